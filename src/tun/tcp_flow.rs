//! TCP 流
//!
//! 在 TUN 一侧模拟 TCP 对端（`TcpEmulator`，纯状态机），
//! 在代理一侧通过 SOCKS5 CONNECT 转发字节流（`TcpFlow`，每流一个任务）。
//!
//! 简化：不做窗口缩放、SACK、拥塞控制；乱序段直接丢弃并重复 ACK。

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::bridge::{FlowContext, TunWriter};
use super::flow_table::{FlowKey, FlowPhase, FlowRegistration};
use super::packet::{build_tcp_packet, ParsedPacket, TcpFlags, TcpSegment, Transport};
use crate::error::{Error, Result};
use crate::proxy::{Socks5Session, TargetAddr};

/// 我们通告给客户端的接收窗口（不使用窗口缩放）
const RECV_WINDOW: u16 = 65535;
/// 客户端未携带 MSS 选项时的默认值
const DEFAULT_MSS: u16 = 536;
/// 代理 -> 客户端方向最多缓存的字节数
const MAX_SEND_BUFFER: usize = 512 * 1024;
/// 初始重传超时
const INITIAL_RTO: Duration = Duration::from_secs(1);
const MAX_RTO: Duration = Duration::from_secs(30);
/// 连续重传次数上限，超过即重置连接
const MAX_RETRANSMITS: u32 = 8;
/// 单次从代理读取的字节数
const PROXY_READ_CHUNK: usize = 16 * 1024;

/// 处理一个客户端段的结果
#[derive(Debug, Default)]
pub struct SegmentOutcome {
    /// 需要写回 TUN 的包（ACK 等）
    pub packets: Vec<Vec<u8>>,
    /// 按序到达、需要转发给代理的数据
    pub payload: Vec<u8>,
    /// 本段携带了客户端 FIN
    pub client_fin: bool,
    /// 客户端 RST
    pub reset: bool,
}

/// TUN 侧 TCP 对端模拟
pub struct TcpEmulator {
    key: FlowKey,
    isn: u32,
    client_isn: u32,
    /// send_buf[0] 对应的序列号
    data_base: u32,
    /// 下一个要发送的序列号
    snd_nxt: u32,
    /// 期望收到的下一个客户端序列号
    rcv_nxt: u32,
    peer_window: u32,
    mss: usize,
    /// 未确认 + 未发送的代理数据
    send_buf: VecDeque<u8>,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    client_fin: bool,
    handshake_acked: bool,
    last_send: Option<Instant>,
    rto: Duration,
    retransmits: u32,
}

impl TcpEmulator {
    /// 收到 SYN 时创建，ISN 随机
    pub fn new(key: FlowKey, syn: &TcpSegment, mtu: u16) -> Self {
        Self::with_isn(key, syn, mtu, rand::random())
    }

    pub fn with_isn(key: FlowKey, syn: &TcpSegment, mtu: u16, isn: u32) -> Self {
        let ip_overhead = if key.src.is_ipv4() { 40 } else { 60 };
        let mtu_mss = mtu.saturating_sub(ip_overhead).max(DEFAULT_MSS);
        let mss = syn.mss().unwrap_or(DEFAULT_MSS).min(mtu_mss).max(1);

        Self {
            key,
            isn,
            client_isn: syn.seq,
            data_base: isn.wrapping_add(1),
            snd_nxt: isn,
            rcv_nxt: syn.seq.wrapping_add(1),
            peer_window: syn.window as u32,
            mss: mss as usize,
            send_buf: VecDeque::new(),
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            client_fin: false,
            handshake_acked: false,
            last_send: None,
            rto: INITIAL_RTO,
            retransmits: 0,
        }
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// SYN-ACK（带 MSS 选项），重复调用会生成相同的包
    pub fn syn_ack(&mut self) -> Result<Vec<u8>> {
        self.snd_nxt = self.isn.wrapping_add(1);
        self.arm_timer();
        let mss = (self.mss as u16).to_be_bytes();
        self.packet(self.isn, TcpFlags::syn_ack(), &[0x02, 0x04, mss[0], mss[1]], &[])
    }

    /// RST|ACK，用于握手失败、取消、重传放弃
    pub fn reset(&self) -> Result<Vec<u8>> {
        self.packet(self.snd_nxt, TcpFlags::rst_ack(), &[], &[])
    }

    fn ack_packet(&self) -> Result<Vec<u8>> {
        self.packet(self.snd_nxt, TcpFlags::ack(), &[], &[])
    }

    fn packet(&self, seq: u32, flags: TcpFlags, options: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        build_tcp_packet(
            self.key.dst,
            self.key.src,
            seq,
            self.rcv_nxt,
            flags,
            RECV_WINDOW,
            options,
            payload,
        )
    }

    fn arm_timer(&mut self) {
        if self.last_send.is_none() {
            self.last_send = Some(Instant::now());
        }
    }

    /// 处理一个来自客户端的段
    pub fn on_segment(&mut self, seg: &TcpSegment) -> Result<SegmentOutcome> {
        let mut out = SegmentOutcome::default();

        if seg.flags.rst {
            out.reset = true;
            return Ok(out);
        }

        if seg.flags.syn {
            // 握手完成前重传的 SYN：再发一次 SYN-ACK
            if !self.handshake_acked && seg.seq == self.client_isn {
                out.packets.push(self.syn_ack()?);
            }
            return Ok(out);
        }

        if seg.flags.ack {
            self.peer_window = seg.window as u32;
            self.process_ack(seg.ack);
        }

        let seg_len = seg.payload.len() as u32 + seg.flags.fin as u32;
        if seg_len == 0 {
            return Ok(out);
        }

        let offset = seg.seq.wrapping_sub(self.rcv_nxt) as i32;
        if offset > 0 {
            // 乱序：重复 ACK，丢弃
            trace!("{} out-of-order segment (+{})", self.key, offset);
            out.packets.push(self.ack_packet()?);
            return Ok(out);
        }

        let skip = offset.unsigned_abs() as usize;
        if skip >= seg.payload.len() && !(seg.flags.fin && !self.client_fin && skip == seg.payload.len()) {
            // 完全重复（包括重复的 FIN）：重新 ACK
            out.packets.push(self.ack_packet()?);
            return Ok(out);
        }

        let data = &seg.payload[skip.min(seg.payload.len())..];
        self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
        out.payload = data.to_vec();

        if seg.flags.fin && !self.client_fin {
            self.client_fin = true;
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            out.client_fin = true;
        }

        out.packets.push(self.ack_packet()?);
        Ok(out)
    }

    fn process_ack(&mut self, ack: u32) {
        if !self.handshake_acked {
            if ack == self.isn.wrapping_add(1) {
                self.handshake_acked = true;
                self.reset_timer();
            }
            return;
        }

        let acked = ack.wrapping_sub(self.data_base) as usize;
        let in_flight = self.snd_nxt.wrapping_sub(self.data_base) as usize;
        if acked == 0 || acked > in_flight {
            return;
        }

        let data_acked = acked.min(self.send_buf.len());
        self.send_buf.drain(..data_acked);
        self.data_base = self.data_base.wrapping_add(data_acked as u32);

        if self.fin_sent && ack == self.snd_nxt {
            // FIN 占一个序列号，确认后不再有在途数据
            self.fin_acked = true;
            self.data_base = self.snd_nxt;
        }
        self.reset_timer();
    }

    fn reset_timer(&mut self) {
        self.retransmits = 0;
        self.rto = INITIAL_RTO;
        self.last_send = if self.has_unacked() { Some(Instant::now()) } else { None };
    }

    /// 代理数据入队
    pub fn enqueue(&mut self, data: &[u8]) {
        self.send_buf.extend(data);
    }

    /// 代理 EOF：数据发完后发送 FIN
    pub fn queue_fin(&mut self) {
        self.fin_queued = true;
    }

    /// 是否还能继续从代理读取
    pub fn can_accept_from_proxy(&self) -> bool {
        !self.fin_queued && self.send_buf.len() < MAX_SEND_BUFFER
    }

    /// 按 MSS 和客户端窗口切分待发送数据
    pub fn poll_transmit(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        if !self.handshake_acked || self.fin_sent {
            return Ok(packets);
        }

        loop {
            let sent = self.snd_nxt.wrapping_sub(self.data_base) as usize;
            let unsent = self.send_buf.len() - sent;
            let window_left = (self.peer_window as usize).saturating_sub(sent);
            let len = unsent.min(self.mss).min(window_left);
            if len == 0 {
                break;
            }

            let chunk: Vec<u8> = self.send_buf.range(sent..sent + len).copied().collect();
            packets.push(self.packet(self.snd_nxt, TcpFlags::psh_ack(), &[], &chunk)?);
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
        }

        let all_sent = self.snd_nxt.wrapping_sub(self.data_base) as usize == self.send_buf.len();
        if self.fin_queued && all_sent {
            packets.push(self.packet(self.snd_nxt, TcpFlags::fin_ack(), &[], &[])?);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
        }

        if !packets.is_empty() {
            self.arm_timer();
        }
        Ok(packets)
    }

    pub fn has_unacked(&self) -> bool {
        !self.handshake_acked || self.snd_nxt != self.data_base
    }

    pub fn retransmit_deadline(&self) -> Option<Instant> {
        if self.snd_nxt == self.isn || !self.has_unacked() {
            return None;
        }
        self.last_send.map(|t| t + self.rto)
    }

    /// 重传最早未确认的段，超过次数上限返回 `Timeout`
    pub fn retransmit(&mut self) -> Result<Vec<Vec<u8>>> {
        if !self.has_unacked() {
            return Ok(Vec::new());
        }
        if self.retransmits >= MAX_RETRANSMITS {
            return Err(Error::Timeout);
        }
        self.retransmits += 1;
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.last_send = Some(Instant::now());

        if !self.handshake_acked {
            return Ok(vec![self.syn_ack()?]);
        }

        let in_flight_data = (self.snd_nxt.wrapping_sub(self.data_base) as usize).min(self.send_buf.len());
        if in_flight_data > 0 {
            let len = in_flight_data.min(self.mss);
            let chunk: Vec<u8> = self.send_buf.range(..len).copied().collect();
            return Ok(vec![self.packet(self.data_base, TcpFlags::psh_ack(), &[], &chunk)?]);
        }

        // 只剩 FIN 未确认
        let fin_seq = self.snd_nxt.wrapping_sub(1);
        Ok(vec![self.packet(fin_seq, TcpFlags::fin_ack(), &[], &[])?])
    }

    /// 双向都已 FIN 且我方 FIN 已被确认
    pub fn is_closed(&self) -> bool {
        self.client_fin && self.fin_acked
    }
}

/// 对未知流的段回应 RST（RFC 793 规则）
pub fn reset_for(key: &FlowKey, seg: &TcpSegment) -> Result<Vec<u8>> {
    if seg.flags.ack {
        build_tcp_packet(key.dst, key.src, seg.ack, 0, TcpFlags::rst(), 0, &[], &[])
    } else {
        let ack = seg.seq.wrapping_add(seg.seq_len());
        build_tcp_packet(key.dst, key.src, 0, ack, TcpFlags::rst_ack(), 0, &[], &[])
    }
}

/// 一条 TCP 流的任务
pub struct TcpFlow {
    registration: FlowRegistration,
    emulator: TcpEmulator,
    rx: mpsc::Receiver<ParsedPacket>,
    cancel: CancellationToken,
}

impl TcpFlow {
    pub fn new(
        registration: FlowRegistration,
        syn: &TcpSegment,
        rx: mpsc::Receiver<ParsedPacket>,
        cancel: CancellationToken,
        mtu: u16,
    ) -> Self {
        let emulator = TcpEmulator::new(registration.key(), syn, mtu);
        Self {
            registration,
            emulator,
            rx,
            cancel,
        }
    }

    pub async fn run(self, ctx: FlowContext) {
        let TcpFlow {
            registration,
            mut emulator,
            mut rx,
            cancel,
        } = self;
        let key = registration.key();

        registration.set_phase(FlowPhase::SynSeen);
        debug!("New TCP flow {}", key);

        registration.set_phase(FlowPhase::SocksConnecting);
        let target = TargetAddr::from(key.dst);
        let dial = tokio::time::timeout(ctx.handshake_timeout, Socks5Session::dial(&ctx.proxy, &target));

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Other("cancelled".into())),
            result = dial => result.map_err(Error::from).and_then(|r| r),
        };

        let mut session = match connected {
            Ok(session) => session,
            Err(e) => {
                debug!("TCP flow {} failed before established: {}", key, e);
                ctx.stats.record_flow_failed();
                send_reset(&ctx.writer, &emulator).await;
                registration.deregister();
                return;
            }
        };

        let established = match emulator.syn_ack() {
            Ok(packet) => ctx.writer.write_packet(packet).await,
            Err(e) => Err(e),
        };
        if let Err(e) = established {
            debug!("TCP flow {} could not send SYN-ACK: {}", key, e);
            registration.deregister();
            session.close().await;
            return;
        }
        registration.set_phase(FlowPhase::Established);
        debug!("TCP flow {} established via {}", key, ctx.proxy);

        let result = relay(&registration, &mut emulator, &mut rx, &mut session, &ctx.writer, &cancel).await;
        match &result {
            Ok(()) => debug!("TCP flow {} closed", key),
            Err(e) => {
                debug!("TCP flow {} aborted: {}", key, e);
                send_reset(&ctx.writer, &emulator).await;
            }
        }

        // 先出表，再释放代理会话
        registration.deregister();
        session.close().await;
        ctx.stats.record_flow_closed();
    }
}

async fn send_reset(writer: &TunWriter, emulator: &TcpEmulator) {
    if let Ok(packet) = emulator.reset() {
        let _ = writer.write_packet(packet).await;
    }
}

async fn write_all_packets(writer: &TunWriter, packets: Vec<Vec<u8>>) -> Result<()> {
    for packet in packets {
        writer.write_packet(packet).await?;
    }
    Ok(())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 双向转发，返回 Err 时调用方负责发送 RST
async fn relay(
    registration: &FlowRegistration,
    emulator: &mut TcpEmulator,
    rx: &mut mpsc::Receiver<ParsedPacket>,
    session: &mut Socks5Session,
    writer: &TunWriter,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; PROXY_READ_CHUNK];
    let mut proxy_eof = false;

    loop {
        let deadline = emulator.retransmit_deadline();
        let can_read = !proxy_eof && emulator.can_accept_from_proxy();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return Err(Error::Other("flow cancelled".into()));
            }

            packet = rx.recv() => {
                let Some(packet) = packet else {
                    return Err(Error::Other("flow channel closed".into()));
                };
                let Transport::Tcp(seg) = &packet.transport else {
                    continue;
                };

                let outcome = emulator.on_segment(seg)?;
                write_all_packets(writer, outcome.packets).await?;
                if outcome.reset {
                    debug!("TCP flow {} reset by client", registration.key());
                    return Ok(());
                }
                if !outcome.payload.is_empty() {
                    session.write_all(&outcome.payload).await?;
                }
                if outcome.client_fin {
                    registration.set_phase(FlowPhase::Closing);
                    // 半关闭：代理方向继续读
                    if let Err(e) = session.shutdown_write().await {
                        debug!("TCP flow {} proxy shutdown failed: {}", registration.key(), e);
                    }
                }
            }

            n = session.read(&mut buf), if can_read => {
                let n = n?;
                if n == 0 {
                    trace!("TCP flow {} proxy EOF", registration.key());
                    proxy_eof = true;
                    emulator.queue_fin();
                    registration.set_phase(FlowPhase::Closing);
                } else {
                    emulator.enqueue(&buf[..n]);
                    registration.touch();
                }
            }

            _ = sleep_until_opt(deadline) => {
                let packets = emulator.retransmit()?;
                write_all_packets(writer, packets).await?;
            }
        }

        let packets = emulator.poll_transmit()?;
        write_all_packets(writer, packets).await?;

        if emulator.is_closed() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::flow_table::Protocol;
    use crate::tun::packet::decode;

    const CLIENT_ISN: u32 = 1000;
    const ISN: u32 = 5000;

    fn key() -> FlowKey {
        FlowKey::new(Protocol::Tcp, "172.16.0.2:40000".parse().unwrap(), "93.184.216.34:80".parse().unwrap())
    }

    fn seg(seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment {
        TcpSegment {
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 65535,
            options: vec![],
            payload: payload.to_vec(),
        }
    }

    fn syn() -> TcpSegment {
        TcpSegment {
            options: vec![0x02, 0x04, 0x03, 0xE8], // MSS 1000
            ..seg(CLIENT_ISN, 0, TcpFlags::syn(), &[])
        }
    }

    fn tcp_of(raw: &[u8]) -> TcpSegment {
        decode(raw).unwrap().tcp().unwrap().clone()
    }

    /// 完成握手的模拟器
    fn established() -> TcpEmulator {
        let mut emu = TcpEmulator::with_isn(key(), &syn(), 1500, ISN);
        emu.syn_ack().unwrap();
        emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 1, TcpFlags::ack(), &[])).unwrap();
        emu
    }

    #[test]
    fn test_syn_ack() {
        let mut emu = TcpEmulator::with_isn(key(), &syn(), 1500, ISN);
        assert_eq!(emu.mss(), 1000);

        let raw = emu.syn_ack().unwrap();
        let parsed = decode(&raw).unwrap();
        assert_eq!(parsed.src_socket(), Some(key().dst));
        assert_eq!(parsed.dst_socket(), Some(key().src));

        let tcp = parsed.tcp().unwrap();
        assert!(tcp.flags.syn && tcp.flags.ack);
        assert_eq!(tcp.seq, ISN);
        assert_eq!(tcp.ack, CLIENT_ISN + 1);
        assert_eq!(tcp.mss(), Some(1000));

        // 重传的 SYN 得到相同的 SYN-ACK
        let out = emu.on_segment(&syn()).unwrap();
        assert_eq!(out.packets, vec![raw]);
    }

    #[test]
    fn test_in_order_data_is_acked() {
        let mut emu = established();
        let out = emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 1, TcpFlags::psh_ack(), b"GET /")).unwrap();

        assert_eq!(out.payload, b"GET /");
        assert_eq!(out.packets.len(), 1);
        let ack = tcp_of(&out.packets[0]);
        assert!(ack.flags.ack && !ack.flags.psh);
        assert_eq!(ack.ack, CLIENT_ISN + 1 + 5);
        assert_eq!(ack.seq, ISN + 1);
    }

    #[test]
    fn test_duplicate_and_overlap() {
        let mut emu = established();
        emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 1, TcpFlags::psh_ack(), b"abc")).unwrap();

        // 完全重复
        let out = emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 1, TcpFlags::psh_ack(), b"abc")).unwrap();
        assert!(out.payload.is_empty());
        assert_eq!(tcp_of(&out.packets[0]).ack, CLIENT_ISN + 4);

        // 部分重叠，只取新数据
        let out = emu.on_segment(&seg(CLIENT_ISN + 2, ISN + 1, TcpFlags::psh_ack(), b"bcdef")).unwrap();
        assert_eq!(out.payload, b"def");
        assert_eq!(tcp_of(&out.packets[0]).ack, CLIENT_ISN + 7);
    }

    #[test]
    fn test_out_of_order_gets_dup_ack() {
        let mut emu = established();
        let out = emu.on_segment(&seg(CLIENT_ISN + 100, ISN + 1, TcpFlags::psh_ack(), b"late")).unwrap();
        assert!(out.payload.is_empty());
        assert_eq!(tcp_of(&out.packets[0]).ack, CLIENT_ISN + 1);
    }

    #[test]
    fn test_segmentation_respects_mss_and_window() {
        let mut emu = established();
        emu.enqueue(&[7u8; 2500]);
        let packets = emu.poll_transmit().unwrap();
        let sizes: Vec<usize> = packets.iter().map(|p| tcp_of(p).payload.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(tcp_of(&packets[1]).seq, ISN + 1 + 1000);
        assert!(tcp_of(&packets[0]).flags.psh);

        // 客户端窗口 1500
        let mut emu = TcpEmulator::with_isn(key(), &syn(), 1500, ISN);
        emu.syn_ack().unwrap();
        let mut ack = seg(CLIENT_ISN + 1, ISN + 1, TcpFlags::ack(), &[]);
        ack.window = 1500;
        emu.on_segment(&ack).unwrap();
        emu.enqueue(&[1u8; 4000]);
        let sizes: Vec<usize> = emu.poll_transmit().unwrap().iter().map(|p| tcp_of(p).payload.len()).collect();
        assert_eq!(sizes, vec![1000, 500]);

        // 确认后窗口前移
        let mut ack = seg(CLIENT_ISN + 1, ISN + 1 + 1500, TcpFlags::ack(), &[]);
        ack.window = 1500;
        emu.on_segment(&ack).unwrap();
        let sizes: Vec<usize> = emu.poll_transmit().unwrap().iter().map(|p| tcp_of(p).payload.len()).collect();
        assert_eq!(sizes, vec![1000, 500]);
    }

    #[test]
    fn test_no_data_before_handshake_ack() {
        let mut emu = TcpEmulator::with_isn(key(), &syn(), 1500, ISN);
        emu.syn_ack().unwrap();
        emu.enqueue(b"early");
        assert!(emu.poll_transmit().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_first_unacked() {
        let mut emu = established();
        emu.enqueue(&[9u8; 1500]);
        assert_eq!(emu.poll_transmit().unwrap().len(), 2);

        let deadline = emu.retransmit_deadline().unwrap();
        assert_eq!(deadline - Instant::now(), INITIAL_RTO);

        tokio::time::advance(INITIAL_RTO).await;
        let packets = emu.retransmit().unwrap();
        assert_eq!(packets.len(), 1);
        let tcp = tcp_of(&packets[0]);
        assert_eq!(tcp.seq, ISN + 1);
        assert_eq!(tcp.payload.len(), 1000);

        // 全部确认后不再有重传定时器
        emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 1 + 1500, TcpFlags::ack(), &[])).unwrap();
        assert!(emu.retransmit_deadline().is_none());
    }

    #[test]
    fn test_retransmit_gives_up() {
        let mut emu = established();
        emu.enqueue(b"x");
        emu.poll_transmit().unwrap();
        for _ in 0..MAX_RETRANSMITS {
            emu.retransmit().unwrap();
        }
        assert!(matches!(emu.retransmit(), Err(Error::Timeout)));
    }

    #[test]
    fn test_graceful_close() {
        let mut emu = established();

        // 客户端先 FIN
        let out = emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 1, TcpFlags::fin_ack(), &[])).unwrap();
        assert!(out.client_fin);
        assert_eq!(tcp_of(&out.packets[0]).ack, CLIENT_ISN + 2);

        // 重复 FIN 只会被重新确认
        let out = emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 1, TcpFlags::fin_ack(), &[])).unwrap();
        assert!(!out.client_fin);
        assert_eq!(out.packets.len(), 1);

        // 代理还有数据，然后 EOF
        emu.enqueue(b"bye");
        emu.queue_fin();
        assert!(!emu.can_accept_from_proxy());
        let packets = emu.poll_transmit().unwrap();
        assert_eq!(packets.len(), 2);
        let fin = tcp_of(&packets[1]);
        assert!(fin.flags.fin);
        assert_eq!(fin.seq, ISN + 1 + 3);
        assert!(!emu.is_closed());

        emu.on_segment(&seg(CLIENT_ISN + 2, ISN + 1 + 4, TcpFlags::ack(), &[])).unwrap();
        assert!(emu.is_closed());
    }

    #[test]
    fn test_acked_fin_is_not_retransmitted() {
        let mut emu = established();

        // 代理先关闭
        emu.queue_fin();
        let packets = emu.poll_transmit().unwrap();
        assert_eq!(packets.len(), 1);
        let fin = tcp_of(&packets[0]);
        assert!(fin.flags.fin);
        assert_eq!(fin.seq, ISN + 1);
        assert!(emu.retransmit_deadline().is_some());

        emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 2, TcpFlags::ack(), &[])).unwrap();
        assert!(!emu.has_unacked());
        assert!(emu.retransmit_deadline().is_none());
        assert!(emu.retransmit().unwrap().is_empty());

        // 客户端保持半开，重复 ACK 不会重新启动定时器
        emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 2, TcpFlags::ack(), &[])).unwrap();
        assert!(emu.retransmit_deadline().is_none());
        assert!(emu.poll_transmit().unwrap().is_empty());

        // 客户端随后 FIN，连接关闭
        let out = emu.on_segment(&seg(CLIENT_ISN + 1, ISN + 2, TcpFlags::fin_ack(), &[])).unwrap();
        assert!(out.client_fin);
        assert!(emu.is_closed());
    }

    #[test]
    fn test_client_reset() {
        let mut emu = established();
        let out = emu.on_segment(&seg(CLIENT_ISN + 1, 0, TcpFlags::rst(), &[])).unwrap();
        assert!(out.reset);
        assert!(out.packets.is_empty());
    }

    #[test]
    fn test_reset_packets() {
        let emu = TcpEmulator::with_isn(key(), &syn(), 1500, ISN);
        let rst = tcp_of(&emu.reset().unwrap());
        assert!(rst.flags.rst && rst.flags.ack);
        assert_eq!(rst.ack, CLIENT_ISN + 1);

        let stray = seg(77, 4242, TcpFlags::ack(), b"data");
        let rst = tcp_of(&reset_for(&key(), &stray).unwrap());
        assert!(rst.flags.rst && !rst.flags.ack);
        assert_eq!(rst.seq, 4242);

        let stray = seg(77, 0, TcpFlags { fin: true, ..Default::default() }, b"data");
        let rst = tcp_of(&reset_for(&key(), &stray).unwrap());
        assert!(rst.flags.rst && rst.flags.ack);
        assert_eq!(rst.ack, 77 + 5);
    }
}
