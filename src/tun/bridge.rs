//! 隧道桥接
//!
//! 单一读循环：从虚拟网卡读包 -> 解码 -> 查流表 -> 投递给流任务。
//! 所有回写的包经 `TunWriter` 通道交给同一个写者，保证整包写出且单流有序。
//!
//! ```text
//! VirtualInterface ──read──> TunnelBridge ──try_send──> TcpFlow / UdpFlow ──> SOCKS5
//!        ^                                                   │
//!        └──────────────── TunWriter (mpsc) <────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::device::VirtualInterface;
use super::flow_table::{FlowKey, FlowTable};
use super::packet::{decode, ParsedPacket, TcpSegment, Transport};
use super::tcp_flow::{reset_for, TcpFlow};
use super::udp_flow::UdpFlow;
use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::proxy::ProxyEndpoint;

/// 写回通道容量
const WRITER_CHANNEL_CAPACITY: usize = 4096;
/// 每个流的入站通道容量，满了就丢包
const FLOW_CHANNEL_CAPACITY: usize = 256;
/// 宿主消息通道容量
const MESSAGE_CHANNEL_CAPACITY: usize = 64;

/// TUN 写入器（流任务把合成的包交给唯一的设备写者）
#[derive(Clone)]
pub struct TunWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl TunWriter {
    /// 写入 IP 包到 TUN 设备
    pub async fn write_packet(&self, packet: Vec<u8>) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| Error::TunnelIoFailure("TUN writer channel closed".into()))
    }

    /// 不等待的写入，通道满时丢弃
    pub fn try_write(&self, packet: Vec<u8>) -> bool {
        self.tx.try_send(packet).is_ok()
    }
}

/// 桥接统计
#[derive(Debug, Default)]
pub struct BridgeStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    flows_opened: AtomicU64,
    flows_rejected: AtomicU64,
    flows_failed: AtomicU64,
    flows_closed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub malformed: u64,
    pub dropped: u64,
    pub flows_opened: u64,
    pub flows_rejected: u64,
    pub flows_failed: u64,
    pub flows_closed: u64,
}

impl BridgeStats {
    pub(crate) fn record_flow_failed(&self) {
        self.flows_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flow_closed(&self) {
        self.flows_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_rejected: self.flows_rejected.load(Ordering::Relaxed),
            flows_failed: self.flows_failed.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
        }
    }
}

/// 流任务共享的上下文
#[derive(Clone)]
pub struct FlowContext {
    pub writer: TunWriter,
    pub proxy: ProxyEndpoint,
    pub handshake_timeout: Duration,
    pub stats: Arc<BridgeStats>,
}

/// 运行中桥接的控制句柄
#[derive(Clone)]
pub struct BridgeHandle {
    cancel: CancellationToken,
    table: Arc<FlowTable>,
    stats: Arc<BridgeStats>,
    messages: mpsc::Sender<Vec<u8>>,
}

impl BridgeHandle {
    /// 请求有序停止
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// 投递宿主消息（不等待，不回复）
    pub fn send_message(&self, data: Vec<u8>) -> Result<()> {
        self.messages
            .try_send(data)
            .map_err(|e| Error::Other(format!("app message not delivered: {}", e)))
    }
}

/// 隧道桥接
pub struct TunnelBridge {
    config: Arc<TunnelConfig>,
    table: Arc<FlowTable>,
    stats: Arc<BridgeStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    messages_tx: mpsc::Sender<Vec<u8>>,
    messages_rx: mpsc::Receiver<Vec<u8>>,
}

impl TunnelBridge {
    pub fn new(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let table = Arc::new(FlowTable::new(
            config.max_flows,
            config.tcp_idle_timeout,
            config.udp_idle_timeout,
        ));
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            table,
            stats: Arc::new(BridgeStats::default()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            messages_tx,
            messages_rx,
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            cancel: self.cancel.clone(),
            table: self.table.clone(),
            stats: self.stats.clone(),
            messages: self.messages_tx.clone(),
        }
    }

    /// 运行读循环直到被取消或设备失败，返回前完成有序停止
    pub async fn run(mut self, mut device: VirtualInterface) -> Result<()> {
        info!("🚀 Starting tunnel bridge on {}", device.name());
        info!("   Proxy: {}:{}", self.config.proxy_host, self.config.proxy_port);
        info!("   Node: {}", self.config.node_label);

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let ctx = FlowContext {
            writer: TunWriter { tx: writer_tx },
            proxy: ProxyEndpoint::new(self.config.proxy_host.clone(), self.config.proxy_port),
            handshake_timeout: self.config.handshake_timeout,
            stats: self.stats.clone(),
        };

        self.spawn_sweeper();

        let result = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break Ok(()),

                Some(packet) = writer_rx.recv() => {
                    self.write_to_device(&mut device, &packet).await;
                }

                Some(message) = self.messages_rx.recv() => {
                    info!("📨 App message received ({} bytes)", message.len());
                }

                read = device.read_packet() => match read {
                    Ok(Some(raw)) => self.process_packet(&raw, &ctx),
                    Ok(None) => {
                        warn!("TUN device closed");
                        break Ok(());
                    }
                    Err(e) => {
                        error!("TUN read error: {}", e);
                        break Err(Error::TunnelIoFailure(e.to_string()));
                    }
                },
            }
        };

        info!("🛑 Stopping tunnel bridge...");
        self.cancel.cancel();
        let cancelled = self.table.cancel_all();
        self.tracker.close();
        drop(ctx);

        // 等待流任务退出，同时把它们的 RST 写出去
        let wait = self.tracker.wait();
        tokio::pin!(wait);
        loop {
            tokio::select! {
                biased;
                Some(packet) = writer_rx.recv() => {
                    self.write_to_device(&mut device, &packet).await;
                }
                _ = &mut wait => break,
            }
        }
        while let Ok(packet) = writer_rx.try_recv() {
            self.write_to_device(&mut device, &packet).await;
        }

        info!("✅ Tunnel bridge stopped ({} flows cancelled)", cancelled);
        result
    }

    async fn write_to_device(&self, device: &mut VirtualInterface, packet: &[u8]) {
        match device.write_packet(packet).await {
            Ok(()) => {
                self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!("TUN write error: {}", e),
        }
    }

    /// 定期淘汰空闲流
    fn spawn_sweeper(&self) {
        let table = self.table.clone();
        let cancel = self.cancel.clone();
        let period = self.config.sweep_interval();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = table.evict_idle();
                        for key in &evicted {
                            debug!("Evicting idle flow {}", key);
                        }
                    }
                }
            }
        });
    }

    /// 处理一个从设备读到的包（不阻塞读循环）
    fn process_packet(&self, raw: &[u8], ctx: &FlowContext) {
        self.stats.packets_in.fetch_add(1, Ordering::Relaxed);

        let packet = match decode(raw) {
            Ok(p) => p,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping packet: {}", e);
                return;
            }
        };

        let Some(key) = FlowKey::from_packet(&packet) else {
            trace!("Ignoring non-TCP/UDP packet {} -> {}", packet.src, packet.dst);
            return;
        };

        if let Some(flow) = self.table.lookup(&key) {
            if flow.tx.try_send(packet).is_err() {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Flow {} busy, packet dropped", key);
            }
            return;
        }

        match &packet.transport {
            Transport::Tcp(seg) if seg.flags.syn && !seg.flags.ack => {
                self.open_tcp_flow(key, seg, ctx);
            }
            Transport::Tcp(seg) => {
                // 未知连接的非 SYN 段：回 RST（RST 本身不回应）
                if !seg.flags.rst {
                    self.send_reset(&key, seg, ctx);
                }
            }
            Transport::Udp(dgram) => {
                self.open_udp_flow(key, dgram.payload.clone(), ctx);
            }
            Transport::Other(_) => {}
        }
    }

    fn open_tcp_flow(&self, key: FlowKey, syn: &TcpSegment, ctx: &FlowContext) {
        let (tx, rx) = mpsc::channel::<ParsedPacket>(FLOW_CHANNEL_CAPACITY);
        let cancel = self.cancel.child_token();

        match self.table.register(key, tx, cancel.clone()) {
            Ok(registration) => {
                self.stats.flows_opened.fetch_add(1, Ordering::Relaxed);
                let flow = TcpFlow::new(registration, syn, rx, cancel, self.config.mtu);
                self.tracker.spawn(flow.run(ctx.clone()));
            }
            Err(e) => {
                self.stats.flows_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Rejecting {}: {}", key, e);
                self.send_reset(&key, syn, ctx);
            }
        }
    }

    fn open_udp_flow(&self, key: FlowKey, initial: Vec<u8>, ctx: &FlowContext) {
        let (tx, rx) = mpsc::channel::<ParsedPacket>(FLOW_CHANNEL_CAPACITY);
        let cancel = self.cancel.child_token();

        match self.table.register(key, tx, cancel.clone()) {
            Ok(registration) => {
                self.stats.flows_opened.fetch_add(1, Ordering::Relaxed);
                let flow = UdpFlow::new(registration, initial, rx, cancel);
                self.tracker.spawn(flow.run(ctx.clone()));
            }
            Err(e) => {
                self.stats.flows_rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping datagram for {}: {}", key, e);
            }
        }
    }

    fn send_reset(&self, key: &FlowKey, seg: &TcpSegment, ctx: &FlowContext) {
        match reset_for(key, seg) {
            Ok(packet) => {
                if !ctx.writer.try_write(packet) {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => debug!("Cannot build RST for {}: {}", key, e),
        }
    }
}
