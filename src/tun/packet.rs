//! IP 包编解码
//!
//! - 解码：IPv4 / IPv6 + TCP / UDP，校验长度，校验和只做报告不做拒绝
//! - 编码：重新计算所有校验和，写回 TUN 设备

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use crate::error::{Error, Result};

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// 合成包使用的 TTL / Hop Limit
pub const DEFAULT_TTL: u8 = 64;

/// 解码后的 IP 包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IPv4 TTL 或 IPv6 Hop Limit
    pub ttl: u8,
    pub transport: Transport,
    /// 解码时校验和是否正确（编码时总是重新计算）
    pub checksum_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    /// 其他协议（ICMP 等）或 IPv4 分片，桥接层直接忽略
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// 原始 TCP 选项字节（不含填充校验）
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// 从选项中读取 MSS
    pub fn mss(&self) -> Option<u16> {
        let opts = &self.options;
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                kind => {
                    let len = *opts.get(i + 1)? as usize;
                    if len < 2 || i + len > opts.len() {
                        return None;
                    }
                    if kind == 2 && len == 4 {
                        return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    }
                    i += len;
                }
            }
        }
        None
    }

    /// 占用的序列号空间（SYN / FIN 各占一个）
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.flags.syn as u32 + self.flags.fin as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.src, t.src_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.src, u.src_port)),
            Transport::Other(_) => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(t) => Some(SocketAddr::new(self.dst, t.dst_port)),
            Transport::Udp(u) => Some(SocketAddr::new(self.dst, u.dst_port)),
            Transport::Other(_) => None,
        }
    }

    pub fn tcp(&self) -> Option<&TcpSegment> {
        match &self.transport {
            Transport::Tcp(t) => Some(t),
            _ => None,
        }
    }
}

/// TCP 标志位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn syn() -> Self {
        Self { syn: true, ..Default::default() }
    }

    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }

    pub fn ack() -> Self {
        Self { ack: true, ..Default::default() }
    }

    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }

    pub fn rst() -> Self {
        Self { rst: true, ..Default::default() }
    }

    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }
}

/// 解码一个原始 IP 包
pub fn decode(raw: &[u8]) -> Result<ParsedPacket> {
    let version = raw
        .first()
        .map(|b| b >> 4)
        .ok_or_else(|| Error::MalformedPacket("empty packet".into()))?;
    if version != 4 && version != 6 {
        return Err(Error::MalformedPacket(format!("unsupported IP version {}", version)));
    }

    let sliced = SlicedPacket::from_ip(raw)
        .map_err(|e| Error::MalformedPacket(e.to_string()))?;

    // (src, dst, ttl, protocol, IP 包结束位置, 是否分片, IP 头校验和)
    let (src, dst, ttl, proto, ip_end, fragmented, header_ok) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            let ihl = header.ihl() as usize * 4;
            let total_len = header.total_len() as usize;
            if total_len < ihl {
                return Err(Error::MalformedPacket(format!(
                    "IPv4 total length {} shorter than header {}",
                    total_len, ihl
                )));
            }
            let frag_bits = u16::from_be_bytes([raw[6], raw[7]]) & 0x3FFF;
            (
                IpAddr::V4(Ipv4Addr::from(header.source())),
                IpAddr::V4(Ipv4Addr::from(header.destination())),
                header.ttl(),
                header.protocol().0,
                total_len,
                frag_bits != 0,
                internet_checksum(&raw[..ihl], 0) == 0,
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::V6(Ipv6Addr::from(header.source())),
                IpAddr::V6(Ipv6Addr::from(header.destination())),
                header.hop_limit(),
                header.next_header().0,
                40 + header.payload_length() as usize,
                false,
                true,
            )
        }
        _ => return Err(Error::MalformedPacket("missing IP header".into())),
    };

    if ip_end > raw.len() {
        return Err(Error::MalformedPacket(format!(
            "declared length {} exceeds buffer {}",
            ip_end,
            raw.len()
        )));
    }

    if fragmented {
        return Ok(ParsedPacket {
            src,
            dst,
            ttl,
            transport: Transport::Other(proto),
            checksum_ok: header_ok,
        });
    }

    let (transport, transport_len) = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            let options = tcp.options().to_vec();
            let payload = tcp.payload().to_vec();
            let len = 20 + options.len() + payload.len();
            let seg = TcpSegment {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                flags: TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                },
                window: tcp.window_size(),
                options,
                payload,
            };
            (Transport::Tcp(seg), Some((PROTO_TCP, len)))
        }
        Some(TransportSlice::Udp(udp)) => {
            let payload = udp.payload().to_vec();
            let len = 8 + payload.len();
            let dgram = UdpDatagram {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
                payload,
            };
            (Transport::Udp(dgram), Some((PROTO_UDP, len)))
        }
        _ => (Transport::Other(proto), None),
    };

    let mut checksum_ok = header_ok;
    if let Some((proto, len)) = transport_len {
        if len <= ip_end {
            let segment = &raw[ip_end - len..ip_end];
            let udp_unchecked = proto == PROTO_UDP && src.is_ipv4() && segment[6..8] == [0, 0];
            if !udp_unchecked {
                checksum_ok &= internet_checksum(segment, pseudo_header_sum(src, dst, proto, len)) == 0;
            }
        }
    }

    if !checksum_ok {
        tracing::debug!("Bad checksum on packet {} -> {}", src, dst);
    }

    Ok(ParsedPacket {
        src,
        dst,
        ttl,
        transport,
        checksum_ok,
    })
}

/// 编码一个 IP 包（重新计算所有校验和）
pub fn encode(packet: &ParsedPacket) -> Result<Vec<u8>> {
    let (proto, segment) = match &packet.transport {
        Transport::Tcp(seg) => (PROTO_TCP, tcp_segment_bytes(seg)),
        Transport::Udp(dgram) => (PROTO_UDP, udp_datagram_bytes(dgram)),
        Transport::Other(proto) => {
            return Err(Error::Protocol(format!("cannot encode IP protocol {}", proto)));
        }
    };
    build_ip_packet(packet.src, packet.dst, packet.ttl, proto, segment)
}

/// 构造 IP + TCP 包
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    options: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>> {
    let seg = TcpSegment {
        src_port: src.port(),
        dst_port: dst.port(),
        seq,
        ack,
        flags,
        window,
        options: options.to_vec(),
        payload: payload.to_vec(),
    };
    build_ip_packet(src.ip(), dst.ip(), DEFAULT_TTL, PROTO_TCP, tcp_segment_bytes(&seg))
}

/// 构造 IP + UDP 包
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let dgram = UdpDatagram {
        src_port: src.port(),
        dst_port: dst.port(),
        payload: payload.to_vec(),
    };
    build_ip_packet(src.ip(), dst.ip(), DEFAULT_TTL, PROTO_UDP, udp_datagram_bytes(&dgram))
}

fn tcp_segment_bytes(seg: &TcpSegment) -> Vec<u8> {
    let mut options = seg.options.clone();
    while options.len() % 4 != 0 {
        options.push(0);
    }
    let header_len = 20 + options.len();

    let mut buf = Vec::with_capacity(header_len + seg.payload.len());
    buf.extend(&seg.src_port.to_be_bytes());
    buf.extend(&seg.dst_port.to_be_bytes());
    buf.extend(&seg.seq.to_be_bytes());
    buf.extend(&seg.ack.to_be_bytes());
    buf.push(((header_len / 4) as u8) << 4);    // Data Offset + Reserved
    buf.push(seg.flags.to_byte());
    buf.extend(&seg.window.to_be_bytes());
    buf.extend(&[0x00, 0x00]);                   // Checksum (placeholder)
    buf.extend(&[0x00, 0x00]);                   // Urgent Pointer
    buf.extend(&options);
    buf.extend(&seg.payload);
    buf
}

fn udp_datagram_bytes(dgram: &UdpDatagram) -> Vec<u8> {
    let udp_len = 8 + dgram.payload.len();
    let mut buf = Vec::with_capacity(udp_len);
    buf.extend(&dgram.src_port.to_be_bytes());
    buf.extend(&dgram.dst_port.to_be_bytes());
    buf.extend(&(udp_len as u16).to_be_bytes());
    buf.extend(&[0x00, 0x00]);                   // Checksum (placeholder)
    buf.extend(&dgram.payload);
    buf
}

/// 包上 IP 头并填写传输层校验和
fn build_ip_packet(src: IpAddr, dst: IpAddr, ttl: u8, proto: u8, mut segment: Vec<u8>) -> Result<Vec<u8>> {
    let checksum_offset = if proto == PROTO_TCP { 16 } else { 6 };
    let mut checksum = internet_checksum(&segment, pseudo_header_sum(src, dst, proto, segment.len()));
    if proto == PROTO_UDP && checksum == 0 {
        checksum = 0xFFFF;
    }
    segment[checksum_offset..checksum_offset + 2].copy_from_slice(&checksum.to_be_bytes());

    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total_len = 20 + segment.len();
            if total_len > u16::MAX as usize {
                return Err(Error::Protocol(format!("packet too large: {} bytes", total_len)));
            }
            let mut packet = Vec::with_capacity(total_len);
            packet.push(0x45);                               // Version (4) + IHL (5)
            packet.push(0x00);                               // DSCP + ECN
            packet.extend(&(total_len as u16).to_be_bytes()); // Total Length
            packet.extend(&[0x00, 0x00]);                    // Identification
            packet.extend(&[0x40, 0x00]);                    // Flags (DF) + Fragment Offset
            packet.push(ttl);
            packet.push(proto);
            packet.extend(&[0x00, 0x00]);                    // Header Checksum (placeholder)
            packet.extend(&src.octets());
            packet.extend(&dst.octets());

            let ip_checksum = internet_checksum(&packet[0..20], 0);
            packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

            packet.extend(&segment);
            Ok(packet)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            if segment.len() > u16::MAX as usize {
                return Err(Error::Protocol(format!("payload too large: {} bytes", segment.len())));
            }
            let mut packet = Vec::with_capacity(40 + segment.len());
            packet.extend(&[0x60, 0x00, 0x00, 0x00]);       // Version (6) + Traffic Class + Flow Label
            packet.extend(&(segment.len() as u16).to_be_bytes());
            packet.push(proto);                              // Next Header
            packet.push(ttl);                                // Hop Limit
            packet.extend(&src.octets());
            packet.extend(&dst.octets());
            packet.extend(&segment);
            Ok(packet)
        }
        _ => Err(Error::Protocol(format!("address family mismatch: {} -> {}", src, dst))),
    }
}

/// 伪头部累加和（未折叠）
fn pseudo_header_sum(src: IpAddr, dst: IpAddr, proto: u8, len: usize) -> u32 {
    let mut sum: u32 = 0;
    let mut add = |bytes: &[u8]| {
        for pair in bytes.chunks(2) {
            sum += ((pair[0] as u32) << 8) | (*pair.get(1).unwrap_or(&0) as u32);
        }
    };
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            add(&s.octets()[..]);
            add(&d.octets()[..]);
        }
        (s, d) => {
            add(&to_v6_octets(s)[..]);
            add(&to_v6_octets(d)[..]);
        }
    }
    sum + proto as u32 + (len as u32 & 0xFFFF) + (len as u32 >> 16)
}

fn to_v6_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// RFC 1071 校验和，`initial` 为伪头部累加值
fn internet_checksum(data: &[u8], initial: u32) -> u16 {
    let mut sum = initial;

    // 按 16-bit 字累加
    for pair in data.chunks(2) {
        let word = if pair.len() == 2 {
            ((pair[0] as u32) << 8) | (pair[1] as u32)
        } else {
            (pair[0] as u32) << 8
        };
        sum += word;
    }

    // 折叠进位
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tcp_packet_build() {
        let packet = build_tcp_packet(
            v4("10.0.0.1:12345"),
            v4("93.184.216.34:80"),
            1000,
            0,
            TcpFlags::syn(),
            65535,
            &[],
            &[],
        )
        .unwrap();

        assert_eq!(packet[0] & 0xF0, 0x40); // IPv4
        assert_eq!(packet[9], 6);           // TCP protocol
        assert_eq!(packet.len(), 40);       // IP(20) + TCP(20)

        let parsed = decode(&packet).unwrap();
        assert!(parsed.checksum_ok);
        let tcp = parsed.tcp().unwrap();
        assert!(tcp.flags.syn && !tcp.flags.ack);
        assert_eq!(tcp.seq, 1000);
    }

    #[test]
    fn test_udp_packet_build() {
        let packet = build_udp_packet(v4("10.0.0.1:54321"), v4("8.8.8.8:53"), b"DNS query").unwrap();

        assert_eq!(packet[0] & 0xF0, 0x40);
        assert_eq!(packet[9], 17);
        assert_eq!(packet.len(), 20 + 8 + 9);
        assert!(decode(&packet).unwrap().checksum_ok);
    }

    #[test]
    fn test_ipv4_tcp_roundtrip() {
        let packet = ParsedPacket {
            src: "172.16.0.2".parse().unwrap(),
            dst: "1.2.3.4".parse().unwrap(),
            ttl: 64,
            transport: Transport::Tcp(TcpSegment {
                src_port: 50000,
                dst_port: 443,
                seq: 0xDEADBEEF,
                ack: 42,
                flags: TcpFlags::psh_ack(),
                window: 29200,
                options: vec![],
                payload: b"hello".to_vec(),
            }),
            checksum_ok: true,
        };

        let raw = encode(&packet).unwrap();
        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(encode(&decoded).unwrap(), raw);
    }

    #[test]
    fn test_ipv6_udp_roundtrip() {
        let packet = ParsedPacket {
            src: "fd00::2".parse().unwrap(),
            dst: "2001:4860:4860::8888".parse().unwrap(),
            ttl: 64,
            transport: Transport::Udp(UdpDatagram {
                src_port: 5353,
                dst_port: 53,
                payload: vec![1, 2, 3, 4, 5],
            }),
            checksum_ok: true,
        };

        let raw = encode(&packet).unwrap();
        assert_eq!(raw[0] >> 4, 6);
        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_mss_option() {
        let packet = build_tcp_packet(
            v4("10.0.0.1:1000"),
            v4("10.0.0.2:80"),
            1,
            0,
            TcpFlags::syn(),
            1024,
            &[0x02, 0x04, 0x05, 0xB4],
            &[],
        )
        .unwrap();
        let parsed = decode(&packet).unwrap();
        assert_eq!(parsed.tcp().unwrap().mss(), Some(1460));
        assert_eq!(parsed.tcp().unwrap().seq_len(), 1);
    }

    #[test]
    fn test_bad_checksum_is_reported() {
        let mut raw = build_udp_packet(v4("10.0.0.1:1"), v4("10.0.0.2:2"), b"abc").unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let parsed = decode(&raw).unwrap();
        assert!(!parsed.checksum_ok);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(decode(&[]), Err(Error::MalformedPacket(_))));
        assert!(matches!(decode(&[0x50, 0, 0, 20]), Err(Error::MalformedPacket(_))));

        let raw = build_tcp_packet(v4("10.0.0.1:1"), v4("10.0.0.2:2"), 0, 0, TcpFlags::ack(), 0, &[], b"xx")
            .unwrap();
        assert!(decode(&raw[..30]).is_err());
    }

    #[test]
    fn test_non_tcp_udp_is_other() {
        // ICMP echo request
        let mut raw = vec![
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x40, 0x00, 0x40, 0x01, 0x00, 0x00,
            10, 0, 0, 1, 10, 0, 0, 2,
            0x08, 0x00, 0xf7, 0xff, 0x00, 0x00, 0x00, 0x00,
        ];
        let checksum = internet_checksum(&raw[..20], 0);
        raw[10..12].copy_from_slice(&checksum.to_be_bytes());

        let parsed = decode(&raw).unwrap();
        assert_eq!(parsed.transport, Transport::Other(1));
        assert!(parsed.src_socket().is_none());
    }

    #[test]
    fn test_mixed_family_rejected() {
        let err = build_udp_packet(v4("10.0.0.1:1"), "[::1]:2".parse().unwrap(), b"x");
        assert!(err.is_err());
    }
}
