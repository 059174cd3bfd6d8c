//! TUN 模式模块
//!
//! 用户态迷你协议栈：把虚拟网卡上的原始 IP 包还原为 TCP/UDP 流，
//! 每个流映射到一个 SOCKS5 会话（TCP 用 CONNECT，UDP 用 UDP ASSOCIATE）。
//!
//! ## 架构
//!
//! ```text
//! TUN Device (172.16.0.2) -> TunnelBridge -> FlowTable -> TcpFlow / UdpFlow -> SOCKS5 Proxy
//! ```

pub mod bridge;
pub mod device;
pub mod flow_table;
pub mod packet;
pub mod route;
pub mod tcp_flow;
pub mod udp_flow;

pub use bridge::{BridgeHandle, BridgeStats, StatsSnapshot, TunWriter, TunnelBridge};
pub use device::{ChannelInterface, InterfaceHandle, TunDevice, VirtualInterface};
pub use flow_table::{FlowKey, FlowPhase, FlowTable, FlowTableStats, Protocol};
pub use packet::{decode, encode, ParsedPacket, TcpFlags, TcpSegment, Transport, UdpDatagram};
pub use route::{NetworkSettings, RouteGuard};

