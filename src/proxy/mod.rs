/// 代理侧：SOCKS5 客户端会话

pub mod socks5;
pub mod socks5_udp;

pub use socks5::{HandshakeState, ProxyEndpoint, ReplyError, Socks5Session, TargetAddr};
pub use socks5_udp::{Socks5UdpFrame, Socks5UdpSession};
