/// SOCKS5 客户端会话
///
/// 关键点：
/// 1. 仅支持无认证（05 01 00）
/// 2. CONNECT / UDP ASSOCIATE 两种请求
/// 3. 会话独占底层连接，任何退出路径都会释放

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// SOCKS5 版本号
const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NO_AUTH: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// 代理返回的失败应答码
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    #[error("general SOCKS server failure")]
    GeneralFailure,
    /// 规则集不允许 (0x02) 或连接被拒绝 (0x05)
    #[error("connection refused by proxy")]
    ProxyRefused,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("TTL expired")]
    TtlExpired,
    #[error("command not supported")]
    CommandNotSupported,
    #[error("address type not supported")]
    AddressTypeNotSupported,
}

impl ReplyError {
    /// 0x00 表示成功，返回 None
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => None,
            0x02 | 0x05 => Some(ReplyError::ProxyRefused),
            0x03 => Some(ReplyError::NetworkUnreachable),
            0x04 => Some(ReplyError::HostUnreachable),
            0x06 => Some(ReplyError::TtlExpired),
            0x07 => Some(ReplyError::CommandNotSupported),
            0x08 => Some(ReplyError::AddressTypeNotSupported),
            _ => Some(ReplyError::GeneralFailure),
        }
    }
}

/// 目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Domain(String, u16),
    Ipv6(Ipv6Addr, u16),
}

impl TargetAddr {
    /// 序列化为 SOCKS5 格式（ATYP + ADDR + PORT，Big-Endian）
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            TargetAddr::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }

        buf
    }

    /// 从字节流读取
    pub async fn from_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let atyp = reader.read_u8().await?;

        match atyp {
            ATYP_IPV4 => {
                let mut ip_bytes = [0u8; 4];
                reader.read_exact(&mut ip_bytes).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Ipv4(Ipv4Addr::from(ip_bytes), port))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await?;
                let mut domain_bytes = vec![0u8; len as usize];
                reader.read_exact(&mut domain_bytes).await?;
                let domain = String::from_utf8(domain_bytes)
                    .map_err(|_| Error::Protocol("Invalid domain name".into()))?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Domain(domain, port))
            }
            ATYP_IPV6 => {
                let mut ip_bytes = [0u8; 16];
                reader.read_exact(&mut ip_bytes).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Ipv6(Ipv6Addr::from(ip_bytes), port))
            }
            _ => Err(Error::Protocol(format!("Unknown address type: {}", atyp))),
        }
    }

    /// 从字节切片解析，返回 (地址, 消耗的字节数)
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        let too_short = || Error::Protocol("Address too short".into());
        let atyp = *buf.first().ok_or_else(too_short)?;

        let (addr, end) = match atyp {
            ATYP_IPV4 => {
                let bytes: [u8; 4] = buf.get(1..5).ok_or_else(too_short)?.try_into().map_err(|_| too_short())?;
                (TargetAddrKind::V4(Ipv4Addr::from(bytes)), 5)
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(too_short)? as usize;
                let bytes = buf.get(2..2 + len).ok_or_else(too_short)?;
                let domain = String::from_utf8(bytes.to_vec())
                    .map_err(|_| Error::Protocol("Invalid domain name".into()))?;
                (TargetAddrKind::Domain(domain), 2 + len)
            }
            ATYP_IPV6 => {
                let bytes: [u8; 16] = buf.get(1..17).ok_or_else(too_short)?.try_into().map_err(|_| too_short())?;
                (TargetAddrKind::V6(Ipv6Addr::from(bytes)), 17)
            }
            _ => return Err(Error::Protocol(format!("Unknown address type: {}", atyp))),
        };

        let port_bytes = buf.get(end..end + 2).ok_or_else(too_short)?;
        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

        let target = match addr {
            TargetAddrKind::V4(ip) => TargetAddr::Ipv4(ip, port),
            TargetAddrKind::V6(ip) => TargetAddr::Ipv6(ip, port),
            TargetAddrKind::Domain(domain) => TargetAddr::Domain(domain, port),
        };
        Ok((target, end + 2))
    }

    /// IP 形式的地址，域名返回 None
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TargetAddr::Ipv4(ip, port) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            TargetAddr::Ipv6(ip, port) => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            TargetAddr::Domain(..) => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) | TargetAddr::Ipv6(_, port) => *port,
        }
    }
}

enum TargetAddrKind {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => TargetAddr::Ipv4(*a.ip(), a.port()),
            SocketAddr::V6(a) => TargetAddr::Ipv6(*a.ip(), a.port()),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
        }
    }
}

/// 握手状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// 已建立传输连接，尚未完成问候
    Greeting,
    /// 认证方法协商完成
    Authenticated,
    /// CONNECT 成功
    Connected,
    /// UDP ASSOCIATE 成功
    Associated,
    /// 会话已关闭
    Disassociated,
}

/// 代理服务器地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// 建立到代理的 TCP 连接
    pub async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::ProxyConnectFailed(format!("{}: {}", self, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 一条到 SOCKS5 代理的会话
///
/// 会话独占传输连接；Drop 即关闭 socket，`close()` 会先显式 shutdown。
pub struct Socks5Session<S = TcpStream> {
    stream: S,
    state: HandshakeState,
    /// 代理返回的 BND.ADDR / BND.PORT
    bound: Option<TargetAddr>,
}

impl Socks5Session<TcpStream> {
    /// 连接代理并发起 CONNECT
    pub async fn dial(proxy: &ProxyEndpoint, target: &TargetAddr) -> Result<Self> {
        let stream = proxy.connect().await?;
        Self::connect(stream, target).await
    }

    /// 连接代理并发起 UDP ASSOCIATE
    pub async fn dial_associate(proxy: &ProxyEndpoint) -> Result<Self> {
        let stream = proxy.connect().await?;
        Self::associate(stream).await
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

impl<S> Socks5Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 在已建立的传输连接上完成问候
    pub async fn open(stream: S) -> Result<Self> {
        let mut session = Self {
            stream,
            state: HandshakeState::Greeting,
            bound: None,
        };
        session.greet().await?;
        Ok(session)
    }

    /// 问候 + CONNECT
    pub async fn connect(stream: S, target: &TargetAddr) -> Result<Self> {
        let mut session = Self::open(stream).await?;
        session.request(CMD_CONNECT, target).await?;
        session.state = HandshakeState::Connected;
        debug!("SOCKS5 CONNECT {} established", target);
        Ok(session)
    }

    /// 问候 + UDP ASSOCIATE（客户端地址填 0.0.0.0:0）
    pub async fn associate(stream: S) -> Result<Self> {
        let mut session = Self::open(stream).await?;
        let hint = TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED, 0);
        session.request(CMD_UDP_ASSOCIATE, &hint).await?;
        session.state = HandshakeState::Associated;
        debug!("SOCKS5 UDP ASSOCIATE established, relay={:?}", session.bound);
        Ok(session)
    }

    async fn greet(&mut self) -> Result<()> {
        self.stream
            .write_all(&[SOCKS5_VERSION, 0x01, AUTH_NO_AUTH])
            .await
            .map_err(handshake_io)?;
        self.stream.flush().await.map_err(handshake_io)?;

        let mut resp = [0u8; 2];
        self.stream.read_exact(&mut resp).await.map_err(handshake_io)?;

        if resp[0] != SOCKS5_VERSION {
            return Err(Error::ProxyHandshakeFailed(format!("Invalid SOCKS version: {}", resp[0])));
        }
        if resp[1] != AUTH_NO_AUTH {
            return Err(Error::ProxyHandshakeFailed(format!(
                "Proxy requires unsupported auth method: {:#04x}",
                resp[1]
            )));
        }

        trace!("SOCKS5 auth: NoAuth");
        self.state = HandshakeState::Authenticated;
        Ok(())
    }

    async fn request(&mut self, cmd: u8, target: &TargetAddr) -> Result<()> {
        let mut req = vec![SOCKS5_VERSION, cmd, 0x00];
        req.extend_from_slice(&target.to_bytes());
        self.stream.write_all(&req).await.map_err(handshake_io)?;
        self.stream.flush().await.map_err(handshake_io)?;

        // VER REP RSV
        let mut head = [0u8; 3];
        self.stream.read_exact(&mut head).await.map_err(handshake_io)?;
        if head[0] != SOCKS5_VERSION {
            return Err(Error::ProxyHandshakeFailed(format!("Invalid SOCKS version: {}", head[0])));
        }
        if let Some(err) = ReplyError::from_code(head[1]) {
            return Err(Error::ProxyRejected(err));
        }

        let bound = TargetAddr::from_reader(&mut self.stream).await.map_err(|e| match e {
            Error::Io(io) => handshake_io(io),
            other => other,
        })?;
        trace!("SOCKS5 bound address: {}", bound);
        self.bound = Some(bound);
        Ok(())
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn bound_addr(&self) -> Option<&TargetAddr> {
        self.bound.as_ref()
    }

    /// 读取代理数据，0 表示 EOF
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).await.map_err(Error::ProxyStream)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(Error::ProxyStream)
    }

    /// 半关闭：客户端 FIN 后只关写方向
    pub async fn shutdown_write(&mut self) -> Result<()> {
        self.stream.shutdown().await.map_err(Error::ProxyStream)
    }

    /// 主动关闭会话
    pub async fn close(mut self) {
        self.state = HandshakeState::Disassociated;
        let _ = self.stream.shutdown().await;
    }
}

fn handshake_io(e: std::io::Error) -> Error {
    Error::ProxyHandshakeFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// 模拟代理：完成问候，读取请求，返回指定应答码
    async fn stub_server(mut server: DuplexStream, rep: u8) -> (u8, TargetAddr, DuplexStream) {
        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        server.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 3];
        server.read_exact(&mut head).await.unwrap();
        let target = TargetAddr::from_reader(&mut server).await.unwrap();

        server
            .write_all(&[0x05, rep, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();
        (head[1], target, server)
    }

    #[tokio::test]
    async fn test_connect_success() {
        let (client, server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let (cmd, target, mut server) = stub_server(server, 0x00).await;
            server.write_all(b"pong").await.unwrap();
            (cmd, target)
        });

        let target = TargetAddr::Domain("example.com".into(), 443);
        let mut session = Socks5Session::connect(client, &target).await.unwrap();
        assert_eq!(session.state(), HandshakeState::Connected);
        assert_eq!(session.bound_addr(), Some(&TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 8080)));

        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            read += session.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, b"pong");

        let (cmd, seen) = server_task.await.unwrap();
        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(seen, target);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (client, server) = duplex(1024);
        tokio::spawn(async move {
            let _ = stub_server(server, 0x05).await;
        });

        let target = TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 80);
        let err = Socks5Session::connect(client, &target).await.err().unwrap();
        assert!(matches!(err, Error::ProxyRejected(ReplyError::ProxyRefused)));
    }

    #[tokio::test]
    async fn test_associate_sends_unspecified_hint() {
        let (client, server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let (cmd, target, _server) = stub_server(server, 0x00).await;
            (cmd, target)
        });

        let session = Socks5Session::associate(client).await.unwrap();
        assert_eq!(session.state(), HandshakeState::Associated);

        let (cmd, hint) = server_task.await.unwrap();
        assert_eq!(cmd, CMD_UDP_ASSOCIATE);
        assert_eq!(hint, TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED, 0));
    }

    #[tokio::test]
    async fn test_auth_required_is_handshake_failure() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let err = Socks5Session::open(client).await.err().unwrap();
        assert!(matches!(err, Error::ProxyHandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_eof_during_handshake() {
        let (client, server) = duplex(1024);
        drop(server);
        let err = Socks5Session::open(client).await.err().unwrap();
        assert!(matches!(err, Error::ProxyHandshakeFailed(_)));
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(ReplyError::from_code(0x00), None);
        assert_eq!(ReplyError::from_code(0x01), Some(ReplyError::GeneralFailure));
        assert_eq!(ReplyError::from_code(0x02), Some(ReplyError::ProxyRefused));
        assert_eq!(ReplyError::from_code(0x03), Some(ReplyError::NetworkUnreachable));
        assert_eq!(ReplyError::from_code(0x04), Some(ReplyError::HostUnreachable));
        assert_eq!(ReplyError::from_code(0x05), Some(ReplyError::ProxyRefused));
        assert_eq!(ReplyError::from_code(0x06), Some(ReplyError::TtlExpired));
        assert_eq!(ReplyError::from_code(0x07), Some(ReplyError::CommandNotSupported));
        assert_eq!(ReplyError::from_code(0x08), Some(ReplyError::AddressTypeNotSupported));
        assert_eq!(ReplyError::from_code(0x42), Some(ReplyError::GeneralFailure));
    }

    #[test]
    fn test_target_addr_from_bytes() {
        let target = TargetAddr::Domain("example.com".to_string(), 443);
        let bytes = target.to_bytes();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1], 11);
        assert_eq!(u16::from_be_bytes([bytes[13], bytes[14]]), 443);

        let (parsed, used) = TargetAddr::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, target);
        assert_eq!(used, bytes.len());

        assert!(TargetAddr::from_bytes(&[0x01, 1, 2]).is_err());
        assert!(TargetAddr::from_bytes(&[0x09]).is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(ProxyEndpoint::new("::1", 1080).to_string(), "[::1]:1080");
        assert_eq!(ProxyEndpoint::new("127.0.0.1", 7890).to_string(), "127.0.0.1:7890");
    }
}
