//! SOCKS5 UDP ASSOCIATE 会话
//!
//! 协议流程：
//! 1. 建立 TCP 控制连接并发送 UDP ASSOCIATE
//! 2. 代理返回 UDP relay 地址
//! 3. 通过 relay 地址收发封装后的 UDP 数据
//! 4. 控制连接关闭即关联结束
//!
//! UDP 数据帧格式 (RFC 1928):
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpStream, UdpSocket};

use super::socks5::{ProxyEndpoint, Socks5Session, TargetAddr};
use crate::error::{Error, Result};

/// UDP 接收缓冲区大小
const UDP_BUFFER_SIZE: usize = 65535;

/// SOCKS5 UDP 数据帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5UdpFrame {
    /// 分片号 (0 = 不分片)
    pub frag: u8,
    pub target: TargetAddr,
    pub data: Vec<u8>,
}

impl Socks5UdpFrame {
    pub fn new(target: TargetAddr, data: Vec<u8>) -> Self {
        Self { frag: 0, target, data }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let addr = self.target.to_bytes();
        let mut buf = Vec::with_capacity(3 + addr.len() + self.data.len());
        buf.extend_from_slice(&[0x00, 0x00]); // RSV
        buf.push(self.frag);
        buf.extend_from_slice(&addr);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Protocol("UDP frame too short".into()));
        }
        let frag = buf[2];
        let (target, used) = TargetAddr::from_bytes(&buf[3..])?;
        Ok(Self {
            frag,
            target,
            data: buf[3 + used..].to_vec(),
        })
    }
}

/// SOCKS5 UDP 会话
pub struct Socks5UdpSession {
    /// 已 connect 到 relay 地址的 UDP socket
    socket: UdpSocket,
    relay_addr: SocketAddr,
    /// TCP 控制连接，关联期间必须保持打开
    control: Socks5Session<TcpStream>,
    buf: Vec<u8>,
}

impl Socks5UdpSession {
    /// 建立 UDP ASSOCIATE 会话
    pub async fn associate(proxy: &ProxyEndpoint) -> Result<Self> {
        let control = Socks5Session::dial_associate(proxy).await?;
        let proxy_ip = control.peer_addr()?.ip();

        let bound = control
            .bound_addr()
            .and_then(TargetAddr::socket_addr)
            .ok_or_else(|| Error::ProxyHandshakeFailed("UDP relay address is not an IP".into()))?;

        // 代理返回 0.0.0.0 / :: 时使用代理自身的 IP
        let relay_addr = if bound.ip().is_unspecified() {
            SocketAddr::new(proxy_ip, bound.port())
        } else {
            bound
        };

        let bind_addr: SocketAddr = match relay_addr.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(relay_addr).await?;

        tracing::debug!(
            "SOCKS5 UDP relay {} (local {})",
            relay_addr,
            socket.local_addr()?
        );

        Ok(Self {
            socket,
            relay_addr,
            control,
            buf: vec![0u8; UDP_BUFFER_SIZE],
        })
    }

    /// 发送一个数据报给目标
    pub async fn send(&self, target: &TargetAddr, data: &[u8]) -> Result<()> {
        let frame = Socks5UdpFrame::new(target.clone(), data.to_vec());
        self.socket
            .send(&frame.to_bytes())
            .await
            .map_err(Error::ProxyStream)?;
        Ok(())
    }

    /// 接收一个数据报，分片帧直接丢弃；控制连接关闭时返回 None
    pub async fn recv(&mut self) -> Result<Option<Socks5UdpFrame>> {
        let mut ctl = [0u8; 64];
        loop {
            tokio::select! {
                biased;

                n = self.socket.recv(&mut self.buf) => {
                    let n = n.map_err(Error::ProxyStream)?;
                    match Socks5UdpFrame::from_bytes(&self.buf[..n]) {
                        Ok(frame) if frame.frag == 0 => return Ok(Some(frame)),
                        Ok(frame) => {
                            tracing::trace!("Dropping fragmented UDP frame (frag={})", frame.frag);
                        }
                        Err(e) => {
                            tracing::debug!("Dropping malformed UDP frame from relay: {}", e);
                        }
                    }
                }

                n = self.control.read(&mut ctl) => {
                    if n? == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// 关闭关联（关闭控制连接）
    pub async fn close(self) {
        self.control.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_udp_frame_ipv4() {
        let frame = Socks5UdpFrame::new(TargetAddr::Ipv4(Ipv4Addr::new(8, 8, 8, 8), 53), vec![0x01, 0x02, 0x03]);
        let bytes = frame.to_bytes();

        // RSV (2) + FRAG (1) + ATYP (1) + ADDR (4) + PORT (2) + DATA (3) = 13
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0..2], [0x00, 0x00]);
        assert_eq!(bytes[2], 0x00);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(bytes[4..8], [8, 8, 8, 8]);
        assert_eq!(bytes[8..10], [0x00, 0x35]);
        assert_eq!(bytes[10..], [0x01, 0x02, 0x03]);

        assert_eq!(Socks5UdpFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_udp_frame_rejects_truncated() {
        assert!(Socks5UdpFrame::from_bytes(&[0, 0, 0]).is_err());
        assert!(Socks5UdpFrame::from_bytes(&[0, 0, 0, 0x01, 8, 8]).is_err());
    }

    /// 本地 SOCKS5 UDP 代理：返回 0.0.0.0 作为 relay 地址，回显收到的帧
    async fn spawn_udp_echo_proxy() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();
            let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let relay_port = relay.local_addr().unwrap().port();

            let mut greeting = [0u8; 3];
            control.read_exact(&mut greeting).await.unwrap();
            control.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 10];
            control.read_exact(&mut req).await.unwrap();
            assert_eq!(req[1], 0x03);
            let mut reply = vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0];
            reply.extend_from_slice(&relay_port.to_be_bytes());
            control.write_all(&reply).await.unwrap();

            let mut buf = [0u8; 2048];
            let (n, from) = relay.recv_from(&mut buf).await.unwrap();
            relay.send_to(&buf[..n], from).await.unwrap();

            // 第二个数据报到达后关闭控制连接，结束关联
            relay.recv_from(&mut buf).await.unwrap();
            drop(control);
        });

        addr
    }

    #[tokio::test]
    async fn test_associate_and_echo() {
        let proxy_addr = spawn_udp_echo_proxy().await;
        let proxy = ProxyEndpoint::new(proxy_addr.ip().to_string(), proxy_addr.port());

        let mut session = Socks5UdpSession::associate(&proxy).await.unwrap();
        assert_eq!(session.relay_addr().ip(), proxy_addr.ip());

        let target = TargetAddr::Ipv4(Ipv4Addr::new(1, 1, 1, 1), 53);
        session.send(&target, b"query").await.unwrap();

        let frame = session.recv().await.unwrap().unwrap();
        assert_eq!(frame.target, target);
        assert_eq!(frame.data, b"query");

        session.send(&target, b"bye").await.unwrap();
        assert!(session.recv().await.unwrap().is_none());
    }
}
