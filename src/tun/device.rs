//! 虚拟网卡
//!
//! - `TunDevice`: 系统 TUN 设备（tun crate）
//! - `ChannelInterface`: 进程内通道，由宿主（或测试）注入和取走原始 IP 包

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::TunnelConfig;
use crate::error::{Error, Result};

/// 单个 IP 包的最大长度
const MAX_PACKET_SIZE: usize = 65535;

/// TUN 设备包装器
pub struct TunDevice {
    inner: tun::AsyncDevice,
    name: String,
    buf: Vec<u8>,
}

impl TunDevice {
    /// 创建 TUN 设备
    pub fn create(config: &TunnelConfig) -> Result<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .address(config.ipv4_address)
            .netmask(config.ipv4_netmask)
            .mtu(config.mtu)
            .up();

        #[cfg(target_os = "linux")]
        {
            tun_config.platform_config(|p| {
                p.ensure_root_privileges(true);
            });
        }

        #[allow(deprecated)]
        if !config.device_name.is_empty() {
            tun_config.tun_name(&config.device_name);
        }

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| Error::TunnelIoFailure(format!("Failed to create TUN device: {}", e)))?;

        tracing::info!("TUN device created: {}", config.device_name);

        Ok(Self {
            inner: device,
            name: config.device_name.clone(),
            buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }

    async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.inner.write_all(packet).await?;
        Ok(())
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        tracing::info!("Closing TUN device: {}", self.name);
    }
}

/// 进程内虚拟网卡
pub struct ChannelInterface {
    name: String,
    inbound: mpsc::Receiver<io::Result<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// `ChannelInterface` 的宿主端
pub struct InterfaceHandle {
    inbound: mpsc::Sender<io::Result<Vec<u8>>>,
    outbound: mpsc::Receiver<Vec<u8>>,
}

impl ChannelInterface {
    pub fn pair(name: impl Into<String>, capacity: usize) -> (Self, InterfaceHandle) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            Self {
                name: name.into(),
                inbound: in_rx,
                outbound: out_tx,
            },
            InterfaceHandle {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

impl InterfaceHandle {
    /// 注入一个"从系统读到"的 IP 包
    pub async fn inject(&self, packet: Vec<u8>) -> Result<()> {
        self.inbound
            .send(Ok(packet))
            .await
            .map_err(|_| Error::TunnelIoFailure("interface closed".into()))
    }

    /// 注入一次读错误
    pub async fn inject_error(&self, err: io::Error) -> Result<()> {
        self.inbound
            .send(Err(err))
            .await
            .map_err(|_| Error::TunnelIoFailure("interface closed".into()))
    }

    /// 取走一个写回系统的 IP 包，隧道停止后返回 None
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }
}

/// 隧道使用的虚拟网卡
pub enum VirtualInterface {
    Tun(TunDevice),
    Channel(ChannelInterface),
}

impl VirtualInterface {
    /// 读取一个 IP 包，设备关闭时返回 None
    pub async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            VirtualInterface::Tun(dev) => dev.read_packet().await,
            VirtualInterface::Channel(ch) => match ch.inbound.recv().await {
                Some(Ok(packet)) => Ok(Some(packet)),
                Some(Err(e)) => Err(Error::Io(e)),
                None => Ok(None),
            },
        }
    }

    /// 写入一个完整的 IP 包
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        match self {
            VirtualInterface::Tun(dev) => dev.write_packet(packet).await,
            VirtualInterface::Channel(ch) => ch
                .outbound
                .send(packet.to_vec())
                .await
                .map_err(|_| Error::TunnelIoFailure("interface handle dropped".into())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            VirtualInterface::Tun(dev) => &dev.name,
            VirtualInterface::Channel(ch) => &ch.name,
        }
    }
}

impl From<TunDevice> for VirtualInterface {
    fn from(dev: TunDevice) -> Self {
        VirtualInterface::Tun(dev)
    }
}

impl From<ChannelInterface> for VirtualInterface {
    fn from(ch: ChannelInterface) -> Self {
        VirtualInterface::Channel(ch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_interface() {
        let (iface, mut handle) = ChannelInterface::pair("test0", 8);
        let mut iface = VirtualInterface::from(iface);
        assert_eq!(iface.name(), "test0");

        handle.inject(vec![0x45, 0x00]).await.unwrap();
        assert_eq!(iface.read_packet().await.unwrap(), Some(vec![0x45, 0x00]));

        iface.write_packet(&[1, 2, 3]).await.unwrap();
        assert_eq!(handle.recv().await, Some(vec![1, 2, 3]));

        handle.inject_error(io::Error::new(io::ErrorKind::Other, "boom")).await.unwrap();
        assert!(iface.read_packet().await.is_err());

        drop(handle);
        assert_eq!(iface.read_packet().await.unwrap(), None);
    }
}
