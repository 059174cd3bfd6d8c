//! 隧道配置
//!
//! - `ActivationConfig`: 控制面下发的激活配置（代理地址 + 节点名），JSON 持久化
//! - `TunnelConfig`: 一次激活期间不可变的完整配置
//! - `ProfileStore`: 已安装配置的读写

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::IpPrefix;

pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROXY_PORT: u16 = 7890;
pub const DEFAULT_NODE_LABEL: &str = "GLOBAL";

/// 激活配置
///
/// 兼容旧版 helper 的 `clashHost` / `clashPort` / `nodeName` 字段名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationConfig {
    /// SOCKS5 代理主机
    #[serde(alias = "clashHost")]
    pub proxy_host: String,

    /// SOCKS5 代理端口
    #[serde(alias = "clashPort")]
    pub proxy_port: u16,

    /// 当前节点名称（仅展示用）
    #[serde(default = "default_node_label", alias = "nodeName")]
    pub node_label: String,
}

fn default_node_label() -> String {
    DEFAULT_NODE_LABEL.to_string()
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            node_label: default_node_label(),
        }
    }
}

impl ActivationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.proxy_host.trim().is_empty() {
            return Err(Error::InvalidConfig("proxy host is empty".into()));
        }
        if self.proxy_port == 0 {
            return Err(Error::InvalidConfig("proxy port must be non-zero".into()));
        }
        Ok(())
    }
}

/// 隧道配置（一次激活内不可变）
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// TUN 设备名称
    pub device_name: String,
    /// SOCKS5 代理主机
    pub proxy_host: String,
    /// SOCKS5 代理端口
    pub proxy_port: u16,
    /// 节点名称
    pub node_label: String,
    /// 虚拟 IPv4 地址
    pub ipv4_address: Ipv4Addr,
    /// IPv4 子网掩码
    pub ipv4_netmask: Ipv4Addr,
    /// 虚拟 IPv6 地址（None 表示不接管 IPv6）
    pub ipv6_address: Option<Ipv6Addr>,
    pub ipv6_prefix_len: u8,
    /// MTU
    pub mtu: u16,
    /// 额外接管的路由（为空时使用默认路由）
    pub included_routes: Vec<IpPrefix>,
    /// 额外排除的路由（叠加在内置排除列表之上）
    pub excluded_routes: Vec<IpPrefix>,
    /// DNS 服务器
    pub dns_servers: Vec<IpAddr>,
    /// SOCKS5 握手超时
    pub handshake_timeout: Duration,
    /// TCP 空闲超时
    pub tcp_idle_timeout: Duration,
    /// UDP 空闲超时
    pub udp_idle_timeout: Duration,
    /// 流表容量
    pub max_flows: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            device_name: "utun-socks".to_string(),
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            node_label: default_node_label(),
            ipv4_address: Ipv4Addr::new(172, 16, 0, 2),
            ipv4_netmask: Ipv4Addr::new(255, 255, 255, 0),
            ipv6_address: Some(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2)),
            ipv6_prefix_len: 64,
            mtu: 1500,
            included_routes: Vec::new(),
            excluded_routes: Vec::new(),
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ],
            handshake_timeout: Duration::from_secs(10),
            tcp_idle_timeout: Duration::from_secs(120),
            udp_idle_timeout: Duration::from_secs(60),
            max_flows: 4096,
        }
    }
}

impl TunnelConfig {
    /// 以当前配置为模板，套用激活配置
    pub fn with_activation(&self, activation: &ActivationConfig) -> Self {
        Self {
            proxy_host: activation.proxy_host.clone(),
            proxy_port: activation.proxy_port,
            node_label: activation.node_label.clone(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy_host.trim().is_empty() {
            return Err(Error::InvalidConfig("proxy host is empty".into()));
        }
        if self.proxy_port == 0 {
            return Err(Error::InvalidConfig("proxy port must be non-zero".into()));
        }
        if self.mtu < 576 {
            return Err(Error::InvalidConfig(format!("MTU {} is too small", self.mtu)));
        }
        if self.max_flows == 0 {
            return Err(Error::InvalidConfig("max_flows must be non-zero".into()));
        }
        if self.handshake_timeout.is_zero()
            || self.tcp_idle_timeout.is_zero()
            || self.udp_idle_timeout.is_zero()
        {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// 代理地址（host:port 形式，IPv6 加方括号）
    pub fn proxy_addr(&self) -> String {
        match self.proxy_host.parse::<Ipv6Addr>() {
            Ok(_) => format!("[{}]:{}", self.proxy_host, self.proxy_port),
            Err(_) => format!("{}:{}", self.proxy_host, self.proxy_port),
        }
    }

    /// 空闲流扫描间隔
    pub fn sweep_interval(&self) -> Duration {
        let shortest = self.tcp_idle_timeout.min(self.udp_idle_timeout);
        (shortest / 4).clamp(Duration::from_millis(10), Duration::from_secs(5))
    }
}

/// 已安装配置的持久化存储（JSON 文件）
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 默认位置：平台配置目录下的 profile.json
    pub fn default_location() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("moe", "tunsocks", "tunsocks")
            .ok_or_else(|| Error::Other("无法获取配置目录".into()))?;
        Ok(Self::new(dirs.config_dir().join("profile.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取配置，不存在时返回 None
    pub fn load(&self) -> Result<Option<ActivationConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let config: ActivationConfig = serde_json::from_str(&content)?;
        Ok(Some(config))
    }

    pub fn save(&self, config: &ActivationConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// 删除配置，返回是否真的删除了文件
    pub fn remove(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
