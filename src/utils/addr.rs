/// 地址解析工具

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 解析代理地址
///
/// 支持 "host:port" 和 "[v6]:port" 两种格式
///
/// # 返回
///
/// (host, port)
pub fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InvalidConfig(format!("Invalid proxy address: {}", addr)))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| Error::InvalidConfig(format!("Missing port: {}", addr)))?;
        (&rest[..end], port)
    } else {
        addr.rsplit_once(':')
            .ok_or_else(|| Error::InvalidConfig(format!("Invalid proxy address: {}", addr)))?
    };

    if host.is_empty() {
        return Err(Error::InvalidConfig(format!("Empty host: {}", addr)));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidConfig(format!("Invalid port: {}", port)))?;

    Ok((host.to_string(), port))
}

/// CIDR 前缀，例如 10.0.0.0/8 或 ::/0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(Error::InvalidConfig(format!("Prefix length {} out of range for {}", len, addr)));
        }
        Ok(Self { addr: mask(addr, len), len })
    }

    pub const fn v4(a: u8, b: u8, c: u8, d: u8, len: u8) -> Self {
        Self { addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)), len }
    }

    /// 单个主机（/32 或 /128）
    pub fn host(addr: IpAddr) -> Self {
        let len = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, len }
    }

    pub fn default_v4() -> Self {
        Self { addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED), len: 0 }
    }

    pub fn default_v6() -> Self {
        Self { addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED), len: 0 }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// 子网掩码形式（仅 IPv4）
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(_) => Some(Ipv4Addr::from(prefix_bits_v4(self.len))),
            IpAddr::V6(_) => None,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.len) == self.addr
            }
            _ => false,
        }
    }
}

fn prefix_bits_v4(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - len as u32) }
}

fn prefix_bits_v6(len: u8) -> u128 {
    if len == 0 { 0 } else { u128::MAX << (128 - len as u32) }
}

fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & prefix_bits_v4(len))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & prefix_bits_v6(len))),
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => {
                let len = len
                    .parse::<u8>()
                    .map_err(|_| Error::InvalidConfig(format!("Invalid prefix: {}", s)))?;
                (addr, Some(len))
            }
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("Invalid prefix: {}", s)))?;
        match len {
            Some(len) => Self::new(addr, len),
            None => Ok(Self::host(addr)),
        }
    }
}

impl From<IpPrefix> for String {
    fn from(p: IpPrefix) -> Self {
        p.to_string()
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}
