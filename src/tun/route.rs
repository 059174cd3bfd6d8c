//! 路由与 DNS 配置
//!
//! `NetworkSettings` 是纯数据：由 `TunnelConfig` 推导出接口地址、路由和 DNS，
//! 交给宿主系统去应用。Linux 下 `RouteGuard` 可以直接用 `ip route` 应用，
//! 并在 Drop 时清理。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::utils::IpPrefix;

/// 永远不进隧道的网段：私有网段、回环、组播
pub const DEFAULT_EXCLUDED_V4: [IpPrefix; 5] = [
    IpPrefix::v4(10, 0, 0, 0, 8),
    IpPrefix::v4(172, 16, 0, 0, 12),
    IpPrefix::v4(192, 168, 0, 0, 16),
    IpPrefix::v4(127, 0, 0, 0, 8),
    IpPrefix::v4(224, 0, 0, 0, 4),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipv4Settings {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub included_routes: Vec<IpPrefix>,
    pub excluded_routes: Vec<IpPrefix>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipv6Settings {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub included_routes: Vec<IpPrefix>,
    pub excluded_routes: Vec<IpPrefix>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSettings {
    pub servers: Vec<IpAddr>,
    /// `[""]` 表示所有域名都走这组 DNS
    pub match_domains: Vec<String>,
}

/// 交给宿主系统应用的网络设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    /// 代理地址 "host:port"
    pub tunnel_remote_address: String,
    pub ipv4: Ipv4Settings,
    pub ipv6: Option<Ipv6Settings>,
    pub dns: DnsSettings,
    pub mtu: u16,
}

impl NetworkSettings {
    pub fn from_config(config: &TunnelConfig) -> Self {
        let proxy_ip = config.proxy_host.parse::<IpAddr>().ok();
        if proxy_ip.is_none() {
            // 域名不解析，代理流量可能被路由回隧道
            tracing::warn!("Proxy host {} is not an IP literal, no route exclusion added for it", config.proxy_host);
        }

        let mut v4_included: Vec<IpPrefix> =
            config.included_routes.iter().copied().filter(|p| p.is_ipv4()).collect();
        if v4_included.is_empty() {
            v4_included.push(IpPrefix::default_v4());
        }

        let mut v4_excluded = DEFAULT_EXCLUDED_V4.to_vec();
        if let Some(ip @ IpAddr::V4(_)) = proxy_ip {
            v4_excluded.push(IpPrefix::host(ip));
        }
        push_unique(&mut v4_excluded, config.excluded_routes.iter().filter(|p| p.is_ipv4()));

        let ipv6 = config.ipv6_address.map(|address| {
            let mut included: Vec<IpPrefix> =
                config.included_routes.iter().copied().filter(|p| !p.is_ipv4()).collect();
            if included.is_empty() {
                included.push(IpPrefix::default_v6());
            }

            let mut excluded = Vec::new();
            if let Some(ip @ IpAddr::V6(_)) = proxy_ip {
                excluded.push(IpPrefix::host(ip));
            }
            push_unique(&mut excluded, config.excluded_routes.iter().filter(|p| !p.is_ipv4()));

            Ipv6Settings {
                address,
                prefix_len: config.ipv6_prefix_len,
                included_routes: included,
                excluded_routes: excluded,
            }
        });

        Self {
            tunnel_remote_address: config.proxy_addr(),
            ipv4: Ipv4Settings {
                address: config.ipv4_address,
                subnet_mask: config.ipv4_netmask,
                included_routes: v4_included,
                excluded_routes: v4_excluded,
            },
            ipv6,
            dns: DnsSettings {
                servers: config.dns_servers.clone(),
                match_domains: vec![String::new()],
            },
            mtu: config.mtu,
        }
    }

    /// 目的地址是否会被路由进隧道
    pub fn is_captured(&self, ip: IpAddr) -> bool {
        let (included, excluded) = match ip {
            IpAddr::V4(_) => (&self.ipv4.included_routes, &self.ipv4.excluded_routes),
            IpAddr::V6(_) => match &self.ipv6 {
                Some(v6) => (&v6.included_routes, &v6.excluded_routes),
                None => return false,
            },
        };
        included.iter().any(|p| p.contains(ip)) && !excluded.iter().any(|p| p.contains(ip))
    }
}

fn push_unique<'a>(list: &mut Vec<IpPrefix>, extra: impl Iterator<Item = &'a IpPrefix>) {
    for prefix in extra {
        if !list.contains(prefix) {
            list.push(*prefix);
        }
    }
}

/// 已应用的系统路由，Drop 时删除
pub struct RouteGuard {
    device_name: String,
    /// 已成功添加的路由，按添加顺序记录 `ip` 参数
    applied: Vec<Vec<String>>,
}

impl RouteGuard {
    /// 把网络设置应用到系统路由表
    #[cfg(target_os = "linux")]
    pub fn apply(device_name: &str, settings: &NetworkSettings) -> Result<Self> {
        tracing::info!("Setting up routes for TUN device: {}", device_name);

        let mut guard = Self {
            device_name: device_name.to_string(),
            applied: Vec::new(),
        };

        // 排除路由走原始网关
        if let Some(gw) = default_gateway(false) {
            tracing::info!("Original default gateway: {}", gw);
            for prefix in &settings.ipv4.excluded_routes {
                guard.add(vec!["route".into(), "add".into(), prefix.to_string(), "via".into(), gw.to_string()])?;
            }
        } else {
            tracing::warn!("No IPv4 default gateway found, excluded routes not applied");
        }

        for prefix in &settings.ipv4.included_routes {
            for part in split_default(prefix) {
                guard.add(vec!["route".into(), "add".into(), part.to_string(), "dev".into(), device_name.into()])?;
            }
        }

        if let Some(v6) = &settings.ipv6 {
            if let Some(gw) = default_gateway(true) {
                for prefix in &v6.excluded_routes {
                    guard.add(vec!["-6".into(), "route".into(), "add".into(), prefix.to_string(), "via".into(), gw.to_string()])?;
                }
            }
            for prefix in &v6.included_routes {
                for part in split_default(prefix) {
                    guard.add(vec!["-6".into(), "route".into(), "add".into(), part.to_string(), "dev".into(), device_name.into()])?;
                }
            }
        }

        tracing::info!("Routes configured successfully ({} entries)", guard.applied.len());
        Ok(guard)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply(device_name: &str, _settings: &NetworkSettings) -> Result<Self> {
        Err(Error::Other(format!(
            "Route configuration for {} is only supported on Linux",
            device_name
        )))
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    #[cfg(target_os = "linux")]
    fn add(&mut self, args: Vec<String>) -> Result<()> {
        let output = std::process::Command::new("ip")
            .args(&args)
            .output()
            .map_err(|e| Error::Other(format!("Failed to run ip: {}", e)))?;

        if output.status.success() {
            self.applied.push(args);
        } else {
            tracing::warn!("ip {}: {}", args.join(" "), String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        for mut args in self.applied.drain(..).rev() {
            // "add" -> "del"
            if let Some(verb) = args.iter_mut().find(|a| a.as_str() == "add") {
                *verb = "del".into();
            }
            let _ = std::process::Command::new("ip").args(&args).output();
        }
        tracing::info!("Routes cleaned up for {}", self.device_name);
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if !self.applied.is_empty() {
            self.cleanup();
        }
    }
}

/// 默认路由拆成两半，避免覆盖系统原有的默认路由
fn split_default(prefix: &IpPrefix) -> Vec<IpPrefix> {
    if prefix.len() != 0 {
        return vec![*prefix];
    }
    match prefix.addr() {
        IpAddr::V4(_) => vec![IpPrefix::v4(0, 0, 0, 0, 1), IpPrefix::v4(128, 0, 0, 0, 1)],
        IpAddr::V6(_) => [Ipv6Addr::UNSPECIFIED, Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0)]
            .into_iter()
            .filter_map(|addr| IpPrefix::new(IpAddr::V6(addr), 1).ok())
            .collect(),
    }
}

#[cfg(target_os = "linux")]
fn default_gateway(v6: bool) -> Option<IpAddr> {
    let mut cmd = std::process::Command::new("ip");
    if v6 {
        cmd.arg("-6");
    }
    let output = cmd.args(["route", "show", "default"]).output().ok()?;

    // 格式: "default via 192.168.1.1 dev eth0 ..."
    let route_str = String::from_utf8_lossy(&output.stdout);
    let mut parts = route_str.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "via" {
            return parts.next()?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = NetworkSettings::from_config(&TunnelConfig::default());

        assert_eq!(settings.tunnel_remote_address, "127.0.0.1:7890");
        assert_eq!(settings.ipv4.address, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(settings.ipv4.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(settings.ipv4.included_routes, vec![IpPrefix::default_v4()]);
        // 代理在 127/8 内，/32 仍然单独列出
        assert_eq!(settings.ipv4.excluded_routes.len(), 6);

        let v6 = settings.ipv6.as_ref().unwrap();
        assert_eq!(v6.prefix_len, 64);
        assert_eq!(v6.included_routes, vec![IpPrefix::default_v6()]);

        assert_eq!(settings.dns.match_domains, vec![String::new()]);
        assert_eq!(settings.dns.servers.len(), 2);
    }

    #[test]
    fn test_is_captured() {
        let config = TunnelConfig {
            proxy_host: "203.0.113.10".into(),
            excluded_routes: vec!["198.51.100.0/24".parse().unwrap()],
            ..Default::default()
        };
        let settings = NetworkSettings::from_config(&config);

        assert!(settings.is_captured("1.1.1.1".parse().unwrap()));
        assert!(settings.is_captured("2001:db8::1".parse().unwrap()));
        assert!(!settings.is_captured("192.168.1.1".parse().unwrap()));
        assert!(!settings.is_captured("10.2.3.4".parse().unwrap()));
        assert!(!settings.is_captured("239.255.255.250".parse().unwrap()));
        assert!(!settings.is_captured("203.0.113.10".parse().unwrap()));
        assert!(settings.is_captured("203.0.113.11".parse().unwrap()));
        assert!(!settings.is_captured("198.51.100.7".parse().unwrap()));
    }

    #[test]
    fn test_hostname_proxy_adds_no_exclusion() {
        let config = TunnelConfig {
            proxy_host: "proxy.example.com".into(),
            ..Default::default()
        };
        let settings = NetworkSettings::from_config(&config);

        assert_eq!(settings.tunnel_remote_address, "proxy.example.com:7890");
        assert_eq!(settings.ipv4.excluded_routes.len(), 5);
        assert_eq!(settings.ipv4.excluded_routes, DEFAULT_EXCLUDED_V4.to_vec());
    }

    #[test]
    fn test_ipv6_disabled() {
        let config = TunnelConfig {
            ipv6_address: None,
            ..Default::default()
        };
        let settings = NetworkSettings::from_config(&config);
        assert!(settings.ipv6.is_none());
        assert!(!settings.is_captured("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_serialize_camel_case() {
        let settings = NetworkSettings::from_config(&TunnelConfig::default());
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["tunnelRemoteAddress"], "127.0.0.1:7890");
        assert_eq!(json["ipv4"]["subnetMask"], "255.255.255.0");
        assert_eq!(json["ipv4"]["excludedRoutes"][0], "10.0.0.0/8");
        assert_eq!(json["dns"]["matchDomains"][0], "");
    }

    #[test]
    fn test_split_default() {
        assert_eq!(split_default(&IpPrefix::default_v4()).len(), 2);
        assert_eq!(split_default(&IpPrefix::default_v6())[1].to_string(), "8000::/1");
        let p = IpPrefix::v4(10, 0, 0, 0, 8);
        assert_eq!(split_default(&p), vec![p]);
    }
}
