//! 控制面
//!
//! 宿主（CLI / RPC / 嵌入方）通过 `TunnelController` 管理隧道生命周期：
//! install / update / remove 操作持久化的配置，start / stop / toggle 操作运行中的桥接。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ActivationConfig, ProfileStore, TunnelConfig};
use crate::error::{Error, Result};
use crate::proxy::ProxyEndpoint;
use crate::tun::{BridgeHandle, NetworkSettings, RouteGuard, StatsSnapshot, TunDevice, TunnelBridge, VirtualInterface};

/// 隧道状态，只经由控制面迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// 对宿主报告的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
    /// 未安装配置
    Invalid,
}

impl From<TunnelState> for ConnectionStatus {
    fn from(state: TunnelState) -> Self {
        match state {
            TunnelState::Stopped => ConnectionStatus::Disconnected,
            TunnelState::Starting => ConnectionStatus::Connecting,
            TunnelState::Running => ConnectionStatus::Connected,
            TunnelState::Stopping => ConnectionStatus::Disconnecting,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub supported: bool,
    pub installed: bool,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_flows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
}

/// 启动前检查代理端口的超时上限
const PROXY_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

struct ActiveTunnel {
    handle: BridgeHandle,
    /// 桥接任务持有路由，任务结束即撤销
    task: JoinHandle<Result<()>>,
    settings: NetworkSettings,
}

/// 隧道控制器
pub struct TunnelController {
    store: ProfileStore,
    template: TunnelConfig,
    apply_routes: bool,
    state: Arc<watch::Sender<TunnelState>>,
    active: Mutex<Option<ActiveTunnel>>,
}

impl TunnelController {
    pub fn new(store: ProfileStore) -> Self {
        Self::with_template(store, TunnelConfig::default())
    }

    /// `template` 提供激活配置之外的字段（设备名、超时等）
    pub fn with_template(store: ProfileStore, template: TunnelConfig) -> Self {
        let (state, _) = watch::channel(TunnelState::Stopped);
        Self {
            store,
            template,
            apply_routes: false,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    /// 启动时是否把路由写入系统（仅 Linux）
    pub fn apply_routes(mut self, enabled: bool) -> Self {
        self.apply_routes = enabled;
        self
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    /// 安装配置（已存在则覆盖）
    pub fn install(&self, activation: &ActivationConfig) -> Result<()> {
        activation.validate()?;
        self.store.save(activation)?;
        info!("✅ Profile installed: {} ({}:{})", activation.node_label, activation.proxy_host, activation.proxy_port);
        Ok(())
    }

    /// 更新配置，下次启动生效
    pub fn update(&self, activation: &ActivationConfig) -> Result<()> {
        activation.validate()?;
        self.store.save(activation)?;
        if self.state() != TunnelState::Stopped {
            info!("Profile updated, takes effect on next start");
        } else {
            info!("✅ Profile updated: {}", activation.node_label);
        }
        Ok(())
    }

    /// 删除配置（运行中先停止），返回是否存在过
    pub async fn remove(&self) -> Result<bool> {
        self.stop().await?;
        let removed = self.store.remove()?;
        if removed {
            info!("Profile removed: {}", self.store.path().display());
        }
        Ok(removed)
    }

    /// 锁住当前隧道；已自行退出的（设备失败等）先回收
    async fn live(&self) -> MutexGuard<'_, Option<ActiveTunnel>> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|t| t.task.is_finished()) {
            if let Some(tunnel) = active.take() {
                match tunnel.task.await {
                    Ok(Ok(())) => debug!("Reaped finished tunnel"),
                    Ok(Err(e)) => debug!("Reaped failed tunnel: {}", e),
                    Err(e) => warn!("Tunnel task failed: {}", e),
                }
            }
        }
        active
    }

    /// 在给定的虚拟网卡上启动
    pub async fn start(&self, device: VirtualInterface) -> Result<()> {
        self.start_with(|_| Ok(device)).await
    }

    /// 在系统 TUN 设备上启动
    pub async fn start_tun(&self) -> Result<()> {
        self.start_with(|config| TunDevice::create(config).map(Into::into)).await
    }

    async fn start_with<F>(&self, open_device: F) -> Result<()>
    where
        F: FnOnce(&TunnelConfig) -> Result<VirtualInterface>,
    {
        let mut active = self.live().await;
        if active.is_some() {
            info!("Tunnel already running");
            return Ok(());
        }

        let activation = self.store.load()?.ok_or(Error::ConfigurationMissing)?;
        let config = self.template.with_activation(&activation);
        config.validate()?;

        self.state.send_replace(TunnelState::Starting);
        info!("🚀 Starting tunnel via {} ({})", config.proxy_addr(), config.node_label);

        let launched = match check_proxy(&config).await {
            Ok(()) => self.launch(config, open_device),
            Err(e) => Err(e),
        };
        match launched {
            Ok(tunnel) => {
                *active = Some(tunnel);
                self.state.send_replace(TunnelState::Running);
                info!("✅ Tunnel running");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(TunnelState::Stopped);
                Err(e)
            }
        }
    }

    fn launch<F>(&self, config: TunnelConfig, open_device: F) -> Result<ActiveTunnel>
    where
        F: FnOnce(&TunnelConfig) -> Result<VirtualInterface>,
    {
        let settings = NetworkSettings::from_config(&config);
        let device = open_device(&config)?;
        let routes = if self.apply_routes {
            Some(RouteGuard::apply(device.name(), &settings)?)
        } else {
            None
        };

        let bridge = TunnelBridge::new(config)?;
        let handle = bridge.handle();
        let state = self.state.clone();

        let task = tokio::spawn(async move {
            let result = bridge.run(device).await;
            drop(routes);
            if let Err(e) = &result {
                warn!("Tunnel stopped with error: {}", e);
            }
            // 设备失败时自行回到 Stopped
            state.send_if_modified(|s| {
                if *s == TunnelState::Running {
                    *s = TunnelState::Stopped;
                    true
                } else {
                    false
                }
            });
            result
        });

        Ok(ActiveTunnel { handle, task, settings })
    }

    /// 停止隧道，未运行时为空操作
    pub async fn stop(&self) -> Result<()> {
        let Some(tunnel) = self.live().await.take() else {
            return Ok(());
        };

        self.state.send_replace(TunnelState::Stopping);
        tunnel.handle.shutdown();

        match tunnel.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Tunnel exited with error: {}", e),
            Err(e) => warn!("Tunnel task failed: {}", e),
        }

        self.state.send_replace(TunnelState::Stopped);
        info!("✅ Tunnel stopped");
        Ok(())
    }

    /// 运行中则停止，否则在系统 TUN 设备上启动
    pub async fn toggle(&self) -> Result<TunnelState> {
        self.toggle_with(|config| TunDevice::create(config).map(Into::into)).await
    }

    pub async fn toggle_with<F>(&self, open_device: F) -> Result<TunnelState>
    where
        F: FnOnce(&TunnelConfig) -> Result<VirtualInterface>,
    {
        if self.live().await.is_some() {
            self.stop().await?;
        } else {
            self.start_with(open_device).await?;
        }
        Ok(self.state())
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let profile = self.store.load()?;
        let state = self.state();
        let active = self.live().await;

        let status = if profile.is_none() && state == TunnelState::Stopped {
            ConnectionStatus::Invalid
        } else {
            ConnectionStatus::from(state)
        };
        let running = active.as_ref().filter(|_| state == TunnelState::Running);

        Ok(StatusReport {
            supported: cfg!(any(target_os = "linux", target_os = "macos", target_os = "windows")),
            installed: profile.is_some(),
            status,
            node_name: profile.as_ref().map(|p| p.node_label.clone()),
            proxy_port: profile.as_ref().map(|p| p.proxy_port),
            active_flows: running.map(|t| t.handle.table().len()),
            stats: running.map(|t| t.handle.stats()),
        })
    }

    /// 向运行中的隧道投递宿主消息，无回复
    pub async fn send_app_message(&self, data: Vec<u8>) -> Result<()> {
        match self.live().await.as_ref() {
            Some(tunnel) => tunnel.handle.send_message(data),
            None => Err(Error::Other("tunnel is not running".into())),
        }
    }

    /// 当前激活的网络设置
    pub async fn network_settings(&self) -> Option<NetworkSettings> {
        self.live().await.as_ref().map(|t| t.settings.clone())
    }

    pub async fn flow_count(&self) -> usize {
        self.live()
            .await
            .as_ref()
            .map(|t| t.handle.table().len())
            .unwrap_or(0)
    }
}

/// 确认代理端口可连接，否则不启动
async fn check_proxy(config: &TunnelConfig) -> Result<()> {
    let proxy = ProxyEndpoint::new(config.proxy_host.clone(), config.proxy_port);
    let limit = config.handshake_timeout.min(PROXY_CHECK_TIMEOUT);

    match tokio::time::timeout(limit, proxy.connect()).await {
        Ok(Ok(_)) => {
            debug!("Proxy {} is reachable", proxy);
            Ok(())
        }
        Ok(Err(e)) => {
            warn!("❌ Proxy {} is not reachable: {}", proxy, e);
            Err(e)
        }
        Err(_) => {
            warn!("❌ Proxy {} did not accept within {:?}", proxy, limit);
            Err(Error::ProxyConnectFailed(format!("{}: connect timed out", proxy)))
        }
    }
}
