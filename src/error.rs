use thiserror::Error;

use crate::proxy::socks5::ReplyError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 启动时缺少隧道配置（致命）
    #[error("Tunnel configuration missing")]
    ConfigurationMissing,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 无法解析的 IP 包，丢弃即可，不影响流
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Proxy connect failed: {0}")]
    ProxyConnectFailed(String),

    #[error("Proxy handshake failed: {0}")]
    ProxyHandshakeFailed(String),

    /// 代理返回了非成功的 REP 码
    #[error("Proxy rejected request: {0}")]
    ProxyRejected(#[from] ReplyError),

    #[error("Proxy stream error: {0}")]
    ProxyStream(std::io::Error),

    #[error("Flow table full ({0} entries)")]
    TableFull(usize),

    #[error("Flow already registered: {0}")]
    FlowExists(String),

    /// 虚拟网卡读失败，整个隧道需要有序停止
    #[error("Tunnel I/O failure: {0}")]
    TunnelIoFailure(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// 是否只影响单个流（不应向上传播到 Bridge）
    pub fn is_flow_scoped(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket(_)
                | Error::ProxyConnectFailed(_)
                | Error::ProxyHandshakeFailed(_)
                | Error::ProxyRejected(_)
                | Error::ProxyStream(_)
                | Error::TableFull(_)
                | Error::Timeout
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_scoped_errors() {
        assert!(Error::TableFull(10).is_flow_scoped());
        assert!(Error::ProxyRejected(ReplyError::HostUnreachable).is_flow_scoped());
        assert!(!Error::ConfigurationMissing.is_flow_scoped());
        assert!(!Error::TunnelIoFailure("read".into()).is_flow_scoped());
    }

    #[test]
    fn test_reply_error_display() {
        let err: Error = ReplyError::ProxyRefused.into();
        assert!(err.to_string().contains("refused"));
    }
}
