//! tunsocks: 用户态 TUN -> SOCKS5 桥接
//!
//! 从虚拟网卡读取原始 IP 包，还原 TCP/UDP 流，
//! 通过 SOCKS5 CONNECT / UDP ASSOCIATE 转发，再合成回包写回网卡。

pub mod config;
pub mod control;
pub mod error;
pub mod proxy;
pub mod rpc;
pub mod tun;
pub mod utils;

pub use control::{ConnectionStatus, StatusReport, TunnelController, TunnelState};
pub use error::{Error, Result};
