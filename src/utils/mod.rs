/// 通用工具

pub mod addr;

pub use addr::{parse_host_port, IpPrefix};
