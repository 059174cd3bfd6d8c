//! 流表 - 连接追踪
//!
//! FlowKey -> 流条目。每个 key 至多一个条目，容量有上限，空闲超时淘汰。
//! 锁只在同步代码里短暂持有，不跨 await。

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::packet::{ParsedPacket, Transport};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// 流标识（五元组）
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct FlowKey {
    pub protocol: Protocol,
    /// 本机（TUN 内侧）地址
    pub src: SocketAddr,
    /// 远端目标地址
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    pub fn from_packet(packet: &ParsedPacket) -> Option<Self> {
        let protocol = match packet.transport {
            Transport::Tcp(_) => Protocol::Tcp,
            Transport::Udp(_) => Protocol::Udp,
            Transport::Other(_) => return None,
        };
        Some(Self {
            protocol,
            src: packet.src_socket()?,
            dst: packet.dst_socket()?,
        })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        };
        write!(f, "{} {} -> {}", proto, self.src, self.dst)
    }
}

/// 流生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    Init,
    /// 已收到 SYN，正在发起 CONNECT
    SynSeen,
    /// 等待代理握手与 CONNECT 应答
    SocksConnecting,
    Established,
    /// 任一方向已 FIN / RST / EOF
    Closing,
    Closed,
}

struct FlowEntry {
    id: u64,
    tx: mpsc::Sender<ParsedPacket>,
    cancel: CancellationToken,
    phase: FlowPhase,
    last_activity: Instant,
}

/// 查表结果
#[derive(Debug, Clone)]
pub struct FlowHandle {
    pub id: u64,
    pub tx: mpsc::Sender<ParsedPacket>,
    pub phase: FlowPhase,
}

/// 流表
pub struct FlowTable {
    entries: Mutex<HashMap<FlowKey, FlowEntry>>,
    next_id: AtomicU64,
    tcp_idle_timeout: Duration,
    udp_idle_timeout: Duration,
    max_entries: usize,
}

impl FlowTable {
    pub fn new(max_entries: usize, tcp_idle_timeout: Duration, udp_idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tcp_idle_timeout,
            udp_idle_timeout,
            max_entries,
        }
    }

    /// 注册新流
    ///
    /// key 已存在返回 `FlowExists`，容量已满返回 `TableFull`
    pub fn register(
        self: &Arc<Self>,
        key: FlowKey,
        tx: mpsc::Sender<ParsedPacket>,
        cancel: CancellationToken,
    ) -> Result<FlowRegistration> {
        let mut entries = self.entries.lock();

        if entries.contains_key(&key) {
            return Err(Error::FlowExists(key.to_string()));
        }
        if entries.len() >= self.max_entries {
            return Err(Error::TableFull(self.max_entries));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key,
            FlowEntry {
                id,
                tx,
                cancel,
                phase: FlowPhase::Init,
                last_activity: Instant::now(),
            },
        );

        Ok(FlowRegistration {
            table: Arc::clone(self),
            key,
            id,
            released: false,
        })
    }

    /// 查找并刷新活动时间
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowHandle> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.last_activity = Instant::now();
        Some(FlowHandle {
            id: entry.id,
            tx: entry.tx.clone(),
            phase: entry.phase,
        })
    }

    pub fn touch(&self, key: &FlowKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn phase(&self, key: &FlowKey) -> Option<FlowPhase> {
        self.entries.lock().get(key).map(|e| e.phase)
    }

    fn set_phase(&self, key: &FlowKey, id: u64, phase: FlowPhase) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            if entry.id == id {
                entry.phase = phase;
            }
        }
    }

    /// 删除条目（仅当 id 匹配，避免误删同 key 的新流）
    fn remove(&self, key: &FlowKey, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.id == id => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// 淘汰空闲流：从表中删除并取消其任务，返回被淘汰的 key
    pub fn evict_idle(&self) -> Vec<FlowKey> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        self.entries.lock().retain(|key, entry| {
            let timeout = match key.protocol {
                Protocol::Tcp => self.tcp_idle_timeout,
                Protocol::Udp => self.udp_idle_timeout,
            };
            if now.duration_since(entry.last_activity) >= timeout {
                entry.cancel.cancel();
                evicted.push(*key);
                false
            } else {
                true
            }
        });

        evicted
    }

    /// 取消所有流（停止隧道时）
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.cancel.cancel();
        }
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> FlowTableStats {
        let entries = self.entries.lock();

        let mut stats = FlowTableStats {
            total: entries.len(),
            ..Default::default()
        };
        for (key, entry) in entries.iter() {
            match key.protocol {
                Protocol::Tcp => stats.tcp += 1,
                Protocol::Udp => stats.udp += 1,
            }
            if entry.phase == FlowPhase::Established {
                stats.established += 1;
            }
        }
        stats
    }
}

/// 流表统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowTableStats {
    pub total: usize,
    pub tcp: usize,
    pub udp: usize,
    pub established: usize,
}

/// 流在表中的注册凭据
///
/// 流任务结束时先 `deregister()`，再释放 SOCKS5 会话；Drop 兜底删除。
pub struct FlowRegistration {
    table: Arc<FlowTable>,
    key: FlowKey,
    id: u64,
    released: bool,
}

impl FlowRegistration {
    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_phase(&self, phase: FlowPhase) {
        self.table.set_phase(&self.key, self.id, phase);
    }

    pub fn touch(&self) {
        self.table.touch(&self.key);
    }

    pub fn deregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.table.set_phase(&self.key, self.id, FlowPhase::Closed);
            self.table.remove(&self.key, self.id);
        }
    }
}

impl Drop for FlowRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16, protocol: Protocol) -> FlowKey {
        FlowKey::new(
            protocol,
            format!("172.16.0.2:{}", port).parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
        )
    }

    fn table(max: usize) -> Arc<FlowTable> {
        Arc::new(FlowTable::new(max, Duration::from_secs(120), Duration::from_secs(60)))
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let table = table(16);
        let (tx, _rx) = mpsc::channel(1);
        let first = table.register(key(1000, Protocol::Tcp), tx.clone(), CancellationToken::new()).unwrap();

        let err = table.register(key(1000, Protocol::Tcp), tx.clone(), CancellationToken::new());
        assert!(matches!(err, Err(Error::FlowExists(_))));

        // 同端口不同协议是不同的流
        let _udp = table.register(key(1000, Protocol::Udp), tx, CancellationToken::new()).unwrap();
        assert_eq!(table.len(), 2);

        first.deregister();
        assert_eq!(table.len(), 1);
        assert!(table.lookup(&key(1000, Protocol::Tcp)).is_none());
    }

    #[test]
    fn test_table_full() {
        let table = table(2);
        let (tx, _rx) = mpsc::channel(1);
        let _a = table.register(key(1, Protocol::Tcp), tx.clone(), CancellationToken::new()).unwrap();
        let _b = table.register(key(2, Protocol::Tcp), tx.clone(), CancellationToken::new()).unwrap();
        let err = table.register(key(3, Protocol::Tcp), tx, CancellationToken::new());
        assert!(matches!(err, Err(Error::TableFull(2))));
    }

    #[test]
    fn test_stale_registration_does_not_remove_new_flow() {
        let table = table(16);
        let (tx, _rx) = mpsc::channel(1);
        let k = key(5000, Protocol::Tcp);

        let old = table.register(k, tx.clone(), CancellationToken::new()).unwrap();
        // 模拟被淘汰后同 key 重新建立
        table.remove(&k, old.id());
        let new = table.register(k, tx, CancellationToken::new()).unwrap();
        new.set_phase(FlowPhase::Established);

        drop(old);
        assert_eq!(table.phase(&k), Some(FlowPhase::Established));
        assert_eq!(table.stats().established, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations() {
        let table = table(1024);
        let (tx, _rx) = mpsc::channel(1);

        let mut handles = Vec::new();
        for port in 0..100u16 {
            let table = table.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                table.register(key(10000 + port, Protocol::Tcp), tx, CancellationToken::new())
            }));
        }

        let mut registrations = Vec::new();
        for handle in handles {
            registrations.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(table.len(), 100);
        assert_eq!(table.stats().tcp, 100);
        drop(registrations);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_key_single_winner() {
        let table = table(1024);
        let (tx, _rx) = mpsc::channel(1);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let table = table.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                table.register(key(443, Protocol::Udp), tx, CancellationToken::new())
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Ok(reg) = handle.await.unwrap() {
                winners.push(reg);
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction() {
        let table = table(16);
        let (tx, _rx) = mpsc::channel(1);
        let tcp_cancel = CancellationToken::new();
        let udp_cancel = CancellationToken::new();
        let _tcp = table.register(key(1, Protocol::Tcp), tx.clone(), tcp_cancel.clone()).unwrap();
        let _udp = table.register(key(2, Protocol::Udp), tx, udp_cancel.clone()).unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(table.evict_idle().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.evict_idle(), vec![key(2, Protocol::Udp)]);
        assert!(udp_cancel.is_cancelled());
        assert!(!tcp_cancel.is_cancelled());

        // 活动刷新计时
        table.touch(&key(1, Protocol::Tcp));
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(table.evict_idle().is_empty());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(table.evict_idle(), vec![key(1, Protocol::Tcp)]);
        assert!(tcp_cancel.is_cancelled());
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let table = table(16);
        let (tx, _rx) = mpsc::channel(1);
        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        let _regs: Vec<_> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| table.register(key(i as u16, Protocol::Tcp), tx.clone(), t.clone()).unwrap())
            .collect();

        assert_eq!(table.cancel_all(), 3);
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }
}
