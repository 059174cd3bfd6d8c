//! UDP 流
//!
//! 每个 (src, dst) 对应一个 SOCKS5 UDP ASSOCIATE，没有握手阶段；
//! 关联失败或被淘汰时静默丢弃，不回任何包。

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::bridge::FlowContext;
use super::flow_table::{FlowPhase, FlowRegistration};
use super::packet::{build_udp_packet, ParsedPacket, Transport};
use crate::error::{Error, Result};
use crate::proxy::{Socks5UdpSession, TargetAddr};

pub struct UdpFlow {
    registration: FlowRegistration,
    /// 触发建流的第一个数据报
    initial: Vec<u8>,
    rx: mpsc::Receiver<ParsedPacket>,
    cancel: CancellationToken,
}

impl UdpFlow {
    pub fn new(
        registration: FlowRegistration,
        initial: Vec<u8>,
        rx: mpsc::Receiver<ParsedPacket>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registration,
            initial,
            rx,
            cancel,
        }
    }

    pub async fn run(self, ctx: FlowContext) {
        let UdpFlow {
            registration,
            initial,
            mut rx,
            cancel,
        } = self;
        let key = registration.key();
        debug!("New UDP flow {}", key);

        registration.set_phase(FlowPhase::SocksConnecting);
        let associate = tokio::time::timeout(ctx.handshake_timeout, Socks5UdpSession::associate(&ctx.proxy));
        let associated = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Other("cancelled".into())),
            result = associate => result.map_err(Error::from).and_then(|r| r),
        };

        let mut session = match associated {
            Ok(session) => session,
            Err(e) => {
                debug!("UDP flow {} associate failed: {}", key, e);
                ctx.stats.record_flow_failed();
                registration.deregister();
                return;
            }
        };
        registration.set_phase(FlowPhase::Established);

        let result = relay(&registration, &initial, &mut rx, &mut session, &ctx, &cancel).await;
        if let Err(e) = result {
            debug!("UDP flow {} ended: {}", key, e);
        }

        registration.set_phase(FlowPhase::Closing);
        registration.deregister();
        session.close().await;
        ctx.stats.record_flow_closed();
    }
}

async fn relay(
    registration: &FlowRegistration,
    initial: &[u8],
    rx: &mut mpsc::Receiver<ParsedPacket>,
    session: &mut Socks5UdpSession,
    ctx: &FlowContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let key = registration.key();
    let target = TargetAddr::from(key.dst);
    session.send(&target, initial).await?;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(()),

            packet = rx.recv() => {
                let Some(packet) = packet else {
                    return Ok(());
                };
                if let Transport::Udp(dgram) = packet.transport {
                    session.send(&target, &dgram.payload).await?;
                }
            }

            frame = session.recv() => {
                let Some(frame) = frame? else {
                    debug!("UDP flow {} association closed by proxy", key);
                    return Ok(());
                };
                trace!("UDP flow {} <- {} bytes from {}", key, frame.data.len(), frame.target);
                // 回包以原目标地址为源
                let packet = build_udp_packet(key.dst, key.src, &frame.data)?;
                ctx.writer.write_packet(packet).await?;
                registration.touch();
            }
        }
    }
}
