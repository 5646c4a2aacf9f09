//! UDP transport adapter: owns the socket, the read/dispatch/write
//! loop, and the timer wakeups.
//!
//! Grounded on `examples/original_source/backend/sip_server.py`'s
//! receive-dispatch-send loop, rebuilt around `tokio::net::UdpSocket`
//! and `tokio::select!` the way the teacher crate's (sync,
//! buffer-per-read) transport code never needed to because it had no
//! async runtime at all -- this shape instead follows
//! `examples/eisenzopf-rvoip`'s use of `tokio::select!` to race a
//! socket read against a timer deadline.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Duration, Instant as TokioInstant};
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::engine::SipEngine;

pub struct Transport {
    socket: UdpSocket,
    engine: Arc<SipEngine>,
    clock: Arc<dyn crate::clock::Clock>,
}

impl Transport {
    pub async fn bind(engine: Arc<SipEngine>, clock: Arc<dyn crate::clock::Clock>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(&engine.config().bind_addr).await?;
        info!(bind_addr = %engine.config().bind_addr, "transport bound");
        Ok(Self { socket, engine, clock })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the receive/dispatch/send loop until `shutdown` resolves.
    /// Also wakes on pending timer deadlines so `ringing -> established`
    /// auto-answers fire close to on schedule even with no further
    /// inbound traffic.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let max_len = self.engine.config().max_datagram_bytes;
        let mut buf = vec![0u8; max_len];

        loop {
            let deadline = self.timer_deadline();
            tokio::select! {
                _ = &mut shutdown => {
                    info!("transport shutting down");
                    self.engine.audit_bus().shutdown();
                    return;
                }
                _ = sleep_until(deadline) => {
                    let now = self.clock.now();
                    for (peer, datagram) in self.engine.fire_due_timers(now) {
                        self.send(peer, &datagram).await;
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, peer)) => self.handle_datagram(peer, &buf[..len]).await,
                        Err(error) => warn!(%error, "socket read failed"),
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, peer: SocketAddr, datagram: &[u8]) {
        debug!(%peer, len = datagram.len(), "received datagram");
        for (dest, response) in self.engine.ingest(peer, datagram) {
            self.send(dest, &response).await;
        }
    }

    async fn send(&self, dest: SocketAddr, datagram: &[u8]) {
        if let Err(error) = self.socket.send_to(datagram, dest).await {
            warn!(%error, %dest, "socket write failed");
        }
    }

    fn timer_deadline(&self) -> TokioInstant {
        match self.engine.next_timer_deadline() {
            // The engine works in its own `MonoTime`; the transport
            // only needs *a* wakeup cadence, not an exact mapping, so
            // poll every 50ms while a timer is outstanding.
            Some(_) => TokioInstant::now() + Duration::from_millis(50),
            None => TokioInstant::now() + Duration::from_secs(3600),
        }
    }
}

/// Periodic liveness reaper: calls `registry.active()` every
/// `reaper_tick_sec`, aging out stale registrations (SPEC_FULL §4.2,
/// §5).
pub async fn run_reaper(engine: Arc<SipEngine>, clock: Arc<dyn crate::clock::Clock>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let tick = Duration::from_secs(engine.config().reaper_tick_sec.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {
                let now = clock.now();
                let active = engine.registry.active(engine.config().liveness_timeout_sec, &*clock, engine.audit_bus());
                info!(active = active.len(), "reaper tick");
                engine.audit_bus().publish(AuditEvent::new(
                    now,
                    "REAPER_TICK",
                    [("active_count".to_string(), active.len().to_string())],
                ));
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
