//! Bounded, multi-producer, multi-consumer audit event bus.
//!
//! Grounded on `examples/original_source/backend/user_manager.py`'s
//! `VoIPLogger.log_step` (step name + small detail map) for the event
//! shape, and on `tokio::sync::broadcast` for the bus itself: a lagging
//! receiver surfaces `RecvError::Lagged(n)`, which maps directly onto
//! SPEC_FULL §4.5's "evict oldest undelivered, emit `AUDIT_OVERFLOW`
//! with the evicted count" requirement without a hand-rolled ring
//! buffer and eviction policy.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::clock::{Clock, MonoTime, SystemClock};

/// One immutable, timestamped step record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub timestamp: MonoTime,
    pub step_name: String,
    pub details: Vec<(String, String)>,
}

impl AuditEvent {
    pub fn new(
        timestamp: MonoTime,
        step_name: impl Into<String>,
        details: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self { timestamp, step_name: step_name.into(), details: details.into_iter().collect() }
    }

    fn overflow(timestamp: MonoTime, dropped: u64) -> Self {
        Self::new(timestamp, "AUDIT_OVERFLOW", [("dropped".to_string(), dropped.to_string())])
    }

    fn shutdown(timestamp: MonoTime) -> Self {
        Self::new(timestamp, "SHUTDOWN", [])
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// JSON rendering of one event, for the (out-of-scope) admin
    /// surface's log/WebSocket endpoints to consume (SPEC_FULL §6).
    /// Serialization of a well-formed `AuditEvent` cannot fail.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("AuditEvent serializes")
    }
}

/// The bus itself. Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct AuditBus {
    tx: broadcast::Sender<AuditEvent>,
    clock: Arc<dyn Clock>,
}

impl AuditBus {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx, clock }
    }

    /// Enqueue an event. Never blocks: `broadcast` drops the oldest
    /// undelivered entry for slow subscribers instead of applying
    /// backpressure to the producer, exactly as SPEC_FULL §4.5 and §5
    /// require.
    pub fn publish(&self, event: AuditEvent) {
        // No receivers is not an error condition for a producer.
        let _ = self.tx.send(event);
    }

    /// A consumer handle on the bus (SPEC_FULL §6: `subscribe_audit()`).
    pub fn subscribe(&self) -> AuditSubscription {
        AuditSubscription { rx: self.tx.subscribe(), clock: self.clock.clone() }
    }

    /// Publish a final `SHUTDOWN` event to every connected subscriber
    /// (SPEC_FULL §5 cancellation path).
    pub fn shutdown(&self) {
        self.publish(AuditEvent::shutdown(self.clock.now()));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view of the bus. Lag is surfaced as a synthetic
/// `AUDIT_OVERFLOW` event rather than an error, so every subscriber
/// sees a total order of events (possibly with gaps) instead of
/// having to handle a distinct lag type.
pub struct AuditSubscription {
    rx: broadcast::Receiver<AuditEvent>,
    clock: Arc<dyn Clock>,
}

impl AuditSubscription {
    pub async fn next(&mut self) -> Option<AuditEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(AuditEvent::overflow(self.clock.now(), skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = AuditBus::new(16);
        let mut sub = bus.subscribe();
        bus.publish(AuditEvent::new(MonoTime(1), "A", []));
        bus.publish(AuditEvent::new(MonoTime(2), "B", []));
        assert_eq!(sub.next().await.unwrap().step_name, "A");
        assert_eq!(sub.next().await.unwrap().step_name, "B");
    }

    #[tokio::test]
    async fn slow_subscriber_sees_overflow_not_backpressure() {
        let clock = Arc::new(FakeClock::new());
        let bus = AuditBus::with_clock(2, clock);
        let mut sub = bus.subscribe();
        // Publishing never blocks even though the subscriber hasn't
        // drained anything yet.
        for i in 0..10u64 {
            bus.publish(AuditEvent::new(MonoTime(i), "STEP", []));
        }
        let mut saw_overflow = false;
        let mut delivered = 0;
        while let Some(event) = sub.next().await {
            if event.step_name == "AUDIT_OVERFLOW" {
                saw_overflow = true;
                assert!(event.detail("dropped").unwrap().parse::<u64>().unwrap() > 0);
            } else {
                delivered += 1;
            }
            if delivered + (saw_overflow as usize) >= 3 {
                break;
            }
        }
        assert!(saw_overflow);
    }

    #[test]
    fn to_json_round_trips_through_serde_json() {
        let event = AuditEvent::new(MonoTime(7), "REGISTER_REQUEST", [("extension".to_string(), "200".to_string())]);
        let json = event.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["step_name"], "REGISTER_REQUEST");
        assert_eq!(value["timestamp"], 7);
    }

    #[tokio::test]
    async fn shutdown_is_observed_by_subscribers() {
        let bus = AuditBus::new(4);
        let mut sub = bus.subscribe();
        bus.shutdown();
        assert_eq!(sub.next().await.unwrap().step_name, "SHUTDOWN");
    }
}
