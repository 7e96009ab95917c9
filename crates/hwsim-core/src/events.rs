//! Per-device publish/subscribe.
//!
//! Events are a closed set of tagged variants. Delivery is synchronous on the
//! publishing task; callbacks must not block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::types::PendingKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingEndReason {
    Paired,
    Exited,
    TimedOut,
    /// A new connection or a reset discarded the pairing window.
    Superseded,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    PairingStarted { code: String, expires_at_ms: u64 },
    PairingEnded { reason: PairingEndReason },
    Heartbeat { at_ms: u64 },
    Connected { paired: bool },
    Paired { app_name: String },
    Unpaired,
    ApprovalRequested { request_id: u64, payload: serde_json::Value },
    ExternalDataRequested { request_id: u64, kind: PendingKind, payload: serde_json::Value },
    RequestResolved { request_id: u64, outcome: String },
    DeviceReset { full: bool },
}

type Callback = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    by_device: DashMap<String, Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

/// Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Subscribers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, device_id: &str, callback: F) -> Subscription
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .by_device
            .entry(device_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            device_id: device_id.to_string(),
            id,
        }
    }

    pub fn publish(&self, device_id: &str, event: DeviceEvent) {
        // Snapshot callbacks so none runs while a shard lock is held.
        let callbacks: Vec<Callback> = match self.inner.by_device.get(device_id) {
            Some(subs) => subs.iter().map(|(_, cb)| cb.clone()).collect(),
            None => Vec::new(),
        };
        debug!(device_id, ?event, subscribers = callbacks.len(), "publish");
        for cb in callbacks {
            cb(&event);
        }
    }

    pub fn subscriber_count(&self, device_id: &str) -> usize {
        self.inner.by_device.get(device_id).map_or(0, |s| s.len())
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<Subscribers>,
    device_id: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else { return };
        let now_empty = match bus.by_device.get_mut(&self.device_id) {
            Some(mut subs) => {
                subs.retain(|(id, _)| *id != self.id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            bus.by_device.remove_if(&self.device_id, |_, subs| subs.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(bus: &EventBus, device: &str) -> (Subscription, Arc<Mutex<Vec<DeviceEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(device, move |e| sink.lock().unwrap().push(e.clone()));
        (sub, seen)
    }

    #[test]
    fn test_publish_reaches_device_subscribers_only() {
        let bus = EventBus::new();
        let (_a, seen_a) = recorder(&bus, "a");
        let (_b, seen_b) = recorder(&bus, "b");

        bus.publish("a", DeviceEvent::Heartbeat { at_ms: 1 });
        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (sub, seen) = recorder(&bus, "a");
        let (_other, _) = recorder(&bus, "a");
        assert_eq!(bus.subscriber_count("a"), 2);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("a"), 1);
        bus.publish("a", DeviceEvent::Unpaired);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_callback_may_subscribe_during_publish() {
        let bus = EventBus::new();
        let inner = bus.clone();
        let _sub = bus.subscribe("a", move |_| {
            inner.subscribe("a", |_| {}).unsubscribe();
        });
        bus.publish("a", DeviceEvent::Unpaired);
    }

    #[test]
    fn test_events_serialize_tagged() {
        let json = serde_json::to_value(DeviceEvent::PairingEnded { reason: PairingEndReason::TimedOut }).unwrap();
        assert_eq!(json["type"], "pairing_ended");
        assert_eq!(json["reason"], "timed_out");
    }
}
