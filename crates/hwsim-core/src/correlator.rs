//! Out-of-band request/response bridge.
//!
//! A handler that needs data or a decision it does not own issues a pending
//! request and awaits its handle. The first of resolve, reject or timeout
//! removes the entry and delivers the outcome; later attempts find nothing and
//! report `NotFound`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::errors::{DeviceError, DeviceResult};
use crate::events::{DeviceEvent, EventBus};
use crate::types::{now_ms, PendingKind, PendingRequest};

#[derive(Debug)]
enum Resolution {
    Resolved(serde_json::Value),
    Rejected(DeviceError),
    TimedOut,
}

impl Resolution {
    fn outcome(&self) -> &'static str {
        match self {
            Resolution::Resolved(_) => "resolved",
            Resolution::Rejected(_) => "rejected",
            Resolution::TimedOut => "timed_out",
        }
    }
}

struct Entry {
    request: PendingRequest,
    tx: oneshot::Sender<Resolution>,
    timer: Option<AbortHandle>,
}

struct Inner {
    device_id: String,
    pending: DashMap<u64, Entry>,
    next_id: AtomicU64,
    events: EventBus,
}

impl Inner {
    /// Single point of terminal resolution. Returns false if `id` is unknown
    /// or already resolved.
    fn finish(&self, id: u64, resolution: Resolution) -> bool {
        let Some((_, entry)) = self.pending.remove(&id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        let outcome = resolution.outcome();
        debug!(device_id = %self.device_id, request_id = id, outcome, "pending request finished");
        // The waiter may have gone away; the entry is still terminal.
        let _ = entry.tx.send(resolution);
        self.events.publish(
            &self.device_id,
            DeviceEvent::RequestResolved { request_id: id, outcome: outcome.to_string() },
        );
        true
    }
}

/// Cheap to clone; clones share the pending table.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<Inner>,
}

/// Awaitable side of an issued request.
#[derive(Debug)]
pub struct PendingHandle {
    id: u64,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Suspend until the request is resolved, rejected or times out.
    pub async fn wait(self) -> DeviceResult<serde_json::Value> {
        match self.rx.await {
            Ok(Resolution::Resolved(data)) => Ok(data),
            Ok(Resolution::Rejected(e)) => Err(e),
            Ok(Resolution::TimedOut) => Err(DeviceError::Timeout),
            Err(_) => Err(DeviceError::Internal("pending request dropped".into())),
        }
    }
}

impl RequestCorrelator {
    pub fn new(device_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.into(),
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Register a pending request. The timeout starts now and fires even if
    /// nothing else happens on the device.
    pub fn issue(&self, kind: PendingKind, payload: serde_json::Value, timeout: Duration) -> PendingHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            id,
            kind,
            payload,
            created_at_ms: now_ms(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        self.inner.pending.insert(id, Entry { request, tx, timer: None });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if inner.finish(id, Resolution::TimedOut) {
                    info!(device_id = %inner.device_id, request_id = id, "pending request timed out");
                }
            }
        });
        if let Some(mut entry) = self.inner.pending.get_mut(&id) {
            entry.timer = Some(timer.abort_handle());
        }

        info!(device_id = %self.inner.device_id, request_id = id, ?kind, "pending request issued");
        PendingHandle { id, rx }
    }

    pub fn resolve(&self, id: u64, data: serde_json::Value) -> DeviceResult<()> {
        if self.inner.finish(id, Resolution::Resolved(data)) {
            Ok(())
        } else {
            Err(DeviceError::NotFound(format!("pending request {id}")))
        }
    }

    pub fn reject(&self, id: u64, error: DeviceError) -> DeviceResult<()> {
        if self.inner.finish(id, Resolution::Rejected(error)) {
            Ok(())
        } else {
            Err(DeviceError::NotFound(format!("pending request {id}")))
        }
    }

    /// Reject everything outstanding. Returns how many were rejected.
    pub fn reject_all(&self, error: DeviceError) -> usize {
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.inner.finish(*id, Resolution::Rejected(error.clone())))
            .count()
    }

    /// Outstanding requests in issue order.
    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut out: Vec<PendingRequest> =
            self.inner.pending.iter().map(|e| e.request.clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn get(&self, id: u64) -> Option<PendingRequest> {
        self.inner.pending.get(&id).map(|e| e.request.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pending.is_empty()
    }
}
