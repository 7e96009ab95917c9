//! Device registry and the hosting-process entry points.
//!
//! The registry owns one [`DeviceHandle`] per device id, created on first use.
//! A handle bundles the device's state with its session manager, protocol
//! handler and request correlator; all of them share one state lock, so
//! mutations of a device are serialized while different devices proceed
//! independently.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hwsim_crypto::hash::sha256;
use hwsim_proto::frame::MsgType;

use crate::config::{ConfigError, DeviceConfig};
use crate::correlator::RequestCorrelator;
use crate::dispatch::{DispatchStatsSnapshot, ProtocolHandler};
use crate::errors::{DeviceError, DeviceResult};
use crate::events::{DeviceEvent, EventBus, PairingEndReason, Subscription};
use crate::pairings::{InMemoryPairingStore, PairingRecord, PairingStore};
use crate::session::SessionManager;
use crate::state::{DeviceState, SessionPhase};
use crate::store::KvRecord;
use crate::types::{now_ms, PendingKind, PendingRequest, Wallet};

/// App name stored with pairing records created by [`DeviceHandle::sync_state`].
const SYNCED_APP_NAME: &str = "state-sync";

/// Externally held authoritative copy of a device. Applying one replaces the
/// corresponding fields wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub paired: bool,
    #[serde(default)]
    pub kv_records: Vec<KvRecord>,
    pub config: DeviceConfig,
}

/// Point-in-time view for operators and tests.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub phase: SessionPhase,
    pub connected: bool,
    pub paired: bool,
    pub locked: bool,
    pub busy: bool,
    pub pairing_code: Option<String>,
    pub kv_records: usize,
    pub pending_requests: usize,
    pub stats: DispatchStatsSnapshot,
}

// ============================================================================
// Registry
// ============================================================================

pub struct DeviceRegistry {
    devices: DashMap<String, Arc<DeviceHandle>>,
    events: EventBus,
    pairings: Arc<dyn PairingStore>,
    default_config: DeviceConfig,
}

impl DeviceRegistry {
    /// Registry with an in-memory pairing store.
    pub fn new(default_config: DeviceConfig) -> Result<Self, ConfigError> {
        Self::with_pairing_store(default_config, Arc::new(InMemoryPairingStore::new()))
    }

    pub fn with_pairing_store(
        default_config: DeviceConfig,
        pairings: Arc<dyn PairingStore>,
    ) -> Result<Self, ConfigError> {
        default_config.validate()?;
        Ok(Self {
            devices: DashMap::new(),
            events: EventBus::new(),
            pairings,
            default_config,
        })
    }

    /// The device for `id`, created with the default configuration on first
    /// use.
    pub fn device(&self, id: &str) -> Arc<DeviceHandle> {
        self.devices
            .entry(id.to_string())
            .or_insert_with(|| {
                info!(device_id = %id, "device created");
                Arc::new(DeviceHandle::new(
                    id,
                    self.default_config.clone(),
                    self.events.clone(),
                    Arc::clone(&self.pairings),
                ))
            })
            .clone()
    }

    /// The device for `id` if it exists.
    pub fn get(&self, id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.get(id).map(|d| d.clone())
    }

    /// Remove a device. Its pairing timer is cancelled and any pending
    /// requests are rejected. Durable pairing records are kept.
    pub async fn dispose(&self, id: &str) -> bool {
        let Some((_, device)) = self.devices.remove(id) else {
            return false;
        };
        device.shutdown().await;
        info!(device_id = %id, "device disposed");
        true
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn subscribe<F>(&self, device_id: &str, callback: F) -> Subscription
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(device_id, callback)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn default_config(&self) -> &DeviceConfig {
        &self.default_config
    }
}

// ============================================================================
// Device handle
// ============================================================================

pub struct DeviceHandle {
    id: String,
    state: Arc<Mutex<DeviceState>>,
    session: SessionManager,
    protocol: ProtocolHandler,
    correlator: RequestCorrelator,
    events: EventBus,
    pairings: Arc<dyn PairingStore>,
    default_config: DeviceConfig,
}

impl DeviceHandle {
    fn new(id: &str, config: DeviceConfig, events: EventBus, pairings: Arc<dyn PairingStore>) -> Self {
        let state = Arc::new(Mutex::new(DeviceState::new(id, config.clone())));
        let session = SessionManager::new(id, Arc::clone(&state), Arc::clone(&pairings), events.clone());
        let correlator = RequestCorrelator::new(id, events.clone());
        let protocol = ProtocolHandler::new(
            id,
            Arc::clone(&state),
            session.clone(),
            correlator.clone(),
            events.clone(),
        );
        Self {
            id: id.to_string(),
            state,
            session,
            protocol,
            correlator,
            events,
            pairings,
            default_config: config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &ProtocolHandler {
        &self.protocol
    }

    // ------------------------------------------------------------------
    // Transport entry points
    // ------------------------------------------------------------------

    pub async fn handle_plain_request(&self, msg_type: MsgType, body: &[u8]) -> Vec<u8> {
        self.protocol.handle_plain_request(msg_type, body).await
    }

    pub async fn handle_plain_frame(&self, frame: &[u8]) -> Vec<u8> {
        self.protocol.handle_plain_frame(frame).await
    }

    pub async fn handle_secure_request(&self, envelope: &[u8]) -> DeviceResult<Vec<u8>> {
        self.protocol.handle_secure_request(envelope).await
    }

    // ------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------

    /// Enter pairing mode and return the new pairing code.
    pub async fn enter_pairing_mode(&self) -> DeviceResult<String> {
        self.session.enter_pairing_mode().await
    }

    pub async fn exit_pairing_mode(&self) -> bool {
        self.session.exit_pairing_mode().await
    }

    pub async fn unpair(&self) -> DeviceResult<()> {
        self.session.unpair().await
    }

    pub async fn pairings(&self) -> DeviceResult<Vec<PairingRecord>> {
        self.pairings.list_pairings(&self.id).await
    }

    // ------------------------------------------------------------------
    // Device flags and wallets
    // ------------------------------------------------------------------

    pub async fn set_locked(&self, locked: bool) {
        self.state.lock().await.locked = locked;
        info!(device_id = %self.id, locked, "lock state changed");
    }

    pub async fn set_busy(&self, busy: bool) {
        self.state.lock().await.busy = busy;
        debug!(device_id = %self.id, busy, "busy flag changed");
    }

    /// Replace the capability bitmask of the internal or external wallet.
    pub async fn set_wallet_capabilities(&self, external: bool, capabilities: u32) -> DeviceResult<()> {
        let mut state = self.state.lock().await;
        let wallet = if external {
            state
                .wallets
                .external
                .as_mut()
                .ok_or_else(|| DeviceError::NotFound("external wallet".into()))?
        } else {
            &mut state.wallets.internal
        };
        wallet.capabilities = capabilities;
        info!(device_id = %self.id, external, capabilities, "wallet capabilities changed");
        Ok(())
    }

    /// Install or remove the external wallet.
    pub async fn set_external_wallet(&self, wallet: Option<Wallet>) {
        let wallet = wallet.map(|w| Wallet { external: true, ..w });
        let present = wallet.is_some();
        self.state.lock().await.wallets.external = wallet;
        info!(device_id = %self.id, present, "external wallet changed");
    }

    // ------------------------------------------------------------------
    // Pending requests
    // ------------------------------------------------------------------

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.correlator.pending()
    }

    /// Approve a pending signing request.
    pub fn approve_request(&self, id: u64) -> DeviceResult<()> {
        self.expect_kind(id, PendingKind::SignApproval)?;
        self.correlator.resolve(id, serde_json::Value::Null)
    }

    /// Decline a pending signing request; the signer sees `UserRejected`.
    pub fn reject_request(&self, id: u64) -> DeviceResult<()> {
        self.expect_kind(id, PendingKind::SignApproval)?;
        self.correlator.reject(id, DeviceError::UserRejected)
    }

    /// Deliver externally held data for a pending request.
    pub fn resolve_external(&self, id: u64, data: serde_json::Value) -> DeviceResult<()> {
        self.expect_kind(id, PendingKind::KvSnapshot)?;
        self.correlator.resolve(id, data)
    }

    /// Refuse a pending external data request; the waiter sees
    /// `UserRejected`.
    pub fn reject_external(&self, id: u64, reason: &str) -> DeviceResult<()> {
        self.expect_kind(id, PendingKind::KvSnapshot)?;
        warn!(device_id = %self.id, request_id = id, reason, "external request rejected");
        self.correlator.reject(id, DeviceError::UserRejected)
    }

    fn expect_kind(&self, id: u64, kind: PendingKind) -> DeviceResult<()> {
        let request = self
            .correlator
            .get(id)
            .ok_or_else(|| DeviceError::NotFound(format!("pending request {id}")))?;
        if request.kind != kind {
            return Err(DeviceError::InvalidRequest(format!(
                "pending request {id} is {:?}, not {kind:?}",
                request.kind
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // State sync and resets
    // ------------------------------------------------------------------

    /// Replace name, paired flag, KV records and configuration with the
    /// snapshot. Nothing is merged.
    pub async fn sync_state(&self, snapshot: DeviceSnapshot) -> DeviceResult<()> {
        snapshot
            .config
            .validate()
            .map_err(|e| DeviceError::InvalidRequest(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.name = snapshot.name;
        state.firmware_version = snapshot.config.firmware_version;
        state.wallets.internal.uid = sha256(snapshot.config.seed_hex.as_bytes()).to_vec();
        state.kv.set_capacity(snapshot.config.kv_capacity);
        state.kv.restore_all(snapshot.kv_records);
        state.config = snapshot.config;

        let client = state.client_pub().map(<[u8]>::to_vec);
        let was_paired = state.is_paired();
        match (snapshot.paired, client) {
            (true, Some(client)) if !was_paired => {
                self.pairings
                    .save_pairing(PairingRecord {
                        device_id: self.id.clone(),
                        client_pub: client,
                        app_name: SYNCED_APP_NAME.to_string(),
                        paired_at_ms: now_ms(),
                    })
                    .await?;
                state.mark_paired()?;
            }
            (true, None) => {
                debug!(device_id = %self.id, "snapshot marks device paired but no client is connected");
            }
            (false, client) => {
                if let Some(client) = client {
                    self.pairings.delete_pairing(&self.id, &client).await?;
                }
                state.mark_unpaired();
            }
            _ => {}
        }
        let paired = state.is_paired();
        let kv_records = state.kv.len();
        drop(state);

        info!(device_id = %self.id, paired, kv_records, "state synced");
        if was_paired && !paired {
            self.events.publish(&self.id, DeviceEvent::Unpaired);
        }
        Ok(())
    }

    /// Current state in the shape accepted by [`DeviceHandle::sync_state`].
    pub async fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.lock().await;
        DeviceSnapshot {
            name: state.name.clone(),
            paired: state.is_paired(),
            kv_records: state.kv.records().to_vec(),
            config: state.config.clone(),
        }
    }

    /// Recreate the device from its default configuration. Session, pairing
    /// and key material, KV records, flags and stored pairings are all
    /// discarded, and pending requests are rejected.
    pub async fn reset_full(&self) -> DeviceResult<()> {
        // Held until the store is cleared so a concurrent connect cannot
        // restore a pairing that is about to be deleted.
        let mut state = self.state.lock().await;
        let had_window = state.reset_full(self.default_config.clone());
        let cleared = self.pairings.clear_device(&self.id).await?;
        let rejected = self.correlator.reject_all(DeviceError::Internal("device reset".into()));
        drop(state);

        info!(device_id = %self.id, cleared, rejected, "full reset");
        if had_window {
            self.events.publish(&self.id, DeviceEvent::PairingEnded { reason: PairingEndReason::Superseded });
        }
        self.events.publish(&self.id, DeviceEvent::DeviceReset { full: true });
        Ok(())
    }

    /// Drop the connection along with its pairing and key material. KV
    /// records, wallets and configuration survive.
    pub async fn reset_connection(&self) -> DeviceResult<()> {
        let mut state = self.state.lock().await;
        let had_window = state.reset_connection();
        let cleared = self.pairings.clear_device(&self.id).await?;
        let rejected = self.correlator.reject_all(DeviceError::Internal("connection reset".into()));
        drop(state);

        info!(device_id = %self.id, cleared, rejected, "connection reset");
        if had_window {
            self.events.publish(&self.id, DeviceEvent::PairingEnded { reason: PairingEndReason::Superseded });
        }
        self.events.publish(&self.id, DeviceEvent::DeviceReset { full: false });
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.lock().await.close_pairing_window();
        self.correlator.reject_all(DeviceError::Internal("device disposed".into()));
    }

    // ------------------------------------------------------------------
    // Liveness and status
    // ------------------------------------------------------------------

    pub fn heartbeat(&self) {
        self.events.publish(&self.id, DeviceEvent::Heartbeat { at_ms: now_ms() });
    }

    /// Publish a heartbeat every `period` until the returned task is aborted.
    pub fn spawn_heartbeat(&self, period: Duration) -> JoinHandle<()> {
        let events = self.events.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                events.publish(&id, DeviceEvent::Heartbeat { at_ms: now_ms() });
            }
        })
    }

    pub async fn status(&self) -> DeviceStatus {
        let state = self.state.lock().await;
        DeviceStatus {
            id: self.id.clone(),
            name: state.name.clone(),
            phase: state.phase(),
            connected: state.is_connected(),
            paired: state.is_paired(),
            locked: state.locked,
            busy: state.busy,
            pairing_code: state.pairing_code().map(str::to_string),
            kv_records: state.kv.len(),
            pending_requests: self.correlator.len(),
            stats: self.protocol.stats(),
        }
    }

    /// Direct access to the device record, for inspection in tests.
    pub async fn with_state<R>(&self, f: impl FnOnce(&DeviceState) -> R) -> R {
        f(&*self.state.lock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_default_config_rejected() {
        let config = DeviceConfig { pairing_timeout_ms: 0, ..DeviceConfig::default() };
        assert!(DeviceRegistry::new(config).is_err());
    }

    #[tokio::test]
    async fn test_device_created_once() {
        let reg = registry();
        let a = reg.device("a");
        let again = reg.device("a");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(reg.get("b").is_none());
        assert_eq!(reg.ids(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending() {
        let reg = registry();
        let dev = reg.device("a");
        let handle = dev.correlator.issue(PendingKind::SignApproval, json!(null), Duration::from_secs(30));

        assert!(reg.dispose("a").await);
        assert!(!reg.dispose("a").await);
        assert!(matches!(handle.wait().await, Err(DeviceError::Internal(_))));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_approve_checks_kind() {
        let reg = registry();
        let dev = reg.device("a");
        let handle = dev.correlator.issue(PendingKind::KvSnapshot, json!(null), Duration::from_secs(30));
        assert!(matches!(dev.approve_request(handle.id()), Err(DeviceError::InvalidRequest(_))));
        assert!(matches!(dev.approve_request(999), Err(DeviceError::NotFound(_))));

        dev.resolve_external(handle.id(), json!([])).unwrap();
        assert_eq!(handle.wait().await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_wallet_capabilities() {
        let reg = registry();
        let dev = reg.device("a");
        assert!(matches!(dev.set_wallet_capabilities(true, 1).await, Err(DeviceError::NotFound(_))));

        dev.set_external_wallet(Some(Wallet {
            uid: vec![7; 32],
            name: "Card".into(),
            capabilities: 0,
            external: false,
        }))
        .await;
        dev.set_wallet_capabilities(true, 5).await.unwrap();
        dev.with_state(|s| {
            let ext = s.wallets.external.as_ref().unwrap();
            assert!(ext.external);
            assert_eq!(ext.capabilities, 5);
        })
        .await;
    }

    #[tokio::test]
    async fn test_sync_state_replaces_records() {
        let reg = registry();
        let dev = reg.device("a");
        dev.with_state(|s| assert!(s.kv.is_empty())).await;

        let mut config = DeviceConfig::default();
        config.auto_approve = false;
        let snapshot = DeviceSnapshot {
            name: "Synced".into(),
            paired: false,
            kv_records: vec![KvRecord { id: 9, record_type: 0, key: "k".into(), value: "v".into() }],
            config,
        };
        dev.sync_state(snapshot.clone()).await.unwrap();
        assert_eq!(dev.snapshot().await, snapshot);

        let bad = DeviceSnapshot {
            config: DeviceConfig { kv_capacity: 0, ..DeviceConfig::default() },
            ..snapshot
        };
        assert!(matches!(dev.sync_state(bad).await, Err(DeviceError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_reset_full_restores_defaults() {
        let reg = registry();
        let dev = reg.device("a");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = reg.subscribe("a", move |e| sink.lock().unwrap().push(e.clone()));

        dev.set_locked(true).await;
        dev.reset_full().await.unwrap();
        let status = dev.status().await;
        assert!(!status.locked);
        assert_eq!(status.phase, SessionPhase::Disconnected);
        assert_eq!(seen.lock().unwrap().last(), Some(&DeviceEvent::DeviceReset { full: true }));
        sub.unsubscribe();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task_publishes() {
        let reg = registry();
        let dev = reg.device("a");
        let count = Arc::new(StdMutex::new(0usize));
        let sink = count.clone();
        let _sub = reg.subscribe("a", move |e| {
            if matches!(e, DeviceEvent::Heartbeat { .. }) {
                *sink.lock().unwrap() += 1;
            }
        });

        let task = dev.spawn_heartbeat(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        task.abort();
        assert_eq!(*count.lock().unwrap(), 3);
    }
}
