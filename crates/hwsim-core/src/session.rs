//! Pairing state machine.
//!
//! `Disconnected -> Connected -> PairingMode -> Paired`. Pairing mode can be
//! entered from Connected or Paired and reverts to whichever of the two the
//! paired flag says when it ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hwsim_crypto::code::{code_matches, generate_pairing_code};
use hwsim_crypto::keys::{derive_shared_secret, generate_ephemeral_key_pair, parse_public};
use hwsim_crypto::pairing::{pairing_transcript_v1, verify_pairing_signature};

use crate::errors::{DeviceError, DeviceResult};
use crate::events::{DeviceEvent, EventBus, PairingEndReason};
use crate::pairings::{PairingRecord, PairingStore};
use crate::state::{DeviceState, PairingWindow, SessionPhase};
use crate::types::{now_ms, ActiveWallets, FirmwareVersion};

/// What a client learns from `connect`.
#[derive(Clone, Debug)]
pub struct ConnectOutcome {
    pub firmware_version: FirmwareVersion,
    /// Compressed SEC1 public key of this session's ephemeral pair.
    pub ephemeral_pub: Vec<u8>,
    pub paired: bool,
    /// Present only when the client is already paired.
    pub wallets: Option<ActiveWallets>,
}

#[derive(Clone)]
pub struct SessionManager {
    device_id: String,
    state: Arc<Mutex<DeviceState>>,
    pairings: Arc<dyn PairingStore>,
    events: EventBus,
}

impl SessionManager {
    pub fn new(
        device_id: impl Into<String>,
        state: Arc<Mutex<DeviceState>>,
        pairings: Arc<dyn PairingStore>,
        events: EventBus,
    ) -> Self {
        Self { device_id: device_id.into(), state, pairings, events }
    }

    /// Start a session with `client_pub`. Fresh ephemeral keys are generated
    /// on every call; a client with a stored pairing record comes back Paired.
    pub async fn connect(&self, client_pub: &[u8]) -> DeviceResult<ConnectOutcome> {
        let remote = parse_public(client_pub)?;
        let ephemeral = generate_ephemeral_key_pair();
        let channel_key = derive_shared_secret(ephemeral.secret(), &remote);
        let ephemeral_pub = ephemeral.public_bytes();

        let mut state = self.state.lock().await;
        let paired = self
            .pairings
            .load_pairing(&self.device_id, client_pub)
            .await?
            .is_some();
        let superseded = state.begin_session(client_pub.to_vec(), ephemeral, channel_key, paired);

        let outcome = ConnectOutcome {
            firmware_version: state.firmware_version,
            ephemeral_pub,
            paired,
            wallets: paired.then(|| state.wallets.clone()),
        };
        drop(state);

        info!(
            device_id = %self.device_id,
            client = %hex::encode(&client_pub[..4]),
            paired,
            "client connected"
        );
        if superseded {
            self.publish(DeviceEvent::PairingEnded { reason: PairingEndReason::Superseded });
        }
        self.publish(DeviceEvent::Connected { paired });
        Ok(outcome)
    }

    /// Enter pairing mode with a fresh code. Re-entering cancels the previous
    /// window's timer before the new one starts.
    pub async fn enter_pairing_mode(&self) -> DeviceResult<String> {
        let mut state = self.state.lock().await;
        if state.phase() == SessionPhase::Disconnected {
            return Err(DeviceError::InvalidRequest("device not connected".into()));
        }

        let code = generate_pairing_code()?;
        let timeout_ms = state.config.pairing_timeout_ms;
        let timeout = Duration::from_millis(timeout_ms);
        let generation = state.next_pairing_generation();
        let expires_at_ms = now_ms() + timeout_ms;

        let timer = self.spawn_pairing_timer(generation, timeout);
        state.open_pairing_window(
            PairingWindow::new(code.clone(), Instant::now() + timeout, expires_at_ms, generation),
            timer,
        );
        drop(state);

        info!(device_id = %self.device_id, generation, timeout_ms, "pairing mode started");
        self.publish(DeviceEvent::PairingStarted { code: code.clone(), expires_at_ms });
        Ok(code)
    }

    fn spawn_pairing_timer(&self, generation: u64, timeout: Duration) -> AbortHandle {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = state.lock().await.expire_pairing_window(generation);
            if expired {
                info!(device_id = %device_id, generation, "pairing mode timed out");
                events.publish(&device_id, DeviceEvent::PairingEnded { reason: PairingEndReason::TimedOut });
            }
        })
        .abort_handle()
    }

    /// Leave pairing mode. Returns false, and emits nothing, when pairing
    /// mode was not active.
    pub async fn exit_pairing_mode(&self) -> bool {
        let closed = self.state.lock().await.close_pairing_window();
        if closed {
            info!(device_id = %self.device_id, "pairing mode exited");
            self.publish(DeviceEvent::PairingEnded { reason: PairingEndReason::Exited });
        }
        closed
    }

    /// Verify the pairing secret and the client's signature over the session
    /// transcript. On any failure the device state is left as it was.
    pub async fn finalize_pairing(
        &self,
        app_name: &str,
        pairing_secret: &str,
        signature: &[u8],
    ) -> DeviceResult<ActiveWallets> {
        let mut state = self.state.lock().await;

        let window = state
            .pairing_window()
            .ok_or_else(|| DeviceError::InvalidRequest("not in pairing mode".into()))?;
        if Instant::now() >= window.expires_at {
            return Err(DeviceError::InvalidRequest("pairing window expired".into()));
        }
        if !code_matches(&window.code, pairing_secret) {
            warn!(device_id = %self.device_id, "pairing secret mismatch");
            return Err(DeviceError::InvalidSignature);
        }

        let (client_pub, ephemeral_pub) = match (state.client_pub(), state.ephemeral()) {
            (Some(client), Some(ephemeral)) => (client.to_vec(), ephemeral.public_bytes()),
            _ => return Err(DeviceError::InvalidRequest("device not connected".into())),
        };

        // Verify signature over the transcript
        let transcript = pairing_transcript_v1(&client_pub, &ephemeral_pub, app_name, pairing_secret);
        if let Err(e) = verify_pairing_signature(&client_pub, &transcript, signature) {
            warn!(device_id = %self.device_id, error = %e, "pairing signature rejected");
            return Err(e.into());
        }

        // Persist first so a store failure leaves nothing half-committed
        state.derive_channel_key()?;
        self.pairings
            .save_pairing(PairingRecord {
                device_id: self.device_id.clone(),
                client_pub,
                app_name: app_name.to_string(),
                paired_at_ms: now_ms(),
            })
            .await?;
        state.mark_paired()?;
        state.close_pairing_window();
        let wallets = state.wallets.clone();
        drop(state);

        info!(device_id = %self.device_id, app_name, "pairing finalized");
        self.publish(DeviceEvent::PairingEnded { reason: PairingEndReason::Paired });
        self.publish(DeviceEvent::Paired { app_name: app_name.to_string() });
        Ok(wallets)
    }

    /// Drop the pairing for the connected client. The connection stays up.
    pub async fn unpair(&self) -> DeviceResult<()> {
        let mut state = self.state.lock().await;
        if let Some(client) = state.client_pub() {
            self.pairings.delete_pairing(&self.device_id, client).await?;
        }
        let was_paired = state.is_paired();
        state.mark_unpaired();
        drop(state);

        if was_paired {
            info!(device_id = %self.device_id, "unpaired");
            self.publish(DeviceEvent::Unpaired);
        } else {
            debug!(device_id = %self.device_id, "unpair on unpaired device");
        }
        Ok(())
    }

    fn publish(&self, event: DeviceEvent) {
        self.events.publish(&self.device_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use hwsim_crypto::pairing::sign_pairing_transcript;
    use k256::ecdsa::SigningKey;
    use rand_core::OsRng;

    use crate::config::DeviceConfig;
    use crate::pairings::InMemoryPairingStore;

    struct Fixture {
        session: SessionManager,
        state: Arc<Mutex<DeviceState>>,
        events: Arc<StdMutex<Vec<DeviceEvent>>>,
        client: SigningKey,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = EventBus::new();
            let events = Arc::new(StdMutex::new(Vec::new()));
            let sink = events.clone();
            let _ = bus.subscribe("dev", move |e| sink.lock().unwrap().push(e.clone()));
            let state = Arc::new(Mutex::new(DeviceState::new("dev", DeviceConfig::default())));
            let session =
                SessionManager::new("dev", state.clone(), Arc::new(InMemoryPairingStore::new()), bus);
            Self { session, state, events, client: SigningKey::random(&mut OsRng) }
        }

        fn client_pub(&self) -> Vec<u8> {
            self.client.verifying_key().to_encoded_point(true).as_bytes().to_vec()
        }

        fn sign(&self, ephemeral_pub: &[u8], code: &str) -> [u8; 64] {
            let t = pairing_transcript_v1(&self.client_pub(), ephemeral_pub, "test-app", code);
            sign_pairing_transcript(&self.client, &t)
        }

        fn ended_events(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, DeviceEvent::PairingEnded { .. }))
                .count()
        }
    }

    #[tokio::test]
    async fn test_connect_generates_fresh_ephemeral_keys() {
        let f = Fixture::new();
        let a = f.session.connect(&f.client_pub()).await.unwrap();
        let b = f.session.connect(&f.client_pub()).await.unwrap();
        assert_ne!(a.ephemeral_pub, b.ephemeral_pub);
        assert!(!a.paired);
        assert!(a.wallets.is_none());
        assert_eq!(f.state.lock().await.phase(), SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_key() {
        let f = Fixture::new();
        let err = f.session.connect(&[0u8; 33]).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidRequest(_)));
        assert_eq!(f.state.lock().await.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_pairing_mode_requires_connection() {
        let f = Fixture::new();
        assert!(matches!(
            f.session.enter_pairing_mode().await,
            Err(DeviceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_full_pairing_and_reconnect() {
        let f = Fixture::new();
        let conn = f.session.connect(&f.client_pub()).await.unwrap();
        let code = f.session.enter_pairing_mode().await.unwrap();
        assert_eq!(f.state.lock().await.phase(), SessionPhase::PairingMode);

        let sig = f.sign(&conn.ephemeral_pub, &code);
        f.session.finalize_pairing("test-app", &code, &sig).await.unwrap();
        {
            let state = f.state.lock().await;
            assert_eq!(state.phase(), SessionPhase::Paired);
            assert!(state.pairing_code().is_none());
            assert!(state.shared_secret().is_some());
        }

        let again = f.session.connect(&f.client_pub()).await.unwrap();
        assert!(again.paired);
        assert!(again.wallets.is_some());
    }

    #[tokio::test]
    async fn test_bad_signature_leaves_state_unchanged() {
        let f = Fixture::new();
        let conn = f.session.connect(&f.client_pub()).await.unwrap();
        let code = f.session.enter_pairing_mode().await.unwrap();

        let mut sig = f.sign(&conn.ephemeral_pub, &code);
        sig[5] ^= 0x01;
        let err = f.session.finalize_pairing("test-app", &code, &sig).await.unwrap_err();
        assert_eq!(err, DeviceError::InvalidSignature);

        let state = f.state.lock().await;
        assert!(!state.is_paired());
        assert_eq!(state.pairing_code(), Some(code.as_str()));
    }

    #[tokio::test]
    async fn test_wrong_code_is_invalid_signature() {
        let f = Fixture::new();
        let conn = f.session.connect(&f.client_pub()).await.unwrap();
        let code = f.session.enter_pairing_mode().await.unwrap();
        let wrong = if code == "00000000" { "00000001" } else { "00000000" };
        let sig = f.sign(&conn.ephemeral_pub, wrong);
        assert_eq!(
            f.session.finalize_pairing("test-app", wrong, &sig).await,
            Err(DeviceError::InvalidSignature)
        );
        assert!(!f.state.lock().await.is_paired());
    }

    #[tokio::test]
    async fn test_exit_when_not_in_pairing_mode_is_noop() {
        let f = Fixture::new();
        f.session.connect(&f.client_pub()).await.unwrap();
        assert!(!f.session.exit_pairing_mode().await);
        assert_eq!(f.ended_events(), 0);

        f.session.enter_pairing_mode().await.unwrap();
        assert!(f.session.exit_pairing_mode().await);
        assert_eq!(f.ended_events(), 1);
        assert_eq!(f.state.lock().await.phase(), SessionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentry_cancels_previous_timer() {
        let f = Fixture::new();
        f.session.connect(&f.client_pub()).await.unwrap();

        f.session.enter_pairing_mode().await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        let second = f.session.enter_pairing_mode().await.unwrap();

        // First window's deadline passes; the second code must survive it.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.state.lock().await.pairing_code(), Some(second.as_str()));
        assert_eq!(f.ended_events(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(f.state.lock().await.pairing_code().is_none());
        assert_eq!(f.ended_events(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentry_codes_are_independent() {
        let f = Fixture::new();
        let conn = f.session.connect(&f.client_pub()).await.unwrap();

        let first = f.session.enter_pairing_mode().await.unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        let second = f.session.enter_pairing_mode().await.unwrap();
        // Past the first window's deadline.
        tokio::time::sleep(Duration::from_secs(30)).await;

        if first != second {
            let stale = f.sign(&conn.ephemeral_pub, &first);
            assert_eq!(
                f.session.finalize_pairing("test-app", &first, &stale).await.unwrap_err(),
                DeviceError::InvalidSignature
            );
            assert_eq!(f.state.lock().await.phase(), SessionPhase::PairingMode);
        }

        let sig = f.sign(&conn.ephemeral_pub, &second);
        f.session.finalize_pairing("test-app", &second, &sig).await.unwrap();
        let state = f.state.lock().await;
        assert_eq!(state.phase(), SessionPhase::Paired);
        assert!(state.pairing_code().is_none());
    }

    #[tokio::test]
    async fn test_unpair_keeps_connection() {
        let f = Fixture::new();
        let conn = f.session.connect(&f.client_pub()).await.unwrap();
        let code = f.session.enter_pairing_mode().await.unwrap();
        let sig = f.sign(&conn.ephemeral_pub, &code);
        f.session.finalize_pairing("test-app", &code, &sig).await.unwrap();

        f.session.unpair().await.unwrap();
        {
            let state = f.state.lock().await;
            assert!(state.is_connected());
            assert!(!state.is_paired());
            assert!(state.shared_secret().is_none());
        }
        let again = f.session.connect(&f.client_pub()).await.unwrap();
        assert!(!again.paired);
    }
}
