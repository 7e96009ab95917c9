//! Canonical per-device record.
//!
//! Session material (client key, ephemeral key pair, channel key, pairing
//! window) is private so that it can only change together, through the
//! methods below.

use tokio::task::AbortHandle;
use tokio::time::Instant;

use hwsim_crypto::hash::sha256;
use hwsim_crypto::keys::{derive_shared_secret, parse_public, EphemeralKeyPair, SharedSecret};

use crate::config::DeviceConfig;
use crate::errors::{DeviceError, DeviceResult};
use crate::store::KvStore;
use crate::types::{capabilities, ActiveWallets, FirmwareVersion, Wallet};

/// Where the device is in the pairing state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disconnected,
    Connected,
    PairingMode,
    Paired,
}

/// An active pairing-mode window.
#[derive(Debug)]
pub struct PairingWindow {
    pub code: String,
    pub expires_at: Instant,
    pub expires_at_ms: u64,
    /// Distinguishes this window from any later one.
    pub generation: u64,
    timer: Option<AbortHandle>,
}

impl PairingWindow {
    pub fn new(code: String, expires_at: Instant, expires_at_ms: u64, generation: u64) -> Self {
        Self { code, expires_at, expires_at_ms, generation, timer: None }
    }

    fn cancel(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

#[derive(Debug)]
pub struct DeviceState {
    pub id: String,
    pub name: String,
    pub firmware_version: FirmwareVersion,
    pub locked: bool,
    pub busy: bool,
    pub wallets: ActiveWallets,
    pub kv: KvStore,
    pub config: DeviceConfig,

    connected: bool,
    paired: bool,
    client_pub: Option<Vec<u8>>,
    ephemeral: Option<EphemeralKeyPair>,
    channel_key: Option<SharedSecret>,
    pairing: Option<PairingWindow>,
    pairing_generation: u64,
}

impl DeviceState {
    pub fn new(id: &str, config: DeviceConfig) -> Self {
        let internal = Wallet {
            uid: sha256(config.seed_hex.as_bytes()).to_vec(),
            name: "Internal".to_string(),
            capabilities: capabilities::ALL,
            external: false,
        };
        Self {
            id: id.to_string(),
            name: config.device_name.clone(),
            firmware_version: config.firmware_version,
            locked: false,
            busy: false,
            wallets: ActiveWallets { internal, external: None },
            kv: KvStore::new(config.kv_capacity),
            config,
            connected: false,
            paired: false,
            client_pub: None,
            ephemeral: None,
            channel_key: None,
            pairing: None,
            pairing_generation: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if !self.connected {
            SessionPhase::Disconnected
        } else if self.pairing.is_some() {
            SessionPhase::PairingMode
        } else if self.paired {
            SessionPhase::Paired
        } else {
            SessionPhase::Connected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    pub fn client_pub(&self) -> Option<&[u8]> {
        self.client_pub.as_deref()
    }

    pub fn ephemeral(&self) -> Option<&EphemeralKeyPair> {
        self.ephemeral.as_ref()
    }

    /// Channel key, defined only while paired and connected.
    pub fn shared_secret(&self) -> Option<&SharedSecret> {
        if self.paired && self.connected {
            self.channel_key.as_ref()
        } else {
            None
        }
    }

    pub fn pairing_window(&self) -> Option<&PairingWindow> {
        self.pairing.as_ref()
    }

    /// Active pairing code, defined only while pairing mode is on.
    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing.as_ref().map(|w| w.code.as_str())
    }

    pub fn seed(&self) -> DeviceResult<Vec<u8>> {
        self.config.seed().map_err(|e| DeviceError::Internal(e.to_string()))
    }

    /// Start a new session. Any previous session material and pairing window
    /// are discarded together. Returns whether a pairing window was closed.
    pub fn begin_session(
        &mut self,
        client_pub: Vec<u8>,
        ephemeral: EphemeralKeyPair,
        channel_key: SharedSecret,
        paired: bool,
    ) -> bool {
        let had_window = self.close_pairing_window();
        self.client_pub = Some(client_pub);
        self.ephemeral = Some(ephemeral);
        self.channel_key = Some(channel_key);
        self.connected = true;
        self.paired = paired;
        had_window
    }

    pub fn next_pairing_generation(&mut self) -> u64 {
        self.pairing_generation += 1;
        self.pairing_generation
    }

    /// Install a pairing window, cancelling the timer of any previous one.
    pub fn open_pairing_window(&mut self, window: PairingWindow, timer: AbortHandle) {
        if let Some(previous) = self.pairing.take() {
            previous.cancel();
        }
        self.pairing = Some(PairingWindow { timer: Some(timer), ..window });
    }

    /// Clear the pairing window and cancel its timer. Returns whether one
    /// was active.
    pub fn close_pairing_window(&mut self) -> bool {
        match self.pairing.take() {
            Some(window) => {
                window.cancel();
                true
            }
            None => false,
        }
    }

    /// Close the window only if it is still the one identified by
    /// `generation`. Used by the timeout task.
    pub fn expire_pairing_window(&mut self, generation: u64) -> bool {
        if self.pairing.as_ref().map(|w| w.generation) == Some(generation) {
            // Dropping without abort: the caller is the timer itself.
            self.pairing = None;
            true
        } else {
            false
        }
    }

    /// ECDH channel key between the current ephemeral pair and client key.
    pub fn derive_channel_key(&self) -> DeviceResult<SharedSecret> {
        let (Some(ephemeral), Some(client_pub)) = (&self.ephemeral, &self.client_pub) else {
            return Err(DeviceError::InvalidRequest("device not connected".into()));
        };
        let remote = parse_public(client_pub)?;
        Ok(derive_shared_secret(ephemeral.secret(), &remote))
    }

    /// Enter Paired with a channel key derived from the current session.
    pub fn mark_paired(&mut self) -> DeviceResult<()> {
        self.channel_key = Some(self.derive_channel_key()?);
        self.paired = true;
        Ok(())
    }

    pub fn mark_unpaired(&mut self) {
        self.paired = false;
        self.channel_key = None;
    }

    /// Clear connection, pairing and crypto material together. KV records,
    /// wallets and configuration are kept.
    pub fn reset_connection(&mut self) -> bool {
        let had_window = self.close_pairing_window();
        self.connected = false;
        self.paired = false;
        self.client_pub = None;
        self.ephemeral = None;
        self.channel_key = None;
        self.busy = false;
        had_window
    }

    /// Replace everything with a freshly created record for the same id.
    pub fn reset_full(&mut self, config: DeviceConfig) -> bool {
        let had_window = self.close_pairing_window();
        let generation = self.pairing_generation;
        let id = std::mem::take(&mut self.id);
        *self = DeviceState::new(&id, config);
        // Keep generations monotonic so a stale timer never matches.
        self.pairing_generation = generation;
        had_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwsim_crypto::keys::generate_ephemeral_key_pair;

    fn state() -> DeviceState {
        DeviceState::new("dev-1", DeviceConfig::default())
    }

    fn key(b: u8) -> SharedSecret {
        SharedSecret::from_bytes([b; 32])
    }

    #[test]
    fn test_mark_paired_requires_session() {
        let mut s = state();
        assert!(matches!(s.mark_paired(), Err(DeviceError::InvalidRequest(_))));
        assert!(!s.is_paired());
    }

    #[test]
    fn test_new_state_is_disconnected() {
        let s = state();
        assert_eq!(s.phase(), SessionPhase::Disconnected);
        assert!(s.shared_secret().is_none());
        assert!(s.pairing_code().is_none());
        assert_eq!(s.wallets.internal.uid.len(), 32);
    }

    #[test]
    fn test_secret_requires_paired_and_connected() {
        let mut s = state();
        let client = generate_ephemeral_key_pair();
        s.begin_session(client.public_bytes(), generate_ephemeral_key_pair(), key(1), false);
        assert_eq!(s.phase(), SessionPhase::Connected);
        assert!(s.shared_secret().is_none());

        s.mark_paired().unwrap();
        assert_eq!(s.phase(), SessionPhase::Paired);
        let expected = derive_shared_secret(client.secret(), s.ephemeral().unwrap().public());
        assert_eq!(s.shared_secret(), Some(&expected));

        s.mark_unpaired();
        assert!(s.shared_secret().is_none());
        assert!(s.is_connected());
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_expire_newer_window() {
        let mut s = state();
        s.begin_session(vec![2; 33], generate_ephemeral_key_pair(), key(1), false);

        let g1 = s.next_pairing_generation();
        let t1 = tokio::spawn(async {}).abort_handle();
        s.open_pairing_window(PairingWindow::new("11111111".into(), Instant::now(), 0, g1), t1);
        let g2 = s.next_pairing_generation();
        let t2 = tokio::spawn(async {}).abort_handle();
        s.open_pairing_window(PairingWindow::new("22222222".into(), Instant::now(), 0, g2), t2);

        assert!(!s.expire_pairing_window(g1));
        assert_eq!(s.pairing_code(), Some("22222222"));
        assert!(s.expire_pairing_window(g2));
        assert!(s.pairing_code().is_none());
    }

    #[test]
    fn test_reset_connection_keeps_kv_and_config() {
        let mut s = state();
        s.config.auto_approve = false;
        s.kv.put("k", "v", 0).unwrap();
        s.begin_session(vec![2; 33], generate_ephemeral_key_pair(), key(1), true);

        s.reset_connection();
        assert_eq!(s.phase(), SessionPhase::Disconnected);
        assert!(s.ephemeral().is_none());
        assert!(s.client_pub().is_none());
        assert_eq!(s.kv.len(), 1);
        assert!(!s.config.auto_approve);
    }

    #[test]
    fn test_reset_full_clears_everything() {
        let mut s = state();
        s.locked = true;
        s.kv.put("k", "v", 0).unwrap();
        s.begin_session(vec![2; 33], generate_ephemeral_key_pair(), key(1), true);

        s.reset_full(DeviceConfig::default());
        assert_eq!(s.id, "dev-1");
        assert!(!s.locked);
        assert!(s.kv.is_empty());
        assert!(s.shared_secret().is_none());
        assert!(s.ephemeral().is_none());
    }
}
