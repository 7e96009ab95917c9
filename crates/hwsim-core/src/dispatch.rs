//! Protocol handler: decodes requests, routes them to the per-type handlers
//! and encodes responses.
//!
//! Plain requests (`connect`, `finalizePairing`) travel as `msg_type || body`
//! and are answered with `code || body`. Every other request arrives inside a
//! secure envelope keyed by the session's shared secret, and is answered in
//! one. Failures of the envelope itself cannot be answered inside it and are
//! returned as `Err` for the transport to report in the clear.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::utils::eip191_message;
use prost::Message;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hwsim_crypto::address::{curve_for_coin, encode_address};
use hwsim_crypto::channel;
use hwsim_crypto::hash::{keccak256, sha256};
use hwsim_crypto::hd::{is_hardened, Curve, DerivationPath, ExtendedKey};
use hwsim_crypto::keys::SharedSecret;
use hwsim_crypto::signing;
use hwsim_proto::frame::{decode_body, decode_request, encode_error, encode_response, MsgType, ResponseCode};
use hwsim_proto::validation::Validate;
use hwsim_proto::v1::*;

use crate::config::{encoding_name, DeviceConfig};
use crate::correlator::RequestCorrelator;
use crate::errors::{DeviceError, DeviceResult};
use crate::events::{DeviceEvent, EventBus};
use crate::session::SessionManager;
use crate::state::DeviceState;
use crate::store::KvRecord;
use crate::types::PendingKind;

/// `getAddresses` flag: addresses for the coin type in the start path.
pub const FLAG_ADDRESS: u32 = 0;
/// `getAddresses` flag: compressed secp256k1 public keys.
pub const FLAG_SECP256K1_PUB: u32 = 3;
/// `getAddresses` flag: ed25519 public keys.
pub const FLAG_ED25519_PUB: u32 = 4;

// ============================================================================
// Statistics
// ============================================================================

/// Request counters for a single device.
#[derive(Debug, Default)]
pub struct DispatchStats {
    plain_requests: AtomicU64,
    secure_requests: AtomicU64,
    channel_failures: AtomicU64,
    handler_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStatsSnapshot {
    pub plain_requests: u64,
    pub secure_requests: u64,
    pub channel_failures: u64,
    pub handler_errors: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            plain_requests: self.plain_requests.load(Ordering::Relaxed),
            secure_requests: self.secure_requests.load(Ordering::Relaxed),
            channel_failures: self.channel_failures.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Cheap to clone; clones share the device they were built for.
#[derive(Clone)]
pub struct ProtocolHandler {
    device_id: String,
    state: Arc<Mutex<DeviceState>>,
    session: SessionManager,
    correlator: RequestCorrelator,
    events: EventBus,
    stats: Arc<DispatchStats>,
}

impl ProtocolHandler {
    pub fn new(
        device_id: impl Into<String>,
        state: Arc<Mutex<DeviceState>>,
        session: SessionManager,
        correlator: RequestCorrelator,
        events: EventBus,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            state,
            session,
            correlator,
            events,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Handle an unencrypted request. Always produces a response payload;
    /// errors are encoded as a bare response code.
    pub async fn handle_plain_request(&self, msg_type: MsgType, body: &[u8]) -> Vec<u8> {
        DispatchStats::inc(&self.stats.plain_requests);
        debug!(device_id = %self.device_id, ?msg_type, len = body.len(), "plain request");

        let result = match msg_type {
            MsgType::Connect => self.connect(body).await,
            MsgType::FinalizePairing => self.finalize_pairing(body).await,
            other => Err(DeviceError::InvalidRequest(format!("{other:?} requires a secure envelope"))),
        };
        self.apply_response_delay().await;
        self.respond(msg_type, result)
    }

    /// Handle a plain frame as read off the transport (`msg_type || body`).
    pub async fn handle_plain_frame(&self, frame: &[u8]) -> Vec<u8> {
        match decode_request(frame) {
            Ok((msg_type, body)) => self.handle_plain_request(msg_type, body).await,
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "malformed plain frame");
                encode_error(DeviceError::from(e).code())
            }
        }
    }

    /// Handle a secure envelope. `Ok` carries the encrypted response, which
    /// may itself hold an error code. `Err` is one of `NotPaired`,
    /// `ChecksumMismatch` or `DecryptionError`.
    pub async fn handle_secure_request(&self, envelope: &[u8]) -> DeviceResult<Vec<u8>> {
        DispatchStats::inc(&self.stats.secure_requests);

        let key = {
            let state = self.state.lock().await;
            state.shared_secret().cloned()
        };
        let Some(key) = key else {
            DispatchStats::inc(&self.stats.channel_failures);
            warn!(device_id = %self.device_id, "secure request without a paired session");
            return Err(DeviceError::NotPaired);
        };

        let plaintext = channel::decrypt(envelope, &key).map_err(|e| {
            DispatchStats::inc(&self.stats.channel_failures);
            warn!(device_id = %self.device_id, error = %e, "envelope rejected");
            DeviceError::from(e)
        })?;

        let (msg_type, result) = match decode_request(&plaintext) {
            Ok((msg_type, body)) => {
                debug!(device_id = %self.device_id, ?msg_type, len = body.len(), "secure request");
                (Some(msg_type), self.dispatch_secure(msg_type, body, &key).await)
            }
            Err(e) => (None, Err(e.into())),
        };
        // A response is only sealed while the key it would be sealed with is
        // still the session's.
        let session_ended = self.state.lock().await.shared_secret() != Some(&key);
        let result = if session_ended { Err(DeviceError::NotPaired) } else { result };
        if let Err(e) = &result {
            if e.is_channel_failure() {
                DispatchStats::inc(&self.stats.channel_failures);
                warn!(device_id = %self.device_id, ?msg_type, error = %e, "session ended during request");
                return Err(e.clone());
            }
        }
        self.apply_response_delay().await;

        let payload = match msg_type {
            Some(t) => self.respond(t, result),
            None => {
                warn!(device_id = %self.device_id, "undecodable secure request");
                encode_error(ResponseCode::InvalidMsg)
            }
        };
        Ok(channel::encrypt(&payload, &key)?)
    }

    async fn dispatch_secure(
        &self,
        msg_type: MsgType,
        body: &[u8],
        key: &SharedSecret,
    ) -> DeviceResult<Vec<u8>> {
        match msg_type {
            MsgType::GetAddresses => self.get_addresses(decode(body)?).await.map(|r| success(&r)),
            MsgType::Sign => self.sign(decode(body)?, key).await.map(|r| success(&r)),
            MsgType::GetWallets => {
                let _: GetWalletsRequestV1 = decode(body)?;
                self.get_wallets().await.map(|r| success(&r))
            }
            MsgType::GetKvRecords => self.get_kv_records(decode(body)?).await.map(|r| success(&r)),
            MsgType::AddKvRecords => self.add_kv_records(decode(body)?).await.map(|r| success(&r)),
            MsgType::RemoveKvRecords => {
                self.remove_kv_records(decode(body)?).await.map(|r| success(&r))
            }
            MsgType::Connect | MsgType::FinalizePairing => Err(DeviceError::InvalidRequest(format!(
                "{msg_type:?} is not accepted inside a secure envelope"
            ))),
        }
    }

    fn respond(&self, msg_type: MsgType, result: DeviceResult<Vec<u8>>) -> Vec<u8> {
        match result {
            Ok(payload) => payload,
            Err(e) => {
                DispatchStats::inc(&self.stats.handler_errors);
                warn!(device_id = %self.device_id, ?msg_type, code = ?e.code(), error = %e, "request failed");
                encode_error(e.code())
            }
        }
    }

    /// Approvals and external data requests share one pending queue.
    fn queue_full(&self, config: &DeviceConfig) -> bool {
        self.correlator.len() >= config.max_pending_requests
    }

    async fn apply_response_delay(&self) {
        let delay_ms = self.state.lock().await.config.response_delay_ms;
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    // ------------------------------------------------------------------
    // Plain handlers
    // ------------------------------------------------------------------

    async fn connect(&self, body: &[u8]) -> DeviceResult<Vec<u8>> {
        let req: ConnectRequestV1 = decode(body)?;
        let outcome = self.session.connect(&req.client_pub).await?;
        Ok(success(&ConnectResponseV1 {
            firmware_version: outcome.firmware_version.to_bytes(),
            ephemeral_pub: outcome.ephemeral_pub,
            paired: outcome.paired,
            wallets: outcome.wallets.map(|w| w.to_wire()).unwrap_or_default(),
        }))
    }

    async fn finalize_pairing(&self, body: &[u8]) -> DeviceResult<Vec<u8>> {
        let req: FinalizePairingRequestV1 = decode(body)?;
        let wallets = self
            .session
            .finalize_pairing(&req.app_name, &req.pairing_secret, &req.signature)
            .await?;
        Ok(success(&FinalizePairingResponseV1 { wallets: wallets.to_wire() }))
    }

    // ------------------------------------------------------------------
    // Secure handlers
    // ------------------------------------------------------------------

    async fn get_addresses(&self, req: GetAddressesRequestV1) -> DeviceResult<GetAddressesResponseV1> {
        let seed = {
            let state = self.state.lock().await;
            let config = &state.config;
            if req.n > config.max_addresses_per_request {
                return Err(DeviceError::InvalidRequest(format!(
                    "n={} exceeds limit {}",
                    req.n, config.max_addresses_per_request
                )));
            }
            check_path_depth(req.start_path.len(), config)?;
            state.seed()?
        };

        let start = DerivationPath::new(req.start_path);
        let curve = match req.flag {
            FLAG_ADDRESS => {
                let coin = start
                    .coin_type()
                    .ok_or_else(|| DeviceError::InvalidRequest(format!("path {start} has no coin type")))?;
                curve_for_coin(coin)
                    .ok_or_else(|| DeviceError::InvalidRequest(format!("unsupported coin type {coin}")))?
            }
            FLAG_SECP256K1_PUB => Curve::Secp256k1,
            FLAG_ED25519_PUB => Curve::Ed25519,
            other => return Err(DeviceError::InvalidRequest(format!("unknown address flag {other}"))),
        };

        let mut entries = Vec::with_capacity(req.n as usize);
        let mut chain_code = Vec::new();
        for i in 0..req.n {
            let path = start.with_last_offset(i)?;
            let node = ExtendedKey::derive_path(&seed, &path, curve)?;
            if i == 0 {
                chain_code = node.chain_code().to_vec();
            }
            let address = if req.flag == FLAG_ADDRESS { encode_address(&node)? } else { String::new() };
            entries.push(AddressEntryV1 {
                path: path.segments().to_vec(),
                address,
                public_key: node.public_key()?,
            });
        }

        info!(device_id = %self.device_id, start = %start, n = req.n, flag = req.flag, "addresses derived");
        Ok(GetAddressesResponseV1 { entries, chain_code })
    }

    /// `key` is the channel key the request arrived under. Signing is
    /// abandoned with `NotPaired` if the session changed while waiting for
    /// approval.
    async fn sign(&self, req: SignRequestV1, key: &SharedSecret) -> DeviceResult<SignResponseV1> {
        let (plan, approval) = {
            let state = self.state.lock().await;
            if state.locked {
                return Err(DeviceError::DeviceLocked);
            }
            if state.busy || (!state.config.auto_approve && self.queue_full(&state.config)) {
                return Err(DeviceError::DeviceBusy);
            }
            let curve = Curve::from_id(req.curve)?;
            if !state.config.supports_curve(curve) {
                return Err(DeviceError::UnsupportedCurve(curve.name().to_string()));
            }
            let encoding = EncodingV1::try_from(req.encoding)
                .map_err(|_| DeviceError::InvalidRequest(format!("unknown encoding {}", req.encoding)))?;
            if !state.config.supports_encoding(encoding) {
                return Err(DeviceError::InvalidRequest(format!(
                    "encoding {} not supported",
                    encoding_name(encoding)
                )));
            }
            req.validate()?;
            let plan = SignPlan::build(&req, curve, encoding, &state.config)?;

            // Issued under the lock so the pending-request limit holds.
            let approval = if state.config.auto_approve {
                None
            } else {
                let payload = json!({
                    "path": plan.path.to_string(),
                    "curve": curve.name(),
                    "encoding": encoding_name(encoding),
                    "data": hex::encode(&req.data),
                    "digest": hex::encode(&plan.digest),
                });
                let timeout = Duration::from_millis(state.config.approval_timeout_ms);
                let handle = self.correlator.issue(PendingKind::SignApproval, payload.clone(), timeout);
                self.events.publish(
                    &self.device_id,
                    DeviceEvent::ApprovalRequested { request_id: handle.id(), payload },
                );
                Some(handle)
            };
            (plan, approval)
        };

        if let Some(handle) = approval {
            let id = handle.id();
            handle.wait().await?;
            debug!(device_id = %self.device_id, request_id = id, "signing approved");
        }

        let seed = {
            let state = self.state.lock().await;
            if state.shared_secret() != Some(key) {
                return Err(DeviceError::NotPaired);
            }
            if state.locked {
                return Err(DeviceError::DeviceLocked);
            }
            state.seed()?
        };
        let node = ExtendedKey::derive_path(&seed, &plan.path, plan.curve)?;
        let signature = signing::sign(&plan.message, node.private_key(), plan.curve)?;

        info!(device_id = %self.device_id, path = %plan.path, curve = %plan.curve, "payload signed");
        Ok(SignResponseV1 {
            signature: signature.bytes,
            recovery_id: signature.recovery_id.map(u32::from),
            public_key: node.public_key()?,
            digest: plan.digest,
        })
    }

    async fn get_wallets(&self) -> DeviceResult<GetWalletsResponseV1> {
        let state = self.state.lock().await;
        Ok(GetWalletsResponseV1 {
            internal: Some(state.wallets.internal.to_wire()),
            external: state.wallets.external.as_ref().map(|w| w.to_wire()),
        })
    }

    async fn get_kv_records(&self, req: GetKvRecordsRequestV1) -> DeviceResult<GetKvRecordsResponseV1> {
        let mut state = self.state.lock().await;
        check_kv_batch(req.n as usize, &state.config)?;

        if state.config.external_kv {
            if self.queue_full(&state.config) {
                return Err(DeviceError::DeviceBusy);
            }
            let payload = json!({ "record_type": req.record_type });
            let timeout = Duration::from_millis(state.config.external_request_timeout_ms);
            let handle = self.correlator.issue(PendingKind::KvSnapshot, payload.clone(), timeout);
            self.events.publish(
                &self.device_id,
                DeviceEvent::ExternalDataRequested {
                    request_id: handle.id(),
                    kind: PendingKind::KvSnapshot,
                    payload,
                },
            );
            drop(state);

            let data = handle.wait().await?;
            let records: Vec<KvRecord> = serde_json::from_value(data)
                .map_err(|e| DeviceError::Internal(format!("malformed KV snapshot: {e}")))?;
            state = self.state.lock().await;
            debug!(device_id = %self.device_id, count = records.len(), "KV snapshot applied");
            state.kv.restore_all(records);
        }

        let page = state.kv.get(req.record_type, req.start as usize, req.n as usize);
        Ok(GetKvRecordsResponseV1 {
            records: page.records.iter().map(KvRecord::to_wire).collect(),
            fetched: page.fetched as u32,
            total: page.total as u32,
        })
    }

    async fn add_kv_records(&self, req: AddKvRecordsRequestV1) -> DeviceResult<AddKvRecordsResponseV1> {
        let mut state = self.state.lock().await;
        let config = &state.config;
        check_kv_batch(req.records.len(), config)?;
        for record in &req.records {
            if record.key.len() > config.max_kv_key_len {
                return Err(DeviceError::InvalidRequest(format!(
                    "key length {} exceeds {}",
                    record.key.len(),
                    config.max_kv_key_len
                )));
            }
            if record.value.len() > config.max_kv_value_len {
                return Err(DeviceError::InvalidRequest(format!(
                    "value length {} exceeds {}",
                    record.value.len(),
                    config.max_kv_value_len
                )));
            }
        }

        let ids = state
            .kv
            .put_many(req.record_type, req.records.iter().map(|r| (r.key.as_str(), r.value.as_str())))
            .map_err(|e| DeviceError::InvalidRequest(e.to_string()))?;
        info!(device_id = %self.device_id, record_type = req.record_type, stored = ids.len(), "KV records stored");
        Ok(AddKvRecordsResponseV1 { stored: ids.len() as u32 })
    }

    async fn remove_kv_records(
        &self,
        req: RemoveKvRecordsRequestV1,
    ) -> DeviceResult<RemoveKvRecordsResponseV1> {
        let mut state = self.state.lock().await;
        check_kv_batch(req.keys.len(), &state.config)?;
        let removed = state.kv.remove(req.record_type, &req.keys);
        info!(device_id = %self.device_id, record_type = req.record_type, removed, "KV records removed");
        Ok(RemoveKvRecordsResponseV1 { removed: removed as u32 })
    }
}

// ============================================================================
// Signing plan
// ============================================================================

/// A validated signing request, ready to run once approved.
#[derive(Debug)]
struct SignPlan {
    curve: Curve,
    path: DerivationPath,
    /// Bytes handed to the signer: a 32-byte digest for ECDSA, the message
    /// itself for ed25519.
    message: Vec<u8>,
    /// Reported back to the client. Empty for ed25519.
    digest: Vec<u8>,
}

impl SignPlan {
    fn build(req: &SignRequestV1, curve: Curve, encoding: EncodingV1, config: &DeviceConfig) -> DeviceResult<Self> {
        if req.data.len() > config.max_sign_payload {
            return Err(DeviceError::InvalidRequest(format!(
                "payload of {} bytes exceeds {}",
                req.data.len(),
                config.max_sign_payload
            )));
        }
        check_path_depth(req.path.len(), config)?;
        if encoding == EncodingV1::Utf8 && std::str::from_utf8(&req.data).is_err() {
            return Err(DeviceError::InvalidRequest("payload is not valid UTF-8".into()));
        }
        if curve == Curve::Ed25519 && !req.path.iter().all(|s| is_hardened(*s)) {
            return Err(DeviceError::InvalidRequest("ed25519 paths must be fully hardened".into()));
        }

        let schema = SchemaV1::try_from(req.schema)
            .map_err(|_| DeviceError::InvalidRequest(format!("unknown schema {}", req.schema)))?;
        let hash_type = HashTypeV1::try_from(req.hash_type)
            .map_err(|_| DeviceError::InvalidRequest(format!("unknown hash type {}", req.hash_type)))?;

        let message = match schema {
            SchemaV1::Raw => req.data.clone(),
            SchemaV1::EthPersonal if curve == Curve::Secp256k1 => eip191_message(&req.data),
            SchemaV1::EthPersonal => {
                return Err(DeviceError::InvalidRequest("eth personal messages need secp256k1".into()))
            }
        };

        let (message, digest) = match (curve, hash_type) {
            (Curve::Secp256k1, HashTypeV1::None) => {
                if message.len() != signing::ECDSA_DIGEST_LEN {
                    return Err(DeviceError::InvalidRequest(format!(
                        "unhashed secp256k1 payload must be {} bytes, got {}",
                        signing::ECDSA_DIGEST_LEN,
                        message.len()
                    )));
                }
                (message.clone(), message)
            }
            (Curve::Secp256k1, HashTypeV1::Keccak256) => {
                let d = keccak256(&message).to_vec();
                (d.clone(), d)
            }
            (Curve::Secp256k1, HashTypeV1::Sha256) => {
                let d = sha256(&message).to_vec();
                (d.clone(), d)
            }
            (Curve::Ed25519, HashTypeV1::None) => (message, Vec::new()),
            (Curve::Ed25519, _) => {
                return Err(DeviceError::InvalidRequest("ed25519 signs unhashed messages only".into()))
            }
        };

        Ok(Self { curve, path: DerivationPath::new(req.path.clone()), message, digest })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn decode<M: Message + Default + Validate>(body: &[u8]) -> DeviceResult<M> {
    let msg: M = decode_body(body)?;
    msg.validate()?;
    Ok(msg)
}

fn success<M: Message>(body: &M) -> Vec<u8> {
    encode_response(ResponseCode::Success, Some(body))
}

fn check_path_depth(depth: usize, config: &DeviceConfig) -> DeviceResult<()> {
    if depth > config.max_path_depth {
        return Err(DeviceError::InvalidRequest(format!(
            "path depth {depth} exceeds {}",
            config.max_path_depth
        )));
    }
    Ok(())
}

fn check_kv_batch(n: usize, config: &DeviceConfig) -> DeviceResult<()> {
    if n > config.max_kv_records_per_request as usize {
        return Err(DeviceError::InvalidRequest(format!(
            "{n} records exceeds limit {}",
            config.max_kv_records_per_request
        )));
    }
    Ok(())
}
