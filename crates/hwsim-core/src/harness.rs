//! Client-side test harness.
//!
//! [`TestClient`] plays the SDK's role against a [`DeviceHandle`]: it holds a
//! long-lived secp256k1 key, performs the connect/pair handshake, derives the
//! same channel key as the device and speaks the secure envelope protocol.

use std::sync::Arc;

use k256::ecdsa::SigningKey;
use k256::SecretKey;
use prost::Message;
use rand_core::OsRng;

use hwsim_crypto::channel;
use hwsim_crypto::hd::DerivationPath;
use hwsim_crypto::keys::{derive_shared_secret, encode_public, parse_public, SharedSecret};
use hwsim_crypto::pairing::{pairing_transcript_v1, sign_pairing_transcript};
use hwsim_proto::frame::{decode_body, decode_response, encode_request, MsgType};
use hwsim_proto::v1::*;

use crate::errors::{DeviceError, DeviceResult};
use crate::registry::DeviceHandle;

pub const DEFAULT_APP_NAME: &str = "hwsim-test";

pub struct TestClient {
    device: Arc<DeviceHandle>,
    secret: SecretKey,
    app_name: String,
    ephemeral_pub: Option<Vec<u8>>,
    shared: Option<SharedSecret>,
}

impl TestClient {
    /// Client with a fresh random key.
    pub fn new(device: Arc<DeviceHandle>) -> Self {
        Self::with_key(device, SecretKey::random(&mut OsRng))
    }

    pub fn with_key(device: Arc<DeviceHandle>, secret: SecretKey) -> Self {
        Self {
            device,
            secret,
            app_name: DEFAULT_APP_NAME.to_string(),
            ephemeral_pub: None,
            shared: None,
        }
    }

    pub fn with_app_name(mut self, app_name: &str) -> Self {
        self.app_name = app_name.to_string();
        self
    }

    pub fn device(&self) -> &Arc<DeviceHandle> {
        &self.device
    }

    pub fn client_pub(&self) -> Vec<u8> {
        encode_public(&self.secret.public_key())
    }

    /// Device ephemeral key from the last successful connect.
    pub fn ephemeral_pub(&self) -> Option<&[u8]> {
        self.ephemeral_pub.as_deref()
    }

    /// Channel key the client derived on the last connect.
    pub fn shared_secret(&self) -> Option<&SharedSecret> {
        self.shared.as_ref()
    }

    // ------------------------------------------------------------------
    // Plain handshake
    // ------------------------------------------------------------------

    pub async fn connect(&mut self) -> DeviceResult<ConnectResponseV1> {
        let req = ConnectRequestV1 { client_pub: self.client_pub() };
        let reply = self
            .device
            .handle_plain_request(MsgType::Connect, &req.encode_to_vec())
            .await;
        let resp: ConnectResponseV1 = parse_response(&reply)?;

        let device_pub = parse_public(&resp.ephemeral_pub)?;
        self.shared = Some(derive_shared_secret(&self.secret, &device_pub));
        self.ephemeral_pub = Some(resp.ephemeral_pub.clone());
        Ok(resp)
    }

    /// Finalize pairing with `code`, signing the transcript correctly.
    pub async fn pair(&self, code: &str) -> DeviceResult<FinalizePairingResponseV1> {
        let signature = self.pairing_signature(code)?;
        self.finalize_with_signature(code, &signature).await
    }

    /// The signature a well-behaved client would send for `code`.
    pub fn pairing_signature(&self, code: &str) -> DeviceResult<[u8; 64]> {
        let ephemeral_pub = self
            .ephemeral_pub
            .as_deref()
            .ok_or_else(|| DeviceError::InvalidRequest("client not connected".into()))?;
        let transcript = pairing_transcript_v1(&self.client_pub(), ephemeral_pub, &self.app_name, code);
        let signing = SigningKey::from_slice(&self.secret.to_bytes())
            .map_err(|e| DeviceError::Internal(e.to_string()))?;
        Ok(sign_pairing_transcript(&signing, &transcript))
    }

    /// Send `finalizePairing` with an arbitrary signature.
    pub async fn finalize_with_signature(
        &self,
        code: &str,
        signature: &[u8],
    ) -> DeviceResult<FinalizePairingResponseV1> {
        let req = FinalizePairingRequestV1 {
            app_name: self.app_name.clone(),
            pairing_secret: code.to_string(),
            signature: signature.to_vec(),
        };
        let reply = self
            .device
            .handle_plain_request(MsgType::FinalizePairing, &req.encode_to_vec())
            .await;
        parse_response(&reply)
    }

    /// Connect, and pair through the device's pairing mode if not already
    /// paired.
    pub async fn connect_and_pair(&mut self) -> DeviceResult<ConnectResponseV1> {
        let resp = self.connect().await?;
        if !resp.paired {
            let code = self.device.enter_pairing_mode().await?;
            self.pair(&code).await?;
        }
        Ok(resp)
    }

    // ------------------------------------------------------------------
    // Secure requests
    // ------------------------------------------------------------------

    /// Encrypt, send and decrypt a typed request.
    pub async fn request<Req, Resp>(&self, msg_type: MsgType, req: &Req) -> DeviceResult<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let envelope = self.seal(&encode_request(msg_type, req))?;
        let reply = self.device.handle_secure_request(&envelope).await?;
        parse_response(&self.open(&reply)?)
    }

    /// Send an envelope as-is and return the raw reply envelope.
    pub async fn send_raw(&self, envelope: &[u8]) -> DeviceResult<Vec<u8>> {
        self.device.handle_secure_request(envelope).await
    }

    pub fn seal(&self, plaintext: &[u8]) -> DeviceResult<Vec<u8>> {
        Ok(channel::encrypt(plaintext, self.key()?)?)
    }

    pub fn open(&self, envelope: &[u8]) -> DeviceResult<Vec<u8>> {
        Ok(channel::decrypt(envelope, self.key()?)?)
    }

    fn key(&self) -> DeviceResult<&SharedSecret> {
        self.shared
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidRequest("client not connected".into()))
    }

    pub async fn get_addresses(&self, start_path: &str, n: u32, flag: u32) -> DeviceResult<GetAddressesResponseV1> {
        let path = DerivationPath::parse(start_path)?;
        let req = GetAddressesRequestV1 { start_path: path.segments().to_vec(), n, flag };
        self.request(MsgType::GetAddresses, &req).await
    }

    pub async fn sign(&self, req: &SignRequestV1) -> DeviceResult<SignResponseV1> {
        self.request(MsgType::Sign, req).await
    }

    pub async fn get_wallets(&self) -> DeviceResult<GetWalletsResponseV1> {
        self.request(MsgType::GetWallets, &GetWalletsRequestV1 {}).await
    }

    pub async fn get_kv_records(&self, record_type: u32, start: u32, n: u32) -> DeviceResult<GetKvRecordsResponseV1> {
        let req = GetKvRecordsRequestV1 { record_type, n, start };
        self.request(MsgType::GetKvRecords, &req).await
    }

    pub async fn add_kv_records(&self, record_type: u32, pairs: &[(&str, &str)]) -> DeviceResult<u32> {
        let req = AddKvRecordsRequestV1 {
            record_type,
            records: pairs
                .iter()
                .map(|(k, v)| KvPairV1 { key: k.to_string(), value: v.to_string() })
                .collect(),
        };
        let resp: AddKvRecordsResponseV1 = self.request(MsgType::AddKvRecords, &req).await?;
        Ok(resp.stored)
    }

    pub async fn remove_kv_records(&self, record_type: u32, keys: &[&str]) -> DeviceResult<u32> {
        let req = RemoveKvRecordsRequestV1 {
            record_type,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        let resp: RemoveKvRecordsResponseV1 = self.request(MsgType::RemoveKvRecords, &req).await?;
        Ok(resp.removed)
    }
}

/// Split `code || body`, turning error codes back into [`DeviceError`].
pub fn parse_response<M: Message + Default>(payload: &[u8]) -> DeviceResult<M> {
    let (code, body) = decode_response(payload)?;
    if let Some(err) = DeviceError::from_code(code) {
        return Err(err);
    }
    Ok(decode_body(body)?)
}
