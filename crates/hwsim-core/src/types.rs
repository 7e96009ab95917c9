use serde::{Deserialize, Serialize};

use hwsim_proto::v1::WalletV1;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    /// Wire form, `[major, minor, patch]`.
    pub fn to_bytes(self) -> Vec<u8> {
        vec![self.major, self.minor, self.patch]
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Wallet capability bits.
pub mod capabilities {
    pub const SECP256K1_PUB: u32 = 1 << 0;
    pub const ED25519_PUB: u32 = 1 << 1;
    pub const SIGN: u32 = 1 << 2;
    pub const ALL: u32 = SECP256K1_PUB | ED25519_PUB | SIGN;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// 32-byte wallet identifier, hex on the JSON side.
    #[serde(with = "hex_bytes")]
    pub uid: Vec<u8>,
    pub name: String,
    pub capabilities: u32,
    pub external: bool,
}

impl Wallet {
    pub fn to_wire(&self) -> WalletV1 {
        WalletV1 {
            uid: self.uid.clone(),
            name: self.name.clone(),
            capabilities: self.capabilities,
            external: self.external,
        }
    }
}

/// The device's internal wallet and, optionally, an inserted external one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWallets {
    pub internal: Wallet,
    pub external: Option<Wallet>,
}

impl ActiveWallets {
    pub fn to_wire(&self) -> Vec<WalletV1> {
        std::iter::once(&self.internal)
            .chain(self.external.as_ref())
            .map(Wallet::to_wire)
            .collect()
    }
}

/// What an out-of-band request is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    /// A user decision on a signing request.
    SignApproval,
    /// The client's authoritative copy of the KV records.
    KvSnapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: u64,
    pub kind: PendingKind,
    pub payload: serde_json::Value,
    pub created_at_ms: u64,
    pub timeout_ms: u64,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_json_uses_hex_uid() {
        let w = Wallet {
            uid: vec![0xab, 0xcd],
            name: "Internal".into(),
            capabilities: capabilities::ALL,
            external: false,
        };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("\"abcd\""));
        let back: Wallet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_active_wallets_order() {
        let internal = Wallet { uid: vec![1], name: "a".into(), capabilities: 0, external: false };
        let external = Wallet { uid: vec![2], name: "b".into(), capabilities: 0, external: true };
        let wallets = ActiveWallets { internal, external: Some(external) };
        let wire = wallets.to_wire();
        assert_eq!(wire.len(), 2);
        assert!(!wire[0].external);
        assert!(wire[1].external);
    }
}
