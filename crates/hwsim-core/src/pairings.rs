//! Durable pairing records.
//!
//! The `PairingStore` trait is the persistence seam: the in-memory
//! implementation backs tests and the demo, and a hosting process can plug in
//! its own.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::DeviceError;

/// Trust established between a device and one client key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    pub device_id: String,
    /// Client secp256k1 public key, compressed SEC1.
    pub client_pub: Vec<u8>,
    pub app_name: String,
    pub paired_at_ms: u64,
}

#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Insert or replace the record for `(device_id, client_pub)`.
    async fn save_pairing(&self, record: PairingRecord) -> Result<(), DeviceError>;

    async fn load_pairing(
        &self,
        device_id: &str,
        client_pub: &[u8],
    ) -> Result<Option<PairingRecord>, DeviceError>;

    /// Delete one record. Missing records are not an error.
    async fn delete_pairing(&self, device_id: &str, client_pub: &[u8]) -> Result<(), DeviceError>;

    async fn list_pairings(&self, device_id: &str) -> Result<Vec<PairingRecord>, DeviceError>;

    /// Delete every record for `device_id`. Returns how many were removed.
    async fn clear_device(&self, device_id: &str) -> Result<usize, DeviceError>;
}

type Key = (String, Vec<u8>);

#[derive(Default)]
pub struct InMemoryPairingStore {
    records: RwLock<HashMap<Key, PairingRecord>>,
}

impl InMemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PairingStore for InMemoryPairingStore {
    async fn save_pairing(&self, record: PairingRecord) -> Result<(), DeviceError> {
        let key = (record.device_id.clone(), record.client_pub.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn load_pairing(
        &self,
        device_id: &str,
        client_pub: &[u8],
    ) -> Result<Option<PairingRecord>, DeviceError> {
        let key = (device_id.to_string(), client_pub.to_vec());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn delete_pairing(&self, device_id: &str, client_pub: &[u8]) -> Result<(), DeviceError> {
        let key = (device_id.to_string(), client_pub.to_vec());
        self.records.write().await.remove(&key);
        Ok(())
    }

    async fn list_pairings(&self, device_id: &str) -> Result<Vec<PairingRecord>, DeviceError> {
        let records = self.records.read().await;
        let mut out: Vec<PairingRecord> = records
            .values()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.paired_at_ms);
        Ok(out)
    }

    async fn clear_device(&self, device_id: &str) -> Result<usize, DeviceError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|(dev, _), _| dev != device_id);
        Ok(before - records.len())
    }
}
