//! Typed, paginated key-value records.
//!
//! Records live in one insertion-ordered list. The type field is a namespace:
//! keys are unique within a type, and reads enumerate a single type in
//! insertion order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hwsim_proto::v1::KvRecordV1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store full: {needed} new records exceed remaining capacity {remaining}")]
    Full { needed: usize, remaining: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRecord {
    pub id: u32,
    #[serde(default)]
    pub record_type: u32,
    pub key: String,
    pub value: String,
}

impl KvRecord {
    pub fn to_wire(&self) -> KvRecordV1 {
        KvRecordV1 {
            id: self.id,
            record_type: self.record_type,
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

/// One page of a typed listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPage {
    pub records: Vec<KvRecord>,
    pub fetched: usize,
    /// Records of this type in the store.
    pub total: usize,
}

#[derive(Clone, Debug)]
pub struct KvStore {
    records: Vec<KvRecord>,
    next_id: u32,
    capacity: usize,
}

impl KvStore {
    pub fn new(capacity: usize) -> Self {
        Self { records: Vec::new(), next_id: 1, capacity }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[KvRecord] {
        &self.records
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Up to `n` records of `record_type`, starting at positional offset
    /// `start`. Returns fewer when fewer exist.
    pub fn get(&self, record_type: u32, start: usize, n: usize) -> KvPage {
        let typed = self.records.iter().filter(|r| r.record_type == record_type);
        let total = typed.clone().count();
        let records: Vec<KvRecord> = typed.skip(start).take(n).cloned().collect();
        KvPage { fetched: records.len(), records, total }
    }

    pub fn find(&self, record_type: u32, key: &str) -> Option<&KvRecord> {
        self.records
            .iter()
            .find(|r| r.record_type == record_type && r.key == key)
    }

    /// Upsert one record. An existing key keeps its position and id.
    pub fn put(&mut self, key: &str, value: &str, record_type: u32) -> Result<u32, StoreError> {
        self.put_many(record_type, [(key, value)]).map(|ids| ids[0])
    }

    /// Upsert a batch. Either every record is stored or, when the new keys
    /// would exceed capacity, none is.
    pub fn put_many<'a, I>(&mut self, record_type: u32, pairs: I) -> Result<Vec<u32>, StoreError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let pairs: Vec<(&str, &str)> = pairs.into_iter().collect();

        let mut new_keys: Vec<&str> = pairs
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| self.find(record_type, k).is_none())
            .collect();
        new_keys.sort_unstable();
        new_keys.dedup();
        let remaining = self.capacity.saturating_sub(self.records.len());
        if new_keys.len() > remaining {
            return Err(StoreError::Full { needed: new_keys.len(), remaining });
        }

        let mut ids = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let existing = self
                .records
                .iter_mut()
                .find(|r| r.record_type == record_type && r.key == key);
            match existing {
                Some(record) => {
                    record.value = value.to_string();
                    ids.push(record.id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.records.push(KvRecord {
                        id,
                        record_type,
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Remove `keys` from `record_type`. Missing keys are ignored. Returns the
    /// number removed.
    pub fn remove<S: AsRef<str>>(&mut self, record_type: u32, keys: &[S]) -> usize {
        let before = self.records.len();
        self.records.retain(|r| {
            r.record_type != record_type || !keys.iter().any(|k| k.as_ref() == r.key)
        });
        before - self.records.len()
    }

    /// Replace the whole contents with `records`. Never merges.
    pub fn restore_all(&mut self, records: Vec<KvRecord>) {
        self.next_id = records.iter().map(|r| r.id).max().unwrap_or(0).saturating_add(1);
        self.records = records;
    }
}
