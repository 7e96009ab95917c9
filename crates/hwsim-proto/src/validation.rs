//! Validation helpers for protocol messages.
//!
//! Only structural checks live here (sizes, emptiness). Limits that depend on
//! device configuration are enforced by the request handlers.

use crate::v1::*;

/// Validation error types for protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field has invalid size (expected, actual)
    InvalidSize { field: &'static str, expected: usize, actual: usize },
    /// Field size is out of allowed range
    SizeOutOfRange { field: &'static str, min: usize, max: usize, actual: usize },
    /// Required field is empty
    EmptyField { field: &'static str },
    /// Field contains invalid data
    InvalidData { field: &'static str, reason: &'static str },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize { field, expected, actual } => {
                write!(f, "field '{}' has invalid size: expected {}, got {}", field, expected, actual)
            }
            Self::SizeOutOfRange { field, min, max, actual } => {
                write!(f, "field '{}' size {} is out of range [{}, {}]", field, actual, min, max)
            }
            Self::EmptyField { field } => {
                write!(f, "required field '{}' is empty", field)
            }
            Self::InvalidData { field, reason } => {
                write!(f, "field '{}' contains invalid data: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Constants for field sizes.
pub mod sizes {
    /// Compressed SEC1 secp256k1 public key.
    pub const COMPRESSED_PUB_SIZE: usize = 33;
    /// ECDSA r || s.
    pub const ECDSA_SIG_SIZE: usize = 64;
    /// Firmware version (major, minor, patch).
    pub const FIRMWARE_VERSION_SIZE: usize = 3;
    /// Digits in a pairing code.
    pub const PAIRING_CODE_LEN: usize = 8;
    /// Longest accepted application name.
    pub const MAX_APP_NAME_LEN: usize = 24;
    /// Shortest accepted application name.
    pub const MIN_APP_NAME_LEN: usize = 5;
}

fn validate_exact_size(field: &'static str, data: &[u8], expected: usize) -> ValidationResult<()> {
    if data.len() != expected {
        return Err(ValidationError::InvalidSize {
            field,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn validate_not_empty(field: &'static str, len: usize) -> ValidationResult<()> {
    if len == 0 {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

/// Trait for validating protocol messages.
pub trait Validate {
    /// Validate the message fields.
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for ConnectRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_exact_size("client_pub", &self.client_pub, sizes::COMPRESSED_PUB_SIZE)
    }
}

impl Validate for FinalizePairingRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        let len = self.app_name.len();
        if !(sizes::MIN_APP_NAME_LEN..=sizes::MAX_APP_NAME_LEN).contains(&len) {
            return Err(ValidationError::SizeOutOfRange {
                field: "app_name",
                min: sizes::MIN_APP_NAME_LEN,
                max: sizes::MAX_APP_NAME_LEN,
                actual: len,
            });
        }
        validate_not_empty("pairing_secret", self.pairing_secret.len())?;
        validate_exact_size("signature", &self.signature, sizes::ECDSA_SIG_SIZE)
    }
}

impl Validate for GetAddressesRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_not_empty("start_path", self.start_path.len())?;
        if self.n == 0 {
            return Err(ValidationError::InvalidData { field: "n", reason: "must be at least 1" });
        }
        Ok(())
    }
}

impl Validate for SignRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_not_empty("data", self.data.len())?;
        validate_not_empty("path", self.path.len())?;
        if SchemaV1::try_from(self.schema).is_err() {
            return Err(ValidationError::InvalidData { field: "schema", reason: "unknown schema" });
        }
        if EncodingV1::try_from(self.encoding).is_err() {
            return Err(ValidationError::InvalidData { field: "encoding", reason: "unknown encoding" });
        }
        if HashTypeV1::try_from(self.hash_type).is_err() {
            return Err(ValidationError::InvalidData { field: "hash_type", reason: "unknown hash type" });
        }
        Ok(())
    }
}

impl Validate for GetWalletsRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        Ok(())
    }
}

impl Validate for GetKvRecordsRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        if self.n == 0 {
            return Err(ValidationError::InvalidData { field: "n", reason: "must be at least 1" });
        }
        Ok(())
    }
}

impl Validate for AddKvRecordsRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_not_empty("records", self.records.len())?;
        for record in &self.records {
            validate_not_empty("key", record.key.len())?;
        }
        Ok(())
    }
}

impl Validate for RemoveKvRecordsRequestV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_not_empty("keys", self.keys.len())
    }
}
