use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use hwsim_crypto::Curve;
use hwsim_proto::v1::EncodingV1;

use crate::types::FirmwareVersion;

/// BIP39 seed of the "abandon abandon ... about" test mnemonic.
pub const DEFAULT_SEED_HEX: &str = "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_name: String,
    pub firmware_version: FirmwareVersion,

    // Approval flow
    pub auto_approve: bool,
    pub approval_timeout_ms: u64,
    pub pairing_timeout_ms: u64,
    /// Artificial latency added to every response.
    pub response_delay_ms: u64,
    pub external_request_timeout_ms: u64,

    // Signing
    pub supported_curves: Vec<String>,
    pub supported_encodings: Vec<String>,
    pub max_sign_payload: usize,
    pub max_path_depth: usize,

    // Limits
    pub max_addresses_per_request: u32,
    pub max_kv_records_per_request: u32,
    pub kv_capacity: usize,
    pub max_kv_key_len: usize,
    pub max_kv_value_len: usize,
    pub max_pending_requests: usize,

    /// Fetch KV records from the client before serving reads.
    pub external_kv: bool,
    pub seed_hex: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: "Simulated Wallet".to_string(),
            firmware_version: FirmwareVersion::new(0, 15, 0),
            auto_approve: true,
            approval_timeout_ms: 30_000,
            pairing_timeout_ms: 60_000,
            response_delay_ms: 0,
            external_request_timeout_ms: 10_000,
            supported_curves: vec!["secp256k1".to_string(), "ed25519".to_string()],
            supported_encodings: vec!["none".to_string(), "hex".to_string(), "utf8".to_string()],
            max_sign_payload: 1024,
            max_path_depth: 5,
            max_addresses_per_request: 10,
            max_kv_records_per_request: 10,
            kv_capacity: 200,
            max_kv_key_len: 63,
            max_kv_value_len: 63,
            max_pending_requests: 4,
            external_kv: false,
            seed_hex: DEFAULT_SEED_HEX.to_string(),
        }
    }
}

pub fn encoding_name(encoding: EncodingV1) -> &'static str {
    match encoding {
        EncodingV1::None => "none",
        EncodingV1::Hex => "hex",
        EncodingV1::Utf8 => "utf8",
    }
}

impl DeviceConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: DeviceConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay `HWSIM_*` environment variables. Unparseable values are
    /// ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var("HWSIM_DEVICE_NAME") {
            self.device_name = name;
        }
        if let Ok(seed) = std::env::var("HWSIM_SEED_HEX") {
            self.seed_hex = seed;
        }
        override_parsed("HWSIM_AUTO_APPROVE", &mut self.auto_approve);
        override_parsed("HWSIM_EXTERNAL_KV", &mut self.external_kv);
        override_parsed("HWSIM_PAIRING_TIMEOUT_MS", &mut self.pairing_timeout_ms);
        override_parsed("HWSIM_APPROVAL_TIMEOUT_MS", &mut self.approval_timeout_ms);
        override_parsed("HWSIM_RESPONSE_DELAY_MS", &mut self.response_delay_ms);
        override_parsed("HWSIM_MAX_ADDRESSES", &mut self.max_addresses_per_request);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pairing_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pairing_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_addresses_per_request == 0 || self.max_kv_records_per_request == 0 {
            return Err(ConfigError::ValidationError(
                "per-request limits must be at least 1".to_string(),
            ));
        }
        if self.kv_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "kv_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_path_depth == 0 || self.max_path_depth > 10 {
            return Err(ConfigError::ValidationError(
                "max_path_depth must be between 1 and 10".to_string(),
            ));
        }
        for curve in &self.supported_curves {
            curve
                .parse::<Curve>()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        for encoding in &self.supported_encodings {
            if !matches!(encoding.as_str(), "none" | "hex" | "utf8") {
                return Err(ConfigError::ValidationError(format!(
                    "unknown encoding: {encoding}"
                )));
            }
        }
        self.seed()?;
        Ok(())
    }

    pub fn seed(&self) -> Result<Vec<u8>, ConfigError> {
        let seed = hex::decode(&self.seed_hex)
            .map_err(|e| ConfigError::ValidationError(format!("seed_hex: {e}")))?;
        if !(16..=64).contains(&seed.len()) {
            return Err(ConfigError::ValidationError(
                "seed must be 16 to 64 bytes".to_string(),
            ));
        }
        Ok(seed)
    }

    pub fn supports_curve(&self, curve: Curve) -> bool {
        self.supported_curves
            .iter()
            .any(|c| c.eq_ignore_ascii_case(curve.name()))
    }

    pub fn supports_encoding(&self, encoding: EncodingV1) -> bool {
        let name = encoding_name(encoding);
        self.supported_encodings.iter().any(|e| e == name)
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => warn!(var, value = %raw, "ignoring unparseable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pairing_timeout_ms, 60_000);
        assert_eq!(config.seed().unwrap().len(), 64);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DeviceConfig = toml::from_str(
            r#"
            device_name = "Bench Unit"
            auto_approve = false
            supported_curves = ["secp256k1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.device_name, "Bench Unit");
        assert!(!config.auto_approve);
        assert!(config.supports_curve(Curve::Secp256k1));
        assert!(!config.supports_curve(Curve::Ed25519));
        assert_eq!(config.kv_capacity, 200);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = DeviceConfig { supported_curves: vec!["p256".into()], ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let config = DeviceConfig { seed_hex: "abcd".into(), ..Default::default() };
        assert!(config.validate().is_err());

        let config = DeviceConfig { max_addresses_per_request: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = DeviceConfig::load_from_file(Path::new("/nonexistent/hwsim.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_encoding_support() {
        let config = DeviceConfig { supported_encodings: vec!["none".into()], ..Default::default() };
        assert!(config.supports_encoding(EncodingV1::None));
        assert!(!config.supports_encoding(EncodingV1::Utf8));
    }
}
