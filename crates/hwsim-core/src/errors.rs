//! Error taxonomy for device operations and its mapping to wire response
//! codes.
//!
//! Every failure a handler can produce is one `DeviceError` variant, and every
//! variant maps to exactly one `ResponseCode`.

use thiserror::Error;

use hwsim_crypto::address::AddressError;
use hwsim_crypto::channel::ChannelError;
use hwsim_crypto::hd::HdError;
use hwsim_crypto::keys::KeyError;
use hwsim_crypto::pairing::PairingError;
use hwsim_crypto::signing::SignError;
use hwsim_proto::frame::{FrameError, ResponseCode};
use hwsim_proto::validation::ValidationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No shared secret: the client is not paired or not connected.
    #[error("device not paired")]
    NotPaired,

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("decryption failed")]
    DecryptionError,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),

    #[error("device locked")]
    DeviceLocked,

    #[error("device busy")]
    DeviceBusy,

    #[error("rejected by user")]
    UserRejected,

    #[error("timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid pairing signature")]
    InvalidSignature,

    /// Unanticipated failure. Carries the original message.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    /// Wire response code for this error.
    pub fn code(&self) -> ResponseCode {
        match self {
            DeviceError::NotPaired => ResponseCode::NotPaired,
            DeviceError::ChecksumMismatch => ResponseCode::ChecksumMismatch,
            DeviceError::DecryptionError => ResponseCode::DecryptFail,
            DeviceError::InvalidRequest(_) => ResponseCode::InvalidMsg,
            DeviceError::UnsupportedCurve(_) => ResponseCode::UnsupportedCurve,
            DeviceError::DeviceLocked => ResponseCode::DeviceLocked,
            DeviceError::DeviceBusy => ResponseCode::DeviceBusy,
            DeviceError::UserRejected => ResponseCode::UserRejected,
            DeviceError::Timeout => ResponseCode::Timeout,
            DeviceError::NotFound(_) => ResponseCode::NotFound,
            DeviceError::InvalidSignature => ResponseCode::PairFailed,
            DeviceError::Internal(_) => ResponseCode::Internal,
        }
    }

    /// Inverse of [`DeviceError::code`], used on the client side of the wire.
    /// Returns `None` for `Success`.
    pub fn from_code(code: ResponseCode) -> Option<Self> {
        Some(match code {
            ResponseCode::Success => return None,
            ResponseCode::NotPaired => DeviceError::NotPaired,
            ResponseCode::ChecksumMismatch => DeviceError::ChecksumMismatch,
            ResponseCode::DecryptFail => DeviceError::DecryptionError,
            ResponseCode::InvalidMsg => DeviceError::InvalidRequest("rejected by device".into()),
            ResponseCode::UnsupportedCurve => DeviceError::UnsupportedCurve("rejected by device".into()),
            ResponseCode::DeviceLocked => DeviceError::DeviceLocked,
            ResponseCode::DeviceBusy => DeviceError::DeviceBusy,
            ResponseCode::UserRejected => DeviceError::UserRejected,
            ResponseCode::Timeout => DeviceError::Timeout,
            ResponseCode::NotFound => DeviceError::NotFound("rejected by device".into()),
            ResponseCode::PairFailed => DeviceError::InvalidSignature,
            ResponseCode::Internal => DeviceError::Internal("reported by device".into()),
        })
    }

    /// Failures of the secure channel itself. These cannot be answered inside
    /// an encrypted envelope.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            DeviceError::NotPaired | DeviceError::ChecksumMismatch | DeviceError::DecryptionError
        )
    }
}

// ============================================================================
// Conversions from lower layers
// ============================================================================

impl From<ChannelError> for DeviceError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::ChecksumMismatch => DeviceError::ChecksumMismatch,
            ChannelError::DecryptionFailed | ChannelError::TooShort(_) => DeviceError::DecryptionError,
            ChannelError::EncryptionFailed | ChannelError::RngError => DeviceError::Internal(e.to_string()),
        }
    }
}

impl From<HdError> for DeviceError {
    fn from(e: HdError) -> Self {
        match e {
            HdError::InvalidPath(_) | HdError::HardenedOnly(_) => DeviceError::InvalidRequest(e.to_string()),
            HdError::InvalidSeed(_) | HdError::InvalidChild(_) | HdError::InvalidKey => {
                DeviceError::Internal(e.to_string())
            }
        }
    }
}

impl From<AddressError> for DeviceError {
    fn from(e: AddressError) -> Self {
        match e {
            AddressError::Derivation(inner) => inner.into(),
            other => DeviceError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<SignError> for DeviceError {
    fn from(e: SignError) -> Self {
        match e {
            SignError::UnsupportedCurve(c) => DeviceError::UnsupportedCurve(c),
            SignError::InvalidDigest(_) => DeviceError::InvalidRequest(e.to_string()),
            SignError::InvalidKey | SignError::Failed(_) => DeviceError::Internal(e.to_string()),
        }
    }
}

impl From<KeyError> for DeviceError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::InvalidPublicKey => DeviceError::InvalidRequest(e.to_string()),
            KeyError::InvalidPrivateKey | KeyError::Rng => DeviceError::Internal(e.to_string()),
        }
    }
}

impl From<PairingError> for DeviceError {
    fn from(_: PairingError) -> Self {
        DeviceError::InvalidSignature
    }
}

impl From<FrameError> for DeviceError {
    fn from(e: FrameError) -> Self {
        DeviceError::InvalidRequest(e.to_string())
    }
}

impl From<ValidationError> for DeviceError {
    fn from(e: ValidationError) -> Self {
        DeviceError::InvalidRequest(e.to_string())
    }
}

impl From<prost::DecodeError> for DeviceError {
    fn from(e: prost::DecodeError) -> Self {
        DeviceError::InvalidRequest(format!("malformed body: {e}"))
    }
}
