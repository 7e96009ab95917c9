//! Multi-curve signing with derived keys.

use ed25519_dalek::{Signer as _, Verifier as _};
use k256::ecdsa::signature::hazmat::PrehashVerifier;

use crate::hd::Curve;

/// Digest length expected by ECDSA prehash signing.
pub const ECDSA_DIGEST_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignError {
    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),
    #[error("invalid private key")]
    InvalidKey,
    #[error("ECDSA requires a {ECDSA_DIGEST_LEN}-byte digest, got {0} bytes")]
    InvalidDigest(usize),
    #[error("signing failed: {0}")]
    Failed(String),
}

/// Signature bytes plus the recovery id on ECDSA curves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutput {
    /// `r || s` for ECDSA, the 64-byte signature for EdDSA.
    pub bytes: Vec<u8>,
    pub recovery_id: Option<u8>,
}

impl Curve {
    /// Curve for a wire selector value.
    pub fn from_id(id: i32) -> Result<Self, SignError> {
        match id {
            0 => Ok(Curve::Secp256k1),
            1 => Ok(Curve::Ed25519),
            other => Err(SignError::UnsupportedCurve(format!("curve id {other}"))),
        }
    }

    pub fn id(self) -> i32 {
        match self {
            Curve::Secp256k1 => 0,
            Curve::Ed25519 => 1,
        }
    }
}

impl std::str::FromStr for Curve {
    type Err = SignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "secp256k1" => Ok(Curve::Secp256k1),
            "ed25519" => Ok(Curve::Ed25519),
            _ => Err(SignError::UnsupportedCurve(s.to_string())),
        }
    }
}

/// Sign `payload` with `private_key` on `curve`.
///
/// For secp256k1 `payload` must already be a 32-byte digest. Ed25519 signs
/// the message itself, hashing internally.
pub fn sign(payload: &[u8], private_key: &[u8; 32], curve: Curve) -> Result<SignatureOutput, SignError> {
    match curve {
        Curve::Secp256k1 => {
            if payload.len() != ECDSA_DIGEST_LEN {
                return Err(SignError::InvalidDigest(payload.len()));
            }
            let key = k256::ecdsa::SigningKey::from_slice(private_key).map_err(|_| SignError::InvalidKey)?;
            let (sig, recid) = key
                .sign_prehash_recoverable(payload)
                .map_err(|e| SignError::Failed(e.to_string()))?;
            Ok(SignatureOutput {
                bytes: sig.to_bytes().to_vec(),
                recovery_id: Some(recid.to_byte()),
            })
        }
        Curve::Ed25519 => {
            let key = ed25519_dalek::SigningKey::from_bytes(private_key);
            Ok(SignatureOutput {
                bytes: key.sign(payload).to_bytes().to_vec(),
                recovery_id: None,
            })
        }
    }
}

/// Check `signature` over `payload` against a public key as produced by
/// `hd::ExtendedKey::public_key`.
pub fn verify(payload: &[u8], signature: &[u8], public_key: &[u8], curve: Curve) -> bool {
    match curve {
        Curve::Secp256k1 => {
            let Ok(vk) = k256::ecdsa::VerifyingKey::from_sec1_bytes(public_key) else {
                return false;
            };
            let Ok(sig) = k256::ecdsa::Signature::from_slice(signature) else {
                return false;
            };
            vk.verify_prehash(payload, &sig).is_ok()
        }
        Curve::Ed25519 => {
            let Ok(pk) = <[u8; 32]>::try_from(public_key) else {
                return false;
            };
            let Ok(sig) = <[u8; 64]>::try_from(signature) else {
                return false;
            };
            let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&pk) else {
                return false;
            };
            vk.verify(payload, &ed25519_dalek::Signature::from_bytes(&sig)).is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::keccak256;
    use crate::hd::{DerivationPath, ExtendedKey};

    fn node(path: &str, curve: Curve) -> ExtendedKey {
        let seed = [7u8; 32];
        ExtendedKey::derive_path(&seed, &DerivationPath::parse(path).unwrap(), curve).unwrap()
    }

    #[test]
    fn test_secp256k1_signature_verifies_and_recovers() {
        let key = node("m/44'/60'/0'/0/0", Curve::Secp256k1);
        let digest = keccak256(b"hello");
        let out = sign(&digest, key.private_key(), Curve::Secp256k1).unwrap();
        assert_eq!(out.bytes.len(), 64);

        let public = key.public_key().unwrap();
        assert!(verify(&digest, &out.bytes, &public, Curve::Secp256k1));

        let sig = k256::ecdsa::Signature::from_slice(&out.bytes).unwrap();
        let recid = k256::ecdsa::RecoveryId::from_byte(out.recovery_id.unwrap()).unwrap();
        let recovered = k256::ecdsa::VerifyingKey::recover_from_prehash(&digest, &sig, recid).unwrap();
        assert_eq!(recovered.to_encoded_point(true).as_bytes(), public.as_slice());
    }

    #[test]
    fn test_ed25519_signature_verifies() {
        let key = node("m/44'/501'/0'/0'", Curve::Ed25519);
        let out = sign(b"any length message", key.private_key(), Curve::Ed25519).unwrap();
        assert_eq!(out.bytes.len(), 64);
        assert_eq!(out.recovery_id, None);
        assert!(verify(b"any length message", &out.bytes, &key.public_key().unwrap(), Curve::Ed25519));
        assert!(!verify(b"other message", &out.bytes, &key.public_key().unwrap(), Curve::Ed25519));
    }

    #[test]
    fn test_secp256k1_requires_digest() {
        let key = node("m/44'/60'/0'/0/0", Curve::Secp256k1);
        assert_eq!(
            sign(b"short", key.private_key(), Curve::Secp256k1),
            Err(SignError::InvalidDigest(5))
        );
    }

    #[test]
    fn test_curve_selection() {
        assert_eq!(Curve::from_id(0), Ok(Curve::Secp256k1));
        assert_eq!(Curve::from_id(1), Ok(Curve::Ed25519));
        assert!(matches!(Curve::from_id(5), Err(SignError::UnsupportedCurve(_))));
        assert_eq!("ED25519".parse::<Curve>(), Ok(Curve::Ed25519));
        assert!("p256".parse::<Curve>().is_err());
    }
}
