//! Ephemeral secp256k1 key pairs and ECDH channel key derivation.

use hkdf::Hkdf;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand_core::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const ECDH_SALT: &[u8] = b"hwsim_ecdh_salt_v1";
const CHANNEL_KEY_INFO: &[u8] = b"hwsim_channel_key_v1";

/// Length of a compressed SEC1 public key.
pub const COMPRESSED_PUB_LEN: usize = 33;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid private key bytes")]
    InvalidPrivateKey,
    #[error("RNG failed")]
    Rng,
}

/// Symmetric key for the secure channel.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Single-session device key pair.
#[derive(Clone)]
pub struct EphemeralKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// 33-byte compressed SEC1 encoding of the public half.
    pub fn public_bytes(&self) -> Vec<u8> {
        encode_public(&self.public)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish_non_exhaustive()
    }
}

/// Fresh key pair from the OS RNG. Never derived, so never repeated.
pub fn generate_ephemeral_key_pair() -> EphemeralKeyPair {
    let secret = SecretKey::random(&mut OsRng);
    let public = secret.public_key();
    EphemeralKeyPair { secret, public }
}

pub fn encode_public(public: &PublicKey) -> Vec<u8> {
    public.to_encoded_point(true).as_bytes().to_vec()
}

/// Parse a SEC1 public key (compressed or uncompressed).
pub fn parse_public(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// ECDH followed by HKDF-SHA256. Both peers arrive at the same key.
pub fn derive_shared_secret(local: &SecretKey, remote: &PublicKey) -> SharedSecret {
    let shared = k256::ecdh::diffie_hellman(local.to_nonzero_scalar(), remote.as_affine());
    let hk = Hkdf::<Sha256>::new(Some(ECDH_SALT), shared.raw_secret_bytes().as_slice());

    let mut key = [0u8; 32];
    hk.expand(CHANNEL_KEY_INFO, &mut key)
        .expect("hkdf expand"); // output size matches digest size, infallible
    SharedSecret(key)
}
