//! Hierarchical deterministic key derivation.
//!
//! secp256k1 follows BIP32 (hardened and normal children). ed25519 follows
//! SLIP-10, which only defines hardened children.

use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{FieldBytes, Scalar, SecretKey};
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha512 = Hmac<Sha512>;

/// Segments at or above this value are hardened.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

const SECP256K1_SEED_KEY: &[u8] = b"Bitcoin seed";
const ED25519_SEED_KEY: &[u8] = b"ed25519 seed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

impl Curve {
    pub fn name(self) -> &'static str {
        match self {
            Curve::Secp256k1 => "secp256k1",
            Curve::Ed25519 => "ed25519",
        }
    }
}

impl std::fmt::Display for Curve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HdError {
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),
    #[error("{0} only supports hardened derivation")]
    HardenedOnly(Curve),
    #[error("seed must be 16..=64 bytes, got {0}")]
    InvalidSeed(usize),
    #[error("derived key is invalid at index {0}")]
    InvalidChild(u32),
    #[error("invalid private key")]
    InvalidKey,
}

pub fn is_hardened(segment: u32) -> bool {
    segment >= HARDENED_OFFSET
}

/// Ordered list of derivation indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn new(segments: Vec<u32>) -> Self {
        Self(segments)
    }

    /// Parse `m/44'/60'/0'/0/0`. `'`, `h` and `H` mark hardened segments.
    pub fn parse(s: &str) -> Result<Self, HdError> {
        let mut parts = s.trim().split('/');
        if parts.next() != Some("m") {
            return Err(HdError::InvalidPath(format!("{s}: must start with 'm'")));
        }
        let mut segments = Vec::new();
        for part in parts {
            let (digits, hardened) = match part.strip_suffix(['\'', 'h', 'H']) {
                Some(d) => (d, true),
                None => (part, false),
            };
            let index: u32 = digits
                .parse()
                .map_err(|_| HdError::InvalidPath(format!("{s}: bad segment '{part}'")))?;
            if index >= HARDENED_OFFSET {
                return Err(HdError::InvalidPath(format!("{s}: segment '{part}' out of range")));
            }
            segments.push(if hardened { index + HARDENED_OFFSET } else { index });
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// BIP44 coin type (second segment, unhardened), if present.
    pub fn coin_type(&self) -> Option<u32> {
        self.0.get(1).map(|s| s & !HARDENED_OFFSET)
    }

    /// Same path with the last index advanced by `offset`. The hardened bit
    /// of the last segment is preserved.
    pub fn with_last_offset(&self, offset: u32) -> Result<Self, HdError> {
        let mut segments = self.0.clone();
        let last = segments
            .last_mut()
            .ok_or_else(|| HdError::InvalidPath("empty path".into()))?;
        let hardened = *last & HARDENED_OFFSET;
        let index = (*last & !HARDENED_OFFSET)
            .checked_add(offset)
            .filter(|i| *i < HARDENED_OFFSET)
            .ok_or_else(|| HdError::InvalidPath(format!("{self}: index overflow")))?;
        *last = hardened | index;
        Ok(Self(segments))
    }
}

impl std::fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("m")?;
        for s in &self.0 {
            if is_hardened(*s) {
                write!(f, "/{}'", s - HARDENED_OFFSET)?;
            } else {
                write!(f, "/{}", s)?;
            }
        }
        Ok(())
    }
}

impl From<Vec<u32>> for DerivationPath {
    fn from(v: Vec<u32>) -> Self {
        Self(v)
    }
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> ([u8; 32], [u8; 32]) {
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC can take keys of any size");
    for p in parts {
        mac.update(p);
    }
    let out = mac.finalize().into_bytes();
    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&out[..32]);
    ir.copy_from_slice(&out[32..]);
    (il, ir)
}

fn parse_scalar(bytes: &[u8; 32]) -> Option<Scalar> {
    Option::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
}

/// A private key plus chain code at some node of the tree.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedKey {
    #[zeroize(skip)]
    curve: Curve,
    key: [u8; 32],
    chain_code: [u8; 32],
}

impl ExtendedKey {
    pub fn master(seed: &[u8], curve: Curve) -> Result<Self, HdError> {
        if !(16..=64).contains(&seed.len()) {
            return Err(HdError::InvalidSeed(seed.len()));
        }
        let hmac_key = match curve {
            Curve::Secp256k1 => SECP256K1_SEED_KEY,
            Curve::Ed25519 => ED25519_SEED_KEY,
        };
        let (key, chain_code) = hmac_sha512(hmac_key, &[seed]);
        if curve == Curve::Secp256k1 {
            match parse_scalar(&key) {
                Some(s) if !bool::from(s.is_zero()) => {}
                _ => return Err(HdError::InvalidChild(0)),
            }
        }
        Ok(Self { curve, key, chain_code })
    }

    pub fn derive_child(&self, index: u32) -> Result<Self, HdError> {
        let ser_index = index.to_be_bytes();
        match self.curve {
            Curve::Ed25519 => {
                if !is_hardened(index) {
                    return Err(HdError::HardenedOnly(Curve::Ed25519));
                }
                let (key, chain_code) =
                    hmac_sha512(&self.chain_code, &[&[0u8], &self.key, &ser_index]);
                Ok(Self { curve: self.curve, key, chain_code })
            }
            Curve::Secp256k1 => {
                let (il, chain_code) = if is_hardened(index) {
                    hmac_sha512(&self.chain_code, &[&[0u8], &self.key, &ser_index])
                } else {
                    let public = self.public_key()?;
                    hmac_sha512(&self.chain_code, &[&public, &ser_index])
                };
                let tweak = parse_scalar(&il).ok_or(HdError::InvalidChild(index))?;
                let parent = parse_scalar(&self.key).ok_or(HdError::InvalidKey)?;
                let child = tweak + parent;
                if bool::from(child.is_zero()) {
                    return Err(HdError::InvalidChild(index));
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(&child.to_bytes());
                Ok(Self { curve: self.curve, key, chain_code })
            }
        }
    }

    pub fn derive_path(seed: &[u8], path: &DerivationPath, curve: Curve) -> Result<Self, HdError> {
        path.segments()
            .iter()
            .try_fold(Self::master(seed, curve)?, |node, index| node.derive_child(*index))
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    /// 33-byte compressed point for secp256k1, 32-byte key for ed25519.
    pub fn public_key(&self) -> Result<Vec<u8>, HdError> {
        match self.curve {
            Curve::Secp256k1 => {
                let sk = SecretKey::from_slice(&self.key).map_err(|_| HdError::InvalidKey)?;
                Ok(sk.public_key().to_encoded_point(true).as_bytes().to_vec())
            }
            Curve::Ed25519 => {
                let sk = ed25519_dalek::SigningKey::from_bytes(&self.key);
                Ok(sk.verifying_key().to_bytes().to_vec())
            }
        }
    }
}

pub fn derive_private_key(path: &DerivationPath, seed: &[u8], curve: Curve) -> Result<[u8; 32], HdError> {
    Ok(*ExtendedKey::derive_path(seed, path, curve)?.private_key())
}

pub fn derive_public_key(path: &DerivationPath, seed: &[u8], curve: Curve) -> Result<Vec<u8>, HdError> {
    ExtendedKey::derive_path(seed, path, curve)?.public_key()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TV1_SEED: &str = "000102030405060708090a0b0c0d0e0f";

    fn seed() -> Vec<u8> {
        hex::decode(TV1_SEED).unwrap()
    }

    #[test]
    fn test_bip32_vector1_master() {
        let m = ExtendedKey::master(&seed(), Curve::Secp256k1).unwrap();
        assert_eq!(
            hex::encode(m.private_key()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(m.chain_code()),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );
    }

    #[test]
    fn test_bip32_vector1_hardened_child() {
        let path = DerivationPath::parse("m/0'").unwrap();
        let node = ExtendedKey::derive_path(&seed(), &path, Curve::Secp256k1).unwrap();
        assert_eq!(
            hex::encode(node.private_key()),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );
        assert_eq!(
            hex::encode(node.chain_code()),
            "47fdacbd0f1097043b78c63c20c34ef4ed9a111d980047ad16282c7ae6236141"
        );
    }

    #[test]
    fn test_bip32_vector1_normal_child() {
        let path = DerivationPath::parse("m/0'/1").unwrap();
        let node = ExtendedKey::derive_path(&seed(), &path, Curve::Secp256k1).unwrap();
        assert_eq!(
            hex::encode(node.private_key()),
            "3c6cb8d0f6a264c91ea8b5030fadaa8e538b020f0a387421a12de9319dc93368"
        );
        assert_eq!(
            hex::encode(node.chain_code()),
            "2a7857631386ba23dacac34180dd1983734e444fdbf774041578e9b6adb37c19"
        );
    }

    #[test]
    fn test_slip10_ed25519_vector1() {
        let m = ExtendedKey::master(&seed(), Curve::Ed25519).unwrap();
        assert_eq!(
            hex::encode(m.private_key()),
            "2b4be7f19ee27bbf30c667b642d5f4aa69fd169872f8fc3059c08ebae2eb19e7"
        );
        assert_eq!(
            hex::encode(m.chain_code()),
            "90046a93de5380a72b5e45010748567d5ea02bbf6522f979e05c0d8d8ca9fffb"
        );

        let child = m.derive_child(HARDENED_OFFSET).unwrap();
        assert_eq!(
            hex::encode(child.private_key()),
            "68e0fe46dfb67e368c75379acec591dad19df3cde26e63b93a8e704f1dade7a3"
        );
        assert_eq!(
            hex::encode(child.chain_code()),
            "8b59aa11380b624e81507a27fedda59fea6d0b779a778918a2fd3590e16e9c69"
        );
    }

    #[test]
    fn test_ed25519_rejects_normal_segment() {
        let path = DerivationPath::parse("m/44'/501'/0").unwrap();
        assert_eq!(
            ExtendedKey::derive_path(&seed(), &path, Curve::Ed25519).err(),
            Some(HdError::HardenedOnly(Curve::Ed25519))
        );
    }

    #[test]
    fn test_path_parse_and_display() {
        let path = DerivationPath::parse("m/44'/60'/0'/0/7").unwrap();
        assert_eq!(
            path.segments(),
            &[44 + HARDENED_OFFSET, 60 + HARDENED_OFFSET, HARDENED_OFFSET, 0, 7]
        );
        assert_eq!(path.coin_type(), Some(60));
        assert_eq!(path.to_string(), "m/44'/60'/0'/0/7");
        assert_eq!(DerivationPath::parse("m/44h/0H").unwrap().to_string(), "m/44'/0'");
    }

    #[test]
    fn test_path_parse_rejects_garbage() {
        assert!(DerivationPath::parse("44'/60'").is_err());
        assert!(DerivationPath::parse("m/abc").is_err());
        assert!(DerivationPath::parse("m/2147483648").is_err());
    }

    #[test]
    fn test_with_last_offset_keeps_hardened_bit() {
        let path = DerivationPath::parse("m/44'/501'/3'").unwrap();
        assert_eq!(path.with_last_offset(2).unwrap().to_string(), "m/44'/501'/5'");

        let path = DerivationPath::parse("m/44'/60'/0'/0/9").unwrap();
        assert_eq!(path.with_last_offset(1).unwrap().to_string(), "m/44'/60'/0'/0/10");

        let edge = DerivationPath::new(vec![HARDENED_OFFSET - 1]);
        assert!(edge.with_last_offset(1).is_err());
    }

    #[test]
    fn test_seed_length_checked() {
        assert_eq!(
            ExtendedKey::master(&[0u8; 8], Curve::Secp256k1).err(),
            Some(HdError::InvalidSeed(8))
        );
    }
}
