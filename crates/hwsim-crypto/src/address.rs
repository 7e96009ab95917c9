//! Per-coin address encoding on top of HD derivation.

use alloy_primitives::Address;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;

use crate::hd::{Curve, DerivationPath, ExtendedKey, HdError};

pub const COIN_ETHEREUM: u32 = 60;
pub const COIN_SOLANA: u32 = 501;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("path {0} has no coin type segment")]
    MissingCoinType(String),
    #[error("unsupported coin type {0}")]
    UnsupportedCoin(u32),
    #[error(transparent)]
    Derivation(#[from] HdError),
}

/// Curve used for keys under the given BIP44 coin type.
pub fn curve_for_coin(coin: u32) -> Option<Curve> {
    match coin {
        COIN_ETHEREUM => Some(Curve::Secp256k1),
        COIN_SOLANA => Some(Curve::Ed25519),
        _ => None,
    }
}

/// Address for `path` under `seed`. Pure: same inputs, same output.
pub fn derive_address(path: &DerivationPath, seed: &[u8]) -> Result<String, AddressError> {
    let coin = path
        .coin_type()
        .ok_or_else(|| AddressError::MissingCoinType(path.to_string()))?;
    let curve = curve_for_coin(coin).ok_or(AddressError::UnsupportedCoin(coin))?;
    encode_address(&ExtendedKey::derive_path(seed, path, curve)?)
}

/// Address of an already derived node: EIP-55 for secp256k1, hex public key
/// for ed25519.
pub fn encode_address(node: &ExtendedKey) -> Result<String, AddressError> {
    match node.curve() {
        Curve::Secp256k1 => ethereum_address(node.private_key()),
        Curve::Ed25519 => Ok(hex::encode(node.public_key()?)),
    }
}

fn ethereum_address(private_key: &[u8; 32]) -> Result<String, AddressError> {
    let sk = SecretKey::from_slice(private_key).map_err(|_| HdError::InvalidKey)?;
    let point = sk.public_key().to_encoded_point(false);
    // Uncompressed point without the 0x04 prefix.
    let address = Address::from_raw_public_key(&point.as_bytes()[1..]);
    Ok(address.to_checksum(None))
}

/// EIP-55 mixed-case encoding, `0x`-prefixed.
pub fn to_checksum_address(addr: &[u8; 20]) -> String {
    Address::from(*addr).to_checksum(None)
}
