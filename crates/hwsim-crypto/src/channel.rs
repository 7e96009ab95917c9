//! Secure channel framing.
//!
//! Envelope layout: `nonce(12) || ciphertext+tag || crc32(plaintext)(4, BE)`.
//! The checksum is computed over the plaintext before encryption and is
//! re-verified after decryption.

#![forbid(unsafe_code)]

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::hash::checksum32;
use crate::keys::SharedSecret;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const CHECKSUM_LEN: usize = 4;
/// Shortest well-formed envelope (empty plaintext).
pub const MIN_ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN + CHECKSUM_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("envelope too short: {0} bytes")]
    TooShort(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("RNG failed")]
    RngError,
}

fn cipher(key: &SharedSecret) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Encrypt `plaintext` and append its checksum.
pub fn encrypt(plaintext: &[u8], key: &SharedSecret) -> Result<Vec<u8>, ChannelError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| ChannelError::RngError)?;

    let ct = cipher(key)
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ChannelError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len() + CHECKSUM_LEN);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    out.extend_from_slice(&checksum32(plaintext).to_be_bytes());
    Ok(out)
}

/// Split off the checksum, decrypt, and verify the checksum against the
/// recovered plaintext.
pub fn decrypt(envelope: &[u8], key: &SharedSecret) -> Result<Vec<u8>, ChannelError> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(ChannelError::TooShort(envelope.len()));
    }
    let (body, checksum) = envelope.split_at(envelope.len() - CHECKSUM_LEN);
    let (nonce, ct) = body.split_at(NONCE_LEN);

    let plaintext = cipher(key)
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| ChannelError::DecryptionFailed)?;

    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(checksum);
    if checksum32(&plaintext) != u32::from_be_bytes(expected) {
        return Err(ChannelError::ChecksumMismatch);
    }
    Ok(plaintext)
}
