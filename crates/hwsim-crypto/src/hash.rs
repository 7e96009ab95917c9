use sha2::{Digest, Sha256};
use sha3::Keccak256;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Legacy Keccak-256 (pre-NIST padding), as used by Ethereum.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut h = Keccak256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Checksum appended to secure envelopes: CRC-32 (IEEE) of the plaintext.
pub fn checksum32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
