//! Cryptographic building blocks for the wallet simulator: ephemeral key
//! exchange, the checksummed secure channel, HD derivation, addresses,
//! multi-curve signing and pairing transcripts.

#![forbid(unsafe_code)]

pub mod hash;
pub mod transcript;
pub mod code;
pub mod keys;
pub mod pairing;

pub mod channel;
pub mod hd;
pub mod address;
pub mod signing;

pub use hd::Curve;

#[cfg(test)]
mod proptests;
