//! Tagged transcript builder.
//!
//! Data is appended as `(tag, len, bytes)` tuples so the same logical input
//! always serializes, and therefore hashes and signs, identically.

use bytes::{BufMut, BytesMut};

use crate::hash::sha256;

/// Tags used by the simulator's transcripts. Fixed once released.
pub mod tags {
    pub const DOMAIN: u32 = 0;
    pub const CLIENT_PUB: u32 = 1;
    pub const DEVICE_PUB: u32 = 2;
    pub const APP_NAME: u32 = 3;
    pub const SECRET: u32 = 4;
}

#[derive(Clone, Debug, Default)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    /// Create a new transcript with the given domain separator.
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self { buf: BytesMut::with_capacity(256) };
        t.append_str(tags::DOMAIN, domain);
        t
    }

    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_u64(&mut self, tag: u32, v: u64) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(8);
        self.buf.put_u64(v);
        self
    }

    pub fn append_str(&mut self, tag: u32, s: &str) -> &mut Self {
        self.append_bytes(tag, s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// SHA-256 of the transcript contents.
    pub fn finalize(&self) -> [u8; 32] {
        sha256(&self.buf)
    }
}
