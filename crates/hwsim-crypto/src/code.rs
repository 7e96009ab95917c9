//! Numeric pairing codes.

use crate::keys::KeyError;

/// Digits in a pairing code.
pub const PAIRING_CODE_LEN: usize = 8;

const MODULUS: u64 = 100_000_000;

/// Fresh fixed-length numeric pairing code from the OS RNG.
pub fn generate_pairing_code() -> Result<String, KeyError> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).map_err(|_| KeyError::Rng)?;
    Ok(format_code(u64::from_be_bytes(buf)))
}

fn format_code(n: u64) -> String {
    format!("{:0width$}", n % MODULUS, width = PAIRING_CODE_LEN)
}

/// Constant-time comparison of a supplied secret against the active code.
pub fn code_matches(active: &str, supplied: &str) -> bool {
    constant_time_eq::constant_time_eq(active.as_bytes(), supplied.as_bytes())
}
