//! RFC 6238 TOTP, used to gate proxy connections and toolbox commands.
//!
//! Grounded on the hmac+sha1 pairing seen across the pack's other DNS-server
//! manifests for exactly this purpose; `data_encoding` base32-decodes the
//! configured seed.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TotpError {
    #[error("seed is not valid base32")]
    BadSeed,
}

/// Compute the 6-digit code for `seed_base32` at `unix_time`, stepped every
/// `step_secs` seconds.
pub fn generate(seed_base32: &str, step_secs: u64, unix_time: u64) -> Result<u32, TotpError> {
    let key = decode_seed(seed_base32)?;
    let counter = unix_time / step_secs;
    Ok(hotp(&key, counter))
}

/// Verify `code` against the previous, current, and next time steps, as
/// §4.9 requires, tolerating clock skew of one step in either direction.
pub fn verify(seed_base32: &str, step_secs: u64, code: u32) -> Result<bool, TotpError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let key = decode_seed(seed_base32)?;
    let counter = now / step_secs;
    for candidate_counter in [counter.saturating_sub(1), counter, counter + 1] {
        if hotp(&key, candidate_counter) == code {
            return Ok(true);
        }
    }
    Ok(false)
}

fn decode_seed(seed_base32: &str) -> Result<Vec<u8>, TotpError> {
    BASE32_NOPAD
        .decode(seed_base32.to_ascii_uppercase().as_bytes())
        .map_err(|_| TotpError::BadSeed)
}

fn hotp(key: &[u8], counter: u64) -> u32 {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let result = mac.finalize().into_bytes();

    let offset = (result[result.len() - 1] & 0x0f) as usize;
    let truncated = ((result[offset] as u32 & 0x7f) << 24)
        | ((result[offset + 1] as u32) << 16)
        | ((result[offset + 2] as u32) << 8)
        | (result[offset + 3] as u32);
    truncated % 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "JBSWY3DPEHPK3PXP";

    #[test]
    fn same_time_step_is_deterministic() {
        let a = generate(SEED, 30, 1_700_000_000).unwrap();
        let b = generate(SEED, 30, 1_700_000_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn adjacent_time_steps_usually_differ() {
        let a = generate(SEED, 30, 1_700_000_000).unwrap();
        let b = generate(SEED, 30, 1_700_000_030).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_rejects_bad_seed() {
        assert_eq!(verify("not valid base32!!", 30, 0), Err(TotpError::BadSeed));
    }

    #[test]
    fn verify_accepts_current_step_code() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let code = generate(SEED, 30, now).unwrap();
        assert!(verify(SEED, 30, code).unwrap());
    }
}
