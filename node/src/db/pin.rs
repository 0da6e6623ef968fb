//! User PIN hashing.
//!
//! Current format: `pbkdf2$<iterations>$<salt_hex>$<digest_hex>` using
//! PBKDF2-HMAC-SHA256 with a per-user random salt. Verification also
//! accepts three legacy formats carried over from earlier node releases —
//! plaintext, a bare SHA-256 hex digest, and the salted `sha256$<salt>$<hex>`
//! form — and reports when a stored PIN should be transparently upgraded.

use std::num::NonZeroU32;

use rand::RngCore;
use ring::pbkdf2;
use sha2::{Digest, Sha256};

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Outcome of a PIN check against a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinVerdict {
    /// The PIN matched. `needs_upgrade` is set when the stored value uses a
    /// legacy format and should be re-hashed.
    Valid { needs_upgrade: bool },
    Invalid,
}

impl PinVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, PinVerdict::Valid { .. })
    }
}

/// Hash a PIN into the current storage format.
pub fn hash_pin(pin: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        PBKDF2_ALG,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("iterations > 0"),
        &salt,
        pin.as_bytes(),
        &mut key,
    );

    format!(
        "pbkdf2${PBKDF2_ITERATIONS}${}${}",
        hex::encode(salt),
        hex::encode(key)
    )
}

/// Verify a PIN against a stored value in any supported format.
pub fn verify_pin(pin: &str, stored: &str) -> PinVerdict {
    if stored.is_empty() {
        return PinVerdict::Invalid;
    }

    if let Some(rest) = stored.strip_prefix("pbkdf2$") {
        return verify_pbkdf2(pin, rest);
    }

    // Legacy: salted SHA-256 of the form sha256$<salt>$<hex>.
    if let Some(rest) = stored.strip_prefix("sha256$") {
        if let Some((salt, digest_hex)) = rest.split_once('$') {
            let mut hasher = Sha256::new();
            hasher.update(salt.as_bytes());
            hasher.update(pin.as_bytes());
            let computed = hex::encode(hasher.finalize());
            if constant_time_eq(computed.as_bytes(), digest_hex.as_bytes()) {
                return PinVerdict::Valid { needs_upgrade: true };
            }
        }
        return PinVerdict::Invalid;
    }

    // Legacy: bare SHA-256 hex digest.
    if stored.len() == 64 && stored.bytes().all(|b| b.is_ascii_hexdigit()) {
        let computed = hex::encode(Sha256::digest(pin.as_bytes()));
        if constant_time_eq(computed.as_bytes(), stored.as_bytes()) {
            return PinVerdict::Valid { needs_upgrade: true };
        }
        return PinVerdict::Invalid;
    }

    // Legacy: plaintext.
    if constant_time_eq(pin.as_bytes(), stored.as_bytes()) {
        return PinVerdict::Valid { needs_upgrade: true };
    }
    PinVerdict::Invalid
}

fn verify_pbkdf2(pin: &str, rest: &str) -> PinVerdict {
    let mut parts = rest.splitn(3, '$');
    let (Some(iterations), Some(salt_hex), Some(digest_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return PinVerdict::Invalid;
    };

    let Ok(iterations) = iterations.parse::<u32>() else {
        return PinVerdict::Invalid;
    };
    let Some(iterations) = NonZeroU32::new(iterations) else {
        return PinVerdict::Invalid;
    };
    let (Ok(salt), Ok(digest)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return PinVerdict::Invalid;
    };

    match pbkdf2::verify(PBKDF2_ALG, iterations, &salt, pin.as_bytes(), &digest) {
        Ok(()) => PinVerdict::Valid {
            needs_upgrade: false,
        },
        Err(_) => PinVerdict::Invalid,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
