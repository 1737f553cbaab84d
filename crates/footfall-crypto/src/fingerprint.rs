//! Keyed visitor fingerprints.
//!
//! # Algorithm
//!
//! The two configured 64-bit keys are expanded into a 32-byte BLAKE3 key with
//! `derive_key`, once, at construction. Per request the hasher absorbs, in a
//! fixed order and each prefixed with its length:
//!
//! 1. User agent
//! 2. Client IP (textual, port stripped by the caller)
//! 3. Global salt followed by the per-request salt
//! 4. Calendar day as `YYYYMMDD` (empty when rotation is disabled)
//!
//! The first eight bytes of the output, read little-endian, form the
//! fingerprint.

use chrono::NaiveDate;
use footfall_types::Fingerprint;

/// Context string for deriving the hashing key from the configured keys.
const KEY_CONTEXT: &str = "footfall 2024-03 visitor fingerprint v1";

/// The two configured fingerprint keys.
///
/// Changing either key invalidates every running session, because no later
/// request can reproduce an earlier fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintKeys {
    pub key0: u64,
    pub key1: u64,
}

impl FingerprintKeys {
    pub fn new(key0: u64, key1: u64) -> Self {
        Self { key0, key1 }
    }

    /// Generates a pair of random keys.
    pub fn random() -> Self {
        Self {
            key0: rand::random(),
            key1: rand::random(),
        }
    }

    /// Returns the configured keys, replacing any zero key with a random one.
    pub fn or_random(key0: u64, key1: u64) -> Self {
        Self {
            key0: if key0 == 0 { rand::random() } else { key0 },
            key1: if key1 == 0 { rand::random() } else { key1 },
        }
    }

    fn derive(self) -> [u8; 32] {
        let mut material = [0u8; 16];
        material[..8].copy_from_slice(&self.key0.to_le_bytes());
        material[8..].copy_from_slice(&self.key1.to_le_bytes());
        blake3::derive_key(KEY_CONTEXT, &material)
    }
}

/// Derives visitor fingerprints.
///
/// Holds no state besides the derived key and the salt, so it is cheap to
/// share across threads.
#[derive(Clone)]
pub struct Fingerprinter {
    key: [u8; 32],
    salt: String,
    rotate_daily: bool,
}

impl Fingerprinter {
    /// Creates a fingerprinter.
    ///
    /// With `rotate_daily` the calendar day is part of the hash, so a
    /// visitor receives a new fingerprint every day.
    pub fn new(keys: FingerprintKeys, salt: impl Into<String>, rotate_daily: bool) -> Self {
        Self {
            key: keys.derive(),
            salt: salt.into(),
            rotate_daily,
        }
    }

    /// Returns true if the calendar day is part of the fingerprint.
    pub fn rotates_daily(&self) -> bool {
        self.rotate_daily
    }

    /// Computes the fingerprint for a request.
    ///
    /// Missing inputs are passed as empty strings. `extra_salt` is appended
    /// to the global salt and lets callers separate otherwise identical
    /// visitors (e.g. per-site salts).
    pub fn fingerprint(
        &self,
        user_agent: &str,
        client_ip: &str,
        day: NaiveDate,
        extra_salt: &str,
    ) -> Fingerprint {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);

        absorb(&mut hasher, user_agent.as_bytes());
        absorb(&mut hasher, client_ip.as_bytes());

        hasher.update(&((self.salt.len() + extra_salt.len()) as u64).to_le_bytes());
        hasher.update(self.salt.as_bytes());
        hasher.update(extra_salt.as_bytes());

        if self.rotate_daily {
            absorb(&mut hasher, day.format("%Y%m%d").to_string().as_bytes());
        } else {
            absorb(&mut hasher, b"");
        }

        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Fingerprint::new(u64::from_le_bytes(head))
    }
}

impl std::fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // keys and salt stay out of logs
        f.debug_struct("Fingerprinter")
            .field("rotate_daily", &self.rotate_daily)
            .finish_non_exhaustive()
    }
}

fn absorb(hasher: &mut blake3::Hasher, field: &[u8]) {
    hasher.update(&(field.len() as u64).to_le_bytes());
    hasher.update(field);
}
