//! # footfall-crypto: Visitor fingerprinting for `Footfall`
//!
//! Visitors are never identified by cookies or stored PII. Instead every
//! request is reduced to a [`Fingerprint`]: a keyed BLAKE3 hash over the
//! user agent, the resolved client IP, a salt and (optionally) the calendar
//! day. The same inputs always produce the same fingerprint inside one
//! rotation window; different inputs collide only with negligible
//! probability.
//!
//! # Example
//!
//! ```
//! use chrono::NaiveDate;
//! use footfall_crypto::{FingerprintKeys, Fingerprinter};
//!
//! let fp = Fingerprinter::new(FingerprintKeys::new(1, 2), "salt", true);
//! let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
//!
//! let a = fp.fingerprint("Mozilla/5.0", "203.0.113.7", day, "");
//! let b = fp.fingerprint("Mozilla/5.0", "203.0.113.7", day, "");
//! assert_eq!(a, b);
//! ```

mod fingerprint;

pub use fingerprint::{FingerprintKeys, Fingerprinter};
pub use footfall_types::Fingerprint;
