//! Derivative cache layout and lock keys.
//!
//! # Design
//!
//! The cache is the derivatives directory itself: a derivative exists if and
//! only if its file exists. There is no manifest to keep in sync, so a
//! retention job may delete any file at any time and the next request simply
//! regenerates it.
//!
//! ## Cache keys
//!
//! Tokens are randomized ciphertext, so two URLs for the same transform
//! differ byte-for-byte. The cache is therefore **content-addressed** on the
//! decrypted, canonical plaintext ([`TokenPayload::to_query`]) rather than
//! on the token:
//!
//! ```text
//! sha256("uuid=…&fit=clip&width=40&height=35&extension=webp")
//!   = 9c4e…
//! derivatives/9c/9c4e….webp
//! ```
//!
//! The two-character fan-out directory keeps any single directory small.
//!
//! ## Lock keys
//!
//! The generation lock for a derivative is keyed by the SHA-256 of its
//! destination path, which makes the key filename-safe for the lock-file
//! backend and scopes contention to exactly one derivative.

use crate::token::TokenPayload;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// SHA-256 of the canonical plaintext, as hex.
pub fn cache_key(payload: &TokenPayload) -> String {
    format!("{:x}", Sha256::digest(payload.to_query().as_bytes()))
}

/// Where the derivative for `payload` lives.
pub fn destination_path(derivatives_dir: &Path, payload: &TokenPayload, extension: &str) -> PathBuf {
    let key = cache_key(payload);
    derivatives_dir
        .join(&key[..2])
        .join(format!("{key}.{extension}"))
}

/// Lock key for a destination path.
pub fn lock_key(destination: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(destination.as_os_str().as_encoded_bytes());
    format!("{:x}", hasher.finalize())
}

/// Summary of request outcomes for a batch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u32,
    pub generated: u32,
    pub busy: u32,
    pub not_found: u32,
    pub failed: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn generate(&mut self) {
        self.generated += 1;
    }

    pub fn busy(&mut self) {
        self.busy += 1;
    }

    pub fn not_found(&mut self) {
        self.not_found += 1;
    }

    pub fn fail(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> u32 {
        self.hits + self.generated + self.busy + self.not_found + self.failed
    }

    /// Combine two partial tallies (used when folding parallel results).
    pub fn merge(self, other: Self) -> Self {
        Self {
            hits: self.hits + other.hits,
            generated: self.generated + other.generated,
            busy: self.busy + other.busy,
            not_found: self.not_found + other.not_found,
            failed: self.failed + other.failed,
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cached, {} generated",
            self.hits, self.generated
        )?;
        if self.busy > 0 {
            write!(f, ", {} busy", self.busy)?;
        }
        if self.not_found > 0 {
            write!(f, ", {} not found", self.not_found)?;
        }
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        write!(f, " ({} total)", self.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FitMode, TransformRequest};

    fn payload(width: Option<u32>) -> TokenPayload {
        TokenPayload {
            uuid: "abc".into(),
            transform: TransformRequest {
                target_width: width,
                target_height: None,
                fit_mode: FitMode::Clip,
                output_extension: None,
            },
        }
    }

    // =========================================================================
    // Keys and paths
    // =========================================================================

    #[test]
    fn cache_key_deterministic() {
        assert_eq!(cache_key(&payload(Some(40))), cache_key(&payload(Some(40))));
        assert_eq!(cache_key(&payload(Some(40))).len(), 64);
    }

    #[test]
    fn cache_key_varies_with_transform() {
        assert_ne!(cache_key(&payload(Some(40))), cache_key(&payload(Some(41))));
        assert_ne!(cache_key(&payload(Some(40))), cache_key(&payload(None)));
    }

    #[test]
    fn destination_fans_out_by_key_prefix() {
        let p = payload(Some(40));
        let key = cache_key(&p);
        let dest = destination_path(Path::new("/var/derivatives"), &p, "webp");
        assert_eq!(
            dest,
            Path::new("/var/derivatives")
                .join(&key[..2])
                .join(format!("{key}.webp"))
        );
    }

    #[test]
    fn lock_key_is_hex_and_path_specific() {
        let a = lock_key(Path::new("/d/aa/x.png"));
        let b = lock_key(Path::new("/d/aa/y.png"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display_plain() {
        let s = CacheStats {
            hits: 5,
            generated: 2,
            ..Default::default()
        };
        assert_eq!(format!("{}", s), "5 cached, 2 generated (7 total)");
    }

    #[test]
    fn cache_stats_display_with_problems() {
        let s = CacheStats {
            hits: 1,
            generated: 1,
            busy: 2,
            not_found: 3,
            failed: 1,
        };
        assert_eq!(
            format!("{}", s),
            "1 cached, 1 generated, 2 busy, 3 not found, 1 failed (8 total)"
        );
    }

    #[test]
    fn cache_stats_merge_adds_fields() {
        let mut a = CacheStats::default();
        a.hit();
        a.busy();
        let mut b = CacheStats::default();
        b.generate();
        b.fail();
        b.not_found();
        let m = a.merge(b);
        assert_eq!(m.total(), 5);
        assert_eq!((m.hits, m.generated, m.busy, m.not_found, m.failed), (1, 1, 1, 1, 1));
    }
}
