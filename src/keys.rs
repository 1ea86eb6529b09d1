//! RSA key material for the token codec.
//!
//! The URL generator only ever needs the public half, so it can run on a
//! render host that never sees the private key. The coordinator needs both.
//! Keys are injected through the [`KeyProvider`] trait rather than looked up
//! globally; [`KeyPair`] is the stock implementation, loaded from PEM files.
//!
//! Accepted encodings:
//! - public: SPKI PEM (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`)
//! - private: PKCS#8 PEM (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`)
//!
//! Loading failures are configuration errors and surface at construction,
//! never per request.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File names written by [`KeyPair::write_pem`].
pub const PUBLIC_KEY_FILENAME: &str = "public.pem";
pub const PRIVATE_KEY_FILENAME: &str = "private.pem";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("cannot read key file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write key file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid {kind} key in {origin}: {reason}")]
    Invalid {
        kind: &'static str,
        origin: String,
        reason: String,
    },
    #[error("private key does not match public key")]
    Mismatch,
    #[error("key generation failed: {0}")]
    Generate(#[from] rsa::Error),
}

/// Supplies key material to the URL generator and the coordinator.
pub trait KeyProvider: Send + Sync {
    fn public_key(&self) -> &RsaPublicKey;

    /// `None` on hosts that only generate URLs.
    fn private_key(&self) -> Option<&RsaPrivateKey>;
}

/// An RSA public key with an optional matching private key.
#[derive(Debug, Clone)]
pub struct KeyPair {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl KeyPair {
    /// Public-only pair, for URL generation.
    pub fn public_only(public: RsaPublicKey) -> Self {
        Self {
            public,
            private: None,
        }
    }

    /// Full pair; the public key is derived from the private key.
    pub fn from_private(private: RsaPrivateKey) -> Self {
        Self {
            public: RsaPublicKey::from(&private),
            private: Some(private),
        }
    }

    /// Generate a fresh pair. 2048 bits is the smallest size whose OAEP
    /// capacity comfortably fits a token plaintext.
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)?;
        Ok(Self::from_private(private))
    }

    /// Parse PEM text. When both halves are present they must match.
    pub fn from_pem(public_pem: Option<&str>, private_pem: Option<&str>) -> Result<Self, KeyError> {
        let private = private_pem
            .map(|pem| parse_private_pem(pem, "<memory>"))
            .transpose()?;
        let public = public_pem
            .map(|pem| parse_public_pem(pem, "<memory>"))
            .transpose()?;
        Self::assemble(public, private)
    }

    /// Load from PEM files. Either path may be absent, but not both.
    pub fn load(public_path: Option<&Path>, private_path: Option<&Path>) -> Result<Self, KeyError> {
        let private = private_path
            .map(|path| {
                let pem = read_key_file(path)?;
                parse_private_pem(&pem, &path.display().to_string())
            })
            .transpose()?;
        let public = public_path
            .map(|path| {
                let pem = read_key_file(path)?;
                parse_public_pem(&pem, &path.display().to_string())
            })
            .transpose()?;
        let pair = Self::assemble(public, private)?;
        debug!(
            public = ?public_path,
            private = ?private_path,
            "loaded key material"
        );
        Ok(pair)
    }

    fn assemble(
        public: Option<RsaPublicKey>,
        private: Option<RsaPrivateKey>,
    ) -> Result<Self, KeyError> {
        match (public, private) {
            (Some(public), Some(private)) => {
                if RsaPublicKey::from(&private) != public {
                    return Err(KeyError::Mismatch);
                }
                Ok(Self {
                    public,
                    private: Some(private),
                })
            }
            (Some(public), None) => Ok(Self::public_only(public)),
            (None, Some(private)) => Ok(Self::from_private(private)),
            (None, None) => Err(KeyError::Invalid {
                kind: "public",
                origin: "configuration".into(),
                reason: "no key configured".into(),
            }),
        }
    }

    /// Write `public.pem` (SPKI) and, if present, `private.pem` (PKCS#8)
    /// into `dir`, creating it if needed. Returns the written paths.
    pub fn write_pem(&self, dir: &Path) -> Result<Vec<PathBuf>, KeyError> {
        fs::create_dir_all(dir).map_err(|source| KeyError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut written = Vec::new();

        let public_pem = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Invalid {
                kind: "public",
                origin: "encoder".into(),
                reason: e.to_string(),
            })?;
        let public_path = dir.join(PUBLIC_KEY_FILENAME);
        write_key_file(&public_path, public_pem.as_bytes())?;
        written.push(public_path);

        if let Some(private) = &self.private {
            let private_pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| KeyError::Invalid {
                    kind: "private",
                    origin: "encoder".into(),
                    reason: e.to_string(),
                })?;
            let private_path = dir.join(PRIVATE_KEY_FILENAME);
            write_key_file(&private_path, private_pem.as_bytes())?;
            written.push(private_path);
        }

        Ok(written)
    }
}

impl KeyProvider for KeyPair {
    fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.private.as_ref()
    }
}

fn read_key_file(path: &Path) -> Result<String, KeyError> {
    fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write_key_file(path: &Path, contents: &[u8]) -> Result<(), KeyError> {
    fs::write(path, contents).map_err(|source| KeyError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_public_pem(pem: &str, origin: &str) -> Result<RsaPublicKey, KeyError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|spki_err| {
            RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| spki_err.to_string())
        })
        .map_err(|reason| KeyError::Invalid {
            kind: "public",
            origin: origin.to_string(),
            reason,
        })
}

fn parse_private_pem(pem: &str, origin: &str) -> Result<RsaPrivateKey, KeyError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|pkcs8_err| {
            RsaPrivateKey::from_pkcs1_pem(pem).map_err(|_| pkcs8_err.to_string())
        })
        .map_err(|reason| KeyError::Invalid {
            kind: "private",
            origin: origin.to_string(),
            reason,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{fixture_keys, fixture_path};
    use tempfile::TempDir;

    #[test]
    fn load_full_pair_from_fixtures() {
        let pair = KeyPair::load(
            Some(fixture_path("keys/public.pem").as_path()),
            Some(fixture_path("keys/private.pem").as_path()),
        )
        .unwrap();
        assert!(pair.private_key().is_some());
    }

    #[test]
    fn load_public_only() {
        let pair = KeyPair::load(Some(fixture_path("keys/public.pem").as_path()), None).unwrap();
        assert!(pair.private_key().is_none());
        assert_eq!(pair.public_key(), fixture_keys().public_key());
    }

    #[test]
    fn load_private_only_derives_public() {
        let pair = KeyPair::load(None, Some(fixture_path("keys/private.pem").as_path())).unwrap();
        assert_eq!(pair.public_key(), fixture_keys().public_key());
    }

    #[test]
    fn mismatched_halves_are_rejected() {
        let err = KeyPair::load(
            Some(fixture_path("keys/public.pem").as_path()),
            Some(fixture_path("keys/other_private.pem").as_path()),
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::Mismatch));
    }

    #[test]
    fn missing_file_is_read_error() {
        let tmp = TempDir::new().unwrap();
        let err = KeyPair::load(Some(&tmp.path().join("nope.pem")), None).unwrap_err();
        assert!(matches!(err, KeyError::Read { .. }));
    }

    #[test]
    fn garbage_pem_is_invalid() {
        let err = KeyPair::from_pem(Some("-----BEGIN PUBLIC KEY-----\nzz\n"), None).unwrap_err();
        assert!(matches!(err, KeyError::Invalid { kind: "public", .. }));
    }

    #[test]
    fn no_keys_is_an_error() {
        assert!(KeyPair::from_pem(None, None).is_err());
    }

    #[test]
    fn write_pem_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let written = fixture_keys().write_pem(tmp.path()).unwrap();
        assert_eq!(written.len(), 2);

        let reloaded = KeyPair::load(
            Some(&tmp.path().join(PUBLIC_KEY_FILENAME)),
            Some(&tmp.path().join(PRIVATE_KEY_FILENAME)),
        )
        .unwrap();
        assert_eq!(reloaded.public_key(), fixture_keys().public_key());
    }

    #[test]
    fn public_only_pair_writes_one_file() {
        let tmp = TempDir::new().unwrap();
        let public = KeyPair::public_only(fixture_keys().public_key().clone());
        let written = public.write_pem(tmp.path()).unwrap();
        assert_eq!(written, vec![tmp.path().join(PUBLIC_KEY_FILENAME)]);
    }
}
