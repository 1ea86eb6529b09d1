//! URL token codec.
//!
//! A token is a transform request plus the source asset reference, encoded
//! as a flat query string, encrypted with RSA-OAEP (SHA-256) under the
//! service's public key, and carried in a URL as unpadded base64url:
//!
//! ```text
//! uuid=3f2c…&fit=clip&width=40&height=35&extension=webp
//!   └─ RSA-OAEP(SHA-256, public key) ─ base64url ─▶ /optimized/<token>.webp
//! ```
//!
//! ## Plaintext format
//!
//! The query string is deliberately a loose key/value map rather than a
//! fixed binary layout: it stays readable when debugging, and tokens minted
//! by a newer deployment still decode on an older one. Unknown keys are
//! ignored; when a key repeats, the first occurrence wins. `fit` defaults to
//! `clip` when absent. The serializer emits keys in a fixed order so the
//! plaintext for a given request is byte-for-byte deterministic.
//!
//! ## Encryption
//!
//! OAEP is randomized: encrypting the same plaintext twice yields different
//! tokens. Cache stability therefore keys on the decrypted plaintext
//! ([`TokenPayload::to_query`]), not on token bytes. Decryption is blinded,
//! so its timing does not depend on the private exponent.

use crate::keys::KeyProvider;
use crate::types::{FitMode, TransformRequest};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

const KEY_UUID: &str = "uuid";
const KEY_FIT: &str = "fit";
const KEY_WIDTH: &str = "width";
const KEY_HEIGHT: &str = "height";
const KEY_EXTENSION: &str = "extension";

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("token plaintext is too long for the key ({len} bytes)")]
    PlaintextTooLong { len: usize },
    #[error("encryption failed: {0}")]
    Rsa(rsa::Error),
}

/// Why a token was rejected. Callers map every variant to "not found"; the
/// detail is for logs only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("private key unavailable")]
    KeyUnavailable,
}

/// Decrypted token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPayload {
    /// Source asset identifier.
    pub uuid: String,
    pub transform: TransformRequest,
}

impl TokenPayload {
    /// Serialize as the canonical query string.
    pub fn to_query(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair(KEY_UUID, &self.uuid);
        query.append_pair(KEY_FIT, self.transform.fit_mode.as_str());
        if let Some(width) = self.transform.target_width {
            query.append_pair(KEY_WIDTH, &width.to_string());
        }
        if let Some(height) = self.transform.target_height {
            query.append_pair(KEY_HEIGHT, &height.to_string());
        }
        if let Some(ext) = &self.transform.output_extension {
            query.append_pair(KEY_EXTENSION, &ext.to_ascii_lowercase());
        }
        query.finish()
    }

    /// Parse a query string, ignoring keys this version does not know.
    pub fn from_query(query: &[u8]) -> Result<Self, DecryptError> {
        let mut uuid = None;
        let mut fit = None;
        let mut width = None;
        let mut height = None;
        let mut extension = None;

        for (key, value) in url::form_urlencoded::parse(query) {
            let slot = match key.as_ref() {
                KEY_UUID => &mut uuid,
                KEY_FIT => &mut fit,
                KEY_WIDTH => &mut width,
                KEY_HEIGHT => &mut height,
                KEY_EXTENSION => &mut extension,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        let uuid = uuid
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DecryptError::Malformed("missing uuid".into()))?;
        let fit_mode = match fit {
            Some(name) => name
                .parse::<FitMode>()
                .map_err(|e| DecryptError::Malformed(e.to_string()))?,
            None => FitMode::default(),
        };
        let output_extension = match extension {
            Some(ext) if ext.is_empty() || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) => {
                return Err(DecryptError::Malformed(format!("bad extension {ext:?}")));
            }
            other => other.map(|ext| ext.to_ascii_lowercase()),
        };

        Ok(Self {
            uuid,
            transform: TransformRequest {
                target_width: parse_dimension(KEY_WIDTH, width)?,
                target_height: parse_dimension(KEY_HEIGHT, height)?,
                fit_mode,
                output_extension,
            },
        })
    }
}

fn parse_dimension(key: &str, value: Option<String>) -> Result<Option<u32>, DecryptError> {
    match value {
        None => Ok(None),
        Some(raw) => match raw.parse::<u32>() {
            Ok(0) | Err(_) => Err(DecryptError::Malformed(format!("bad {key} {raw:?}"))),
            Ok(n) => Ok(Some(n)),
        },
    }
}

/// Encrypt a plaintext under the public key. The output is raw ciphertext;
/// see [`encode_token`] for the URL-safe form.
pub fn encrypt(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, EncryptError> {
    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| match e {
            rsa::Error::MessageTooLong => EncryptError::PlaintextTooLong {
                len: plaintext.len(),
            },
            other => EncryptError::Rsa(other),
        })
}

/// Decrypt a base64url token (as found in the URL path) to its plaintext.
pub fn decrypt(token: &[u8], keys: &dyn KeyProvider) -> Result<Vec<u8>, DecryptError> {
    let private_key = keys.private_key().ok_or(DecryptError::KeyUnavailable)?;
    let ciphertext = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| DecryptError::Malformed(format!("base64: {e}")))?;
    let mut rng = rand::thread_rng();
    private_key
        .decrypt_blinded(&mut rng, Oaep::new::<Sha256>(), &ciphertext)
        .map_err(|_| DecryptError::Malformed("decryption failed".into()))
}

/// Serialize, encrypt, and base64url-encode a payload.
pub fn encode_token(payload: &TokenPayload, keys: &dyn KeyProvider) -> Result<String, EncryptError> {
    let ciphertext = encrypt(payload.to_query().as_bytes(), keys.public_key())?;
    Ok(URL_SAFE_NO_PAD.encode(ciphertext))
}

/// Inverse of [`encode_token`].
pub fn decode_token(token: &str, keys: &dyn KeyProvider) -> Result<TokenPayload, DecryptError> {
    let plaintext = decrypt(token.as_bytes(), keys)?;
    TokenPayload::from_query(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::test_helpers::{fixture_keys, other_keys};

    fn payload(transform: TransformRequest) -> TokenPayload {
        TokenPayload {
            uuid: "3f2c9a1e-0000-4000-8000-000000000001".into(),
            transform,
        }
    }

    // =========================================================================
    // Plaintext format
    // =========================================================================

    #[test]
    fn query_has_fixed_key_order() {
        let p = payload(TransformRequest {
            target_width: Some(40),
            target_height: Some(35),
            fit_mode: FitMode::Clip,
            output_extension: Some("WEBP".into()),
        });
        assert_eq!(
            p.to_query(),
            "uuid=3f2c9a1e-0000-4000-8000-000000000001&fit=clip&width=40&height=35&extension=webp"
        );
    }

    #[test]
    fn query_omits_absent_fields() {
        let p = payload(TransformRequest::default());
        assert_eq!(p.to_query(), "uuid=3f2c9a1e-0000-4000-8000-000000000001&fit=clip");
    }

    #[test]
    fn parse_is_order_independent() {
        let parsed =
            TokenPayload::from_query(b"height=10&extension=png&uuid=abc&width=5&fit=crop").unwrap();
        assert_eq!(parsed.uuid, "abc");
        assert_eq!(parsed.transform.target_width, Some(5));
        assert_eq!(parsed.transform.target_height, Some(10));
        assert_eq!(parsed.transform.fit_mode, FitMode::Crop);
        assert_eq!(parsed.transform.output_extension.as_deref(), Some("png"));
    }

    #[test]
    fn parse_ignores_unknown_keys() {
        let parsed = TokenPayload::from_query(b"uuid=abc&fit=clip&quality=80&v=2").unwrap();
        assert_eq!(parsed, payload_with_uuid("abc"));
    }

    #[test]
    fn parse_defaults_fit_to_clip() {
        let parsed = TokenPayload::from_query(b"uuid=abc").unwrap();
        assert_eq!(parsed.transform.fit_mode, FitMode::Clip);
    }

    #[test]
    fn parse_first_duplicate_wins() {
        let parsed = TokenPayload::from_query(b"uuid=first&uuid=second").unwrap();
        assert_eq!(parsed.uuid, "first");
    }

    #[test]
    fn parse_decodes_percent_escapes() {
        let p = TokenPayload {
            uuid: "a b&c=d".into(),
            transform: TransformRequest::default(),
        };
        assert_eq!(TokenPayload::from_query(p.to_query().as_bytes()).unwrap(), p);
    }

    #[test]
    fn parse_rejects_bad_values() {
        for bad in [
            &b"fit=clip"[..],
            b"uuid=",
            b"uuid=a&width=abc",
            b"uuid=a&height=-3",
            b"uuid=a&width=0",
            b"uuid=a&fit=stretch",
            b"uuid=a&extension=",
            b"uuid=a&extension=..%2Fetc",
        ] {
            assert!(
                matches!(TokenPayload::from_query(bad), Err(DecryptError::Malformed(_))),
                "{}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    fn payload_with_uuid(uuid: &str) -> TokenPayload {
        TokenPayload {
            uuid: uuid.into(),
            transform: TransformRequest::default(),
        }
    }

    // =========================================================================
    // Encryption
    // =========================================================================

    #[test]
    fn token_roundtrip() {
        let keys = fixture_keys();
        for transform in [
            TransformRequest::default(),
            TransformRequest {
                target_width: Some(40),
                target_height: None,
                fit_mode: FitMode::Clip,
                output_extension: None,
            },
            TransformRequest {
                target_width: Some(640),
                target_height: Some(480),
                fit_mode: FitMode::Crop,
                output_extension: Some("avif".into()),
            },
        ] {
            let p = payload(transform);
            let token = encode_token(&p, keys).unwrap();
            assert_eq!(decode_token(&token, keys).unwrap(), p);
        }
    }

    #[test]
    fn token_is_url_safe() {
        let token = encode_token(&payload(TransformRequest::default()), fixture_keys()).unwrap();
        assert!(
            token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        );
    }

    #[test]
    fn encryption_is_randomized() {
        let p = payload(TransformRequest::default());
        let a = encode_token(&p, fixture_keys()).unwrap();
        let b = encode_token(&p, fixture_keys()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_token_is_malformed() {
        let keys = fixture_keys();
        let token = encode_token(&payload(TransformRequest::default()), keys).unwrap();
        let mut bytes = token.into_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] = if bytes[mid] == b'A' { b'B' } else { b'A' };
        assert!(matches!(
            decrypt(&bytes, keys),
            Err(DecryptError::Malformed(_))
        ));
    }

    #[test]
    fn non_base64_is_malformed() {
        assert!(matches!(
            decrypt(b"not*base64!", fixture_keys()),
            Err(DecryptError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_key_is_malformed() {
        let token = encode_token(&payload(TransformRequest::default()), fixture_keys()).unwrap();
        assert!(matches!(
            decode_token(&token, other_keys()),
            Err(DecryptError::Malformed(_))
        ));
    }

    #[test]
    fn public_only_provider_cannot_decrypt() {
        let public = KeyPair::public_only(fixture_keys().public_key().clone());
        let token = encode_token(&payload(TransformRequest::default()), &public).unwrap();
        assert_eq!(
            decode_token(&token, &public),
            Err(DecryptError::KeyUnavailable)
        );
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let p = TokenPayload {
            uuid: "x".repeat(400),
            transform: TransformRequest::default(),
        };
        assert!(matches!(
            encode_token(&p, fixture_keys()),
            Err(EncryptError::PlaintextTooLong { .. })
        ));
    }
}
