//! Render-time URL generation.
//!
//! Produces paths of the form `/<prefix>/<token>.<extension>`. The outward
//! extension only helps routing and content sniffing; the coordinator trusts
//! the extension inside the token and rejects paths where the two disagree.

use crate::imaging::{FitError, compute, format_for_extension};
use crate::keys::KeyProvider;
use crate::token::{EncryptError, TokenPayload, encode_token};
use crate::types::{FitMode, ImageDescriptor, TransformRequest};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum UrlError {
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Encrypt(#[from] EncryptError),
    #[error("source {0} has no extension and none was requested")]
    NoExtension(String),
    #[error("cannot produce .{0} derivatives")]
    UnsupportedExtension(String),
}

/// Builds token-bearing derivative URLs. Needs only the public key.
pub struct UrlGenerator {
    prefix: String,
    keys: Arc<dyn KeyProvider>,
}

impl UrlGenerator {
    /// `prefix` is the mount point without slashes, e.g. `"optimized"`.
    pub fn new(prefix: impl Into<String>, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
            keys,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the URL path for a derivative of `source`.
    ///
    /// When a width and/or height is requested, the final dimensions are
    /// computed here and both are embedded, so the token fully describes the
    /// output. With neither requested, no dimensions are embedded and the
    /// derivative keeps the source size.
    pub fn generate(
        &self,
        uuid: &str,
        source: &ImageDescriptor,
        requested_w: Option<u32>,
        requested_h: Option<u32>,
        requested_extension: Option<&str>,
        fit_mode: FitMode,
    ) -> Result<String, UrlError> {
        let (target_width, target_height) = if requested_w.is_some() || requested_h.is_some() {
            let (w, h) = compute(
                (source.width, source.height),
                requested_w,
                requested_h,
                fit_mode,
            )?;
            (Some(w), Some(h))
        } else {
            (None, None)
        };

        let output_extension = requested_extension.map(str::to_ascii_lowercase);
        let effective_extension = match &output_extension {
            Some(ext) => ext.clone(),
            None => source
                .extension()
                .ok_or_else(|| UrlError::NoExtension(source.source_identifier.clone()))?,
        };
        if format_for_extension(&effective_extension).is_none() {
            return Err(UrlError::UnsupportedExtension(effective_extension));
        }

        let payload = TokenPayload {
            uuid: uuid.to_string(),
            transform: TransformRequest {
                target_width,
                target_height,
                fit_mode,
                output_extension,
            },
        };
        let token = encode_token(&payload, self.keys.as_ref())?;
        debug!(uuid, plaintext = %payload.to_query(), "generated derivative url");

        Ok(format!("/{}/{}.{}", self.prefix, token, effective_extension))
    }
}
