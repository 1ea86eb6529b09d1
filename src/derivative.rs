//! Derivative generation: resize, then optionally convert, then persist.
//!
//! ```text
//! source bytes ─▶ [decode] ─▶ resize? ─▶ encode(target format) ─▶ tmp file ─▶ rename
//!       └──────────── untouched (same format, no resize) ─────────▶ tmp file ─▶ rename
//! ```
//!
//! The generator is stateless; the coordinator decides *whether* to run it.
//! Output goes to a temporary file in the destination directory and is
//! renamed into place only once fully written, so a crash or failed encode
//! never leaves a truncated file where the cache check would find it.

use crate::assets::AssetHandle;
use crate::imaging::{CodecError, FitError, ImageCodec, compute, format_for_extension, mime_for_extension};
use crate::types::{DerivativeArtifact, TransformRequest};
use image::ImageFormat;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("unsupported extension: {0}")]
    UnsupportedExtension(String),
    #[error("source {path} unreadable: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },
    #[error(transparent)]
    InvalidSourceDimensions(#[from] FitError),
    #[error("encoding derivative failed: {0}")]
    EncodeFailed(#[from] CodecError),
    #[error("writing {path} failed: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Produces derivative files using an [`ImageCodec`].
#[derive(Clone)]
pub struct DerivativeGenerator {
    codec: Arc<dyn ImageCodec>,
}

impl DerivativeGenerator {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        Self { codec }
    }

    /// Generate the derivative of `source` described by `transform` at
    /// `destination`.
    ///
    /// The output extension is the requested one, or the source's own.
    pub fn generate(
        &self,
        destination: &Path,
        source: &AssetHandle,
        transform: &TransformRequest,
    ) -> Result<DerivativeArtifact, GenerationError> {
        let started = Instant::now();
        let extension = output_extension(source, transform)?;
        let target_format = format_for_extension(&extension)
            .ok_or_else(|| GenerationError::UnsupportedExtension(extension.clone()))?;

        let bytes = fs::read(&source.path).map_err(|e| GenerationError::SourceUnreadable {
            path: source.path.clone(),
            reason: e.to_string(),
        })?;
        let source_format = image::guess_format(&bytes)
            .ok()
            .or_else(|| source_extension(&source.path).and_then(format_for_extension))
            .ok_or_else(|| GenerationError::SourceUnreadable {
                path: source.path.clone(),
                reason: "unrecognized container format".into(),
            })?;

        let output = if !transform.resizes() && source_format == target_format {
            debug!(source = %source.path.display(), "derivative is a verbatim copy");
            bytes
        } else {
            self.transcode(&bytes, source, transform, target_format)?
        };

        let byte_size = write_atomically(destination, &output)?;
        info!(
            destination = %destination.display(),
            bytes = byte_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generated derivative"
        );

        Ok(DerivativeArtifact {
            uri: destination.to_path_buf(),
            mime_type: mime_for_extension(&extension),
            byte_size,
        })
    }

    fn transcode(
        &self,
        bytes: &[u8],
        source: &AssetHandle,
        transform: &TransformRequest,
        target_format: ImageFormat,
    ) -> Result<Vec<u8>, GenerationError> {
        let mut raster = self
            .codec
            .decode(bytes)
            .map_err(|e| GenerationError::SourceUnreadable {
                path: source.path.clone(),
                reason: e.to_string(),
            })?;

        if transform.resizes() {
            let (width, height) = compute(
                (raster.width(), raster.height()),
                transform.target_width,
                transform.target_height,
                transform.fit_mode,
            )?;
            debug!(
                from = %format!("{}x{}", raster.width(), raster.height()),
                to = %format!("{width}x{height}"),
                fit = %transform.fit_mode,
                "resizing"
            );
            raster = self.codec.resize(raster, width, height, transform.fit_mode);
        }

        Ok(self.codec.encode(&raster, target_format)?)
    }
}

fn output_extension(
    source: &AssetHandle,
    transform: &TransformRequest,
) -> Result<String, GenerationError> {
    match &transform.output_extension {
        Some(ext) => Ok(ext.to_ascii_lowercase()),
        None => source_extension(&source.path)
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| GenerationError::UnsupportedExtension(String::new())),
    }
}

fn source_extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

/// Write via a sibling temp file and rename over `destination`.
fn write_atomically(destination: &Path, contents: &[u8]) -> Result<u64, GenerationError> {
    let write_failed = |source: std::io::Error| GenerationError::WriteFailed {
        path: destination.to_path_buf(),
        source,
    };
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(write_failed)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_failed)?;
    tmp.write_all(contents).map_err(write_failed)?;
    tmp.as_file().sync_all().map_err(write_failed)?;
    tmp.persist(destination).map_err(|e| write_failed(e.error))?;
    Ok(contents.len() as u64)
}
