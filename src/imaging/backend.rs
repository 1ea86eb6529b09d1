//! Image codec trait and shared types.
//!
//! The [`ImageCodec`] trait defines the three pixel operations the
//! derivative generator needs: decode, resize, and encode. The production
//! implementation is [`RustCodec`](super::rust_backend::RustCodec), built on
//! the `image` crate.

use crate::types::FitMode;
use image::{DynamicImage, ImageFormat};
use thiserror::Error;

/// Decoded pixels. Backends exchange the `image` crate's dynamic image.
pub type RasterImage = DynamicImage;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("unsupported output format: {0:?}")]
    UnsupportedFormat(ImageFormat),
}

/// Trait for pixel backends.
///
/// Implementations must be shareable across request threads.
pub trait ImageCodec: Send + Sync {
    /// Decode a complete encoded image.
    fn decode(&self, bytes: &[u8]) -> Result<RasterImage, CodecError>;

    /// Resample to exactly `width`x`height`.
    ///
    /// `mode` selects the resampling shape: [`FitMode::Crop`] fills then
    /// centre-crops, the other modes resize the full frame.
    fn resize(&self, image: RasterImage, width: u32, height: u32, mode: FitMode) -> RasterImage;

    /// Encode into the given container format.
    fn encode(&self, image: &RasterImage, format: ImageFormat) -> Result<Vec<u8>, CodecError>;
}
