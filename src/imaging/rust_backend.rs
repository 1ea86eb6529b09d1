//! Pure Rust codec built on the `image` crate.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, TIFF, WebP) | `image::load_from_memory` |
//! | Resize (clip, scale) | `DynamicImage::resize_exact` with `Lanczos3` |
//! | Resize (crop) | `DynamicImage::resize_to_fill` with `Lanczos3` |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` on an RGB8 copy |
//! | Encode → other | `DynamicImage::write_to` |

use super::backend::{CodecError, ImageCodec, RasterImage};
use crate::types::FitMode;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Fixed encoder settings; derivatives are not quality-tuned per request.
const AVIF_SPEED: u8 = 6;
const AVIF_QUALITY: u8 = 80;
const JPEG_QUALITY: u8 = 85;

/// Codec using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustCodec;

impl RustCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCodec for RustCodec {
    fn decode(&self, bytes: &[u8]) -> Result<RasterImage, CodecError> {
        image::load_from_memory(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn resize(&self, image: RasterImage, width: u32, height: u32, mode: FitMode) -> RasterImage {
        if image.width() == width && image.height() == height {
            return image;
        }
        match mode {
            FitMode::Crop => image.resize_to_fill(width, height, FilterType::Lanczos3),
            FitMode::Clip | FitMode::Scale => {
                image.resize_exact(width, height, FilterType::Lanczos3)
            }
        }
    }

    fn encode(&self, image: &RasterImage, format: ImageFormat) -> Result<Vec<u8>, CodecError> {
        let mut out = Cursor::new(Vec::new());
        match format {
            ImageFormat::Avif => {
                let encoder = image::codecs::avif::AvifEncoder::new_with_speed_quality(
                    &mut out,
                    AVIF_SPEED,
                    AVIF_QUALITY,
                );
                image
                    .write_with_encoder(encoder)
                    .map_err(|e| CodecError::Encode(format!("AVIF: {e}")))?;
            }
            ImageFormat::Jpeg => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                let encoder =
                    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
                rgb.write_with_encoder(encoder)
                    .map_err(|e| CodecError::Encode(format!("JPEG: {e}")))?;
            }
            ImageFormat::WebP => {
                // The pure-Rust WebP encoder is lossless and wants 8-bit RGB(A)
                let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
                rgba.write_to(&mut out, ImageFormat::WebP)
                    .map_err(|e| CodecError::Encode(format!("WebP: {e}")))?;
            }
            ImageFormat::Png | ImageFormat::Gif | ImageFormat::Tiff => {
                let normalized = match format {
                    ImageFormat::Gif => DynamicImage::ImageRgba8(image.to_rgba8()),
                    _ => image.clone(),
                };
                normalized
                    .write_to(&mut out, format)
                    .map_err(|e| CodecError::Encode(format!("{format:?}: {e}")))?;
            }
            other => return Err(CodecError::UnsupportedFormat(other)),
        }
        Ok(out.into_inner())
    }
}
