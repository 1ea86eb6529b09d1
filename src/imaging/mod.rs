//! Image processing in pure Rust, no system libraries.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Fit math** | [`compute`] |
//! | **Decode** | `image::load_from_memory` |
//! | **Resize** | Lanczos3 (`resize_exact` / `resize_to_fill`) |
//! | **Encode** | `image` encoders, rav1e for AVIF |
//!
//! The module is split into:
//! - **Fit**: Pure functions for dimension math (unit testable)
//! - **Format**: Extension, container format, and mime tables
//! - **Backend**: [`ImageCodec`] trait + [`RustCodec`]

pub mod backend;
mod fit;
pub mod format;
pub mod rust_backend;

pub use backend::{CodecError, ImageCodec, RasterImage};
pub use fit::{FitError, compute};
pub use format::{format_for_extension, mime_for_extension};
pub use rust_backend::RustCodec;
