//! Shared test utilities for the derivate test suite.
//!
//! Key fixtures live in `fixtures/keys/` and are parsed once per test
//! binary. Source images are synthesized on demand rather than checked in.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let src = asset(&tmp, "3f2c9a1e", "png", 100, 88);
//! let token = encode_token(&payload, fixture_keys()).unwrap();
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::TempDir;

use crate::assets::AssetHandle;
use crate::keys::KeyPair;

// =========================================================================
// Fixtures
// =========================================================================

/// Absolute path of a file under `fixtures/`.
pub fn fixture_path(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(rel)
}

/// The fixture key pair (`fixtures/keys/{public,private}.pem`).
pub fn fixture_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| {
        KeyPair::load(
            Some(fixture_path("keys/public.pem").as_path()),
            Some(fixture_path("keys/private.pem").as_path()),
        )
        .unwrap()
    })
}

/// An unrelated private key, for wrong-key scenarios.
pub fn other_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| {
        KeyPair::load(None, Some(fixture_path("keys/other_private.pem").as_path())).unwrap()
    })
}

// =========================================================================
// Images
// =========================================================================

/// Write a `width`×`height` PNG gradient, creating parent directories.
pub fn write_png(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    img.save_with_format(path, image::ImageFormat::Png).unwrap();
}

/// Create `<tmp>/assets/<uuid>.<ext>` (always PNG-encoded) and return its
/// handle.
pub fn asset(tmp: &TempDir, uuid: &str, ext: &str, width: u32, height: u32) -> AssetHandle {
    let path = tmp.path().join("assets").join(format!("{uuid}.{ext}"));
    write_png(&path, width, height);
    AssetHandle {
        uuid: uuid.to_string(),
        path,
        width,
        height,
    }
}
