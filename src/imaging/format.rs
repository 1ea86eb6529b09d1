//! Extension ↔ container format ↔ mime type mapping.
//!
//! | Extension | Format | Mime | Decode | Encode |
//! |---|---|---|---|---|
//! | `jpg`, `jpeg` | JPEG | `image/jpeg` | yes | yes |
//! | `png` | PNG | `image/png` | yes | yes |
//! | `gif` | GIF | `image/gif` | yes | yes |
//! | `webp` | WebP | `image/webp` | yes | lossless only |
//! | `tif`, `tiff` | TIFF | `image/tiff` | yes | yes |
//! | `avif` | AVIF | `image/avif` | no | yes (rav1e) |
//!
//! AVIF can be produced but not read: the `image` crate's `"avif"` feature
//! only enables the rav1e encoder.

use image::ImageFormat;

const FORMATS: &[(&str, ImageFormat, &str)] = &[
    ("jpg", ImageFormat::Jpeg, "image/jpeg"),
    ("jpeg", ImageFormat::Jpeg, "image/jpeg"),
    ("png", ImageFormat::Png, "image/png"),
    ("gif", ImageFormat::Gif, "image/gif"),
    ("webp", ImageFormat::WebP, "image/webp"),
    ("tif", ImageFormat::Tiff, "image/tiff"),
    ("tiff", ImageFormat::Tiff, "image/tiff"),
    ("avif", ImageFormat::Avif, "image/avif"),
];

/// Container format for a (case-insensitive) extension.
pub fn format_for_extension(ext: &str) -> Option<ImageFormat> {
    FORMATS
        .iter()
        .find(|(e, _, _)| e.eq_ignore_ascii_case(ext))
        .map(|(_, fmt, _)| *fmt)
}

/// Mime type served for an extension. Unknown extensions are served as
/// opaque bytes.
pub fn mime_for_extension(ext: &str) -> &'static str {
    FORMATS
        .iter()
        .find(|(e, _, _)| e.eq_ignore_ascii_case(ext))
        .map(|(_, _, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

/// Extensions the codec can write.
pub fn encodable_extensions() -> impl Iterator<Item = &'static str> {
    FORMATS.iter().map(|(e, _, _)| *e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_aliases_share_format() {
        assert_eq!(format_for_extension("jpg"), Some(ImageFormat::Jpeg));
        assert_eq!(format_for_extension("JPEG"), Some(ImageFormat::Jpeg));
    }

    #[test]
    fn unknown_extension_has_no_format() {
        assert_eq!(format_for_extension("bmp"), None);
        assert_eq!(format_for_extension(""), None);
    }

    #[test]
    fn mime_lookup() {
        assert_eq!(mime_for_extension("webp"), "image/webp");
        assert_eq!(mime_for_extension("AVIF"), "image/avif");
        assert_eq!(mime_for_extension("exe"), "application/octet-stream");
    }

    #[test]
    fn every_encodable_extension_has_a_mime() {
        for ext in encodable_extensions() {
            assert_ne!(mime_for_extension(ext), "application/octet-stream", "{ext}");
        }
    }
}
