//! Pure dimension math for derivatives.
//!
//! Everything here is free of I/O so the rounding rules can be pinned down by
//! unit tests without decoding a single pixel.

use crate::types::FitMode;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitError {
    #[error("invalid source dimensions {width}x{height}")]
    InvalidSourceDimensions { width: u32, height: u32 },
}

/// Compute the output dimensions of a derivative.
///
/// # Arguments
/// * `source` - Natural dimensions of the source (width, height)
/// * `requested_w` / `requested_h` - Requested box; either may be absent
/// * `mode` - Policy used when both sides are requested
///
/// # Returns
/// * `(width, height)` - Final derivative dimensions, never zero
///
/// Rounding is half-away-from-zero (`f64::round`). Feeding a result back in
/// as a box returns it unchanged.
///
/// # Examples
/// ```
/// # use derivate::imaging::compute;
/// # use derivate::FitMode;
/// // Width only: height follows the source aspect ratio
/// assert_eq!(compute((100, 88), Some(40), None, FitMode::Clip), Ok((40, 35)));
///
/// // Both sides under Clip: the smaller scale factor wins
/// assert_eq!(compute((100, 88), Some(50), Some(10), FitMode::Clip), Ok((11, 10)));
/// ```
pub fn compute(
    source: (u32, u32),
    requested_w: Option<u32>,
    requested_h: Option<u32>,
    mode: FitMode,
) -> Result<(u32, u32), FitError> {
    let (src_w, src_h) = source;
    if src_w == 0 || src_h == 0 {
        return Err(FitError::InvalidSourceDimensions {
            width: src_w,
            height: src_h,
        });
    }

    let dims = match (requested_w, requested_h) {
        (None, None) => (src_w, src_h),
        (Some(w), None) => (w, scale_edge(w, src_h, src_w)),
        (None, Some(h)) => (scale_edge(h, src_w, src_h), h),
        (Some(w), Some(h)) => match mode {
            // A box that already has the source aspect ratio, up to rounding
            // of the derived side, is used as is. Single-sided requests are
            // stored with both sides, so re-fitting them must not shrink the
            // requested side.
            FitMode::Clip
                if scale_edge(w, src_h, src_w) == h || scale_edge(h, src_w, src_h) == w =>
            {
                (w, h)
            }
            FitMode::Clip => {
                let scale = (w as f64 / src_w as f64).min(h as f64 / src_h as f64);
                (
                    round_edge(src_w as f64 * scale),
                    round_edge(src_h as f64 * scale),
                )
            }
            FitMode::Crop | FitMode::Scale => (w, h),
        },
    };

    Ok((dims.0.max(1), dims.1.max(1)))
}

/// `requested * numerator / denominator`, rounded.
fn scale_edge(requested: u32, numerator: u32, denominator: u32) -> u32 {
    round_edge(requested as f64 * numerator as f64 / denominator as f64)
}

fn round_edge(value: f64) -> u32 {
    value.round().clamp(0.0, u32::MAX as f64) as u32
}
