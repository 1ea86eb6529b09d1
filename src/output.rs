//! CLI output formatting.
//!
//! Each command has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.
//!
//! # Output Format
//!
//! ## Request outcomes (`fetch`, `warm`)
//!
//! ```text
//! 200 /optimized/Zk3v9QmT0b1x….webp
//!     image/webp, 1834 bytes, generated
//!     File: derivatives/9c/9c4e….webp
//! 503 /optimized/Ab01Cd23Ef45….png
//!     Retry-After: 3
//! 404 /optimized/nonsense.png
//! ```
//!
//! Tokens run to several hundred characters, so paths are abbreviated.
//! With `--json`, each outcome is instead one [`OutcomeReport`] object per
//! line, with the full path.
//!
//! ## Assets
//!
//! ```text
//! 001 3f2c9a1e (100x88)
//!     Source: 2024/3f2c9a1e.png
//! ```

use crate::assets::AssetHandle;
use crate::cache::CacheStats;
use crate::coordinator::{CacheStatus, Outcome};
use crate::derivative::GenerationError;
use crate::types::DerivativeArtifact;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Characters of the token kept when abbreviating a request path.
const TOKEN_PREVIEW: usize = 12;

fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Shorten the token segment of `/<prefix>/<token>.<ext>` for display.
fn abbreviate_path(path: &str) -> String {
    let Some((dir, file)) = path.rsplit_once('/') else {
        return path.to_string();
    };
    let (token, ext) = match file.rsplit_once('.') {
        Some((token, ext)) => (token, Some(ext)),
        None => (file, None),
    };
    let short = match token.char_indices().nth(TOKEN_PREVIEW) {
        Some((cut, _)) => format!("{}…", &token[..cut]),
        None => token.to_string(),
    };
    match ext {
        Some(ext) => format!("{dir}/{short}.{ext}"),
        None => format!("{dir}/{short}"),
    }
}

fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

// ============================================================================
// Request outcomes
// ============================================================================

/// Format the result of handling one request path.
pub fn format_outcome(path: &str, result: &Result<Outcome, GenerationError>) -> Vec<String> {
    let shown = abbreviate_path(path);
    match result {
        Ok(Outcome::Served(served)) => {
            let cache = match served.cache {
                CacheStatus::Hit => "cached",
                CacheStatus::Generated => "generated",
            };
            vec![
                format!("200 {shown}"),
                format!(
                    "    {}, {} bytes, {}",
                    served.artifact.mime_type, served.artifact.byte_size, cache
                ),
                format!("    File: {}", served.artifact.uri.display()),
            ]
        }
        Ok(Outcome::Busy { retry_after }) => vec![
            format!("503 {shown}"),
            format!("    Retry-After: {}", retry_after.as_secs()),
        ],
        Ok(Outcome::NotFound) => vec![format!("404 {shown}")],
        Err(e) => vec![format!("500 {shown}"), format!("    Error: {e}")],
    }
}

pub fn print_outcome(path: &str, result: &Result<Outcome, GenerationError>) {
    for line in format_outcome(path, result) {
        println!("{}", line);
    }
}

/// Machine-readable form of a handling result.
#[derive(Debug, Serialize)]
pub struct OutcomeReport<'a> {
    pub path: &'a str,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<&'a DerivativeArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn outcome_report<'a>(
    path: &'a str,
    result: &'a Result<Outcome, GenerationError>,
) -> OutcomeReport<'a> {
    let mut report = OutcomeReport {
        path,
        status: crate::coordinator::response_status(result),
        cache: None,
        artifact: None,
        retry_after_secs: None,
        error: None,
    };
    match result {
        Ok(Outcome::Served(served)) => {
            report.cache = Some(match served.cache {
                CacheStatus::Hit => "hit",
                CacheStatus::Generated => "generated",
            });
            report.artifact = Some(&served.artifact);
        }
        Ok(outcome @ Outcome::Busy { .. }) => {
            report.retry_after_secs = outcome.retry_after().map(|d| d.as_secs());
        }
        Ok(Outcome::NotFound) => {}
        Err(e) => report.error = Some(e.to_string()),
    }
    report
}

pub fn print_outcome_json(
    path: &str,
    result: &Result<Outcome, GenerationError>,
) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(&outcome_report(path, result))?);
    Ok(())
}

/// One-line summary after a batch run.
pub fn format_warm_summary(stats: &CacheStats) -> String {
    format!("Cache: {stats}")
}

// ============================================================================
// Assets
// ============================================================================

/// Format the asset index, with source paths relative to `root`.
pub fn format_assets(assets: &[AssetHandle], root: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, asset) in assets.iter().enumerate() {
        lines.push(format!(
            "{} {} ({}x{})",
            format_index(i + 1),
            asset.uuid,
            asset.width,
            asset.height
        ));
        lines.push(format!("    Source: {}", display_relative(&asset.path, root)));
    }
    lines.push(format!("{} assets", assets.len()));
    lines
}

pub fn print_assets(assets: &[AssetHandle], root: &Path) {
    for line in format_assets(assets, root) {
        println!("{}", line);
    }
}

// ============================================================================
// Keys
// ============================================================================

pub fn format_keygen(written: &[PathBuf], bits: usize) -> Vec<String> {
    let mut lines = vec![format!("Generated {bits}-bit RSA key pair")];
    lines.extend(written.iter().map(|p| format!("    {}", p.display())));
    lines
}

pub fn print_keygen(written: &[PathBuf], bits: usize) {
    for line in format_keygen(written, bits) {
        println!("{}", line);
    }
}
