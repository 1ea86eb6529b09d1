//! Shared types passed between the URL generator, token codec, derivative
//! generator, and coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// How an image is scaled to satisfy width/height constraints.
///
/// When only one side is requested every mode derives the other from the
/// source aspect ratio. The modes differ only when both sides are given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Preserve aspect ratio, fit entirely inside the box.
    #[default]
    Clip,
    /// Preserve aspect ratio, cover the box, then centre-crop to it.
    Crop,
    /// Stretch to exactly the box.
    Scale,
}

impl FitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FitMode::Clip => "clip",
            FitMode::Crop => "crop",
            FitMode::Scale => "scale",
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown fit mode: {0}")]
pub struct UnknownFitMode(pub String);

impl FromStr for FitMode {
    type Err = UnknownFitMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clip" => Ok(FitMode::Clip),
            "crop" => Ok(FitMode::Crop),
            "scale" => Ok(FitMode::Scale),
            other => Err(UnknownFitMode(other.to_string())),
        }
    }
}

/// The original asset as the asset store describes it. Never mutated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    /// File name or URI of the source; its extension is the source format.
    pub source_identifier: String,
}

impl ImageDescriptor {
    /// Lower-cased extension of the source identifier, if it has one.
    pub fn extension(&self) -> Option<String> {
        let name = self.source_identifier.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// What to do to a source image. An empty request is the identity transform.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransformRequest {
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub fit_mode: FitMode,
    pub output_extension: Option<String>,
}

impl TransformRequest {
    pub fn resizes(&self) -> bool {
        self.target_width.is_some() || self.target_height.is_some()
    }

    pub fn is_identity(&self) -> bool {
        !self.resizes() && self.output_extension.is_none()
    }
}

/// A generated derivative on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivativeArtifact {
    pub uri: PathBuf,
    pub mime_type: &'static str,
    pub byte_size: u64,
}
