//! Request handling: token → asset → cache check → single-flight generation.
//!
//! ```text
//! Received ─▶ TokenDecoded ─▶ AssetResolved ─┬─▶ CacheHit ───────────────┬─▶ Served
//!    │             │               │         └─▶ Generating ─▶ Generated ┘
//!    └─────────────┴───────────────┴─▶ NotFound       └─▶ Busy (lock held elsewhere)
//! ```
//!
//! Every rejection of untrusted input (bad path, bad token, unknown asset,
//! extension mismatch) collapses to [`Outcome::NotFound`] so the response
//! reveals nothing about why. The reason is logged at `warn`.
//!
//! Generation is single-flight per destination file: the first request to
//! miss the cache takes the lock and generates, concurrent requests for the
//! same derivative get [`Outcome::Busy`] and are expected to retry. The lock
//! is never waited on.

use crate::assets::{AssetError, AssetStore, DirectoryAssetStore};
use crate::cache::{CacheStats, destination_path, lock_key};
use crate::config::{LockBackend, ServiceConfig};
use crate::derivative::{DerivativeGenerator, GenerationError};
use crate::imaging::{ImageCodec, RustCodec, mime_for_extension};
use crate::keys::{KeyError, KeyPair, KeyProvider};
use crate::lock::{LockFileLocks, ProcessLocks, TryLock};
use crate::token::decode_token;
use crate::types::DerivativeArtifact;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);

/// Failure to assemble a coordinator from configuration.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error(transparent)]
    Assets(#[from] AssetError),
    #[error("serving derivatives requires keys.private_key")]
    PrivateKeyRequired,
}

/// Whether a served derivative was already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Generated,
}

/// A derivative ready to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub artifact: DerivativeArtifact,
    pub cache: CacheStatus,
}

impl Served {
    pub fn open(&self) -> std::io::Result<File> {
        File::open(&self.artifact.uri)
    }
}

/// Result of handling one request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Served(Served),
    /// Another request is generating this derivative.
    Busy { retry_after: Duration },
    NotFound,
}

impl Outcome {
    /// HTTP status for this outcome.
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Served(_) => 200,
            Outcome::Busy { .. } => 503,
            Outcome::NotFound => 404,
        }
    }

    /// `Retry-After` value, for busy outcomes.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Outcome::Busy { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// HTTP status for a full handling result; generation errors are 500.
pub fn response_status(result: &Result<Outcome, GenerationError>) -> u16 {
    match result {
        Ok(outcome) => outcome.status(),
        Err(_) => 500,
    }
}

/// Count a handling result into batch statistics.
pub fn record_outcome(stats: &mut CacheStats, result: &Result<Outcome, GenerationError>) {
    match result {
        Ok(Outcome::Served(Served {
            cache: CacheStatus::Hit,
            ..
        })) => stats.hit(),
        Ok(Outcome::Served(_)) => stats.generate(),
        Ok(Outcome::Busy { .. }) => stats.busy(),
        Ok(Outcome::NotFound) => stats.not_found(),
        Err(_) => stats.fail(),
    }
}

/// Serves derivative requests. `Send + Sync`; share it behind an `Arc`.
pub struct Coordinator {
    keys: Arc<dyn KeyProvider>,
    assets: Arc<dyn AssetStore>,
    generator: DerivativeGenerator,
    locks: Arc<dyn TryLock>,
    prefix: String,
    derivatives_dir: PathBuf,
    allowed: Vec<String>,
    retry_after: Duration,
}

impl Coordinator {
    /// Coordinator with the stock prefix, allowlist, and retry hint.
    pub fn new(
        keys: Arc<dyn KeyProvider>,
        assets: Arc<dyn AssetStore>,
        codec: Arc<dyn ImageCodec>,
        locks: Arc<dyn TryLock>,
        derivatives_dir: impl Into<PathBuf>,
    ) -> Self {
        let defaults = ServiceConfig::default();
        Self {
            keys,
            assets,
            generator: DerivativeGenerator::new(codec),
            locks,
            prefix: defaults.urls.prefix,
            derivatives_dir: derivatives_dir.into(),
            allowed: defaults.formats.allowed,
            retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_matches('/').to_string();
        self
    }

    pub fn with_allowed_extensions(mut self, allowed: Vec<String>) -> Self {
        self.allowed = allowed;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Build everything from a loaded config: keys, asset index, lock
    /// backend, and the pure-Rust codec.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, SetupError> {
        let private_path = config
            .keys
            .private_key
            .as_deref()
            .ok_or(SetupError::PrivateKeyRequired)?;
        let keys = KeyPair::load(Some(config.keys.public_key.as_path()), Some(private_path))?;
        let assets = DirectoryAssetStore::open(&config.storage.assets_dir)?;
        let locks: Arc<dyn TryLock> = match config.locking.backend {
            LockBackend::Process => Arc::new(ProcessLocks::new()),
            LockBackend::File => Arc::new(LockFileLocks::new(
                &config.locking.dir,
                config.locking.stale_after(),
            )),
        };
        info!(
            assets = assets.len(),
            derivatives = %config.storage.derivatives_dir.display(),
            locking = ?config.locking.backend,
            "coordinator ready"
        );

        Ok(Self::new(
            Arc::new(keys),
            Arc::new(assets),
            Arc::new(RustCodec::new()),
            locks,
            &config.storage.derivatives_dir,
        )
        .with_prefix(&config.urls.prefix)
        .with_allowed_extensions(config.formats.allowed.clone())
        .with_retry_after(config.service.retry_after()))
    }

    pub fn derivatives_dir(&self) -> &Path {
        &self.derivatives_dir
    }

    /// Handle a request path of the form `/<prefix>/<token>.<ext>`.
    pub fn handle(&self, path: &str) -> Result<Outcome, GenerationError> {
        let Some((token, outward_ext)) = parse_path(&self.prefix, path) else {
            warn!(path, "request path does not match derivative URL shape");
            return Ok(Outcome::NotFound);
        };

        let payload = match decode_token(token, self.keys.as_ref()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(path, reason = %e, "rejected token");
                return Ok(Outcome::NotFound);
            }
        };
        debug!(uuid = %payload.uuid, "token decoded");

        let Some(source) = self.assets.load_by_uuid(&payload.uuid) else {
            warn!(path, uuid = %payload.uuid, "unknown asset");
            return Ok(Outcome::NotFound);
        };

        let Some(extension) = payload
            .transform
            .output_extension
            .clone()
            .or_else(|| source.descriptor().extension())
        else {
            warn!(path, source = %source.path.display(), "source has no extension");
            return Ok(Outcome::NotFound);
        };
        if !self.allowed.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
            warn!(path, extension = %extension, "extension not allowed");
            return Ok(Outcome::NotFound);
        }
        if !extension.eq_ignore_ascii_case(outward_ext) {
            warn!(path, extension = %extension, outward = outward_ext, "extension mismatch");
            return Ok(Outcome::NotFound);
        }

        let destination = destination_path(&self.derivatives_dir, &payload, &extension);
        if let Some(artifact) = existing_artifact(&destination, &extension) {
            debug!(destination = %destination.display(), "cache hit");
            return Ok(served(artifact, CacheStatus::Hit));
        }

        let key = lock_key(&destination);
        let Some(guard) = self.locks.try_acquire(&key) else {
            debug!(destination = %destination.display(), "generation in progress elsewhere");
            return Ok(Outcome::Busy {
                retry_after: self.retry_after,
            });
        };

        // Someone may have finished between our cache check and the lock.
        if let Some(artifact) = existing_artifact(&destination, &extension) {
            drop(guard);
            debug!(destination = %destination.display(), "cache hit after lock");
            return Ok(served(artifact, CacheStatus::Hit));
        }

        let result = self
            .generator
            .generate(&destination, &source, &payload.transform);
        drop(guard);

        match result {
            Ok(artifact) => Ok(served(artifact, CacheStatus::Generated)),
            Err(e) => {
                error!(destination = %destination.display(), error = %e, "generation failed");
                Err(e)
            }
        }
    }
}

fn served(artifact: DerivativeArtifact, cache: CacheStatus) -> Outcome {
    Outcome::Served(Served { artifact, cache })
}

fn existing_artifact(destination: &Path, extension: &str) -> Option<DerivativeArtifact> {
    let meta = fs::metadata(destination).ok()?;
    meta.is_file().then(|| DerivativeArtifact {
        uri: destination.to_path_buf(),
        mime_type: mime_for_extension(extension),
        byte_size: meta.len(),
    })
}

/// `/<prefix>/<token>.<ext>` → `(token, ext)`.
fn parse_path<'a>(prefix: &str, path: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = path.strip_prefix('/')?.strip_prefix(prefix)?.strip_prefix('/')?;
    if rest.contains('/') {
        return None;
    }
    let (token, ext) = rest.rsplit_once('.')?;
    if token.is_empty() || ext.is_empty() {
        return None;
    }
    Some((token, ext))
}
