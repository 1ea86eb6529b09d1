//! Service configuration module.
//!
//! Handles loading, validating, and merging `derivate.toml`. Stock defaults
//! are overridden by whatever the file specifies; a missing file means
//! "all defaults".
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [keys]
//! public_key = "keys/public.pem"    # SPKI or PKCS#1 PEM
//! private_key = "keys/private.pem"  # omit on hosts that only build URLs
//!
//! [storage]
//! assets_dir = "assets"             # <uuid>.<ext> source images
//! derivatives_dir = "derivatives"   # generated files (the cache)
//!
//! [urls]
//! prefix = "optimized"              # /<prefix>/<token>.<ext>
//!
//! [formats]
//! allowed = ["jpg", "jpeg", "png", "gif", "webp", "avif"]
//!
//! [locking]
//! backend = "process"               # "process" or "file"
//! dir = ".derivate-locks"           # lock files (file backend only)
//! stale_after_secs = 30             # lock files older than this are taken over
//!
//! [service]
//! retry_after_secs = 3              # hint sent with busy responses
//! max_processes = 4                 # warm-up workers (omit for CPU cores)
//! ```
//!
//! Relative paths are resolved against the directory containing the config
//! file. Unknown keys are rejected to catch typos early.

use crate::imaging::format::encodable_extensions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Service configuration loaded from `derivate.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// RSA key locations.
    pub keys: KeysConfig,
    /// Source and derivative directories.
    pub storage: StorageConfig,
    /// URL shape.
    pub urls: UrlsConfig,
    /// Output extension allowlist.
    pub formats: FormatsConfig,
    /// Generation lock backend.
    pub locking: LockingConfig,
    /// Request handling knobs.
    pub service: ServiceSection,
}

impl ServiceConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.urls.prefix.trim_matches('/');
        if prefix.is_empty() || prefix.contains('/') {
            return Err(ConfigError::Validation(
                "urls.prefix must be a single non-empty path segment".into(),
            ));
        }
        if self.formats.allowed.is_empty() {
            return Err(ConfigError::Validation(
                "formats.allowed must not be empty".into(),
            ));
        }
        for ext in &self.formats.allowed {
            if !encodable_extensions().any(|e| e.eq_ignore_ascii_case(ext)) {
                return Err(ConfigError::Validation(format!(
                    "formats.allowed: unsupported extension {ext:?}"
                )));
            }
        }
        if self.service.retry_after_secs == 0 {
            return Err(ConfigError::Validation(
                "service.retry_after_secs must be at least 1".into(),
            ));
        }
        if self.locking.stale_after_secs == 0 {
            return Err(ConfigError::Validation(
                "locking.stale_after_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Make every relative path absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.keys.public_key);
        if let Some(private) = self.keys.private_key.as_mut() {
            resolve(private);
        }
        resolve(&mut self.storage.assets_dir);
        resolve(&mut self.storage.derivatives_dir);
        resolve(&mut self.locking.dir);
    }

    pub fn is_allowed(&self, extension: &str) -> bool {
        self.formats
            .allowed
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }
}

/// RSA key locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeysConfig {
    pub public_key: PathBuf,
    /// Absent on hosts that only generate URLs.
    pub private_key: Option<PathBuf>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            public_key: PathBuf::from("keys/public.pem"),
            private_key: Some(PathBuf::from("keys/private.pem")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory of `<uuid>.<ext>` source images.
    pub assets_dir: PathBuf,
    /// Directory that holds generated derivatives.
    pub derivatives_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("assets"),
            derivatives_dir: PathBuf::from("derivatives"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UrlsConfig {
    /// Mount point segment; URLs look like `/<prefix>/<token>.<ext>`.
    pub prefix: String,
}

impl Default for UrlsConfig {
    fn default() -> Self {
        Self {
            prefix: "optimized".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatsConfig {
    /// Output extensions a token may request.
    pub allowed: Vec<String>,
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            allowed: ["jpg", "jpeg", "png", "gif", "webp", "avif"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Which [`TryLock`](crate::lock::TryLock) implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Threads of this process only.
    #[default]
    Process,
    /// Lock files, shared by all processes on the host.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockingConfig {
    pub backend: LockBackend,
    /// Lock file directory (file backend).
    pub dir: PathBuf,
    /// Age after which a lock file is considered abandoned.
    pub stale_after_secs: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Process,
            dir: PathBuf::from(".derivate-locks"),
            stale_after_secs: 30,
        }
    }
}

impl LockingConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    /// Retry hint, in seconds, attached to busy responses.
    pub retry_after_secs: u64,
    /// Maximum number of parallel warm-up workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            retry_after_secs: 3,
            max_processes: None,
        }
    }
}

impl ServiceSection {
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

/// Resolve the effective worker count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ServiceSection) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_processes
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(ServiceConfig::default())
        .map_err(|e| ConfigError::Validation(format!("default config must serialize: {e}")))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<ServiceConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: ServiceConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a `derivate.toml` file.
///
/// A missing file yields the stock defaults. Relative paths resolve against
/// the file's directory.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let overlay = if path.exists() {
        let content = fs::read_to_string(path)?;
        Some(toml::from_str::<toml::Value>(&content)?)
    } else {
        None
    };
    let mut config = resolve_config(overlay)?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    config.resolve_paths(base);
    Ok(config)
}

/// Returns a fully-commented stock `derivate.toml` with all keys and
/// explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# derivate configuration
# ======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Relative paths are resolved against
# the directory containing this file. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Keys
# ---------------------------------------------------------------------------
[keys]
# Public key used to mint URLs (SPKI "BEGIN PUBLIC KEY" or PKCS#1 PEM).
public_key = "keys/public.pem"

# Private key used to decode URLs. Leave it out on hosts that only render
# pages; they can build URLs but not serve derivatives.
private_key = "keys/private.pem"

# ---------------------------------------------------------------------------
# Storage
# ---------------------------------------------------------------------------
[storage]
# Source images, named <uuid>.<ext>, in any directory layout.
assets_dir = "assets"

# Generated derivatives. Safe to delete at any time; files are regenerated
# on the next request.
derivatives_dir = "derivatives"

# ---------------------------------------------------------------------------
# URLs
# ---------------------------------------------------------------------------
[urls]
# Mount point: URLs look like /<prefix>/<token>.<extension>
prefix = "optimized"

# ---------------------------------------------------------------------------
# Output formats
# ---------------------------------------------------------------------------
[formats]
# Extensions a URL may request. Requests for anything else are not found.
allowed = ["jpg", "jpeg", "png", "gif", "webp", "avif"]

# ---------------------------------------------------------------------------
# Locking
# ---------------------------------------------------------------------------
[locking]
# "process": threads of one process share a lock table.
# "file": lock files in `dir`, shared by every process on this host.
backend = "process"
dir = ".derivate-locks"

# Lock files older than this are assumed abandoned and taken over.
stale_after_secs = 30

# ---------------------------------------------------------------------------
# Service
# ---------------------------------------------------------------------------
[service]
# Seconds a client should wait before retrying a busy derivative.
retry_after_secs = 3

# Maximum parallel workers for `warm`.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4
"##
}
