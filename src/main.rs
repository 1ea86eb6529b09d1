use clap::{Parser, Subcommand};
use derivate::assets::{AssetStore, DirectoryAssetStore};
use derivate::cache::CacheStats;
use derivate::coordinator::{Coordinator, Outcome, Served, record_outcome};
use derivate::keys::{KeyPair, PUBLIC_KEY_FILENAME};
use derivate::{FitMode, UrlGenerator, config, output};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "derivate")]
#[command(about = "On-demand image derivatives behind encrypted URLs")]
#[command(long_about = "\
On-demand image derivatives behind encrypted URLs

Source images live in an asset directory, named by identifier:

  assets/
  ├── 3f2c9a1e-7d4b-4c1e-9a0f-5b8e2d6c1a37.jpg
  └── 2024/
      └── 9b71d0c4-2e8f-4a6b-b3c5-0d1e7f9a2b48.png

'derivate url' mints a path such as /optimized/<token>.webp. The token is
the request (asset, size, fit, format) encrypted with the public key, so it
cannot be forged or altered. 'derivate fetch' decrypts it with the private
key and serves the derivative, generating it on first use.

Run 'derivate keygen' to create a key pair and 'derivate gen-config' to
generate a documented derivate.toml.")]
#[command(version)]
struct Cli {
    /// Config file (missing file = stock defaults)
    #[arg(long, default_value = "derivate.toml", global = true)]
    config: PathBuf,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "derivate=trace")
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an RSA key pair (PEM)
    Keygen {
        /// Directory to write public.pem and private.pem into
        #[arg(long, default_value = "keys")]
        out: PathBuf,
        /// Modulus size in bits
        #[arg(long, default_value_t = 2048)]
        bits: usize,
        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },
    /// Print the derivative URL path for an asset
    Url {
        /// Asset identifier
        uuid: String,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        /// Output format (defaults to the source's own)
        #[arg(long)]
        extension: Option<String>,
        /// clip, crop, or scale
        #[arg(long, default_value = "clip")]
        fit: FitMode,
    },
    /// Handle one request path and report the outcome
    Fetch {
        /// Request path, e.g. /optimized/<token>.webp
        path: String,
        /// Copy the served derivative here
        #[arg(long)]
        out: Option<PathBuf>,
        /// Report as a JSON object
        #[arg(long)]
        json: bool,
    },
    /// Handle every request path in a file (one per line), in parallel
    Warm {
        file: PathBuf,
        /// Report one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// List indexed source assets
    Assets,
    /// Print a stock derivate.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Command::Keygen { out, bits, force } => {
            if !force && out.join(PUBLIC_KEY_FILENAME).exists() {
                return Err(format!(
                    "{} already exists (use --force to overwrite)",
                    out.join(PUBLIC_KEY_FILENAME).display()
                )
                .into());
            }
            let pair = KeyPair::generate(bits)?;
            let written = pair.write_pem(&out)?;
            output::print_keygen(&written, bits);
        }
        Command::Url {
            uuid,
            width,
            height,
            extension,
            fit,
        } => {
            let config = config::load_config(&cli.config)?;
            let keys = KeyPair::load(Some(config.keys.public_key.as_path()), None)?;
            let assets = DirectoryAssetStore::open(&config.storage.assets_dir)?;
            let source = assets
                .load_by_uuid(&uuid)
                .ok_or_else(|| format!("unknown asset {uuid}"))?;
            let urls = UrlGenerator::new(config.urls.prefix.as_str(), Arc::new(keys));
            let path = urls.generate(
                &uuid,
                &source.descriptor(),
                width,
                height,
                extension.as_deref(),
                fit,
            )?;
            println!("{}", path);
        }
        Command::Fetch { path, out, json } => {
            let config = config::load_config(&cli.config)?;
            let coordinator = Coordinator::from_config(&config)?;
            let result = coordinator.handle(&path);
            if json {
                output::print_outcome_json(&path, &result)?;
            } else {
                output::print_outcome(&path, &result);
            }
            if let (Ok(Outcome::Served(served)), Some(out)) = (&result, out) {
                copy_served(served, &out)?;
            }
            result?;
        }
        Command::Warm { file, json } => {
            let config = config::load_config(&cli.config)?;
            let coordinator = Coordinator::from_config(&config)?;
            let paths = read_request_paths(&file)?;
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config::effective_threads(&config.service))
                .build()?;

            let results: Vec<_> = pool.install(|| {
                paths
                    .par_iter()
                    .map(|path| (path, coordinator.handle(path)))
                    .collect()
            });

            let mut stats = CacheStats::default();
            for (path, result) in &results {
                if json {
                    output::print_outcome_json(path, result)?;
                } else {
                    output::print_outcome(path, result);
                }
                record_outcome(&mut stats, result);
            }
            if !json {
                println!("{}", output::format_warm_summary(&stats));
            }
        }
        Command::Assets => {
            let config = config::load_config(&cli.config)?;
            let assets = DirectoryAssetStore::open(&config.storage.assets_dir)?;
            output::print_assets(&assets.list(), assets.root());
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Logs go to stderr; `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();
}

/// Non-empty, non-comment lines of a request list.
fn read_request_paths(file: &Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(file)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

fn copy_served(served: &Served, out: &Path) -> std::io::Result<()> {
    let mut src = served.open()?;
    let mut dst = std::fs::File::create(out)?;
    std::io::copy(&mut src, &mut dst)?;
    Ok(())
}
