//! # derivate
//!
//! On-demand image derivatives behind opaque, encrypted URLs.
//!
//! A page renderer asks for "this asset, 400 wide, as WebP" and gets back a
//! path like `/optimized/<token>.webp`. The token is the request itself,
//! encrypted with the service's RSA public key, so the URL can't be forged
//! or edited into a different (or more expensive) derivative. When the URL
//! is fetched, the service decrypts the token, finds the source, and either
//! serves the derivative from disk or generates it first.
//!
//! # Request Lifecycle
//!
//! ```text
//! UrlGenerator          (page render)   uuid + transform ─▶ /optimized/<token>.<ext>
//!
//! Coordinator::handle   (request)       path ─▶ decrypt ─▶ asset ─▶ cache? ─▶ lock ─▶ generate
//!                                                                  │                    │
//!                                                                  └──── Served ◀───────┘
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | Shared value types: `FitMode`, `ImageDescriptor`, `TransformRequest`, `DerivativeArtifact` |
//! | [`imaging`] | Fit math, format tables, and the `ImageCodec` seam (pure-Rust `image` backend) |
//! | [`keys`] | RSA key loading, generation, and the `KeyProvider` trait |
//! | [`token`] | Query-string plaintext + RSA-OAEP + base64url token codec |
//! | [`urls`] | Builds derivative URLs from an asset descriptor and a requested size |
//! | [`assets`] | `AssetStore` trait and the directory-backed index of `<uuid>.<ext>` sources |
//! | [`cache`] | Content-addressed derivative paths, lock keys, batch statistics |
//! | [`lock`] | Non-blocking per-key locks: in-process and lock-file backends |
//! | [`derivative`] | Resize/convert one source into one derivative file, atomically |
//! | [`coordinator`] | The request state machine and its outward status mapping |
//! | [`config`] | `derivate.toml` loading, validation, and merging |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## The Token Is the Request
//!
//! Nothing is stored server-side when a URL is minted. Everything needed to
//! produce the derivative travels inside the token, and only the holder of
//! the private key can read it. Hosts that only render pages can be given
//! the public key alone.
//!
//! ## The Filesystem Is the Cache
//!
//! A derivative exists if its file exists. Files are addressed by the hash
//! of the decrypted request, so two differently-encrypted URLs for the same
//! transform share one file, and deleting any file is always safe.
//!
//! ## Busy, Not Blocked
//!
//! When a derivative is already being generated, other requests for it get
//! [`coordinator::Outcome::Busy`] with a retry hint instead of waiting. A
//! slow encode never ties up more than one worker.

pub mod assets;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod derivative;
pub mod imaging;
pub mod keys;
pub mod lock;
pub mod output;
pub mod token;
pub mod types;
pub mod urls;

pub use coordinator::{Coordinator, Outcome};
pub use keys::{KeyPair, KeyProvider};
pub use types::{DerivativeArtifact, FitMode, ImageDescriptor, TransformRequest};
pub use urls::UrlGenerator;

#[cfg(test)]
pub(crate) mod test_helpers;
