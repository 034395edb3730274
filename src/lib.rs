//! # gravy-fetch
//!
//! Resilient fetch layer for the Gravy Jobs listing aggregator.
//!
//! Job boards rate limit, block IPs, and fingerprint browsers. This crate
//! decides, for every outbound request, which network identity to present,
//! how to recover from blocking signals, and when to serve stale cached
//! content instead of failing outright. Report rendering, scoring, and the
//! GUI are external collaborators consuming this layer's output.
//!
//! ## Features
//!
//! - Identity pool over direct, local SOCKS, and commercial proxy egress
//! - License-gated capability set with graceful degradation
//! - Exponential backoff with jitter per identity
//! - Browser fingerprint profiles bound per rotation epoch
//! - On-disk fallback cache serving stale payloads when retries run out
//!
//! ## Example
//!
//! ```no_run
//! use gravy_fetch::ResilientFetcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fetcher = ResilientFetcher::builder()
//!         .with_license_key("TEST-GRAVY-JOBS-12345")
//!         .build()?;
//!     let response = fetcher.fetch_url("https://remoteok.com/remote-dev-jobs").await?;
//!     println!("{} bytes (stale: {})", response.body.len(), response.stale);
//!     Ok(())
//! }
//! ```

mod fetcher;

pub mod config;
pub mod modules;
pub mod transport;

pub use crate::fetcher::{
    FetchError,
    FetchRequest,
    FetchResponse,
    FetchResult,
    FetcherBuilder,
    ResilientFetcher,
};

pub use crate::config::{
    ConfigError,
    IdentityConfig,
    RotationSettings,
    ScraperConfig,
    SiteSettings,
    TransportKind,
};

pub use crate::modules::{
    BackoffConfig,
    BackoffController,
    BackoffState,
    CacheEntry,
    CacheError,
    CapabilityReport,
    Clock,
    FallbackCache,
    Feature,
    FingerprintProfile,
    Identity,
    IdentityPool,
    Lease,
    LicenseState,
    ManualClock,
    NoIdentityAvailable,
    Outcome,
    RotationConfig,
    SystemClock,
    Transport,
};

pub use crate::transport::{
    FetchTransport,
    ProxyServiceConfig,
    RawResponse,
    ReqwestTransport,
    TransportFailure,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
