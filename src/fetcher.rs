//! High level fetch orchestration.
//!
//! Wires together the identity pool, backoff controller, license gate, and
//! fallback cache behind a single entry point: give it a target URL and the
//! capability tags the caller needs, get back a payload with a staleness
//! flag or a typed failure. Retryable outcomes never cross this boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Method;
use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use url::Url;

use crate::config::{ConfigError, ScraperConfig, SiteSettings};
use crate::modules::backoff::{BackoffConfig, BackoffController, Outcome, classify};
use crate::modules::cache::{CacheError, FallbackCache};
use crate::modules::clock::{Clock, SystemClock};
use crate::modules::identity::{Identity, IdentityPool, RotationConfig};
use crate::modules::license::{self, CapabilityReport, Feature, LicenseState};
use crate::transport::{FetchTransport, ReqwestTransport};

/// Per-attempt network timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while every candidate identity is leased out.
const LEASE_POLL: Duration = Duration::from_millis(100);

/// Result alias for the fetch layer.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors that cross the fetch layer boundary.
///
/// Rate-limit, block, and transport classifications are handled inside the
/// retry loop and only ever surface folded into [`FetchError::Failed`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cache unavailable: {0}")]
    Cache(#[from] CacheError),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("no identity became eligible before the request deadline")]
    NoIdentityAvailable,
    #[error("fetch failed after {attempts} attempts, last outcome: {}", .last.label())]
    Failed { attempts: u32, last: Outcome },
}

/// One logical fetch request. Immutable; consumed by [`ResilientFetcher::fetch`].
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    /// Extra headers layered over the identity's fingerprint headers.
    pub headers: HashMap<String, String>,
    /// Capability tags the caller needs for this fetch.
    pub capabilities: Vec<Feature>,
    /// Skip the fresh-cache shortcut and always attempt a live fetch.
    pub force_fresh: bool,
    /// Per-request deadline override.
    pub deadline: Option<Duration>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HashMap::new(),
            capabilities: vec![Feature::BasicScraping],
            force_fresh: false,
            deadline: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_capability(mut self, feature: Feature) -> Self {
        if !self.capabilities.contains(&feature) {
            self.capabilities.push(feature);
        }
        self
    }

    pub fn force_fresh(mut self) -> Self {
        self.force_fresh = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Payload returned to callers, with provenance.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
    pub url: Url,
    /// Identity the payload came through; `None` when served from cache.
    pub identity: Option<String>,
    pub fetched_at: DateTime<Utc>,
    /// Set when the payload comes from cache because the live fetch failed.
    pub stale: bool,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Fluent builder for [`ResilientFetcher`].
pub struct FetcherBuilder {
    config: ScraperConfig,
    license_key: Option<String>,
    transport: Option<Arc<dyn FetchTransport>>,
    clock: Option<Arc<dyn Clock>>,
    cache_path: Option<PathBuf>,
}

impl FetcherBuilder {
    pub fn new() -> Self {
        Self {
            config: ScraperConfig::default(),
            license_key: None,
            transport: None,
            clock: None,
            cache_path: None,
        }
    }

    pub fn with_config(mut self, config: ScraperConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_license_key(mut self, key: impl Into<String>) -> Self {
        self.license_key = Some(key.into());
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn FetchTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the cache database location (defaults to
    /// `<cache_dir>/fetch-cache.redb`).
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn build(self) -> FetchResult<ResilientFetcher> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let key = self
            .license_key
            .or_else(|| self.config.license_key.clone())
            .unwrap_or_default();
        let license = Arc::new(license::validate_with_clock(&key, clock.as_ref()));

        let rotation = &self.config.rotation;
        let backoff = Arc::new(BackoffController::new(
            BackoffConfig {
                base_delay: Duration::from_secs_f64(rotation.retry_base_delay_secs),
                max_delay: Duration::from_secs_f64(rotation.retry_max_delay_secs),
                transport_delay: Duration::from_secs_f64(rotation.transport_error_delay_secs),
                ..BackoffConfig::default()
            },
            clock.clone(),
        ));

        let pool = IdentityPool::new(
            self.config.build_identities()?,
            backoff.clone(),
            clock.clone(),
            RotationConfig {
                rotate_every_requests: rotation.rotate_every_requests,
                epoch_window: rotation.epoch_window_secs.map(Duration::from_secs),
            },
            license.has_feature(Feature::FingerprintRotation),
        );

        let cache_path = self.cache_path.unwrap_or_else(|| {
            self.config.cache_dir.join("fetch-cache.redb")
        });
        if let Some(parent) = cache_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let cache = FallbackCache::open(&cache_path, self.config.cache_ttl(), clock.clone())?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));

        Ok(ResilientFetcher {
            pool,
            backoff,
            cache,
            license,
            transport,
            clock,
            config: self.config,
            site_counts: Mutex::new(HashMap::new()),
        })
    }
}

impl Default for FetcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator for resilient fetching.
pub struct ResilientFetcher {
    pool: IdentityPool,
    backoff: Arc<BackoffController>,
    cache: FallbackCache,
    license: Arc<LicenseState>,
    transport: Arc<dyn FetchTransport>,
    clock: Arc<dyn Clock>,
    config: ScraperConfig,
    site_counts: Mutex<HashMap<String, u32>>,
}

impl ResilientFetcher {
    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::new()
    }

    /// The capability set this process is running with.
    pub fn license(&self) -> &LicenseState {
        &self.license
    }

    pub fn capability_report(&self) -> CapabilityReport {
        self.license.report()
    }

    /// Backoff bookkeeping, for observability.
    pub fn backoff(&self) -> &BackoffController {
        &self.backoff
    }

    /// Convenience wrapper: GET `url` with baseline capabilities.
    pub async fn fetch_url(&self, url: &str) -> FetchResult<FetchResponse> {
        let url = Url::parse(url)?;
        self.fetch(FetchRequest::get(url)).await
    }

    /// Run one logical fetch request through the retry state machine.
    pub async fn fetch(&self, request: FetchRequest) -> FetchResult<FetchResponse> {
        let host = request.url.host_str().unwrap_or_default().to_string();
        let site = self.config.site_settings(&host);

        // Freshness is preferred whenever available: a within-ttl entry
        // short-circuits the live fetch unless the caller opted out.
        if !request.force_fresh {
            if let Some(entry) = self.cached_entry(&request.url).await {
                log::debug!("serving fresh cache entry for {}", request.url);
                return Ok(FetchResponse {
                    status: 200,
                    body: Bytes::from(entry.payload),
                    url: request.url.clone(),
                    identity: None,
                    fetched_at: entry.stored_at,
                    stale: false,
                });
            }
        }

        let allowed = self.allowed_identities(&request);
        let allowed_refs: Vec<&str> = allowed.iter().map(String::as_str).collect();

        let deadline = request
            .deadline
            .unwrap_or(Duration::from_secs(self.config.rotation.request_deadline_secs));
        let started = self.clock.now();

        let max_retries = self.config.rotation.max_retries.max(1);
        let mut attempts = 0u32;
        let mut last_outcome: Option<Outcome> = None;

        while attempts < max_retries {
            let elapsed = self.clock.now().duration_since(started);
            let Some(remaining) = deadline.checked_sub(elapsed) else {
                log::warn!("deadline exceeded for {} after {attempts} attempts", request.url);
                break;
            };

            let lease = match self.pool.acquire(&allowed_refs) {
                Ok(lease) => lease,
                Err(unavailable) => {
                    let wait = unavailable
                        .earliest
                        .map(|at| at.saturating_duration_since(self.clock.now()))
                        .unwrap_or(LEASE_POLL);
                    if wait >= remaining {
                        log::warn!(
                            "no identity for {} within the deadline (earliest in {:.1}s)",
                            request.url,
                            wait.as_secs_f64()
                        );
                        break;
                    }
                    log::debug!(
                        "waiting {:.1}s for an eligible identity for {}",
                        wait.as_secs_f64(),
                        request.url
                    );
                    sleep(wait).await;
                    continue;
                }
            };

            let pacing = self.pacing_delay(&site).min(remaining);
            if pacing > Duration::ZERO {
                sleep(pacing).await;
            }

            let identity = lease.identity().clone();
            let mut headers = lease.fingerprint().headers(None);
            headers.extend(request.headers.clone());

            let timeout = remaining.min(ATTEMPT_TIMEOUT);
            let result = self
                .transport
                .execute(&identity, &request.method, &request.url, &headers, timeout)
                .await;
            attempts += 1;

            let (outcome, raw) = match result {
                Ok(raw) => {
                    let body_text = String::from_utf8_lossy(&raw.body);
                    (classify(raw.status, &body_text), Some(raw))
                }
                Err(failure) => {
                    log::warn!(
                        "transport failure through {} for {}: {failure}",
                        identity.id,
                        request.url
                    );
                    (Outcome::TransportError, None)
                }
            };
            lease.complete(outcome);
            self.note_site_request(&host, &site, &identity);

            match (outcome, raw) {
                (Outcome::Success, Some(raw)) => {
                    if let Err(err) = self.cache.put(&request.url, &raw.body).await {
                        log::warn!("cache write failed for {}: {err}", request.url);
                    }
                    return Ok(FetchResponse {
                        status: raw.status,
                        body: raw.body,
                        url: raw.url,
                        identity: Some(identity.id),
                        fetched_at: self.clock.utc_now(),
                        stale: false,
                    });
                }
                (outcome, _) => {
                    log::info!(
                        "attempt {attempts}/{max_retries} for {} via {} classified {}",
                        request.url,
                        identity.id,
                        outcome.label()
                    );
                    last_outcome = Some(outcome);
                }
            }
        }

        // Retries exhausted or deadline passed: fall back to cache before
        // surfacing an error.
        if let Some(entry) = self.cached_entry(&request.url).await {
            log::warn!("serving stale cache entry for {}", request.url);
            return Ok(FetchResponse {
                status: 200,
                body: Bytes::from(entry.payload),
                url: request.url.clone(),
                identity: None,
                fetched_at: entry.stored_at,
                stale: true,
            });
        }

        match last_outcome {
            Some(last) => Err(FetchError::Failed { attempts, last }),
            None => Err(FetchError::NoIdentityAvailable),
        }
    }

    /// Identities the license permits for this request.
    ///
    /// Capability tags the caller asked for but the license does not grant
    /// degrade the request rather than failing it.
    fn allowed_identities(&self, request: &FetchRequest) -> Vec<String> {
        for capability in &request.capabilities {
            if !self.license.has_feature(*capability) {
                log::warn!(
                    "capability {} not licensed, continuing at reduced capability",
                    capability.tag()
                );
            }
        }

        self.pool
            .identities()
            .iter()
            .filter(|identity| {
                self.license
                    .has_feature(identity.transport.required_feature())
            })
            .map(|identity| identity.id.clone())
            .collect()
    }

    fn pacing_delay(&self, site: &SiteSettings) -> Duration {
        let rotation = &self.config.rotation;
        let base = if rotation.request_delay_max_secs > rotation.request_delay_min_secs {
            rand::thread_rng()
                .gen_range(rotation.request_delay_min_secs..rotation.request_delay_max_secs)
        } else {
            rotation.request_delay_min_secs
        };
        Duration::from_secs_f64((base + site.extra_delay_secs).max(0.0))
    }

    /// Track per-site request counts and close the identity's session when
    /// a site's per-session budget runs out.
    fn note_site_request(&self, host: &str, site: &SiteSettings, identity: &Identity) {
        if host.is_empty() || site.max_requests_per_session == 0 {
            return;
        }
        let mut guard = self.site_counts.lock().expect("site count lock poisoned");
        let count = guard.entry(host.to_string()).or_insert(0);
        *count += 1;
        if *count >= site.max_requests_per_session {
            log::info!(
                "session budget for {host} exhausted after {count} requests, rotating"
            );
            *count = 0;
            drop(guard);
            self.pool.redraw_fingerprint(&identity.id);
        }
    }

    async fn cached_entry(&self, url: &Url) -> Option<crate::modules::cache::CacheEntry> {
        match self.cache.get(url).await {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("cache read failed for {url}: {err}");
                None
            }
        }
    }
}
