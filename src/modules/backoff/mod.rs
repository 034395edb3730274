//! Outcome classification and per-identity backoff windows.
//!
//! Classification turns a raw response into one of four outcome statuses;
//! recording an outcome updates that identity's failure streak and the
//! window during which it is ineligible for selection. Delay computation is
//! a pure function of recorded history and the injected clock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Regex, RegexBuilder};

use crate::modules::clock::Clock;

/// Status of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    RateLimited,
    Blocked,
    TransportError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate-limited",
            Outcome::Blocked => "blocked",
            Outcome::TransportError => "transport-error",
        }
    }
}

/// Block-page phrases job boards serve with an HTTP 200.
static BLOCK_PAGE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"(captcha|access denied|unusual traffic|automated (requests|queries|access)|verify you are a human|your ip has been blocked)",
    )
    .case_insensitive(true)
    .build()
    .expect("invalid block page regex")
});

/// Classify a completed HTTP exchange.
///
/// Priority order: rate-limit statuses first, then block-page signatures
/// (which some sites serve with a 200), then success. Connection-level
/// failures never reach this function; the transport reports those and they
/// map to [`Outcome::TransportError`] directly.
pub fn classify(status: u16, body: &str) -> Outcome {
    if status == 429 || status == 403 {
        return Outcome::RateLimited;
    }
    if BLOCK_PAGE_RE.is_match(body) {
        return Outcome::Blocked;
    }
    Outcome::Success
}

/// Failure bookkeeping for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub consecutive_failures: u32,
    pub next_eligible: Option<Instant>,
}

/// Delay policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// First-failure delay; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Ceiling for the exponential window.
    pub max_delay: Duration,
    /// Fixed delay for transport-level faults, which are not evidence of
    /// blocking and therefore never grow.
    pub transport_delay: Duration,
    /// Fraction of the computed delay added as random jitter so retries
    /// across workers do not synchronize.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            transport_delay: Duration::from_secs(5),
            jitter_fraction: 0.25,
        }
    }
}

/// Thread-safe controller tracking [`BackoffState`] per identity.
pub struct BackoffController {
    config: BackoffConfig,
    clock: Arc<dyn Clock>,
    states: RwLock<HashMap<String, BackoffState>>,
}

impl BackoffController {
    pub fn new(config: BackoffConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Record the outcome of an attempt made through `identity`.
    ///
    /// Success clears the failure streak and the backoff window. Rate-limit
    /// and block outcomes grow the window exponentially (with jitter, capped
    /// at the configured maximum); transport errors apply the short fixed
    /// delay. `next_eligible` never moves backwards without an intervening
    /// success.
    pub fn record(&self, identity: &str, outcome: Outcome) {
        let now = self.clock.now();
        let mut guard = self.states.write().expect("backoff state lock poisoned");
        let state = guard.entry(identity.to_string()).or_default();

        match outcome {
            Outcome::Success => {
                state.consecutive_failures = 0;
                state.next_eligible = None;
            }
            Outcome::RateLimited | Outcome::Blocked => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                let delay = self.exponential_delay(state.consecutive_failures);
                state.next_eligible = Some(monotonic(state.next_eligible, now + delay));
                log::info!(
                    "identity {identity} backed off {:.1}s after {} consecutive failures ({})",
                    delay.as_secs_f64(),
                    state.consecutive_failures,
                    outcome.label(),
                );
            }
            Outcome::TransportError => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.next_eligible =
                    Some(monotonic(state.next_eligible, now + self.config.transport_delay));
                log::debug!(
                    "identity {identity} paused {:.1}s after transport error",
                    self.config.transport_delay.as_secs_f64()
                );
            }
        }
    }

    /// Instant at which `identity` becomes selectable, or `None` when it is
    /// eligible right now.
    pub fn eligible_at(&self, identity: &str) -> Option<Instant> {
        let guard = self.states.read().expect("backoff state lock poisoned");
        guard
            .get(identity)
            .and_then(|state| state.next_eligible)
            .filter(|&at| at > self.clock.now())
    }

    pub fn is_eligible(&self, identity: &str) -> bool {
        self.eligible_at(identity).is_none()
    }

    /// Copy of the recorded state for `identity`.
    pub fn snapshot(&self, identity: &str) -> BackoffState {
        let guard = self.states.read().expect("backoff state lock poisoned");
        guard.get(identity).copied().unwrap_or_default()
    }

    fn exponential_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let uncapped = self.config.base_delay.saturating_mul(1u32 << exponent);
        let capped = uncapped.min(self.config.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=self.config.jitter_fraction.max(0.0));
        capped.mul_f64(1.0 + jitter)
    }
}

fn monotonic(previous: Option<Instant>, candidate: Instant) -> Instant {
    match previous {
        Some(prev) if prev > candidate => prev,
        _ => candidate,
    }
}
