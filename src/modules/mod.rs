//! Core subsystems of the fetch layer.
//!
//! Each module owns one concern: identity rotation, backoff windows,
//! license gating, cache fallback, fingerprint drawing, and the injected
//! clock they all share.

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod fingerprint;
pub mod identity;
pub mod license;

// Re-export commonly used types
pub use backoff::{BackoffConfig, BackoffController, BackoffState, Outcome, classify};
pub use cache::{CacheEntry, CacheError, FallbackCache, normalize_key};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::FingerprintProfile;
pub use identity::{
    Identity, IdentityPool, Lease, NoIdentityAvailable, RotationConfig, Transport,
};
pub use license::{CapabilityReport, Feature, LicenseState, validate, validate_with_clock};
