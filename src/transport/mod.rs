//! Transport seam between the fetch layer and the network.
//!
//! The orchestrator talks to a [`FetchTransport`] so the whole retry and
//! fallback machinery can be exercised against a scripted implementation;
//! the reqwest-backed implementation lives in [`reqwest_client`].

pub mod commercial;
pub mod reqwest_client;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;
use url::Url;

use crate::modules::identity::Identity;

pub use commercial::{ProxyServiceConfig, endpoint_url};
pub use reqwest_client::ReqwestTransport;

/// Completed HTTP exchange, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

/// Connection-level failure. Distinguished from blocking signals: these are
/// classified as transient transport errors, not as evidence of detection.
#[derive(Debug, Error)]
pub enum TransportFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("proxy endpoint rejected: {0}")]
    Proxy(String),
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// Executes one HTTP exchange through a given identity.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn execute(
        &self,
        identity: &Identity,
        method: &Method,
        url: &Url,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<RawResponse, TransportFailure>;
}
