//! Reqwest-based implementation of the [`FetchTransport`] trait.
//!
//! Keeps one configured client per identity so cookies and the proxy
//! binding stay consistent across requests made through the same egress
//! point.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http::{
    HeaderMap as HttpHeaderMap, HeaderName as HttpHeaderName, HeaderValue as HttpHeaderValue,
    Method as HttpMethod,
};
use reqwest::{Client, Method, Proxy};
use tokio::sync::Mutex;
use url::Url;

use super::{FetchTransport, RawResponse, TransportFailure};
use crate::modules::identity::Identity;

/// Reqwest-backed transport with a client pool keyed by identity.
pub struct ReqwestTransport {
    clients: Mutex<HashMap<String, Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, identity: &Identity) -> Result<Client, TransportFailure> {
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&identity.id) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().cookie_store(true);
        if let Some(endpoint) = &identity.proxy_url {
            let proxy = Proxy::all(endpoint.as_str())
                .map_err(|err| TransportFailure::Proxy(err.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| TransportFailure::Other(err.to_string()))?;
        guard.insert(identity.id.clone(), client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchTransport for ReqwestTransport {
    async fn execute(
        &self,
        identity: &Identity,
        method: &HttpMethod,
        url: &Url,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<RawResponse, TransportFailure> {
        let client = self.client(identity).await?;
        let req_method = Method::from_bytes(method.as_str().as_bytes())
            .map_err(|err| TransportFailure::Other(err.to_string()))?;
        let req_headers = to_reqwest_headers(headers)?;

        let response = client
            .request(req_method, url.as_str())
            .headers(req_headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let resp_headers = to_http_headers(response.headers())?;
        let body = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?;

        Ok(RawResponse {
            status,
            headers: resp_headers,
            body,
            url: final_url,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        return TransportFailure::Timeout;
    }
    if err.is_connect() {
        let message = err.to_string();
        if message.contains("dns") || message.contains("resolve") {
            return TransportFailure::Dns(message);
        }
        return TransportFailure::Connect(message);
    }
    TransportFailure::Other(err.to_string())
}

fn to_reqwest_headers(
    headers: &HashMap<String, String>,
) -> Result<reqwest::header::HeaderMap, TransportFailure> {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportFailure::InvalidHeader(name.clone()))?;
        let header_value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|_| TransportFailure::InvalidHeader(name.clone()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn to_http_headers(map: &reqwest::header::HeaderMap) -> Result<HttpHeaderMap, TransportFailure> {
    let mut headers = HttpHeaderMap::new();
    for (name, value) in map.iter() {
        let header_name = HttpHeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|_| TransportFailure::InvalidHeader(name.to_string()))?;
        let header_value = HttpHeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| TransportFailure::InvalidHeader(name.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}
