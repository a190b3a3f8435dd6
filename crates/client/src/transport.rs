//! The network side of a cached session.
//!
//! ### Redirects
//! - [`ReqwestTransport`] follows redirects itself (reqwest's own policy is
//!   turned off) so every hop is kept in [`OriginResponse::history`]; the
//!   cache needs those hops to write redirect aliases.
//! - 303, and 301/302 after a POST, are replayed as GET without a body.
//! - `Authorization` is dropped when a redirect changes host.
//! - With `follow_redirects` off, the redirect target is returned in
//!   [`OriginResponse::next`].

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::Client;

use crate::error::TransportError;
use reqcache_core::models::headers;
use reqcache_core::{CachedRequest, Error, OriginResponse};

/// Something that can send a request to the origin.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: &CachedRequest) -> Result<OriginResponse, Error>;
}

/// Configuration for the reqwest transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// User agent string (default: "reqcache/0.1")
    pub user_agent: String,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Follow redirects (default: true)
    pub follow_redirects: bool,

    /// Maximum number of redirects to follow (default: 30)
    pub max_redirects: usize,

    /// Verify TLS certificates (default: true)
    pub verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: "reqcache/0.1".to_string(),
            timeout: Duration::from_millis(20000),
            follow_redirects: true,
            max_redirects: 30,
            verify: true,
        }
    }
}

/// HTTP transport backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
    config: TransportConfig,
}

impl ReqwestTransport {
    /// Create a new transport with the given configuration.
    pub fn new(config: TransportConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!config.verify)
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::HttpError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    /// Wrap an existing client, keeping its headers, proxies, TLS trust and
    /// timeouts.
    ///
    /// The client should have redirects disabled; if it follows them itself,
    /// responses arrive without history and no redirect aliases are written.
    pub fn from_client(http: Client, config: TransportConfig) -> Self {
        Self { http, config }
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn send_once(&self, request: &CachedRequest) -> Result<OriginResponse, TransportError> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", request.url)))?;
        let mut builder = self.http.request(request.method.clone(), url).headers(request.headers.clone());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let start = Instant::now();
        let response = builder.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body: Bytes = response.bytes().await?;
        let elapsed = start.elapsed();

        tracing::debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            bytes = body.len(),
            "fetched from origin"
        );

        Ok(OriginResponse {
            url: final_url,
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            elapsed,
            history: Vec::new(),
            request: request.clone(),
            next: None,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &CachedRequest) -> Result<OriginResponse, Error> {
        let mut history = Vec::new();
        let mut current = request.clone();
        loop {
            let mut response = self.send_once(&current).await?;
            if !response.is_redirect() {
                response.history = history;
                return Ok(response);
            }

            let next = redirect_target(&current, &response)?;
            if !self.config.follow_redirects {
                response.next = Some(next);
                response.history = history;
                return Ok(response);
            }
            if history.len() >= self.config.max_redirects {
                return Err(TransportError::TooManyRedirects(self.config.max_redirects).into());
            }
            tracing::debug!(from = %current.url, to = %next.url, status = response.status, "following redirect");
            history.push(response);
            current = next;
        }
    }
}

/// The request a redirect response points at.
pub fn redirect_target(request: &CachedRequest, response: &OriginResponse) -> Result<CachedRequest, TransportError> {
    let location = headers::get_str(&response.headers, LOCATION.as_str())
        .ok_or_else(|| TransportError::InvalidRedirect("missing Location header".into()))?;
    let base = url::Url::parse(&request.url).map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    let target = base.join(location.trim()).map_err(|e| TransportError::InvalidRedirect(format!("{location}: {e}")))?;

    let mut next = request.clone();
    next.url = target.to_string();

    let to_get = match response.status {
        303 => request.method != Method::HEAD,
        301 | 302 => request.method == Method::POST,
        _ => false,
    };
    if to_get {
        next.method = Method::GET;
        next.body = Bytes::new();
        next.headers.remove(CONTENT_TYPE);
        next.headers.remove(CONTENT_LENGTH);
    }
    if base.host_str() != target.host_str() {
        next.headers.remove(AUTHORIZATION);
    }
    Ok(next)
}
