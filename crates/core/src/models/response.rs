//! Origin responses and the cached form they are stored as.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http::header::{self, HeaderMap};
use serde::{Deserialize, Serialize};

use super::headers;
use super::request::{CachedRequest, media_type};
use crate::policy::expiration::ExpireAfter;

/// A response as produced by the transport, before it touches the cache.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub url: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
    /// Redirect responses that led here, oldest first.
    pub history: Vec<OriginResponse>,
    /// The request that produced this response (the last hop for redirects).
    pub request: CachedRequest,
    /// Redirect target when the transport stopped following.
    pub next: Option<CachedRequest>,
}

impl OriginResponse {
    pub fn new(request: CachedRequest, status: u16) -> Self {
        Self {
            url: request.url.clone(),
            status,
            reason: canonical_reason(status).to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            elapsed: Duration::ZERO,
            history: Vec::new(),
            request,
            next: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        headers::insert_str(&mut self.headers, name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308) && self.headers.contains_key(header::LOCATION)
    }
}

/// A response as stored in, and served from, the cache.
///
/// The body is always raw bytes. `history` is flat: entries never carry a
/// history of their own. `cache_key` and `from_cache` are transient and never
/// serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub url: String,
    #[serde(rename = "status_code")]
    pub status: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(with = "headers::header_map", default)]
    pub headers: HeaderMap,
    #[serde(rename = "_content", with = "headers::base64_bytes", default)]
    pub content: Bytes,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(with = "headers::duration_secs", default)]
    pub elapsed: Duration,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub history: Vec<CachedResponse>,
    pub request: CachedRequest,
    #[serde(default)]
    pub next: Option<CachedRequest>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revalidated: bool,
    #[serde(skip)]
    pub cache_key: Option<String>,
    #[serde(skip)]
    pub from_cache: bool,
}

impl CachedResponse {
    /// Convert an origin response, flattening nested redirect histories.
    pub fn from_response(response: &OriginResponse, expires: Option<DateTime<Utc>>) -> Self {
        let mut cached = Self::flat(response, expires);
        cached.history = response.history.iter().map(|r| Self::flat(r, None)).collect();
        cached
    }

    fn flat(response: &OriginResponse, expires: Option<DateTime<Utc>>) -> Self {
        Self {
            url: response.url.clone(),
            status: response.status,
            reason: response.reason.clone(),
            headers: response.headers.clone(),
            content: response.body.clone(),
            encoding: charset(&response.headers),
            elapsed: response.elapsed,
            cookies: set_cookies(&response.headers),
            history: Vec::new(),
            request: response.request.clone(),
            next: response.next.clone(),
            created_at: Utc::now(),
            expires,
            revalidated: false,
            cache_key: None,
            from_cache: false,
        }
    }

    /// Synthetic `504 Not Cached` for an `only-if-cached` miss.
    pub fn not_cached(request: &CachedRequest) -> Self {
        Self {
            url: request.url.clone(),
            status: 504,
            reason: "Not Cached".to_string(),
            headers: HeaderMap::new(),
            content: Bytes::new(),
            encoding: None,
            elapsed: Duration::ZERO,
            cookies: BTreeMap::new(),
            history: Vec::new(),
            request: request.clone(),
            next: None,
            created_at: Utc::now(),
            expires: None,
            revalidated: false,
            cache_key: None,
            from_cache: true,
        }
    }

    /// Placeholder emitted by `filter(invalid=true)` for entries that failed to load.
    pub fn invalid_entry(cache_key: &str) -> Self {
        let mut response = Self::not_cached(&CachedRequest::get(""));
        response.reason = String::new();
        response.cache_key = Some(cache_key.to_string());
        response
    }

    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|expires| Utc::now() >= expires)
    }

    /// Time remaining until expiration; `None` for never-expire, zero once expired.
    pub fn ttl(&self) -> Option<TimeDelta> {
        self.expires.map(|expires| (expires - Utc::now()).max(TimeDelta::zero()))
    }

    /// Expiration as Unix seconds, for backends with native TTL columns.
    pub fn expires_unix(&self) -> Option<i64> {
        self.expires.map(|e| e.timestamp())
    }

    /// Recompute `expires` from now. Returns true if it changed.
    pub fn reset_expiration(&mut self, expire_after: ExpireAfter) -> bool {
        let expires = expire_after.expires_at(Utc::now());
        let changed = expires != self.expires;
        self.expires = expires;
        changed
    }

    /// Body size in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Body decoded as UTF-8 (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }

    pub fn content_type(&self) -> Option<String> {
        media_type(&self.headers)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        headers::get_str(&self.headers, name)
    }

    /// Logically always true; kept for parity with streaming responses.
    pub fn content_consumed(&self) -> bool {
        true
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308) && self.headers.contains_key(header::LOCATION)
    }
}

impl fmt::Display for CachedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expires = self.expires.map_or_else(|| "never".to_string(), |e| e.to_rfc3339());
        write!(
            f,
            "<CachedResponse [{}]: {} (created {}, expires {}, {} bytes)>",
            self.status,
            self.url,
            self.created_at.to_rfc3339(),
            expires,
            self.size()
        )
    }
}

fn charset(headers: &HeaderMap) -> Option<String> {
    let content_type = headers::get_str(headers, "content-type")?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    })
}

fn set_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| {
            let raw = headers::value_str(value);
            let first = raw.split(';').next()?;
            let (name, value) = first.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Standard reason phrase for a status code.
pub fn canonical_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}
