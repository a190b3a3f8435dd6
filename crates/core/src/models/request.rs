//! The request half of a cached entry.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::Method;
use http::header::{self, HeaderMap};
use serde::{Deserialize, Serialize};

use super::headers;

/// A prepared request: enough to replay it against the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRequest {
    #[serde(with = "headers::method")]
    pub method: Method,
    pub url: String,
    #[serde(with = "headers::header_map", default)]
    pub headers: HeaderMap,
    #[serde(with = "headers::base64_bytes", default)]
    pub body: Bytes,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl CachedRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: HeaderMap::new(), body: Bytes::new(), cookies: BTreeMap::new() }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Set a header, replacing any previous value. Invalid names or values are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        headers::insert_str(&mut self.headers, name, value);
        if name.eq_ignore_ascii_case("cookie") {
            self.cookies = parse_cookie_header(value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the body and set `Content-Type: application/json`.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("content-type", "application/json").body(body))
    }

    /// Form-encode `pairs` as the body.
    pub fn form<'a>(self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish();
        self.header("content-type", "application/x-www-form-urlencoded").body(body)
    }

    /// Content-Type without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        media_type(&self.headers)
    }

    /// Request host, used for log context.
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url).ok().and_then(|u| u.host_str().map(str::to_string))
    }
}

/// Media type of a header map's `Content-Type`, without parameters, lowercased.
pub fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .map(headers::value_str)
        .and_then(|ct| ct.split(';').next().map(|s| s.trim().to_ascii_lowercase()))
        .filter(|s| !s.is_empty())
}

/// Parse a `Cookie: a=1; b=2` header into a jar.
pub fn parse_cookie_header(value: &str) -> BTreeMap<String, String> {
    value
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_cookie_jar() {
        let req = CachedRequest::get("https://example.com").header("Cookie", "a=1; b=2");
        assert_eq!(req.cookies.get("a").map(String::as_str), Some("1"));
        assert_eq!(req.cookies.len(), 2);
    }

    #[test]
    fn test_json_body() {
        let req = CachedRequest::new(Method::POST, "https://example.com")
            .json(&serde_json::json!({"b": 1, "a": 2}))
            .unwrap();
        assert_eq!(req.content_type().as_deref(), Some("application/json"));
        assert!(!req.body.is_empty());
    }

    #[test]
    fn test_form_body() {
        let req = CachedRequest::new(Method::POST, "https://example.com").form([("q", "rust lang"), ("a", "1")]);
        assert_eq!(req.body, Bytes::from_static(b"q=rust+lang&a=1"));
    }

    #[test]
    fn test_media_type_strips_params() {
        let req = CachedRequest::get("https://example.com").header("Content-Type", "Text/HTML; charset=utf-8");
        assert_eq!(req.content_type().as_deref(), Some("text/html"));
    }
}
