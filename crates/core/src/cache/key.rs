//! Cache key generation.
//!
//! A key is a short BLAKE2b digest over a canonicalised request, so requests
//! that differ only in parameter order, header order, method case, host case,
//! default ports, multipart boundaries or JSON key order share a key. The
//! same normalisation redacts `ignored_parameters` from what gets stored.

use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::Method;
use serde_json::Value;

use crate::models::{CachedRequest, CachedResponse, headers};
use crate::policy::settings::MatchHeaders;

type Blake2b64 = Blake2b<U8>;

/// Replacement value for redacted parameters and headers.
pub const REDACTED: &str = "REDACTED";

/// Bodies larger than this are keyed as raw bytes.
pub const MAX_NORM_BODY_SIZE: usize = 10 * 1024 * 1024;

const FIXED_BOUNDARY: &str = "reqcache-fixed-boundary";

/// Inputs to key generation besides the request itself.
#[derive(Debug, Clone)]
pub struct KeyOptions {
    pub ignored_parameters: Vec<String>,
    pub match_headers: MatchHeaders,
    /// Serializer name; entries written by different serializers never share keys.
    pub serializer: String,
    pub verify: bool,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self { ignored_parameters: Vec::new(), match_headers: MatchHeaders::Disabled, serializer: String::new(), verify: true }
    }
}

/// Compute the cache key for a request.
pub fn create_key(request: &CachedRequest, options: &KeyOptions) -> String {
    let normalized = normalize_request(request, &options.ignored_parameters);
    let matched = matched_headers(&normalized.headers, &options.match_headers);

    let mut hasher = Blake2b64::new();
    let parts: [&[u8]; 4] = [
        normalized.method.as_str().as_bytes(),
        normalized.url.as_bytes(),
        &normalized.body[..],
        if options.verify { b"True".as_slice() } else { &[] },
    ];
    for part in parts {
        if !part.is_empty() {
            hasher.update(part);
        }
    }
    for header in &matched {
        hasher.update(header.as_bytes());
    }
    if !options.serializer.is_empty() {
        hasher.update(options.serializer.as_bytes());
    }

    let key = hex::encode(hasher.finalize());
    tracing::trace!(key = %key, method = %normalized.method, url = %normalized.url, "computed cache key");
    key
}

/// Canonical copy of a request with ignored parameters redacted.
pub fn normalize_request(request: &CachedRequest, ignored: &[String]) -> CachedRequest {
    let mut normalized = request.clone();
    normalized.method = normalize_method(&request.method);
    normalized.url = normalize_url(&request.url, ignored);
    fix_boundary(&mut normalized);
    normalized.body = normalize_body(&normalized, ignored);
    normalized.headers = normalize_headers(&normalized.headers, ignored);
    normalized
}

/// Redact ignored parameters from a response (and its history) before storage.
pub fn redact_response(response: &mut CachedResponse, ignored: &[String]) {
    if ignored.is_empty() {
        return;
    }
    response.url = filter_sort_url(&response.url, ignored);
    response.request = normalize_request(&response.request, ignored);
    for entry in &mut response.history {
        entry.url = filter_sort_url(&entry.url, ignored);
        entry.request = normalize_request(&entry.request, ignored);
    }
}

fn normalize_method(method: &Method) -> Method {
    Method::from_bytes(method.as_str().to_ascii_uppercase().as_bytes()).unwrap_or_else(|_| method.clone())
}

/// Sort and redact the query string, then canonicalise scheme, host, port and encoding.
///
/// Unparseable URLs are returned with only the query handling applied.
pub fn normalize_url(raw: &str, ignored: &[String]) -> String {
    let filtered = filter_sort_url(raw.trim(), ignored);
    match url::Url::parse(&filtered) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            if parsed.query() == Some("") {
                parsed.set_query(None);
            }
            normalize_percent_encoding(parsed.as_str())
        }
        Err(_) => filtered,
    }
}

/// Uppercase percent-escapes and decode the ones for unreserved characters.
///
/// Expects a serialized `url::Url`, which is always ASCII.
fn normalize_percent_encoding(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos + 1..pos + 3).filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()));
        match escape.and_then(|hex| u8::from_str_radix(hex, 16).ok().map(|byte| (hex, byte))) {
            Some((_, byte)) if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) => {
                out.push(char::from(byte));
                rest = &rest[pos + 3..];
            }
            Some((hex, _)) => {
                out.push('%');
                out.push_str(&hex.to_ascii_uppercase());
                rest = &rest[pos + 3..];
            }
            None => {
                out.push('%');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn filter_sort_url(raw: &str, ignored: &[String]) -> String {
    let (without_fragment, _) = raw.split_once('#').unwrap_or((raw, ""));
    match without_fragment.split_once('?') {
        Some((base, query)) => {
            let query = filter_sort_pairs(query, ignored);
            if query.is_empty() { base.to_string() } else { format!("{base}?{query}") }
        }
        None => without_fragment.to_string(),
    }
}

/// Sort `k=v&k2` style pairs and redact ignored names. Value-less keys follow the pairs.
fn filter_sort_pairs(raw: &str, ignored: &[String]) -> String {
    let mut pairs: Vec<(String, String, String)> = Vec::new();
    let mut bare: Vec<(String, String)> = Vec::new();
    for piece in raw.split('&').filter(|p| !p.is_empty()) {
        match piece.split_once('=') {
            Some((name, value)) => {
                let decoded = decode_component(name);
                let value = if is_ignored(&decoded, ignored) { REDACTED.to_string() } else { value.to_string() };
                pairs.push((decoded, name.to_string(), value));
            }
            None => bare.push((decode_component(piece), piece.to_string())),
        }
    }
    pairs.sort();
    bare.sort();
    pairs
        .into_iter()
        .map(|(_, name, value)| format!("{name}={value}"))
        .chain(bare.into_iter().map(|(_, name)| name))
        .collect::<Vec<_>>()
        .join("&")
}

fn decode_component(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}

fn is_ignored(name: &str, ignored: &[String]) -> bool {
    ignored.iter().any(|i| i.eq_ignore_ascii_case(name))
}

/// Redact ignored headers and sort the elements of comma-separated values.
pub fn normalize_headers(headers: &HeaderMap, ignored: &[String]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers::to_pairs(headers) {
        let value = if is_ignored(&name, ignored) {
            REDACTED.to_string()
        } else if value.contains(',') {
            let mut elements: Vec<String> = value
                .split(',')
                .map(|v| v.trim().to_ascii_lowercase())
                .filter(|v| !v.is_empty())
                .collect();
            elements.sort();
            elements.join(", ")
        } else {
            value
        };
        headers::insert_str(&mut out, &name, &value);
    }
    out
}

fn normalize_body(request: &CachedRequest, ignored: &[String]) -> Bytes {
    let body = &request.body;
    let Some(content_type) = request.content_type() else {
        return body.clone();
    };
    if body.is_empty() || body.len() > MAX_NORM_BODY_SIZE {
        return body.clone();
    }
    if is_json_type(&content_type) {
        if body.len() < 3 {
            return body.clone();
        }
        return match serde_json::from_slice::<Value>(body) {
            Ok(value) => serde_json::to_vec(&filter_sort_json(value, ignored)).map(Bytes::from).unwrap_or_else(|_| body.clone()),
            Err(_) => body.clone(),
        };
    }
    if content_type == "application/x-www-form-urlencoded" {
        return match std::str::from_utf8(body) {
            Ok(text) => Bytes::from(filter_sort_pairs(text, ignored)),
            Err(_) => body.clone(),
        };
    }
    body.clone()
}

/// True for `application/json` and vendor types such as `application/vnd.api+json`.
pub fn is_json_type(content_type: &str) -> bool {
    content_type.starts_with("application/") && content_type.contains("json")
}

fn filter_sort_json(value: Value, ignored: &[String]) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| {
                        let v = if is_ignored(&k, ignored) { Value::String(REDACTED.into()) } else { filter_sort_json(v, ignored) };
                        (k, v)
                    })
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(|v| filter_sort_json(v, ignored)).collect()),
        other => other,
    }
}

/// Swap a multipart boundary for a fixed token so the body hashes deterministically.
fn fix_boundary(request: &mut CachedRequest) {
    let Some(content_type) = headers::get_str(&request.headers, "content-type") else {
        return;
    };
    if !content_type.to_ascii_lowercase().starts_with("multipart/") {
        return;
    }
    let Some(boundary) = content_type.split(';').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim().eq_ignore_ascii_case("boundary").then(|| value.trim().trim_matches('"').to_string())
    }) else {
        return;
    };
    if boundary.is_empty() || boundary == FIXED_BOUNDARY {
        return;
    }

    let body = replace_bytes(&request.body, boundary.as_bytes(), FIXED_BOUNDARY.as_bytes());
    request.body = Bytes::from(body);
    if let Ok(value) = HeaderValue::from_str(&content_type.replace(&boundary, FIXED_BOUNDARY)) {
        request.headers.insert(header::CONTENT_TYPE, value);
    }
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// `name=value` strings for the headers selected by `match_headers`, sorted by name.
pub fn matched_headers(headers: &HeaderMap, match_headers: &MatchHeaders) -> Vec<String> {
    let pairs = headers::to_pairs(headers);
    match match_headers {
        MatchHeaders::Disabled => Vec::new(),
        MatchHeaders::All => pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
        MatchHeaders::Only(names) => {
            let mut names: Vec<String> = names.iter().map(|n| n.to_ascii_lowercase()).collect();
            names.sort();
            names.dedup();
            names
                .iter()
                .filter_map(|name| pairs.iter().find(|(k, _)| k == name).map(|(k, v)| format!("{k}={v}")))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(request: &CachedRequest) -> String {
        create_key(request, &KeyOptions::default())
    }

    #[test]
    fn test_key_stability_and_format() {
        let req = CachedRequest::get("https://example.com/items?a=1");
        let k1 = key(&req);
        assert_eq!(k1, key(&req));
        assert_eq!(k1.len(), 16);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_query_order_method_case_host_case_and_port() {
        let a = CachedRequest::get("https://api.example.com/v1/items?b=2&a=1");
        let b = CachedRequest::new(Method::from_bytes(b"get").unwrap(), "HTTPS://API.Example.com:443/v1/items?a=1&b=2");
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn test_normalized_url_orders_query() {
        assert_eq!(
            normalize_url("https://api.example.com/v1/items?b=2&a=1", &[]),
            "https://api.example.com/v1/items?a=1&b=2"
        );
        assert_eq!(normalize_url("https://example.com/?flag&b=1#frag", &[]), "https://example.com/?b=1&flag");
    }

    #[test]
    fn test_percent_encoding_normalized() {
        assert_eq!(normalize_url("https://example.com/a%2fb/%7euser?q=%c3%a9&tag=%41", &[]), "https://example.com/a%2Fb/~user?q=%C3%A9&tag=A");
        assert_eq!(normalize_url("https://example.com/100%", &[]), "https://example.com/100%");

        let encoded = CachedRequest::get("https://example.com/%7Euser/a%2fb");
        let plain = CachedRequest::get("https://example.com/~user/a%2Fb");
        assert_eq!(key(&encoded), key(&plain));
    }

    #[test]
    fn test_idn_host_normalized_to_punycode() {
        assert_eq!(normalize_url("https://Bücher.Example/katalog", &[]), "https://xn--bcher-kva.example/katalog");
        let unicode = CachedRequest::get("https://bücher.example/katalog");
        let ascii = CachedRequest::get("https://XN--BCHER-KVA.example/katalog");
        assert_eq!(key(&unicode), key(&ascii));
    }

    #[test]
    fn test_ignored_parameters_redacted_in_query() {
        let ignored = vec!["api_key".to_string()];
        let url = normalize_url("https://example.com/?api_key=secret&q=rust", &ignored);
        assert_eq!(url, "https://example.com/?api_key=REDACTED&q=rust");

        let opts = KeyOptions { ignored_parameters: ignored, ..Default::default() };
        let a = CachedRequest::get("https://example.com/?api_key=one&q=rust");
        let b = CachedRequest::get("https://example.com/?q=rust&api_key=two");
        assert_eq!(create_key(&a, &opts), create_key(&b, &opts));
    }

    #[test]
    fn test_json_body_key_order() {
        let a = CachedRequest::new(Method::POST, "https://example.com")
            .header("content-type", "application/json")
            .body(r#"{"b": 1, "a": {"y": 2, "x": 1}}"#);
        let b = CachedRequest::new(Method::POST, "https://example.com")
            .header("content-type", "application/json")
            .body(r#"{"a":{"x":1,"y":2},"b":1}"#);
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn test_vendor_json_and_redaction() {
        let req = CachedRequest::new(Method::POST, "https://example.com")
            .header("content-type", "application/vnd.api+json")
            .body(r#"{"token": "abc", "q": 1}"#);
        let normalized = normalize_request(&req, &["token".to_string()]);
        assert_eq!(&normalized.body[..], br#"{"q":1,"token":"REDACTED"}"#);
    }

    #[test]
    fn test_malformed_json_falls_back_to_bytes() {
        let req = CachedRequest::new(Method::POST, "https://example.com")
            .header("content-type", "application/json")
            .body("{not json");
        assert_eq!(normalize_request(&req, &[]).body, req.body);
    }

    #[test]
    fn test_large_body_not_normalized_but_keyed() {
        let mut big = vec![b' '; MAX_NORM_BODY_SIZE + 1];
        big[0] = b'{';
        let req = CachedRequest::new(Method::POST, "https://example.com")
            .header("content-type", "application/json")
            .body(big);
        assert_eq!(normalize_request(&req, &[]).body.len(), MAX_NORM_BODY_SIZE + 1);
        assert_eq!(key(&req).len(), 16);
    }

    #[test]
    fn test_form_body_sorted_with_bare_keys_last() {
        let req = CachedRequest::new(Method::POST, "https://example.com")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("z=1&flag&a=2&password=hunter2");
        let normalized = normalize_request(&req, &["password".to_string()]);
        assert_eq!(&normalized.body[..], b"a=2&password=REDACTED&z=1&flag");
    }

    #[test]
    fn test_multipart_boundary_ignored() {
        let make = |boundary: &str| {
            CachedRequest::new(Method::POST, "https://example.com/upload")
                .header("content-type", &format!("multipart/form-data; boundary={boundary}"))
                .body(format!("--{boundary}\r\ncontent-disposition: form-data; name=\"f\"\r\n\r\nx\r\n--{boundary}--\r\n"))
        };
        assert_eq!(key(&make("aaaa1111")), key(&make("bbbb2222")));
    }

    #[test]
    fn test_header_normalization() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/HTML, application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer x"));
        let normalized = normalize_headers(&headers, &["Authorization".to_string()]);
        assert_eq!(normalized.get("accept").unwrap(), "application/json, text/html");
        assert_eq!(normalized.get("authorization").unwrap(), REDACTED);
    }

    #[test]
    fn test_match_headers() {
        let opts = KeyOptions { match_headers: MatchHeaders::only(["Accept-Language"]).unwrap(), ..Default::default() };
        let en = CachedRequest::get("https://example.com").header("Accept-Language", "en");
        let fr = CachedRequest::get("https://example.com").header("Accept-Language", "fr");
        let en_other = en.clone().header("X-Trace", "1");
        assert_ne!(create_key(&en, &opts), create_key(&fr, &opts));
        assert_eq!(create_key(&en, &opts), create_key(&en_other, &opts));
        assert_eq!(key(&en), key(&fr));

        let all = KeyOptions { match_headers: MatchHeaders::All, ..Default::default() };
        assert_ne!(create_key(&en, &all), create_key(&en_other, &all));
    }

    #[test]
    fn test_serializer_and_verify_change_key() {
        let req = CachedRequest::get("https://example.com");
        let json = KeyOptions { serializer: "json".into(), ..Default::default() };
        let yaml = KeyOptions { serializer: "yaml".into(), ..Default::default() };
        let unverified = KeyOptions { verify: false, ..Default::default() };
        assert_ne!(create_key(&req, &json), create_key(&req, &yaml));
        assert_ne!(key(&req), create_key(&req, &unverified));
    }

    #[test]
    fn test_invalid_url_does_not_panic() {
        let req = CachedRequest::get("not a url?b=1&a=2");
        assert_eq!(normalize_url(&req.url, &[]), "not a url?a=2&b=1");
        assert_eq!(key(&req).len(), 16);
    }

    proptest! {
        #[test]
        fn prop_query_order_invariant(params in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 1..6)) {
            let forward: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let backward: Vec<String> = forward.iter().rev().cloned().collect();
            let a = CachedRequest::get(format!("https://example.com/p?{}", forward.join("&")));
            let b = CachedRequest::get(format!("https://example.com/p?{}", backward.join("&")));
            prop_assert_eq!(key(&a), key(&b));
        }

        #[test]
        fn prop_header_order_invariant(values in proptest::collection::vec("[a-z]{1,8}", 1..5)) {
            let opts = KeyOptions { match_headers: MatchHeaders::All, ..Default::default() };
            let forward = values.join(", ");
            let backward = values.iter().rev().cloned().collect::<Vec<_>>().join(",");
            let a = CachedRequest::get("https://example.com").header("accept", &forward).header("x-a", "1");
            let b = CachedRequest::get("https://example.com").header("x-a", "1").header("accept", &backward);
            prop_assert_eq!(create_key(&a, &opts), create_key(&b, &opts));
        }
    }
}
