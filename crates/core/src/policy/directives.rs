//! Parsed view of `Cache-Control` plus the `Expires` and validator headers.

use chrono::{DateTime, TimeDelta, Utc};
use http::header::{self, HeaderMap};

use super::expiration::{ExpireAfter, StaleSetting, parse_http_date};
use crate::models::headers;

/// Cache directives found in a request's or response's headers.
///
/// Absent numeric fields mean "not specified".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub max_age: Option<i64>,
    pub max_stale: Option<i64>,
    pub min_fresh: Option<i64>,
    /// `Expires`; an unparseable value counts as already expired.
    pub expires: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub immutable: bool,
    pub must_revalidate: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub only_if_cached: bool,
    pub stale_if_error: StaleSetting,
    pub stale_while_revalidate: StaleSetting,
}

impl CacheDirectives {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = CacheDirectives {
            expires: headers.get(header::EXPIRES).map(|value| {
                parse_http_date(&headers::value_str(value)).unwrap_or_default()
            }),
            etag: headers::get_str(headers, "etag"),
            last_modified: headers::get_str(headers, "last-modified"),
            ..Default::default()
        };

        for value in headers.get_all(header::CACHE_CONTROL) {
            for token in headers::value_str(value).split(',') {
                let (name, arg) = match token.split_once('=') {
                    Some((name, arg)) => (name, Some(arg.trim().trim_matches('"'))),
                    None => (token, None),
                };
                let seconds = arg.and_then(|a| a.parse::<i64>().ok());
                match name.trim().to_ascii_lowercase().as_str() {
                    "max-age" => directives.max_age = seconds,
                    "max-stale" => directives.max_stale = seconds,
                    "min-fresh" => directives.min_fresh = seconds,
                    "immutable" => directives.immutable = true,
                    "must-revalidate" => directives.must_revalidate = true,
                    "no-cache" => directives.no_cache = true,
                    "no-store" => directives.no_store = true,
                    "only-if-cached" => directives.only_if_cached = true,
                    "stale-if-error" => directives.stale_if_error = stale_arg(seconds),
                    "stale-while-revalidate" => directives.stale_while_revalidate = stale_arg(seconds),
                    _ => {}
                }
            }
        }
        directives
    }

    /// `max-age` as an expiration, if present.
    pub fn max_age_expiration(&self) -> Option<ExpireAfter> {
        self.max_age.map(ExpireAfter::from_seconds)
    }

    /// `Expires` as an expiration, if present.
    pub fn expires_expiration(&self) -> Option<ExpireAfter> {
        self.expires.map(ExpireAfter::At)
    }

    /// Offset applied to a stored expiration: `max-stale` extends it, `min-fresh` shortens it.
    pub fn expire_offset(&self) -> TimeDelta {
        let seconds = match (self.max_stale, self.min_fresh) {
            (Some(max_stale), _) if max_stale != 0 => max_stale,
            (_, Some(min_fresh)) if min_fresh != 0 => -min_fresh,
            _ => 0,
        };
        TimeDelta::try_seconds(seconds).unwrap_or(TimeDelta::MAX)
    }

    pub fn has_validator(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

fn stale_arg(seconds: Option<i64>) -> StaleSetting {
    seconds.map_or(StaleSetting::Any, StaleSetting::from)
}

/// True if the headers carry an `ETag` or `Last-Modified`.
pub fn has_validator(headers: &HeaderMap) -> bool {
    headers.contains_key(header::ETAG) || headers.contains_key(header::LAST_MODIFIED)
}
