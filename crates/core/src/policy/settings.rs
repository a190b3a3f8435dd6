//! Session-wide cache settings, mutable at runtime.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use http::{HeaderName, Method};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::expiration::{ExpireAfter, StaleSetting, UrlExpiration};
use crate::Error;
use crate::cache::key::KeyOptions;
use crate::models::{CachedRequest, CachedResponse};

/// Predicate deciding whether a response may be stored.
pub type FilterFn = Arc<dyn Fn(&CachedResponse) -> bool + Send + Sync>;

/// Replacement for the default key function.
pub type KeyFn = Arc<dyn Fn(&CachedRequest, &KeyOptions) -> String + Send + Sync>;

/// Which request headers take part in the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchHeaders {
    #[default]
    Disabled,
    All,
    Only(Vec<String>),
}

impl MatchHeaders {
    /// Build a header list, rejecting names that are not valid header tokens.
    pub fn only<I, S>(names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(Error::Config(format!("invalid match_headers entry: {name:?}")));
            }
            out.push(name.to_ascii_lowercase());
        }
        Ok(MatchHeaders::Only(out))
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self {
            MatchHeaders::Only(names) => MatchHeaders::only(names).map(|_| ()),
            _ => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawMatchHeaders {
    Flag(bool),
    Names(Vec<String>),
}

impl Serialize for MatchHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MatchHeaders::Disabled => RawMatchHeaders::Flag(false),
            MatchHeaders::All => RawMatchHeaders::Flag(true),
            MatchHeaders::Only(names) => RawMatchHeaders::Names(names.clone()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MatchHeaders {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawMatchHeaders::deserialize(deserializer)? {
            RawMatchHeaders::Flag(true) => Ok(MatchHeaders::All),
            RawMatchHeaders::Flag(false) => Ok(MatchHeaders::Disabled),
            RawMatchHeaders::Names(names) => MatchHeaders::only(names).map_err(serde::de::Error::custom),
        }
    }
}

/// Settings that drive the policy engine and key builder.
#[derive(Clone)]
pub struct CacheSettings {
    pub allowable_codes: BTreeSet<u16>,
    pub allowable_methods: Vec<Method>,
    pub always_revalidate: bool,
    /// Honour response `Cache-Control` and `Expires`.
    pub cache_control: bool,
    pub disabled: bool,
    pub expire_after: ExpireAfter,
    /// Checked in order; the first matching pattern wins.
    pub urls_expire_after: Vec<UrlExpiration>,
    pub filter_fn: Option<FilterFn>,
    pub key_fn: Option<KeyFn>,
    pub ignored_parameters: Vec<String>,
    pub match_headers: MatchHeaders,
    pub only_if_cached: bool,
    pub stale_if_error: StaleSetting,
    pub stale_while_revalidate: StaleSetting,
    /// TLS verification of the transport; part of the cache key.
    pub verify: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            allowable_codes: BTreeSet::from([200]),
            allowable_methods: vec![Method::GET, Method::HEAD],
            always_revalidate: false,
            cache_control: false,
            disabled: false,
            expire_after: ExpireAfter::Never,
            urls_expire_after: Vec::new(),
            filter_fn: None,
            key_fn: None,
            ignored_parameters: Vec::new(),
            match_headers: MatchHeaders::Disabled,
            only_if_cached: false,
            stale_if_error: StaleSetting::Disabled,
            stale_while_revalidate: StaleSetting::Disabled,
            verify: true,
        }
    }
}

impl CacheSettings {
    pub fn is_method_allowed(&self, method: &Method) -> bool {
        self.allowable_methods.iter().any(|m| m == method)
    }

    pub fn is_status_allowed(&self, status: u16) -> bool {
        self.allowable_codes.contains(&status)
    }

    /// Run the filter callback; no callback means everything passes.
    pub fn passes_filter(&self, response: &CachedResponse) -> bool {
        self.filter_fn.as_ref().is_none_or(|f| f(response))
    }

    pub fn with_filter(mut self, filter: impl Fn(&CachedResponse) -> bool + Send + Sync + 'static) -> Self {
        self.filter_fn = Some(Arc::new(filter));
        self
    }

    pub fn with_key_fn(mut self, key_fn: impl Fn(&CachedRequest, &KeyOptions) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Options for the key builder.
    pub fn key_options(&self, serializer: &str) -> KeyOptions {
        KeyOptions {
            ignored_parameters: self.ignored_parameters.clone(),
            match_headers: self.match_headers.clone(),
            serializer: serializer.to_string(),
            verify: self.verify,
        }
    }

    /// Append a URL pattern after any existing ones.
    pub fn with_url_expiration(mut self, pattern: &str, expire_after: ExpireAfter) -> Result<Self, Error> {
        self.urls_expire_after.push(UrlExpiration::new(pattern, expire_after)?);
        Ok(self)
    }
}

impl fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSettings")
            .field("allowable_codes", &self.allowable_codes)
            .field("allowable_methods", &self.allowable_methods)
            .field("always_revalidate", &self.always_revalidate)
            .field("cache_control", &self.cache_control)
            .field("disabled", &self.disabled)
            .field("expire_after", &self.expire_after)
            .field("urls_expire_after", &self.urls_expire_after.len())
            .field("filter_fn", &self.filter_fn.is_some())
            .field("key_fn", &self.key_fn.is_some())
            .field("ignored_parameters", &self.ignored_parameters)
            .field("match_headers", &self.match_headers)
            .field("only_if_cached", &self.only_if_cached)
            .field("stale_if_error", &self.stale_if_error)
            .field("stale_while_revalidate", &self.stale_while_revalidate)
            .field("verify", &self.verify)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert!(settings.is_status_allowed(200));
        assert!(!settings.is_status_allowed(404));
        assert!(settings.is_method_allowed(&Method::HEAD));
        assert!(!settings.is_method_allowed(&Method::POST));
        assert_eq!(settings.expire_after, ExpireAfter::Never);
    }

    #[test]
    fn test_match_headers_validation() {
        assert!(MatchHeaders::only(["Accept", "accept-language"]).is_ok());
        assert!(MatchHeaders::only(["bad header"]).is_err());
        assert!(MatchHeaders::only([""]).is_err());
    }

    #[test]
    fn test_match_headers_deserialize() {
        let m: MatchHeaders = serde_json::from_str("true").unwrap();
        assert_eq!(m, MatchHeaders::All);
        let m: MatchHeaders = serde_json::from_str("[\"Accept\"]").unwrap();
        assert_eq!(m, MatchHeaders::Only(vec!["accept".into()]));
        assert!(serde_json::from_str::<MatchHeaders>("[\"no good\"]").is_err());
    }

    #[test]
    fn test_filter_fn() {
        let settings = CacheSettings::default().with_filter(|r| r.size() < 4);
        let req = CachedRequest::get("https://example.com");
        let small = CachedResponse::from_response(
            &crate::models::OriginResponse::new(req.clone(), 200).body("abc"),
            None,
        );
        let large = CachedResponse::from_response(&crate::models::OriginResponse::new(req, 200).body("abcdef"), None);
        assert!(settings.passes_filter(&small));
        assert!(!settings.passes_filter(&large));
    }
}
