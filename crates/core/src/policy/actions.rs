//! The per-request cache decision.
//!
//! [`CacheActions`] is built in stages as a request moves through a session:
//! [`CacheActions::from_request`] before the cache is read,
//! [`CacheActions::update_from_cached_response`] after it is read,
//! [`CacheActions::update_from_response`] after the origin answers, and
//! [`CacheActions::update_revalidated_response`] when that answer is a 304.
//!
//! A request sending `Cache-Control: must-revalidate` is treated as a user
//! refresh: the stored entry is revalidated even if it is still fresh.

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, VARY};

use super::directives::{CacheDirectives, has_validator};
use super::expiration::{ExpireAfter, StaleSetting, url_expiration};
use super::settings::{CacheSettings, MatchHeaders};
use crate::models::{CachedRequest, CachedResponse, OriginResponse, headers};

/// What to do with one request. Consumed once.
#[derive(Debug, Clone)]
pub struct CacheActions {
    pub cache_key: String,
    /// Nothing usable is cached and the network may not be used.
    pub error_504: bool,
    pub expire_after: ExpireAfter,
    /// Nothing usable is cached, or a conditional request is needed.
    pub send_request: bool,
    /// A cached entry exists but is stale; a failed resend may fall back to it.
    /// Takes precedence over `send_request` when both are set.
    pub resend_request: bool,
    /// Serve the stale entry now and refresh it in the background.
    pub resend_async: bool,
    pub skip_read: bool,
    pub skip_write: bool,
    request: CachedRequest,
    directives: CacheDirectives,
    settings: CacheSettings,
    request_expire_after: Option<ExpireAfter>,
    url_expire_after: Option<ExpireAfter>,
    only_if_cached: bool,
    refresh: bool,
    stale_if_error: StaleSetting,
    stale_while_revalidate: StaleSetting,
    validation_headers: HeaderMap,
}

impl CacheActions {
    /// Initial actions from request headers and session settings.
    pub fn from_request(cache_key: impl Into<String>, request: &CachedRequest, settings: &CacheSettings) -> Self {
        let directives = CacheDirectives::from_headers(&request.headers);
        let request_expire_after = directives.max_age_expiration();
        let url_expire_after = url_expiration(&request.url, &settings.urls_expire_after);
        let expire_after = request_expire_after.or(url_expire_after).unwrap_or(settings.expire_after);

        let refresh = directives.max_age == Some(0) || directives.must_revalidate;
        let only_if_cached = settings.only_if_cached || directives.only_if_cached;

        let disabled_method = !settings.is_method_allowed(&request.method);
        let skip_read = settings.disabled
            || disabled_method
            || directives.no_cache
            || directives.no_store
            || expire_after.is_do_not_cache();
        tracing::debug!(
            disabled = settings.disabled,
            disabled_method,
            no_cache = directives.no_cache,
            no_store = directives.no_store,
            expire_after = %expire_after,
            skip_read,
            "read criteria"
        );

        Self {
            cache_key: cache_key.into(),
            error_504: false,
            expire_after,
            send_request: false,
            resend_request: false,
            resend_async: false,
            skip_read,
            skip_write: directives.no_store,
            request: request.clone(),
            stale_if_error: settings.stale_if_error.or(directives.stale_if_error),
            stale_while_revalidate: settings.stale_while_revalidate.or(directives.stale_while_revalidate),
            directives,
            settings: settings.clone(),
            request_expire_after,
            url_expire_after,
            only_if_cached,
            refresh,
            validation_headers: HeaderMap::new(),
        }
    }

    /// Decide what to do given what was read from the cache.
    ///
    /// `create_key` recomputes a key restricted to the given headers; it is
    /// used to compare the request against a stored response's `Vary`.
    pub fn update_from_cached_response<F>(&mut self, cached: Option<&CachedResponse>, create_key: F)
    where
        F: Fn(&CachedRequest, &MatchHeaders) -> String,
    {
        if let Some(cached) = cached.filter(|_| self.settings.cache_control) {
            let stored = CacheDirectives::from_headers(&cached.headers);
            self.stale_if_error = self.stale_if_error.or(stored.stale_if_error);
            self.stale_while_revalidate = self.stale_while_revalidate.or(stored.stale_while_revalidate);
        }

        let usable = self.is_usable(cached, false);
        let usable_if_error = self.is_usable(cached, true);

        match cached {
            _ if !usable && self.only_if_cached && !usable_if_error => self.error_504 = true,
            None => self.send_request = true,
            Some(cached) if !self.vary_matches(cached, &create_key) => self.send_request = true,
            Some(cached) if cached.is_expired() && usable && self.stale_while_revalidate.is_enabled() => {
                self.resend_async = true
            }
            Some(_) if !usable => self.resend_request = true,
            Some(_) => {}
        }

        if self.only_if_cached {
            // The network is off limits: a Vary mismatch cannot be served, a stale entry can.
            if self.send_request {
                self.error_504 = true;
            }
            self.send_request = false;
            self.resend_request = false;
            self.resend_async = false;
        } else if let Some(cached) = cached {
            self.update_validation_headers(cached);
        }
        tracing::debug!(
            key = %self.cache_key,
            error_504 = self.error_504,
            send_request = self.send_request,
            resend_request = self.resend_request,
            resend_async = self.resend_async,
            "post-read cache actions"
        );
    }

    /// True if the cached response may be served for this request.
    ///
    /// With `error` set, the check is for a fallback after a failed request.
    pub fn is_usable(&self, cached: Option<&CachedResponse>, error: bool) -> bool {
        let Some(cached) = cached else {
            return false;
        };
        let Some(expires) = cached.expires else {
            return true;
        };
        let expired = cached.is_expired();
        if (expired && self.stale_while_revalidate == StaleSetting::Any)
            || (error && self.stale_if_error == StaleSetting::Any)
        {
            return true;
        }

        let offset = match (self.stale_if_error, self.stale_while_revalidate) {
            (StaleSetting::Within(limit), _) if error => limit,
            (_, StaleSetting::Within(limit)) if expired => limit,
            _ => self.directives.expire_offset(),
        };
        let deadline = expires.checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Utc::now() < deadline
    }

    /// Refine expiration and write permission from a fresh origin response.
    pub fn update_from_response(&mut self, response: &OriginResponse) {
        let directives = CacheDirectives::from_headers(&response.headers);
        if self.settings.cache_control {
            tracing::debug!(?directives, "response cache directives");
            self.stale_if_error = self.stale_if_error.or(directives.stale_if_error);
            self.expire_after = if directives.immutable {
                ExpireAfter::Never
            } else {
                self.request_expire_after
                    .or(self.url_expire_after)
                    .or(directives.max_age_expiration())
                    .or(directives.expires_expiration())
                    .unwrap_or(self.settings.expire_after)
            };
        }

        let now = Utc::now();
        let skip_stale = self.expire_after.is_immediate(now) && !has_validator(&response.headers);
        let do_not_cache = self.expire_after.is_do_not_cache();
        let filtered_out = self.settings.filter_fn.as_ref().is_some_and(|filter| {
            let candidate = CachedResponse::from_response(response, None);
            !filter(&candidate)
        });
        let disabled_method = !self.settings.is_method_allowed(&self.request.method);
        let disabled_status = !self.settings.is_status_allowed(response.status);

        let by_headers = self.skip_write || directives.no_store;
        self.skip_write = self.settings.disabled
            || disabled_method
            || disabled_status
            || filtered_out
            || by_headers
            || do_not_cache
            || skip_stale;
        tracing::debug!(
            disabled = self.settings.disabled,
            disabled_method,
            disabled_status,
            filtered_out,
            by_headers,
            do_not_cache,
            skip_stale,
            skip_write = self.skip_write,
            "write criteria"
        );
    }

    /// Merge a 304 into the stored response.
    ///
    /// The write is skipped when neither headers nor expiration changed.
    pub fn update_revalidated_response(&mut self, response: &OriginResponse, mut cached: CachedResponse) -> CachedResponse {
        let previous_headers = cached.headers.clone();
        let previous_expires = cached.expires;

        for name in response.headers.keys() {
            cached.headers.remove(name);
            for value in response.headers.get_all(name) {
                cached.headers.append(name.clone(), value.clone());
            }
        }
        cached.expires = self.expires();
        cached.revalidated = true;

        let changed = cached.headers != previous_headers || cached.expires != previous_expires;
        self.skip_write = !changed;
        tracing::debug!(key = %self.cache_key, changed, "revalidated cached response");
        cached
    }

    /// Absolute expiration for a response saved now.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expire_after.expires_at(Utc::now())
    }

    /// Conditional headers to add to the outgoing request.
    pub fn validation_headers(&self) -> &HeaderMap {
        &self.validation_headers
    }

    pub fn only_if_cached(&self) -> bool {
        self.only_if_cached
    }

    pub fn stale_if_error(&self) -> StaleSetting {
        self.stale_if_error
    }

    pub fn request(&self) -> &CachedRequest {
        &self.request
    }

    fn vary_matches<F>(&self, cached: &CachedResponse, create_key: &F) -> bool
    where
        F: Fn(&CachedRequest, &MatchHeaders) -> String,
    {
        let Some(vary) = cached.headers.get(VARY).map(headers::value_str) else {
            return true;
        };
        if vary.trim() == "*" {
            return false;
        }
        let names: Vec<String> = vary
            .split(',')
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            return true;
        }
        let match_headers = MatchHeaders::Only(names);
        let matched = create_key(&cached.request, &match_headers) == create_key(&self.request, &match_headers);
        if !matched {
            tracing::debug!(key = %self.cache_key, vary = %vary, "request headers do not match Vary");
        }
        matched
    }

    fn update_validation_headers(&mut self, cached: &CachedResponse) {
        let stored = CacheDirectives::from_headers(&cached.headers);
        let response_requires = self.settings.cache_control && (stored.no_cache || stored.must_revalidate);
        let revalidate = stored.has_validator()
            && (cached.is_expired() || self.refresh || self.settings.always_revalidate || response_requires);
        if !revalidate {
            return;
        }

        if let Some(etag) = stored.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            self.validation_headers.insert(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = stored.last_modified.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            self.validation_headers.insert(IF_MODIFIED_SINCE, modified);
        }
        // An expired entry keeps `resend_request` so a failed revalidation can still fall back to it.
        if !self.validation_headers.is_empty() {
            self.send_request = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{KeyOptions, create_key};
    use chrono::TimeDelta;
    use http::Method;

    const URL: &str = "https://api.example.com/v1/items";

    fn key_fn(request: &CachedRequest, match_headers: &MatchHeaders) -> String {
        create_key(request, &KeyOptions { match_headers: match_headers.clone(), ..Default::default() })
    }

    fn cached(expires_in: Option<i64>, headers: &[(&str, &str)]) -> CachedResponse {
        let mut origin = OriginResponse::new(CachedRequest::get(URL), 200).body("cached");
        for (name, value) in headers {
            origin = origin.header(name, value);
        }
        let expires = expires_in.map(|secs| Utc::now() + TimeDelta::seconds(secs));
        CachedResponse::from_response(&origin, expires)
    }

    fn actions(request: &CachedRequest, settings: &CacheSettings) -> CacheActions {
        CacheActions::from_request("key", request, settings)
    }

    #[test]
    fn test_expire_after_precedence_on_request() {
        let settings = CacheSettings { expire_after: ExpireAfter::seconds(10), ..Default::default() }
            .with_url_expiration("api.example.com", ExpireAfter::seconds(20))
            .unwrap();

        let a = actions(&CachedRequest::get(URL), &settings);
        assert_eq!(a.expire_after, ExpireAfter::seconds(20));

        let a = actions(&CachedRequest::get(URL).header("cache-control", "max-age=30"), &settings);
        assert_eq!(a.expire_after, ExpireAfter::seconds(30));

        let a = actions(&CachedRequest::get("https://other.example.com"), &settings);
        assert_eq!(a.expire_after, ExpireAfter::seconds(10));
    }

    #[test]
    fn test_skip_read_criteria() {
        let settings = CacheSettings::default();
        assert!(!actions(&CachedRequest::get(URL), &settings).skip_read);
        assert!(actions(&CachedRequest::new(Method::POST, URL), &settings).skip_read);
        assert!(actions(&CachedRequest::get(URL).header("cache-control", "no-cache"), &settings).skip_read);

        let a = actions(&CachedRequest::get(URL).header("cache-control", "no-store"), &settings);
        assert!(a.skip_read);
        assert!(a.skip_write);

        let disabled = CacheSettings { disabled: true, ..Default::default() };
        assert!(actions(&CachedRequest::get(URL), &disabled).skip_read);

        let do_not_cache = CacheSettings { expire_after: ExpireAfter::DoNotCache, ..Default::default() };
        assert!(actions(&CachedRequest::get(URL), &do_not_cache).skip_read);
    }

    #[test]
    fn test_miss_sends_request() {
        let mut a = actions(&CachedRequest::get(URL), &CacheSettings::default());
        a.update_from_cached_response(None, key_fn);
        assert!(a.send_request);
        assert!(!a.error_504);
    }

    #[test]
    fn test_only_if_cached_miss_is_504() {
        let req = CachedRequest::get(URL).header("cache-control", "only-if-cached");
        let mut a = actions(&req, &CacheSettings::default());
        a.update_from_cached_response(None, key_fn);
        assert!(a.error_504);
        assert!(!a.send_request);
    }

    #[test]
    fn test_only_if_cached_serves_stale_when_stale_if_error_allows() {
        let settings = CacheSettings { only_if_cached: true, stale_if_error: StaleSetting::Any, ..Default::default() };
        let stale = cached(Some(-60), &[]);
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_cached_response(Some(&stale), key_fn);
        assert!(!a.error_504);
        assert!(!a.send_request && !a.resend_request);
    }

    #[test]
    fn test_fresh_hit_needs_nothing() {
        let fresh = cached(Some(60), &[]);
        let mut a = actions(&CachedRequest::get(URL), &CacheSettings::default());
        a.update_from_cached_response(Some(&fresh), key_fn);
        assert!(!a.send_request && !a.resend_request && !a.resend_async && !a.error_504);
    }

    #[test]
    fn test_expired_without_validator_resends() {
        let stale = cached(Some(-1), &[]);
        let mut a = actions(&CachedRequest::get(URL), &CacheSettings::default());
        a.update_from_cached_response(Some(&stale), key_fn);
        assert!(a.resend_request);
        assert!(a.validation_headers().is_empty());
    }

    #[test]
    fn test_expired_with_etag_sets_validation_headers() {
        let stale = cached(Some(-1), &[("etag", "\"abc\""), ("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT")]);
        let mut a = actions(&CachedRequest::get(URL), &CacheSettings::default());
        a.update_from_cached_response(Some(&stale), key_fn);
        assert!(a.send_request);
        assert!(a.resend_request);
        assert_eq!(a.validation_headers().get(IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert!(a.validation_headers().contains_key(IF_MODIFIED_SINCE));
    }

    #[test]
    fn test_refresh_revalidates_fresh_entry() {
        let fresh = cached(Some(60), &[("etag", "\"abc\"")]);
        let req = CachedRequest::get(URL).header("cache-control", "must-revalidate");
        let mut a = actions(&req, &CacheSettings::default());
        a.update_from_cached_response(Some(&fresh), key_fn);
        assert!(a.send_request);
        assert!(!a.resend_request);
        assert!(a.validation_headers().contains_key(IF_NONE_MATCH));
    }

    #[test]
    fn test_always_revalidate() {
        let fresh = cached(Some(60), &[("etag", "\"abc\"")]);
        let settings = CacheSettings { always_revalidate: true, ..Default::default() };
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_cached_response(Some(&fresh), key_fn);
        assert!(a.send_request);
    }

    #[test]
    fn test_response_no_cache_revalidates_only_with_cache_control() {
        let fresh = cached(None, &[("etag", "\"abc\""), ("cache-control", "no-cache")]);
        let mut a = actions(&CachedRequest::get(URL), &CacheSettings::default());
        a.update_from_cached_response(Some(&fresh), key_fn);
        assert!(!a.send_request);

        let settings = CacheSettings { cache_control: true, ..Default::default() };
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_cached_response(Some(&fresh), key_fn);
        assert!(a.send_request);
    }

    #[test]
    fn test_stale_while_revalidate_resends_async() {
        let stale = cached(Some(-1), &[("cache-control", "stale-while-revalidate=60")]);
        let settings = CacheSettings { cache_control: true, ..Default::default() };
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_cached_response(Some(&stale), key_fn);
        assert!(a.resend_async);
        assert!(!a.resend_request);
    }

    #[test]
    fn test_stale_while_revalidate_limit_exceeded() {
        let stale = cached(Some(-120), &[]);
        let settings = CacheSettings { stale_while_revalidate: StaleSetting::from(60), ..Default::default() };
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_cached_response(Some(&stale), key_fn);
        assert!(!a.resend_async);
        assert!(a.resend_request);
    }

    #[test]
    fn test_is_usable_with_stale_if_error() {
        let stale = cached(Some(-30), &[]);
        let settings = CacheSettings { stale_if_error: StaleSetting::from(60), ..Default::default() };
        let a = actions(&CachedRequest::get(URL), &settings);
        assert!(!a.is_usable(Some(&stale), false));
        assert!(a.is_usable(Some(&stale), true));

        let too_old = cached(Some(-120), &[]);
        assert!(!a.is_usable(Some(&too_old), true));
        assert!(!a.is_usable(None, true));
    }

    #[test]
    fn test_max_stale_and_min_fresh_offsets() {
        let slightly_stale = cached(Some(-10), &[]);
        let req = CachedRequest::get(URL).header("cache-control", "max-stale=60");
        let a = actions(&req, &CacheSettings::default());
        assert!(a.is_usable(Some(&slightly_stale), false));

        let nearly_expired = cached(Some(10), &[]);
        let req = CachedRequest::get(URL).header("cache-control", "min-fresh=60");
        let a = actions(&req, &CacheSettings::default());
        assert!(!a.is_usable(Some(&nearly_expired), false));
    }

    #[test]
    fn test_vary_mismatch_is_a_miss() {
        let mut stored = cached(None, &[("vary", "Accept-Language")]);
        stored.request = CachedRequest::get(URL).header("accept-language", "en");

        let mut a = actions(&CachedRequest::get(URL).header("accept-language", "fr"), &CacheSettings::default());
        a.update_from_cached_response(Some(&stored), key_fn);
        assert!(a.send_request);

        let mut a = actions(&CachedRequest::get(URL).header("accept-language", "en"), &CacheSettings::default());
        a.update_from_cached_response(Some(&stored), key_fn);
        assert!(!a.send_request);
    }

    #[test]
    fn test_vary_star_always_misses() {
        let stored = cached(None, &[("vary", "*")]);
        let mut a = actions(&CachedRequest::get(URL), &CacheSettings::default());
        a.update_from_cached_response(Some(&stored), key_fn);
        assert!(a.send_request);
    }

    #[test]
    fn test_response_expiration_precedence() {
        let settings = CacheSettings { cache_control: true, expire_after: ExpireAfter::seconds(10), ..Default::default() };
        let origin = OriginResponse::new(CachedRequest::get(URL), 200).header("cache-control", "max-age=60");

        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&origin);
        assert_eq!(a.expire_after, ExpireAfter::seconds(60));
        assert!(!a.skip_write);

        let mut a = actions(&CachedRequest::get(URL).header("cache-control", "max-age=5"), &settings);
        a.update_from_response(&origin);
        assert_eq!(a.expire_after, ExpireAfter::seconds(5));

        let immutable = origin.clone().header("cache-control", "immutable, max-age=60");
        let mut a = actions(&CachedRequest::get(URL).header("cache-control", "max-age=5"), &settings);
        a.update_from_response(&immutable);
        assert_eq!(a.expire_after, ExpireAfter::Never);
    }

    #[test]
    fn test_response_headers_ignored_without_cache_control() {
        let settings = CacheSettings { expire_after: ExpireAfter::seconds(10), ..Default::default() };
        let origin = OriginResponse::new(CachedRequest::get(URL), 200).header("cache-control", "max-age=60");
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&origin);
        assert_eq!(a.expire_after, ExpireAfter::seconds(10));
    }

    #[test]
    fn test_expires_header_used_after_max_age() {
        let settings = CacheSettings { cache_control: true, ..Default::default() };
        let origin = OriginResponse::new(CachedRequest::get(URL), 200).header("expires", "Mon, 01 Jan 2024 00:00:00 GMT");
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&origin);
        assert!(matches!(a.expire_after, ExpireAfter::At(_)));
        assert!(a.skip_write);
    }

    #[test]
    fn test_skip_write_criteria() {
        let settings = CacheSettings::default();
        let ok = OriginResponse::new(CachedRequest::get(URL), 200);

        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&ok);
        assert!(!a.skip_write);

        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&OriginResponse::new(CachedRequest::get(URL), 404));
        assert!(a.skip_write);

        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&ok.clone().header("cache-control", "no-store"));
        assert!(a.skip_write);

        let filtered = CacheSettings::default().with_filter(|r| r.status != 200);
        let mut a = actions(&CachedRequest::get(URL), &filtered);
        a.update_from_response(&ok);
        assert!(a.skip_write);
    }

    #[test]
    fn test_expire_immediately_needs_validator() {
        let settings = CacheSettings { expire_after: ExpireAfter::immediately(), ..Default::default() };
        let plain = OriginResponse::new(CachedRequest::get(URL), 200);
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&plain);
        assert!(a.skip_write);

        let validated = plain.header("etag", "\"v1\"");
        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&validated);
        assert!(!a.skip_write);
    }

    #[test]
    fn test_update_revalidated_response() {
        let settings = CacheSettings { cache_control: true, ..Default::default() };
        let stored = cached(Some(-1), &[("etag", "\"abc\"")]);
        let not_modified = OriginResponse::new(CachedRequest::get(URL), 304).header("cache-control", "max-age=30");

        let mut a = actions(&CachedRequest::get(URL), &settings);
        a.update_from_response(&not_modified);
        let updated = a.update_revalidated_response(&not_modified, stored);
        assert!(updated.revalidated);
        assert_eq!(updated.status, 200);
        assert_eq!(updated.header("cache-control").as_deref(), Some("max-age=30"));
        let ttl = updated.ttl().unwrap();
        assert!(ttl > TimeDelta::seconds(25) && ttl <= TimeDelta::seconds(30));
        assert!(!a.skip_write);
    }

    #[test]
    fn test_unchanged_revalidation_skips_write() {
        let stored = cached(None, &[("etag", "\"abc\"")]);
        let not_modified = OriginResponse::new(CachedRequest::get(URL), 304).header("etag", "\"abc\"");
        let mut a = actions(&CachedRequest::get(URL), &CacheSettings::default());
        a.update_from_response(&not_modified);
        let updated = a.update_revalidated_response(&not_modified, stored);
        assert!(updated.revalidated);
        assert!(a.skip_write);
    }
}
