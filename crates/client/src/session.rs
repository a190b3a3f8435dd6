//! A caching HTTP session.
//!
//! [`CachedSession::send_with`] runs one request through the cache:
//!
//! 1. Compute the cache key and the initial [`CacheActions`].
//! 2. Read the cache unless the request forbids it.
//! 3. Let the policy look at what was read (this is where `Vary` is checked).
//! 4. Serve a synthetic 504, the cached response, a stale response plus a
//!    background refresh, or go to the network.
//! 5. Delete the entry if `filter_fn` rejects what is about to be returned.
//! 6. Run the response hooks.
//!
//! Cache errors never lose a successful network response: a failed save is
//! logged and the response is still returned.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use chrono::Utc;
use http::Method;
use http::header::{CACHE_CONTROL, HeaderValue};

use crate::transport::{ReqwestTransport, Transport, TransportConfig};
use reqcache_core::models::headers;
use reqcache_core::{
    BackendSpec, BaseCache, CacheActions, CacheConfig, CacheSettings, CachedRequest, CachedResponse, DeleteOptions, Error,
    ExpireAfter, init_backend,
};

/// Called on every response before it is returned, in registration order.
pub type ResponseHook = Arc<dyn Fn(CachedResponse) -> CachedResponse + Send + Sync>;

/// Per-request cache directives. They take precedence over session settings
/// and travel to the policy as `Cache-Control` request directives.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Sent as `max-age=<seconds>`.
    pub expire_after: Option<ExpireAfter>,
    /// Sent as `only-if-cached`: never touch the network.
    pub only_if_cached: bool,
    /// Revalidate the entry even if it is still fresh. Sent as
    /// `must-revalidate`, which on a request means "refresh".
    pub refresh: bool,
    /// Ignore the cache for this request. Sent as `no-cache`.
    pub force_refresh: bool,
}

impl RequestOptions {
    pub fn expire_after(mut self, expire_after: impl Into<ExpireAfter>) -> Self {
        self.expire_after = Some(expire_after.into());
        self
    }

    pub fn only_if_cached(mut self) -> Self {
        self.only_if_cached = true;
        self
    }

    pub fn refresh(mut self) -> Self {
        self.refresh = true;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    /// Directives these options add, in header order.
    pub fn directives(&self) -> Vec<String> {
        let mut directives = Vec::new();
        if let Some(expire_after) = self.expire_after {
            directives.push(format!("max-age={}", expire_after.as_seconds(Utc::now())));
        }
        if self.only_if_cached {
            directives.push("only-if-cached".to_string());
        }
        if self.refresh {
            directives.push("must-revalidate".to_string());
        }
        if self.force_refresh {
            directives.push("no-cache".to_string());
        }
        directives
    }

    /// Merge the directives into the request's `Cache-Control`, after any it already has.
    pub fn apply(&self, request: &mut CachedRequest) {
        let added = self.directives();
        if added.is_empty() {
            return;
        }
        let mut directives: Vec<String> = request.headers.get_all(CACHE_CONTROL).iter().map(headers::value_str).collect();
        directives.extend(added);
        if let Ok(value) = HeaderValue::from_str(&directives.join(", ")) {
            request.headers.insert(CACHE_CONTROL, value);
        }
    }
}

/// An HTTP session that reads from and writes to a [`BaseCache`].
///
/// Clones share the cache, transport and hooks.
#[derive(Clone)]
pub struct CachedSession {
    cache: BaseCache,
    transport: Arc<dyn Transport>,
    hooks: Arc<RwLock<Vec<ResponseHook>>>,
}

impl std::fmt::Debug for CachedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSession")
            .field("cache", &self.cache)
            .field("transport", &self.transport)
            .finish()
    }
}

impl CachedSession {
    pub fn new(cache: BaseCache, transport: Arc<dyn Transport>) -> Self {
        Self { cache, transport, hooks: Arc::new(RwLock::new(Vec::new())) }
    }

    /// Open the configured backend and a reqwest transport.
    ///
    /// With no backend configured this is SQLite, or memory if SQLite
    /// cannot be opened.
    pub async fn open(config: &CacheConfig) -> Result<Self, Error> {
        let cache = init_backend(BackendSpec::from(config.backend.clone()), &config.cache_name, config).await?;
        let transport = ReqwestTransport::new(TransportConfig { verify: config.verify, ..Default::default() })?;
        tracing::info!(cache_name = %config.cache_name, backend = cache.backend_name(), "opened cached session");
        Ok(Self::new(cache, Arc::new(transport)))
    }

    /// Add caching to an existing reqwest client, keeping its headers,
    /// proxies, TLS trust and timeouts.
    pub fn wrap(client: reqwest::Client, cache: BaseCache) -> Self {
        let verify = cache.settings().verify;
        let transport = ReqwestTransport::from_client(client, TransportConfig { verify, ..Default::default() });
        Self::new(cache, Arc::new(transport))
    }

    pub fn cache(&self) -> &BaseCache {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Snapshot of the cache settings.
    pub fn settings(&self) -> CacheSettings {
        self.cache.settings()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut CacheSettings)) {
        self.cache.update_settings(f);
    }

    pub fn add_response_hook(&self, hook: impl Fn(CachedResponse) -> CachedResponse + Send + Sync + 'static) {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner).push(Arc::new(hook));
    }

    /// Disable the cache until the guard is dropped. Requests still go out.
    pub fn cache_disabled(&self) -> CacheDisabled {
        CacheDisabled::new(self.cache.clone())
    }

    pub async fn get(&self, url: &str) -> Result<CachedResponse, Error> {
        self.request(Method::GET, url).await
    }

    pub async fn head(&self, url: &str) -> Result<CachedResponse, Error> {
        self.request(Method::HEAD, url).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> Result<CachedResponse, Error> {
        self.send(CachedRequest::new(Method::POST, url).body(body)).await
    }

    pub async fn request(&self, method: Method, url: &str) -> Result<CachedResponse, Error> {
        self.send(CachedRequest::new(method, url)).await
    }

    pub async fn send(&self, request: CachedRequest) -> Result<CachedResponse, Error> {
        self.send_with(request, &RequestOptions::default()).await
    }

    /// Send one request through the cache.
    pub async fn send_with(&self, mut request: CachedRequest, options: &RequestOptions) -> Result<CachedResponse, Error> {
        options.apply(&mut request);
        let settings = self.cache.settings();
        let key = self.cache.create_key(&request);
        let mut actions = CacheActions::from_request(key.clone(), &request, &settings);

        let cached = if actions.skip_read { None } else { self.cache.get_response(&key).await? };
        actions.update_from_cached_response(cached.as_ref(), |req, match_headers| {
            self.cache.create_key_matching(req, match_headers)
        });

        let response = match cached {
            _ if actions.error_504 => {
                tracing::debug!(key = %key, url = %request.url, "not cached and only-if-cached set");
                CachedResponse::not_cached(&request)
            }
            Some(cached) if actions.resend_async => {
                tracing::debug!(key = %key, "serving stale response, refreshing in background");
                let session = self.clone();
                let stale = cached.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.send_and_cache(&request, actions, Some(stale)).await {
                        tracing::warn!(error = %e, "background refresh failed");
                    }
                });
                cached
            }
            Some(cached) if actions.resend_request => self.resend(&request, actions, cached).await?,
            Some(cached) if actions.send_request => self.send_and_cache(&request, actions, Some(cached)).await?,
            Some(cached) => {
                tracing::debug!(key = %key, "serving from cache");
                cached
            }
            None => self.send_and_cache(&request, actions, None).await?,
        };

        if let Some(stored) = response.cache_key.as_deref().filter(|_| !settings.passes_filter(&response)) {
            tracing::debug!(key = %stored, "response rejected by filter, deleting entry");
            // `key` may only be an alias of `stored`; remaining aliases are pruned by delete.
            if let Err(e) = self.cache.delete(DeleteOptions::keys([stored, key.as_str()])).await {
                tracing::error!(key = %stored, error = %e, "failed to delete filtered response");
            }
        }

        Ok(self.run_hooks(response))
    }

    /// Send, then save whatever the policy allows. A 304 is merged into
    /// `cached` and that merged response is returned.
    async fn send_and_cache(
        &self,
        request: &CachedRequest,
        mut actions: CacheActions,
        cached: Option<CachedResponse>,
    ) -> Result<CachedResponse, Error> {
        let mut outgoing = request.clone();
        for (name, value) in actions.validation_headers() {
            outgoing.headers.insert(name.clone(), value.clone());
        }

        let response = self.transport.send(&outgoing).await?;
        actions.update_from_response(&response);

        if response.status == 304 {
            if let Some(cached) = cached {
                let key = cached.cache_key.clone().unwrap_or_else(|| actions.cache_key.clone());
                let mut merged = actions.update_revalidated_response(&response, cached);
                if !actions.skip_write {
                    if let Err(e) = self.cache.save_cached(&key, merged.clone()).await {
                        tracing::error!(key = %key, error = %e, "failed to save revalidated response");
                    }
                }
                merged.cache_key = Some(key);
                merged.from_cache = true;
                return Ok(merged);
            }
        }

        // Redirected responses live under the final request's key; the
        // original key becomes an alias.
        let key = if response.history.is_empty() {
            actions.cache_key.clone()
        } else {
            self.cache.create_key(&response.request)
        };
        let expires = actions.expires();
        if !actions.skip_write {
            if let Err(e) = self.cache.save_response(&response, Some(&key), expires).await {
                tracing::error!(key = %key, error = %e, "failed to save response");
            }
        }

        let mut fresh = CachedResponse::from_response(&response, expires);
        fresh.cache_key = Some(key);
        Ok(fresh)
    }

    /// Send for a cached entry that needs refreshing, falling back to it if
    /// the request fails (or returns a non-cacheable status) and
    /// `stale_if_error` allows.
    async fn resend(
        &self,
        request: &CachedRequest,
        actions: CacheActions,
        cached: CachedResponse,
    ) -> Result<CachedResponse, Error> {
        let fallback_allowed = actions.is_usable(Some(&cached), true);
        let allowed_status = |status| self.cache.settings().is_status_allowed(status);
        match self.send_and_cache(request, actions, Some(cached.clone())).await {
            Ok(response) if response.from_cache || allowed_status(response.status) => Ok(response),
            Ok(response) if fallback_allowed => {
                tracing::warn!(url = %request.url, status = response.status, "error status from origin, serving stale response");
                Ok(cached)
            }
            Ok(response) => Ok(response),
            Err(e) if fallback_allowed => {
                tracing::warn!(url = %request.url, error = %e, "request failed, serving stale response");
                Ok(cached)
            }
            Err(e) => Err(e),
        }
    }

    fn run_hooks(&self, response: CachedResponse) -> CachedResponse {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone();
        hooks.iter().fold(response, |response, hook| hook(response))
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.cache.close().await
    }
}

/// Restores the previous `disabled` flag on drop.
#[derive(Debug)]
pub struct CacheDisabled {
    cache: BaseCache,
    previous: bool,
}

impl CacheDisabled {
    fn new(cache: BaseCache) -> Self {
        let previous = cache.settings().disabled;
        cache.update_settings(|s| s.disabled = true);
        Self { cache, previous }
    }
}

impl Drop for CacheDisabled {
    fn drop(&mut self) {
        let previous = self.previous;
        self.cache.update_settings(|s| s.disabled = previous);
    }
}
