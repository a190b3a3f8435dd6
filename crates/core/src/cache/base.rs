//! The cache manager: two storages (responses and redirect aliases) plus a
//! serializer, and the maintenance operations built on them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use chrono::{TimeDelta, Utc};

use super::key::{create_key, redact_response};
use crate::Error;
use crate::backends::sqlite::{SortKey, SqliteStorage};
use crate::backends::{Storage, StorageItem, payload_key, prune_redirects};
use crate::config::CacheConfig;
use crate::models::{CachedRequest, CachedResponse, OriginResponse};
use crate::policy::{CacheSettings, ExpireAfter, MatchHeaders};
use crate::serializers::{Payload, SerializerPipeline};

/// Body written by very old versions for responses without content.
const LEGACY_EMPTY_BODY: &[u8] = b"None";

/// Which entries [`BaseCache::filter`] returns. An entry matching any flag is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOptions {
    /// Entries that are not expired.
    pub valid: bool,
    pub expired: bool,
    /// Entries that cannot be deserialized, as placeholder responses.
    pub invalid: bool,
    /// Entries created longer ago than this.
    pub older_than: Option<TimeDelta>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self { valid: true, expired: false, invalid: false, older_than: None }
    }
}

/// What [`BaseCache::delete`] removes; the union of all fields.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub keys: Vec<String>,
    pub expired: bool,
    pub invalid: bool,
    pub older_than: Option<TimeDelta>,
    pub requests: Vec<CachedRequest>,
    /// Matched as plain `GET` requests.
    pub urls: Vec<String>,
}

impl DeleteOptions {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { keys: keys.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    pub fn urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { urls: urls.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    pub fn expired() -> Self {
        Self { expired: true, ..Default::default() }
    }
}

/// A response cache over any pair of [`Storage`]s.
///
/// Clones share storage and settings.
#[derive(Clone)]
pub struct BaseCache {
    cache_name: String,
    responses: Arc<dyn Storage>,
    redirects: Arc<dyn Storage>,
    serializer: SerializerPipeline,
    settings: Arc<RwLock<CacheSettings>>,
}

impl fmt::Debug for BaseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseCache")
            .field("cache_name", &self.cache_name)
            .field("backend", &self.backend_name())
            .field("serializer", &self.serializer.name())
            .finish()
    }
}

impl BaseCache {
    /// Compose a cache; settings are taken from `config`.
    pub fn new(
        cache_name: &str,
        responses: Arc<dyn Storage>,
        redirects: Arc<dyn Storage>,
        serializer: SerializerPipeline,
        config: &CacheConfig,
    ) -> Result<Self, Error> {
        let settings = CacheSettings::from_config(config)?;
        Ok(Self {
            cache_name: cache_name.to_string(),
            responses,
            redirects,
            serializer,
            settings: Arc::new(RwLock::new(settings)),
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn backend_name(&self) -> &'static str {
        self.responses.backend()
    }

    pub fn responses(&self) -> &Arc<dyn Storage> {
        &self.responses
    }

    pub fn redirects(&self) -> &Arc<dyn Storage> {
        &self.redirects
    }

    pub fn serializer(&self) -> &SerializerPipeline {
        &self.serializer
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> CacheSettings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change settings in place; later requests see the change.
    pub fn update_settings(&self, f: impl FnOnce(&mut CacheSettings)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut settings);
    }

    /// Key for `request` under the current settings.
    pub fn create_key(&self, request: &CachedRequest) -> String {
        let settings = self.settings();
        let options = settings.key_options(self.serializer.name());
        match &settings.key_fn {
            Some(key_fn) => key_fn(request, &options),
            None => create_key(request, &options),
        }
    }

    /// Key for `request` with only the given headers matched, for `Vary` checks.
    pub fn create_key_matching(&self, request: &CachedRequest, match_headers: &MatchHeaders) -> String {
        let settings = self.settings();
        let mut options = settings.key_options(self.serializer.name());
        options.match_headers = match_headers.clone();
        match &settings.key_fn {
            Some(key_fn) => key_fn(request, &options),
            None => create_key(request, &options),
        }
    }

    /// Deserialize the entry stored under `key`, if any. Invalid entries are
    /// logged and reported as absent.
    async fn load(&self, key: &str) -> Result<Option<CachedResponse>, Error> {
        let Some(payload) = self.responses.get(key).await? else {
            return Ok(None);
        };
        match self.serializer.loads(payload) {
            Ok(mut response) => {
                response.cache_key = Some(key.to_string());
                response.from_cache = true;
                Ok(Some(response))
            }
            Err(e) => {
                tracing::error!(key, error = %e, "unable to deserialize cached response");
                Ok(None)
            }
        }
    }

    /// The response stored under `key`, following a redirect alias once.
    ///
    /// `cache_key` on the result is the key the response is stored under.
    pub async fn get_response(&self, key: &str) -> Result<Option<CachedResponse>, Error> {
        if let Some(response) = self.load(key).await? {
            return Ok(Some(response));
        }
        match self.redirects.get(key).await?.and_then(payload_key) {
            Some(target) => {
                tracing::debug!(key, target = %target, "following redirect alias");
                self.load(&target).await
            }
            None => Ok(None),
        }
    }

    /// Store an origin response with the given absolute expiration.
    ///
    /// Ignored parameters are redacted before storage. Returns the key used.
    pub async fn save_response(
        &self,
        response: &OriginResponse,
        cache_key: Option<&str>,
        expires: Option<chrono::DateTime<Utc>>,
    ) -> Result<String, Error> {
        let key = cache_key.map_or_else(|| self.create_key(&response.request), str::to_string);
        let mut cached = CachedResponse::from_response(response, expires);
        redact_response(&mut cached, &self.settings().ignored_parameters);
        self.save_cached(&key, cached).await?;
        Ok(key)
    }

    /// Store an already-cached response (for example after revalidation).
    ///
    /// Unless it was revalidated, each request in its redirect history gets an
    /// alias pointing at `key`; aliases are written after the response.
    pub async fn save_cached(&self, key: &str, mut response: CachedResponse) -> Result<(), Error> {
        response.cache_key = None;
        response.from_cache = false;
        let payload = self.serializer.dumps(&response)?;
        self.responses.set(key, payload, response.expires).await?;
        tracing::debug!(key, url = %response.url, expires = ?response.expires, "saved response");

        if response.revalidated {
            return Ok(());
        }
        let aliases: Vec<StorageItem> = response
            .history
            .iter()
            .map(|hop| self.create_key(&hop.request))
            .filter(|alias| alias != key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|alias| StorageItem { key: alias, value: Payload::Text(key.to_string()), expires: None })
            .collect();
        if !aliases.is_empty() {
            tracing::debug!(key, aliases = aliases.len(), "saved redirect aliases");
            self.redirects.bulk_set(aliases).await?;
        }
        Ok(())
    }

    /// Delete entries, then prune aliases left dangling. Returns how many
    /// responses were deleted.
    pub async fn delete(&self, options: DeleteOptions) -> Result<usize, Error> {
        let mut keys: BTreeSet<String> = options.keys.into_iter().collect();
        keys.extend(options.requests.iter().map(|request| self.create_key(request)));
        keys.extend(options.urls.iter().map(|url| self.create_key(&CachedRequest::get(url.as_str()))));

        let mut deleted = 0;
        let mut scan_expired = options.expired;
        if options.expired && !options.invalid && options.older_than.is_none() {
            if let Some(n) = self.responses.delete_expired().await? {
                deleted += n;
                scan_expired = false;
            }
        }
        if scan_expired || options.invalid || options.older_than.is_some() {
            let filter = FilterOptions {
                valid: false,
                expired: scan_expired,
                invalid: options.invalid,
                older_than: options.older_than,
            };
            keys.extend(self.filter(filter).await?.into_iter().filter_map(|r| r.cache_key));
        }

        let keys: Vec<String> = keys.into_iter().collect();
        match keys.as_slice() {
            [] => {}
            [key] => match self.responses.delete(key).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_key_not_found() => {}
                Err(e) => return Err(e),
            },
            _ => deleted += self.responses.bulk_delete(&keys).await?,
        }
        if !keys.is_empty() {
            self.redirects.bulk_delete(&keys).await?;
        }
        let pruned = self.prune_redirects().await?;
        tracing::info!(cache = %self.cache_name, deleted, pruned, "deleted cache entries");
        Ok(deleted)
    }

    /// Remove aliases whose target is gone: one SQL statement when both maps
    /// share a SQLite database, a scan otherwise.
    async fn prune_redirects(&self) -> Result<usize, Error> {
        let responses = self.responses.as_any().downcast_ref::<SqliteStorage>();
        let redirects = self.redirects.as_any().downcast_ref::<SqliteStorage>();
        if let (Some(responses), Some(redirects)) = (responses, redirects) {
            if redirects.db().same_db(responses.db()) {
                return redirects.prune_against(responses).await;
            }
        }
        prune_redirects(self.redirects.as_ref(), self.responses.as_ref()).await
    }

    /// Stored responses matching `options`.
    pub async fn filter(&self, options: FilterOptions) -> Result<Vec<CachedResponse>, Error> {
        let cutoff = options.older_than.map(|age| Utc::now() - age);
        let mut matched = Vec::new();
        for key in self.responses.keys().await? {
            let Some(payload) = self.responses.get(&key).await? else { continue };
            let mut response = match self.serializer.loads(payload) {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "invalid cache entry");
                    if options.invalid {
                        matched.push(CachedResponse::invalid_entry(&key));
                    }
                    continue;
                }
            };
            response.cache_key = Some(key);
            response.from_cache = true;
            let expired = response.is_expired();
            if (options.valid && !expired)
                || (options.expired && expired)
                || cutoff.is_some_and(|cutoff| response.created_at < cutoff)
            {
                matched.push(response);
            }
        }
        Ok(matched)
    }

    /// Re-key every entry under the current settings, and repair legacy empty
    /// bodies. Returns how many entries were rewritten.
    pub async fn recreate_keys(&self) -> Result<usize, Error> {
        let mut items = Vec::new();
        let mut old_keys = Vec::new();
        for key in self.responses.keys().await? {
            let Some(mut response) = self.load(&key).await? else { continue };
            let legacy = response.content.as_ref() == LEGACY_EMPTY_BODY;
            if legacy {
                response.content = Bytes::new();
            }
            let new_key = self.create_key(&response.request);
            if new_key == key && !legacy {
                continue;
            }
            items.push(StorageItem {
                key: new_key.clone(),
                value: self.serializer.dumps(&response)?,
                expires: response.expires,
            });
            if new_key != key {
                old_keys.push(key);
            }
        }
        let new_keys: BTreeSet<&str> = items.iter().map(|item| item.key.as_str()).collect();
        old_keys.retain(|key| !new_keys.contains(key.as_str()));

        let rewritten = items.len();
        self.responses.bulk_set(items).await?;
        self.responses.bulk_delete(&old_keys).await?;
        tracing::info!(cache = %self.cache_name, rewritten, removed = old_keys.len(), "recreated cache keys");
        Ok(rewritten)
    }

    /// Give every live entry a new expiration computed from now.
    pub async fn reset_expiration(&self, expire_after: ExpireAfter) -> Result<usize, Error> {
        let mut items = Vec::new();
        for mut response in self.filter(FilterOptions::default()).await? {
            let Some(key) = response.cache_key.take() else { continue };
            response.reset_expiration(expire_after);
            items.push(StorageItem { key, value: self.serializer.dumps(&response)?, expires: response.expires });
        }
        let updated = items.len();
        self.responses.bulk_set(items).await?;
        tracing::info!(cache = %self.cache_name, updated, expire_after = %expire_after, "reset expiration");
        Ok(updated)
    }

    /// Copy every entry and alias of `other` into this cache, overwriting on collision.
    pub async fn update(&self, other: &BaseCache) -> Result<usize, Error> {
        let mut items = Vec::new();
        for key in other.responses.keys().await? {
            if let Some(response) = other.load(&key).await? {
                items.push(StorageItem { key, value: self.serializer.dumps(&response)?, expires: response.expires });
            }
        }
        let copied = items.len();
        self.responses.bulk_set(items).await?;

        let mut aliases = Vec::new();
        for key in other.redirects.keys().await? {
            if let Some(target) = other.redirects.get(&key).await?.and_then(payload_key) {
                aliases.push(StorageItem { key, value: Payload::Text(target), expires: None });
            }
        }
        self.redirects.bulk_set(aliases).await?;
        Ok(copied)
    }

    /// True if `key` is stored as a response or an alias.
    pub async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(self.responses.contains(key).await? || self.redirects.contains(key).await?)
    }

    pub async fn contains_request(&self, request: &CachedRequest) -> Result<bool, Error> {
        self.contains(&self.create_key(request)).await
    }

    /// Checks a plain `GET` for `url`.
    pub async fn contains_url(&self, url: &str) -> Result<bool, Error> {
        self.contains_request(&CachedRequest::get(url)).await
    }

    /// Sorted, de-duplicated URLs of the entries matching `options`.
    pub async fn urls(&self, options: FilterOptions) -> Result<Vec<String>, Error> {
        let urls: BTreeSet<String> = self.filter(options).await?.into_iter().map(|r| r.url).collect();
        Ok(urls.into_iter().collect())
    }

    /// Number of stored responses.
    pub async fn len(&self) -> Result<usize, Error> {
        self.responses.len().await
    }

    pub async fn is_empty(&self) -> Result<bool, Error> {
        self.responses.is_empty().await
    }

    /// Responses ordered by expiration, size or key. Ordering runs in SQL
    /// on SQLite and in memory elsewhere.
    pub async fn sorted(
        &self,
        order: SortKey,
        reversed: bool,
        limit: Option<usize>,
        include_expired: bool,
    ) -> Result<Vec<CachedResponse>, Error> {
        if let Some(sqlite) = self.responses.as_any().downcast_ref::<SqliteStorage>() {
            let mut sorted = Vec::new();
            for (key, payload) in sqlite.sorted(order, reversed, limit, include_expired).await? {
                match self.serializer.loads(payload) {
                    Ok(mut response) => {
                        response.cache_key = Some(key);
                        response.from_cache = true;
                        sorted.push(response);
                    }
                    Err(e) => tracing::error!(key = %key, error = %e, "invalid cache entry"),
                }
            }
            return Ok(sorted);
        }

        let options = FilterOptions { valid: true, expired: include_expired, ..Default::default() };
        let mut sorted = self.filter(options).await?;
        match order {
            SortKey::Expires => sorted.sort_by_key(|r| r.expires),
            SortKey::Size => sorted.sort_by_key(|r| r.size()),
            SortKey::Key => sorted.sort_by(|a, b| a.cache_key.cmp(&b.cache_key)),
        }
        if reversed {
            sorted.reverse();
        }
        if let Some(limit) = limit {
            sorted.truncate(limit);
        }
        Ok(sorted)
    }

    /// Delete everything. A SQLite database that cannot be cleared is
    /// deleted and recreated.
    pub async fn clear(&self) -> Result<(), Error> {
        let cleared = async {
            self.responses.clear().await?;
            self.redirects.clear().await
        }
        .await;
        let Err(e) = cleared else {
            tracing::info!(cache = %self.cache_name, "cleared cache");
            return Ok(());
        };
        let Some(sqlite) = self.responses.as_any().downcast_ref::<SqliteStorage>() else {
            return Err(e);
        };
        tracing::error!(cache = %self.cache_name, error = %e, "failed to clear cache, recreating database");
        let mut tables = vec![sqlite.table().to_string()];
        if let Some(redirects) = self.redirects.as_any().downcast_ref::<SqliteStorage>() {
            if redirects.db().same_db(sqlite.db()) {
                tables.push(redirects.table().to_string());
            }
        }
        sqlite.db().recreate(&tables).await
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.responses.close().await?;
        self.redirects.close().await
    }
}
