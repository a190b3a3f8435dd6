//! Storage backends.
//!
//! Every backend exposes the same dictionary-like [`Storage`] contract over
//! serialized [`Payload`]s. A cache uses two of them: one for responses, one
//! for redirect aliases. [`init_backend`] builds a [`BaseCache`] from an alias
//! or passes a prebuilt one through.

pub mod dynamodb;
pub mod filesystem;
pub mod memory;
pub mod mongodb;
pub mod redis;
pub mod sqlite;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Error;
use crate::cache::BaseCache;
use crate::config::CacheConfig;
use crate::serializers::{Payload, SerializerPipeline, init_serializer};

/// Aliases accepted by [`init_backend`].
pub const BACKEND_NAMES: &[&str] = &["memory", "sqlite", "filesystem", "mongodb", "gridfs", "redis", "dynamodb"];

/// Backend used when none is named.
pub const DEFAULT_BACKEND: &str = "sqlite";

/// One entry for [`Storage::bulk_set`].
#[derive(Debug, Clone)]
pub struct StorageItem {
    pub key: String,
    pub value: Payload,
    pub expires: Option<DateTime<Utc>>,
}

/// Dictionary-like key/value storage.
///
/// `get` returns `None` for a missing key; `get_item` and `delete` report
/// it as [`Error::KeyNotFound`]. Iteration and `bulk_delete` never do.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Backend alias, for logging.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Payload>, Error>;

    async fn get_item(&self, key: &str) -> Result<Payload, Error> {
        self.get(key).await?.ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Store a value. `expires` lets backends with native TTL drop it on their own.
    async fn set(&self, key: &str, value: Payload, expires: Option<DateTime<Utc>>) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, Error>;

    async fn len(&self) -> Result<usize, Error> {
        Ok(self.keys().await?.len())
    }

    async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len().await? == 0)
    }

    /// Delete many keys; missing ones are skipped. Returns how many were deleted.
    async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        let mut deleted = 0;
        for key in keys {
            match self.delete(key).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_key_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Write many values; backends that can do it atomically override this.
    async fn bulk_set(&self, items: Vec<StorageItem>) -> Result<(), Error> {
        for item in items {
            self.set(&item.key, item.value, item.expires).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error>;

    /// Remove expired entries natively. `None` means the backend cannot,
    /// and the cache falls back to a scan.
    async fn delete_expired(&self) -> Result<Option<usize>, Error> {
        Ok(None)
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Decode a stored redirect target.
pub fn payload_key(payload: Payload) -> Option<String> {
    match payload {
        Payload::Text(key) => Some(key),
        Payload::Bytes(bytes) => String::from_utf8(bytes).ok(),
        Payload::Document(serde_json::Value::String(key)) => Some(key),
        _ => None,
    }
}

/// Delete aliases whose target response no longer exists, by scanning.
pub async fn prune_redirects(redirects: &dyn Storage, responses: &dyn Storage) -> Result<usize, Error> {
    let mut dangling = Vec::new();
    for key in redirects.keys().await? {
        let target = redirects.get(&key).await?.and_then(payload_key);
        let live = match target {
            Some(target) => responses.contains(&target).await?,
            None => false,
        };
        if !live {
            dangling.push(key);
        }
    }
    if dangling.is_empty() {
        return Ok(0);
    }
    redirects.bulk_delete(&dangling).await
}

/// A backend alias, or a cache built elsewhere.
pub enum BackendSpec {
    /// SQLite, falling back to memory if it cannot be opened.
    Default,
    Name(String),
    Instance(Box<BaseCache>),
}

impl From<&str> for BackendSpec {
    fn from(name: &str) -> Self {
        BackendSpec::Name(name.to_string())
    }
}

impl From<String> for BackendSpec {
    fn from(name: String) -> Self {
        BackendSpec::Name(name)
    }
}

impl From<BaseCache> for BackendSpec {
    fn from(cache: BaseCache) -> Self {
        BackendSpec::Instance(Box::new(cache))
    }
}

impl From<Option<String>> for BackendSpec {
    fn from(name: Option<String>) -> Self {
        name.map_or(BackendSpec::Default, BackendSpec::Name)
    }
}

/// Build a cache for `spec`, named `cache_name` (a file, directory, namespace
/// or table name depending on the backend).
///
/// # Errors
///
/// Returns [`Error::UnknownBackend`] for an unregistered alias,
/// [`Error::MissingDependency`] for a backend compiled out, or whatever the
/// backend reports while connecting.
pub async fn init_backend(spec: impl Into<BackendSpec>, cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
    let name = match spec.into() {
        BackendSpec::Instance(cache) => return Ok(*cache),
        BackendSpec::Name(name) => name.trim().to_ascii_lowercase(),
        BackendSpec::Default => {
            return match sqlite::open_cache(cache_name, config).await {
                Ok(cache) => Ok(cache),
                Err(e) => {
                    tracing::warn!(error = %e, cache_name, "SQLite unavailable, falling back to in-memory cache");
                    memory::open_cache(cache_name, config)
                }
            };
        }
    };
    tracing::debug!(backend = %name, cache_name, "initializing cache backend");
    match name.as_str() {
        "memory" => memory::open_cache(cache_name, config),
        "sqlite" => sqlite::open_cache(cache_name, config).await,
        "filesystem" => filesystem::open_cache(cache_name, config).await,
        "redis" => redis::open_cache(cache_name, config).await,
        "mongodb" => mongodb::open_cache(cache_name, config).await,
        "gridfs" => mongodb::open_gridfs_cache(cache_name, config).await,
        "dynamodb" => dynamodb::open_cache(cache_name, config).await,
        _ => Err(Error::UnknownBackend { name, expected: BACKEND_NAMES.join(", ") }),
    }
}

/// The configured serializer, or `default` if none is configured.
pub(crate) fn configured_serializer(config: &CacheConfig, default: &str) -> Result<SerializerPipeline, Error> {
    let name = config.serializer.as_deref().unwrap_or(default);
    init_serializer(name, config.decode_content, config.secret_key.as_deref())
}
