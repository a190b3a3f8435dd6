//! In-memory storage. Values are kept as-is; with the default `none`
//! serializer that means live response objects.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Storage, StorageItem, configured_serializer};
use crate::Error;
use crate::cache::BaseCache;
use crate::config::CacheConfig;
use crate::serializers::Payload;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, (Payload, Option<DateTime<Utc>>)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
        Ok(self.entries.read().await.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: Payload, expires: Option<DateTime<Utc>>) -> Result<(), Error> {
        self.entries.write().await.insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        match self.entries.write().await.remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::KeyNotFound(key.to_string())),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize, Error> {
        Ok(self.entries.read().await.len())
    }

    async fn bulk_set(&self, items: Vec<StorageItem>) -> Result<(), Error> {
        let mut entries = self.entries.write().await;
        for item in items {
            entries.insert(item.key, (item.value, item.expires));
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn delete_expired(&self) -> Result<Option<usize>, Error> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, expires)| expires.is_none_or(|at| at > now));
        Ok(Some(before - entries.len()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An in-memory cache; lost when the process exits.
pub fn open_cache(cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
    let serializer = configured_serializer(config, "none")?;
    BaseCache::new(
        cache_name,
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryStorage::new()),
        serializer,
        config,
    )
}
