//! Redis storage.
//!
//! Responses are plain keys, `<namespace>:<key>`, with binary values and an
//! optional native TTL: the response's remaining lifetime plus `ttl_offset`
//! seconds, so stale entries stay around long enough to be revalidated.
//! Redirect aliases share one hash, `<namespace>:redirects`.

use chrono::{DateTime, Utc};

#[cfg(feature = "redis")]
pub use imp::{RedisHashStorage, RedisStorage, open_cache};
#[cfg(not(feature = "redis"))]
pub use placeholder::{RedisHashStorage, RedisStorage, open_cache};

/// Hash field holding redirect aliases.
pub const REDIRECTS_SUFFIX: &str = "redirects";

pub fn namespaced(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

/// Inverse of [`namespaced`]; `None` for keys outside the namespace.
pub fn strip_namespace<'a>(namespace: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(namespace).and_then(|rest| rest.strip_prefix(':'))
}

/// Seconds to pass to `SETEX`, or `None` for a key that should not expire.
pub fn ttl_seconds(expires: Option<DateTime<Utc>>, now: DateTime<Utc>, ttl_offset: i64) -> Option<u64> {
    let remaining = (expires? - now).num_seconds() + ttl_offset;
    Some(u64::try_from(remaining.max(1)).unwrap_or(1))
}

#[cfg(feature = "redis")]
mod imp {
    use std::any::Any;
    use std::fmt;
    use std::sync::Arc;

    use ::redis::aio::ConnectionManager;
    use ::redis::{AsyncCommands, Client, RedisError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::{REDIRECTS_SUFFIX, namespaced, strip_namespace, ttl_seconds};
    use crate::Error;
    use crate::backends::{Storage, configured_serializer};
    use crate::cache::BaseCache;
    use crate::config::{CacheConfig, RedisConfig};
    use crate::serializers::Payload;

    const SCAN_COUNT: usize = 500;

    impl From<RedisError> for Error {
        fn from(err: RedisError) -> Self {
            Error::Backend(format!("redis: {err}"))
        }
    }

    /// Responses stored as namespaced string keys.
    #[derive(Clone)]
    pub struct RedisStorage {
        conn: ConnectionManager,
        namespace: String,
        ttl: bool,
        ttl_offset: i64,
    }

    impl fmt::Debug for RedisStorage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisStorage")
                .field("namespace", &self.namespace)
                .field("ttl", &self.ttl)
                .field("ttl_offset", &self.ttl_offset)
                .finish()
        }
    }

    impl RedisStorage {
        pub async fn connect(config: &RedisConfig, namespace: &str) -> Result<Self, Error> {
            let client = Client::open(config.url.as_str())?;
            let conn = ConnectionManager::new(client).await?;
            Ok(Self::with_connection(conn, namespace, config))
        }

        pub fn with_connection(conn: ConnectionManager, namespace: &str, config: &RedisConfig) -> Self {
            Self { conn, namespace: namespace.to_string(), ttl: config.ttl, ttl_offset: config.ttl_offset }
        }

        pub fn connection(&self) -> &ConnectionManager {
            &self.conn
        }

        /// All keys under the namespace, via `SCAN` so the server is never blocked.
        async fn scan_keys(&self) -> Result<Vec<String>, Error> {
            let mut conn = self.conn.clone();
            let pattern = namespaced(&self.namespace, "*");
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            let hash_key = namespaced(&self.namespace, REDIRECTS_SUFFIX);
            keys.retain(|k| *k != hash_key);
            Ok(keys)
        }
    }

    #[async_trait]
    impl Storage for RedisStorage {
        fn backend(&self) -> &'static str {
            "redis"
        }

        async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = conn.get(namespaced(&self.namespace, key)).await?;
            Ok(value.map(Payload::Bytes))
        }

        async fn set(&self, key: &str, value: Payload, expires: Option<DateTime<Utc>>) -> Result<(), Error> {
            let mut conn = self.conn.clone();
            let key = namespaced(&self.namespace, key);
            let bytes = value.into_bytes()?;
            match ttl_seconds(expires, Utc::now(), self.ttl_offset).filter(|_| self.ttl) {
                Some(secs) => {
                    let _: () = conn.set_ex(key, bytes, secs).await?;
                }
                None => {
                    let _: () = conn.set(key, bytes).await?;
                }
            }
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            let mut conn = self.conn.clone();
            let deleted: usize = conn.del(namespaced(&self.namespace, key)).await?;
            if deleted == 0 { Err(Error::KeyNotFound(key.to_string())) } else { Ok(()) }
        }

        async fn contains(&self, key: &str) -> Result<bool, Error> {
            let mut conn = self.conn.clone();
            Ok(conn.exists(namespaced(&self.namespace, key)).await?)
        }

        async fn keys(&self) -> Result<Vec<String>, Error> {
            Ok(self
                .scan_keys()
                .await?
                .iter()
                .filter_map(|k| strip_namespace(&self.namespace, k).map(str::to_string))
                .collect())
        }

        async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
            let mut conn = self.conn.clone();
            let mut deleted = 0;
            for chunk in keys.chunks(SCAN_COUNT) {
                let full: Vec<String> = chunk.iter().map(|k| namespaced(&self.namespace, k)).collect();
                let n: usize = conn.del(full).await?;
                deleted += n;
            }
            Ok(deleted)
        }

        async fn clear(&self) -> Result<(), Error> {
            let keys = self.scan_keys().await?;
            let mut conn = self.conn.clone();
            for chunk in keys.chunks(SCAN_COUNT) {
                let _: usize = conn.del(chunk.to_vec()).await?;
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Redirect aliases stored as fields of one hash.
    #[derive(Clone)]
    pub struct RedisHashStorage {
        conn: ConnectionManager,
        hash_key: String,
    }

    impl fmt::Debug for RedisHashStorage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisHashStorage").field("hash_key", &self.hash_key).finish()
        }
    }

    impl RedisHashStorage {
        pub fn with_connection(conn: ConnectionManager, namespace: &str) -> Self {
            Self { conn, hash_key: namespaced(namespace, REDIRECTS_SUFFIX) }
        }
    }

    #[async_trait]
    impl Storage for RedisHashStorage {
        fn backend(&self) -> &'static str {
            "redis"
        }

        async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = conn.hget(&self.hash_key, key).await?;
            Ok(value.map(Payload::Bytes))
        }

        async fn set(&self, key: &str, value: Payload, _expires: Option<DateTime<Utc>>) -> Result<(), Error> {
            let mut conn = self.conn.clone();
            let _: () = conn.hset(&self.hash_key, key, value.into_bytes()?).await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            let mut conn = self.conn.clone();
            let deleted: usize = conn.hdel(&self.hash_key, key).await?;
            if deleted == 0 { Err(Error::KeyNotFound(key.to_string())) } else { Ok(()) }
        }

        async fn contains(&self, key: &str) -> Result<bool, Error> {
            let mut conn = self.conn.clone();
            Ok(conn.hexists(&self.hash_key, key).await?)
        }

        async fn keys(&self) -> Result<Vec<String>, Error> {
            let mut conn = self.conn.clone();
            Ok(conn.hkeys(&self.hash_key).await?)
        }

        async fn len(&self) -> Result<usize, Error> {
            let mut conn = self.conn.clone();
            Ok(conn.hlen(&self.hash_key).await?)
        }

        async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.conn.clone();
            Ok(conn.hdel(&self.hash_key, keys.to_vec()).await?)
        }

        async fn clear(&self) -> Result<(), Error> {
            let mut conn = self.conn.clone();
            let _: usize = conn.del(&self.hash_key).await?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A Redis cache; `cache_name` is the key namespace.
    pub async fn open_cache(cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
        let responses = RedisStorage::connect(&config.redis, cache_name).await?;
        let redirects = RedisHashStorage::with_connection(responses.connection().clone(), cache_name);
        let serializer = configured_serializer(config, "json")?;
        tracing::debug!(namespace = cache_name, ttl = config.redis.ttl, "opened redis cache");
        BaseCache::new(cache_name, Arc::new(responses), Arc::new(redirects), serializer, config)
    }
}

#[cfg(not(feature = "redis"))]
mod placeholder {
    use crate::Error;
    use crate::cache::BaseCache;
    use crate::config::{CacheConfig, RedisConfig};

    fn missing() -> Error {
        Error::MissingDependency { backend: "redis", feature: "redis" }
    }

    /// Stand-in for a build without the `redis` feature.
    #[derive(Debug)]
    pub struct RedisStorage;

    impl RedisStorage {
        pub async fn connect(_config: &RedisConfig, _namespace: &str) -> Result<Self, Error> {
            Err(missing())
        }
    }

    #[derive(Debug)]
    pub struct RedisHashStorage;

    pub async fn open_cache(_cache_name: &str, _config: &CacheConfig) -> Result<BaseCache, Error> {
        Err(missing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_namespacing() {
        let key = namespaced("http_cache", "abc");
        assert_eq!(key, "http_cache:abc");
        assert_eq!(strip_namespace("http_cache", &key), Some("abc"));
        assert_eq!(strip_namespace("http_cache", "other:abc"), None);
        assert_eq!(strip_namespace("http", "http_cache:abc"), None);
    }

    #[test]
    fn test_ttl_adds_offset() {
        let now = Utc::now();
        assert_eq!(ttl_seconds(None, now, 3600), None);
        assert_eq!(ttl_seconds(Some(now + TimeDelta::seconds(60)), now, 3600), Some(3660));
        assert_eq!(ttl_seconds(Some(now + TimeDelta::seconds(60)), now, 0), Some(60));
    }

    #[test]
    fn test_ttl_never_below_one_second() {
        let now = Utc::now();
        assert_eq!(ttl_seconds(Some(now - TimeDelta::hours(2)), now, 3600), Some(1));
    }
}
