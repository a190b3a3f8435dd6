//! SQLite storage: `responses` and `redirects` tables in one database file.
//!
//! Each table is `(key TEXT PRIMARY KEY, value BLOB, expires INTEGER)` with
//! an index on `expires`, so expiration and ordering run as SQL.

pub mod connection;
pub mod migrations;

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite::params_from_iter;
use tokio_rusqlite::{params, rusqlite};

use super::{Storage, StorageItem, configured_serializer};
use crate::Error;
use crate::cache::BaseCache;
use crate::config::{CacheConfig, SqliteConfig};
use crate::serializers::Payload;

pub use connection::{SqliteDb, SqliteOptions};

/// SQLite's historical limit on bound parameters per statement.
const MAX_PARAMS: usize = 999;

pub const RESPONSES_TABLE: &str = "responses";
pub const REDIRECTS_TABLE: &str = "redirects";

/// Column to order [`SqliteStorage::sorted`] by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Expires,
    Size,
    Key,
}

impl SortKey {
    fn column(self) -> &'static str {
        match self {
            SortKey::Expires => "expires",
            SortKey::Size => "LENGTH(value)",
            SortKey::Key => "key",
        }
    }
}

/// One table of a [`SqliteDb`].
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db: SqliteDb,
    table: String,
}

impl SqliteStorage {
    /// Attach to `table`, creating or upgrading it as needed.
    pub async fn new(db: SqliteDb, table: &str) -> Result<Self, Error> {
        db.ensure_table(table).await?;
        Ok(Self { db, table: table.to_string() })
    }

    pub fn db(&self) -> &SqliteDb {
        &self.db
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of rows, optionally leaving out expired ones.
    pub async fn count(&self, include_expired: bool) -> Result<usize, Error> {
        let sql = if include_expired {
            format!("SELECT COUNT(key) FROM \"{}\"", self.table)
        } else {
            format!("SELECT COUNT(key) FROM \"{}\" WHERE expires IS NULL OR expires > ?1", self.table)
        };
        let now = Utc::now().timestamp();
        self.db
            .read(move |conn| -> Result<usize, Error> {
                let count: i64 = if include_expired {
                    conn.query_row(&sql, [], |row| row.get(0))?
                } else {
                    conn.query_row(&sql, params![now], |row| row.get(0))?
                };
                Ok(usize::try_from(count).unwrap_or_default())
            })
            .await
    }

    /// Rows ordered by expiration, value size or key.
    pub async fn sorted(
        &self,
        order: SortKey,
        reversed: bool,
        limit: Option<usize>,
        include_expired: bool,
    ) -> Result<Vec<(String, Payload)>, Error> {
        let filter = if include_expired { "" } else { "WHERE expires IS NULL OR expires > ?1" };
        let direction = if reversed { "DESC" } else { "ASC" };
        let limit = limit.map(|n| format!("LIMIT {n}")).unwrap_or_default();
        let sql = format!(
            "SELECT key, value FROM \"{}\" {filter} ORDER BY {} {direction} {limit}",
            self.table,
            order.column()
        );
        let now = Utc::now().timestamp();
        self.db
            .read(move |conn| -> Result<Vec<(String, Payload)>, Error> {
                let mut stmt = conn.prepare(&sql)?;
                let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, Payload)> {
                    Ok((row.get(0)?, Payload::Bytes(row.get(1)?)))
                };
                let rows = if include_expired {
                    stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?
                } else {
                    stmt.query_map(params![now], map_row)?.collect::<Result<Vec<_>, _>>()?
                };
                Ok(rows)
            })
            .await
    }

    /// Delete rows of this table whose value names a key missing from `targets`.
    ///
    /// Both tables must live in the same database.
    pub async fn prune_against(&self, targets: &SqliteStorage) -> Result<usize, Error> {
        if !self.db.same_db(&targets.db) {
            return Err(Error::Config("tables are in different databases".into()));
        }
        let sql = format!(
            "DELETE FROM \"{t}\" WHERE NOT EXISTS (SELECT 1 FROM \"{r}\" WHERE \"{r}\".key = CAST(\"{t}\".value AS TEXT))",
            t = self.table,
            r = targets.table
        );
        let deleted = self
            .db
            .write(move |conn| -> Result<usize, Error> { Ok(conn.execute(&sql, [])?) })
            .await?;
        tracing::debug!(table = %self.table, deleted, "pruned redirects");
        Ok(deleted)
    }

    pub async fn size(&self) -> Result<u64, Error> {
        self.db.size().await
    }

    pub async fn vacuum(&self) -> Result<(), Error> {
        self.db.vacuum().await
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
        let sql = format!("SELECT value FROM \"{}\" WHERE key = ?1", self.table);
        let key = key.to_string();
        self.db
            .read(move |conn| -> Result<Option<Payload>, Error> {
                match conn.query_row(&sql, params![key], |row| row.get::<_, Vec<u8>>(0)) {
                    Ok(value) => Ok(Some(Payload::Bytes(value))),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn set(&self, key: &str, value: Payload, expires: Option<DateTime<Utc>>) -> Result<(), Error> {
        let sql = format!("INSERT OR REPLACE INTO \"{}\" (key, value, expires) VALUES (?1, ?2, ?3)", self.table);
        let key = key.to_string();
        let value = value.into_bytes()?;
        let expires = expires.map(|e| e.timestamp());
        let result = self
            .db
            .write(move |conn| -> Result<(), Error> {
                conn.execute(&sql, params![key, value, expires])?;
                Ok(())
            })
            .await;
        match result {
            Err(e) if e.is_database_locked() => {
                tracing::error!(table = %self.table, error = %e, "database still locked after retries, dropping write");
                Ok(())
            }
            other => other,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let sql = format!("DELETE FROM \"{}\" WHERE key = ?1", self.table);
        let owned = key.to_string();
        let deleted = self
            .db
            .write(move |conn| -> Result<usize, Error> { Ok(conn.execute(&sql, params![owned])?) })
            .await?;
        if deleted == 0 { Err(Error::KeyNotFound(key.to_string())) } else { Ok(()) }
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM \"{}\" WHERE key = ?1)", self.table);
        let key = key.to_string();
        self.db
            .read(move |conn| -> Result<bool, Error> { Ok(conn.query_row(&sql, params![key], |row| row.get(0))?) })
            .await
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        let sql = format!("SELECT key FROM \"{}\"", self.table);
        self.db
            .read(move |conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare(&sql)?;
                let keys = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
    }

    async fn len(&self) -> Result<usize, Error> {
        self.count(true).await
    }

    async fn bulk_delete(&self, keys: &[String]) -> Result<usize, Error> {
        if keys.is_empty() {
            return Ok(0);
        }
        let table = self.table.clone();
        let keys = keys.to_vec();
        let deleted = self
            .db
            .write(move |conn| -> Result<usize, Error> {
                let tx = conn.transaction()?;
                let mut deleted = 0;
                for chunk in keys.chunks(MAX_PARAMS) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let sql = format!("DELETE FROM \"{table}\" WHERE key IN ({placeholders})");
                    deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        tracing::debug!(table = %self.table, deleted, "bulk delete");
        Ok(deleted)
    }

    /// All writes share one transaction and one hold of the write lock.
    async fn bulk_set(&self, items: Vec<StorageItem>) -> Result<(), Error> {
        let sql = format!("INSERT OR REPLACE INTO \"{}\" (key, value, expires) VALUES (?1, ?2, ?3)", self.table);
        let rows = items
            .into_iter()
            .map(|item| Ok((item.key, item.value.into_bytes()?, item.expires.map(|e| e.timestamp()))))
            .collect::<Result<Vec<(String, Vec<u8>, Option<i64>)>, Error>>()?;
        self.db
            .write(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&sql)?;
                    for (key, value, expires) in &rows {
                        stmt.execute(params![key, value, expires])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn clear(&self) -> Result<(), Error> {
        let sql = format!("DELETE FROM \"{}\"", self.table);
        self.db
            .write(move |conn| -> Result<(), Error> {
                conn.execute(&sql, [])?;
                Ok(())
            })
            .await
    }

    async fn delete_expired(&self) -> Result<Option<usize>, Error> {
        let sql = format!("DELETE FROM \"{}\" WHERE expires <= ?1", self.table);
        let now = Utc::now().timestamp();
        let deleted = self
            .db
            .write(move |conn| -> Result<usize, Error> { Ok(conn.execute(&sql, params![now])?) })
            .await?;
        Ok(Some(deleted))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Database path for a cache name: `.sqlite` is appended when there is no
/// extension, and relative paths go under the temp dir with `use_temp`.
pub fn db_path(cache_name: &str, config: &SqliteConfig) -> PathBuf {
    let mut path = PathBuf::from(cache_name);
    if path.extension().is_none() {
        path.set_extension("sqlite");
    }
    if config.use_temp && path.is_relative() {
        path = std::env::temp_dir().join(path);
    }
    path
}

/// A SQLite-backed cache. `:memory:` opens a private in-memory database.
pub async fn open_cache(cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
    let db = if cache_name == ":memory:" {
        SqliteDb::open_in_memory().await?
    } else {
        SqliteDb::open(db_path(cache_name, &config.sqlite), config.sqlite.options()).await?
    };
    let responses = SqliteStorage::new(db.clone(), RESPONSES_TABLE).await?;
    let redirects = SqliteStorage::new(db, REDIRECTS_TABLE).await?;
    let serializer = configured_serializer(config, "json")?;
    BaseCache::new(cache_name, Arc::new(responses), Arc::new(redirects), serializer, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    async fn storage() -> (SqliteStorage, SqliteStorage) {
        let db = SqliteDb::open_in_memory().await.unwrap();
        let responses = SqliteStorage::new(db.clone(), RESPONSES_TABLE).await.unwrap();
        let redirects = SqliteStorage::new(db, REDIRECTS_TABLE).await.unwrap();
        (responses, redirects)
    }

    fn bytes(value: &str) -> Payload {
        Payload::Bytes(value.as_bytes().to_vec())
    }

    fn in_secs(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc::now() + TimeDelta::seconds(secs))
    }

    #[tokio::test]
    async fn test_crud() {
        let (responses, _) = storage().await;
        responses.set("k1", bytes("v1"), None).await.unwrap();
        responses.set("k1", bytes("v2"), None).await.unwrap();

        let value = responses.get_item("k1").await.unwrap().into_bytes().unwrap();
        assert_eq!(value, b"v2");
        assert!(responses.contains("k1").await.unwrap());
        assert_eq!(responses.len().await.unwrap(), 1);

        responses.delete("k1").await.unwrap();
        assert!(responses.get("k1").await.unwrap().is_none());
        assert!(matches!(responses.delete("k1").await, Err(Error::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_documents() {
        let (responses, _) = storage().await;
        let err = responses.set("k", Payload::Document(serde_json::json!({})), None).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_bulk_delete_chunks_past_param_limit() {
        let (responses, _) = storage().await;
        let items: Vec<StorageItem> = (0..1500)
            .map(|i| StorageItem { key: format!("k{i}"), value: bytes("v"), expires: None })
            .collect();
        responses.bulk_set(items).await.unwrap();
        assert_eq!(responses.len().await.unwrap(), 1500);

        let mut keys: Vec<String> = (0..1200).map(|i| format!("k{i}")).collect();
        keys.push("missing".to_string());
        assert_eq!(responses.bulk_delete(&keys).await.unwrap(), 1200);
        assert_eq!(responses.len().await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_delete_expired_and_count() {
        let (responses, _) = storage().await;
        responses.set("old", bytes("1"), in_secs(-10)).await.unwrap();
        responses.set("new", bytes("2"), in_secs(60)).await.unwrap();
        responses.set("forever", bytes("3"), None).await.unwrap();

        assert_eq!(responses.count(true).await.unwrap(), 3);
        assert_eq!(responses.count(false).await.unwrap(), 2);
        assert_eq!(responses.delete_expired().await.unwrap(), Some(1));
        assert_eq!(responses.count(true).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sorted() {
        let (responses, _) = storage().await;
        responses.set("a", bytes("xxx"), in_secs(30)).await.unwrap();
        responses.set("b", bytes("x"), in_secs(10)).await.unwrap();
        responses.set("c", bytes("xx"), in_secs(-10)).await.unwrap();

        let keys = |rows: Vec<(String, Payload)>| rows.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys(responses.sorted(SortKey::Expires, false, None, false).await.unwrap()), ["b", "a"]);
        assert_eq!(keys(responses.sorted(SortKey::Size, true, None, true).await.unwrap()), ["a", "c", "b"]);
        assert_eq!(keys(responses.sorted(SortKey::Key, false, Some(2), true).await.unwrap()), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_prune_redirects_anti_join() {
        let (responses, redirects) = storage().await;
        responses.set("target", bytes("r"), None).await.unwrap();
        redirects.set("alias", bytes("target"), None).await.unwrap();
        redirects.set("stale_alias", bytes("gone"), None).await.unwrap();

        assert_eq!(redirects.prune_against(&responses).await.unwrap(), 1);
        assert_eq!(redirects.keys().await.unwrap(), vec!["alias".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_requires_shared_db() {
        let (_, redirects) = storage().await;
        let (other_responses, _) = storage().await;
        assert!(redirects.prune_against(&other_responses).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_and_vacuum() {
        let (responses, redirects) = storage().await;
        responses.set("k", bytes("v"), None).await.unwrap();
        redirects.set("a", bytes("k"), None).await.unwrap();
        responses.clear().await.unwrap();
        assert_eq!(responses.len().await.unwrap(), 0);
        assert_eq!(redirects.len().await.unwrap(), 1);
        responses.vacuum().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_backed_cache() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("http_cache").to_string_lossy().into_owned();
        let cache = open_cache(&name, &CacheConfig::default()).await.unwrap();
        assert_eq!(cache.backend_name(), "sqlite");
        assert!(dir.path().join("http_cache.sqlite").exists());
    }

    #[test]
    fn test_db_path() {
        let config = SqliteConfig::default();
        assert_eq!(db_path("http_cache", &config), PathBuf::from("http_cache.sqlite"));
        assert_eq!(db_path("cache.db", &config), PathBuf::from("cache.db"));

        let temp = SqliteConfig { use_temp: true, ..Default::default() };
        assert!(db_path("http_cache", &temp).starts_with(std::env::temp_dir()));
    }
}
