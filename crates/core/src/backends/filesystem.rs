//! Filesystem storage: one file per response, `<dir>/<key>.<ext>`.
//!
//! Redirect aliases live in a small SQLite database, `<dir>/redirects.sqlite`.
//! I/O failures on reads and deletes are reported as missing keys.

use std::any::Any;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::sqlite::{REDIRECTS_TABLE, SqliteDb, SqliteStorage};
use super::{Storage, configured_serializer};
use crate::Error;
use crate::cache::BaseCache;
use crate::config::{CacheConfig, FilesystemConfig};
use crate::serializers::Payload;

pub const REDIRECTS_FILE: &str = "redirects.sqlite";

#[derive(Debug)]
pub struct FilesystemStorage {
    dir: PathBuf,
    extension: String,
    lock: Mutex<()>,
}

impl FilesystemStorage {
    /// Use `dir` for response files, creating it if needed.
    pub async fn new(dir: impl Into<PathBuf>, extension: &str) -> Result<Self, Error> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, extension: extension.trim_start_matches('.').to_string(), lock: Mutex::new(()) })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the value for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{}", self.extension))
    }

    /// Paths of all stored response files.
    pub async fn paths(&self) -> Result<Vec<PathBuf>, Error> {
        let mut paths = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == self.extension.as_str()) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Total size of the response files in bytes.
    pub async fn size(&self) -> Result<u64, Error> {
        let mut total = 0;
        for path in self.paths().await? {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    fn backend(&self) -> &'static str {
        "filesystem"
    }

    async fn get(&self, key: &str) -> Result<Option<Payload>, Error> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(Payload::Bytes(bytes))),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::debug!(key, error = %e, "unreadable cache file treated as missing");
                }
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Payload, _expires: Option<DateTime<Utc>>) -> Result<(), Error> {
        let bytes = value.into_bytes()?;
        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(key), bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        tokio::fs::remove_file(self.path_for(key))
            .await
            .map_err(|_| Error::KeyNotFound(key.to_string()))
    }

    async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await.unwrap_or(false))
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .paths()
            .await?
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect())
    }

    /// Removes and recreates the directory; removal failures are ignored.
    async fn clear(&self) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        for path in self.paths().await.unwrap_or_default() {
            let _ = tokio::fs::remove_file(path).await;
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Directory for a cache name, under the temp dir with `use_temp`.
pub fn cache_dir(cache_name: &str, config: &FilesystemConfig) -> PathBuf {
    let dir = PathBuf::from(cache_name);
    if config.use_temp && dir.is_relative() { std::env::temp_dir().join(dir) } else { dir }
}

/// A filesystem cache rooted at the directory named by `cache_name`.
pub async fn open_cache(cache_name: &str, config: &CacheConfig) -> Result<BaseCache, Error> {
    let serializer = configured_serializer(config, "json")?;
    let dir = cache_dir(cache_name, &config.filesystem);
    let responses = FilesystemStorage::new(&dir, serializer.extension()).await?;
    let db = SqliteDb::open(dir.join(REDIRECTS_FILE), config.sqlite.options()).await?;
    let redirects = SqliteStorage::new(db, REDIRECTS_TABLE).await?;
    tracing::debug!(dir = %dir.display(), extension = serializer.extension(), "opened filesystem cache");
    BaseCache::new(cache_name, Arc::new(responses), Arc::new(redirects), serializer, config)
}
