//! Database connection management with pragma configuration.
//!
//! One [`SqliteDb`] is shared by the `responses` and `redirects` tables of a
//! cache. Writes go through [`SqliteDb::write`], which serialises them on a
//! per-database lock and retries while SQLite reports the file as locked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_rusqlite::{Connection, rusqlite};

use super::migrations;
use crate::Error;

/// Connection options.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Use write-ahead logging.
    pub wal: bool,
    /// Turn off fsync on commit. Faster, but a crash may lose recent writes.
    pub fast_save: bool,
    /// Extra attempts for a write that fails with `SQLITE_BUSY`/`SQLITE_LOCKED`.
    pub busy_retries: u32,
    pub busy_sleep: Duration,
    /// How long SQLite itself waits on a lock before reporting busy.
    pub timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            wal: false,
            fast_save: false,
            busy_retries: 3,
            busy_sleep: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Cache database handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread. Clones share the connection and the write lock.
#[derive(Clone, Debug)]
pub struct SqliteDb {
    conn: Arc<RwLock<Connection>>,
    path: Option<PathBuf>,
    options: SqliteOptions,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteDb {
    /// Open a database at the specified path.
    ///
    /// Creates the file and its parent directories if they don't exist and
    /// applies the configured pragmas. Tables are created by [`SqliteDb::ensure_table`].
    pub async fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = connect(Some(&path), &options).await?;
        tracing::debug!(path = %path.display(), wal = options.wal, fast_save = options.fast_save, "opened SQLite cache");
        Ok(Self { conn: Arc::new(RwLock::new(conn)), path: Some(path), options, write_lock: Arc::new(Mutex::new(())) })
    }

    /// Open an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let options = SqliteOptions::default();
        let conn = connect(None, &options).await?;
        Ok(Self { conn: Arc::new(RwLock::new(conn)), path: None, options, write_lock: Arc::new(Mutex::new(())) })
    }

    /// Database file, or `None` for an in-memory database.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    /// True if both handles point at the same database.
    pub fn same_db(&self, other: &SqliteDb) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    /// Create (or upgrade) a key/value table.
    pub async fn ensure_table(&self, table: &str) -> Result<(), Error> {
        let conn = self.conn.read().await.clone();
        migrations::run(&conn, table).await
    }

    /// Run a read-only closure. No lock is held once the connection is obtained.
    pub async fn read<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.read().await.clone();
        conn.call(f).await.map_err(Error::from)
    }

    /// Run a writing closure under the write lock, retrying while the database is locked.
    pub async fn write<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: Fn(&mut rusqlite::Connection) -> Result<R, Error> + Clone + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let mut attempt = 0;
        loop {
            let conn = self.conn.read().await.clone();
            let op = f.clone();
            match conn.call(move |c| op(c)).await.map_err(Error::from) {
                Err(e) if e.is_database_locked() && attempt < self.options.busy_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, retries = self.options.busy_retries, "database is locked, retrying write");
                    tokio::time::sleep(self.options.busy_sleep).await;
                }
                result => return result,
            }
        }
    }

    /// Size of the database in bytes.
    pub async fn size(&self) -> Result<u64, Error> {
        if let Some(path) = &self.path {
            return Ok(tokio::fs::metadata(path).await?.len());
        }
        self.read(|conn| -> Result<u64, Error> {
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            Ok(u64::try_from(pages * page_size).unwrap_or_default())
        })
        .await
    }

    /// Rebuild free pages and shrink the file.
    pub async fn vacuum(&self) -> Result<(), Error> {
        self.write(|conn| -> Result<(), Error> {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await
    }

    /// Throw away the database file and start over with empty `tables`.
    pub async fn recreate(&self, tables: &[String]) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.conn.write().await;
        if let Some(path) = &self.path {
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let mut file = path.as_os_str().to_owned();
                file.push(suffix);
                match tokio::fs::remove_file(&file).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
        }
        let fresh = connect(self.path.as_deref(), &self.options).await?;
        for table in tables {
            migrations::run(&fresh, table).await?;
        }
        *conn = fresh;
        tracing::warn!(path = ?self.path, "recreated SQLite cache database");
        Ok(())
    }
}

async fn connect(path: Option<&Path>, options: &SqliteOptions) -> Result<Connection, Error> {
    let conn = match path {
        Some(path) => Connection::open(path).await,
        None => Connection::open_in_memory().await,
    }
    .map_err(|e| Error::Database(e.into()))?;

    let mut pragmas = String::from("PRAGMA temp_store=MEMORY;");
    if options.wal {
        pragmas.push_str("PRAGMA journal_mode=WAL;");
    }
    if options.fast_save {
        pragmas.push_str("PRAGMA synchronous=OFF;");
    }
    let timeout = options.timeout;
    conn.call(move |conn| {
        conn.busy_timeout(timeout)?;
        conn.execute_batch(&pragmas)?;
        Ok(())
    })
    .await
    .map_err(Error::Database)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = SqliteDb::open_in_memory().await.unwrap();
        let version = db
            .read(|conn| Ok(conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))?))
            .await
            .unwrap();
        assert!(!version.is_empty());
        assert!(db.path().is_none());

        db.ensure_table("responses").await.unwrap();
        assert!(db.size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs_and_applies_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/http_cache.sqlite");
        let options = SqliteOptions { wal: true, ..Default::default() };
        let db = SqliteDb::open(&path, options).await.unwrap();
        assert!(path.exists());

        let mode = db
            .read(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))?))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_clones_share_connection() {
        let db = SqliteDb::open_in_memory().await.unwrap();
        let other = SqliteDb::open_in_memory().await.unwrap();
        assert!(db.same_db(&db.clone()));
        assert!(!db.same_db(&other));
    }

    #[tokio::test]
    async fn test_recreate_drops_data() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDb::open(dir.path().join("cache.sqlite"), SqliteOptions::default()).await.unwrap();
        db.ensure_table("responses").await.unwrap();
        db.write(|conn| -> Result<(), Error> {
            conn.execute("INSERT INTO responses (key, value) VALUES ('k', x'00')", [])?;
            Ok(())
        })
        .await
        .unwrap();

        db.recreate(&["responses".to_string()]).await.unwrap();
        let count: i64 = db
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
