//! Database schema migrations.
//!
//! Each cache table is migrated on its own; applied versions are tracked per
//! table in `_migrations`. Databases written before expiration tracking
//! existed lack the `expires` column and are upgraded in place.

use tokio_rusqlite::{Connection, params, rusqlite};

use crate::Error;

/// A schema step for one table.
struct Migration {
    version: i64,
    description: &'static str,
    sql: fn(&str) -> String,
    /// Failures are logged and the step recorded as applied.
    tolerate_failure: bool,
}

/// Migrations must be applied in order; each is recorded once per table.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create table",
        sql: create_table,
        tolerate_failure: false,
    },
    Migration {
        version: 2,
        description: "add expires column",
        sql: add_expires,
        tolerate_failure: true,
    },
    Migration {
        version: 3,
        description: "index expires",
        sql: index_expires,
        tolerate_failure: false,
    },
];

fn create_table(t: &str) -> String {
    format!("CREATE TABLE IF NOT EXISTS \"{t}\" (key TEXT PRIMARY KEY, value BLOB, expires INTEGER)")
}

fn add_expires(t: &str) -> String {
    format!("ALTER TABLE \"{t}\" ADD COLUMN expires INTEGER")
}

fn index_expires(t: &str) -> String {
    format!("CREATE INDEX IF NOT EXISTS \"{t}_expires_idx\" ON \"{t}\" (expires)")
}

/// Table names are interpolated into SQL, so only plain identifiers are accepted.
pub fn validate_table_name(table: &str) -> Result<(), Error> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid { Ok(()) } else { Err(Error::Config(format!("invalid SQLite table name: {table:?}"))) }
}

/// Run any pending migrations for `table`.
///
/// # Errors
///
/// Returns an error if the table name is invalid or a migration that must
/// succeed fails.
pub async fn run(conn: &Connection, table: &str) -> Result<(), Error> {
    validate_table_name(table)?;
    let table = table.to_string();
    conn.call(move |conn| -> Result<(), Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (name, version)
            )",
            [],
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations WHERE name = ?1",
            params![table],
            |row| row.get(0),
        )?;

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            match conn.execute_batch(&(migration.sql)(&table)) {
                Ok(()) => {}
                Err(e) if migration.tolerate_failure => {
                    tracing::debug!(table = %table, migration = migration.description, error = %e, "skipped migration");
                }
                Err(e) => {
                    return Err(Error::MigrationFailed(format!("{table} v{}: {e}", migration.version)));
                }
            }
            conn.execute(
                "INSERT INTO _migrations (name, version, applied_at) VALUES (?1, ?2, ?3)",
                params![table, migration.version, chrono::Utc::now().to_rfc3339()],
            )?;
        }
        Ok(())
    })
    .await
    .map_err(Error::from)
}

/// Columns of `table`, for schema checks.
pub fn columns(conn: &rusqlite::Connection, table: &str) -> Result<Vec<String>, Error> {
    validate_table_name(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?.collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().await.unwrap();
        run(&conn, "responses").await.unwrap();
        run(&conn, "responses").await.unwrap();

        let has_index: bool = conn
            .call(|conn| {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='index' AND name='responses_expires_idx')",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert!(has_index);
    }

    #[tokio::test]
    async fn test_migrations_version_tracking_per_table() {
        let conn = Connection::open_in_memory().await.unwrap();
        run(&conn, "responses").await.unwrap();
        run(&conn, "redirects").await.unwrap();

        let count: i64 = conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 2 * MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_legacy_table_gains_expires_column() {
        let conn = Connection::open_in_memory().await.unwrap();
        conn.call(|conn| conn.execute_batch("CREATE TABLE responses (key TEXT PRIMARY KEY, value BLOB)"))
            .await
            .unwrap();

        run(&conn, "responses").await.unwrap();
        let cols = conn
            .call(|conn| columns(conn, "responses"))
            .await
            .unwrap();
        assert!(cols.contains(&"expires".to_string()));
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("responses").is_ok());
        assert!(validate_table_name("my_cache_2").is_ok());
        assert!(validate_table_name("bad; DROP TABLE x").is_err());
        assert!(validate_table_name("1abc").is_err());
        assert!(validate_table_name("").is_err());
    }
}
