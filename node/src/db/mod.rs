//! Registry store: one embedded SQLite file holding devices, users,
//! incubators, runs, experiments and the alert log.
//!
//! Opening the store runs migrations; opening it twice is a no-op. The
//! versioned initial schema is applied through a `_migrations` tracking
//! table, followed by idempotent structural fixups for databases written by
//! older node versions (missing columns, a legacy auto-increment primary
//! key on the device table, users kept in a flat config file).

pub mod pin;
pub mod registry;

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

pub use registry::{
    EthoscopeRecord, EthoscopeUpdate, NewRun, NewUser, Registry, RunRecord, UserRecord,
};

/// The initial migration SQL, embedded at compile time.
const INIT_MIGRATION: &str = include_str!("migrations/001_init.sql");

/// Canonical device-table columns, used both at creation time and when
/// rebuilding a legacy table around the `ethoscope_id` primary key.
const ETHOSCOPE_COLUMNS: &[&str] = &[
    "ethoscope_id",
    "ethoscope_name",
    "first_seen",
    "last_seen",
    "active",
    "last_ip",
    "status",
    "machineinfo",
    "problems",
    "comments",
];

/// Initialize the SQLite pool and run all migrations.
pub async fn init(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    // In-memory databases exist per connection; a larger pool would hand
    // each connection its own empty database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    info!("Registry migrations applied");

    Ok(pool)
}

/// Apply migrations using a simple version-tracking approach, then the
/// idempotent structural fixups.
async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (\
         version INTEGER PRIMARY KEY, \
         applied_at TEXT NOT NULL DEFAULT (datetime('now')))",
    )
    .execute(pool)
    .await?;

    let applied: bool = sqlx::query("SELECT 1 FROM _migrations WHERE version = 1")
        .fetch_optional(pool)
        .await?
        .is_some();

    if !applied {
        for statement in INIT_MIGRATION.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() || stmt.starts_with("--") {
                continue;
            }
            sqlx::query(stmt).execute(pool).await?;
        }

        sqlx::query("INSERT INTO _migrations (version) VALUES (1)")
            .execute(pool)
            .await?;

        info!("Applied migration 001_init.sql");
    }

    // Structural fixups for databases written by older node versions.
    // Safe to re-run on every open.
    ensure_column(pool, "users", "telephone", "TEXT NOT NULL DEFAULT ''").await?;
    ensure_column(pool, "alert_logs", "run_id", "TEXT NOT NULL DEFAULT ''").await?;
    migrate_ethoscopes_primary_key(pool).await?;

    Ok(())
}

/// Column names of a table, via `PRAGMA table_info`.
async fn table_columns(pool: &SqlitePool, table: &str) -> Result<HashSet<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| row.get::<String, _>("name"))
        .collect())
}

/// Add a column if the table does not already have it.
async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, ddl: &str) -> Result<()> {
    let columns = table_columns(pool, table).await?;
    if !columns.contains(column) {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
            .execute(pool)
            .await?;
        info!(table, column, "Added missing column");
    }
    Ok(())
}

/// Old databases keyed the device table on an auto-increment `id` column,
/// which allowed duplicate rows per device. Rebuild around `ethoscope_id`,
/// keeping the most recently seen row for each device.
async fn migrate_ethoscopes_primary_key(pool: &SqlitePool) -> Result<()> {
    let columns = table_columns(pool, "ethoscopes").await?;
    if !columns.contains("id") {
        return Ok(());
    }

    info!("Rebuilding ethoscopes table around ethoscope_id primary key");

    let shared: Vec<&str> = ETHOSCOPE_COLUMNS
        .iter()
        .copied()
        .filter(|c| columns.contains(*c))
        .collect();
    let col_list = shared.join(", ");

    sqlx::query(
        "CREATE TABLE ethoscopes_migrated (\
         ethoscope_id TEXT PRIMARY KEY, \
         ethoscope_name TEXT NOT NULL DEFAULT '', \
         first_seen TEXT NOT NULL, \
         last_seen TEXT NOT NULL, \
         active INTEGER NOT NULL DEFAULT 1, \
         last_ip TEXT, \
         status TEXT NOT NULL DEFAULT 'offline', \
         machineinfo TEXT, \
         problems TEXT NOT NULL DEFAULT '', \
         comments TEXT NOT NULL DEFAULT '')",
    )
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO ethoscopes_migrated ({col_list}) \
         SELECT {col_list} FROM ethoscopes WHERE rowid IN (\
           SELECT rowid FROM (\
             SELECT rowid, ROW_NUMBER() OVER (\
               PARTITION BY ethoscope_id ORDER BY last_seen DESC, rowid DESC\
             ) AS rn FROM ethoscopes\
           ) WHERE rn = 1)"
    ))
    .execute(pool)
    .await?;

    sqlx::query("DROP TABLE ethoscopes").execute(pool).await?;
    sqlx::query("ALTER TABLE ethoscopes_migrated RENAME TO ethoscopes")
        .execute(pool)
        .await?;

    Ok(())
}

/// One user entry in the legacy flat config file.
#[derive(Debug, serde::Deserialize)]
struct LegacyUser {
    #[serde(default)]
    fullname: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    pin: String,
    #[serde(default)]
    labname: String,
    #[serde(default)]
    isadmin: bool,
}

/// Import users from a legacy JSON config file, if and only if the users
/// table is empty. The file maps username to user fields.
pub async fn migrate_legacy_users(pool: &SqlitePool, path: &Path) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    if count > 0 || !path.exists() {
        return Ok(0);
    }

    let contents = std::fs::read_to_string(path)?;
    let legacy: std::collections::BTreeMap<String, LegacyUser> =
        serde_json::from_str(&contents)?;

    let now = chrono::Utc::now().to_rfc3339();
    let mut imported = 0u64;
    for (username, user) in legacy {
        if username.is_empty() || user.email.is_empty() {
            continue;
        }
        let pin_hash = if user.pin.is_empty() {
            String::new()
        } else {
            pin::hash_pin(&user.pin)
        };
        let result = sqlx::query(
            "INSERT OR IGNORE INTO users \
             (username, fullname, email, pin, labname, active, isadmin, created) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&username)
        .bind(&user.fullname)
        .bind(&user.email)
        .bind(&pin_hash)
        .bind(&user.labname)
        .bind(user.isadmin as i64)
        .bind(&now)
        .execute(pool)
        .await?;
        imported += result.rows_affected();
    }

    if imported > 0 {
        info!(imported, path = %path.display(), "Imported users from legacy config file");
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_creates_all_tables() {
        let pool = init(":memory:").await.expect("in-memory DB init failed");

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        for expected in [
            "alert_logs",
            "ethoscopes",
            "experiments",
            "incubators",
            "runs",
            "users",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "table {expected} not created"
            );
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init(":memory:").await.unwrap();
        // A second pass over the same pool must be a no-op.
        run_migrations(&pool).await.expect("second open failed");
        run_migrations(&pool).await.expect("third open failed");
    }

    #[tokio::test]
    async fn test_ensure_column_adds_once() {
        let pool = init(":memory:").await.unwrap();
        let before = table_columns(&pool, "users").await.unwrap();
        assert!(before.contains("telephone"));

        ensure_column(&pool, "users", "telephone", "TEXT NOT NULL DEFAULT ''")
            .await
            .expect("re-adding existing column must be a no-op");
    }

    #[tokio::test]
    async fn test_legacy_ethoscopes_pk_rebuild_dedupes() {
        // Simulate an old database: device table keyed on auto-increment id
        // with duplicate ethoscope_id rows.
        let options = SqliteConnectOptions::from_str(":memory:")
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE ethoscopes (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             ethoscope_id TEXT, ethoscope_name TEXT, \
             first_seen TEXT, last_seen TEXT, \
             active INTEGER, status TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();

        for (seen, name) in [("2024-01-01T00:00:00+00:00", "OLD"), ("2025-01-01T00:00:00+00:00", "NEW")] {
            sqlx::query(
                "INSERT INTO ethoscopes \
                 (ethoscope_id, ethoscope_name, first_seen, last_seen, active, status) \
                 VALUES ('abc', ?, ?, ?, 1, 'offline')",
            )
            .bind(name)
            .bind(seen)
            .bind(seen)
            .execute(&pool)
            .await
            .unwrap();
        }

        migrate_ethoscopes_primary_key(&pool).await.unwrap();

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT ethoscope_id, ethoscope_name FROM ethoscopes")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows.len(), 1, "duplicates must collapse to one row");
        assert_eq!(rows[0].1, "NEW", "the most recent row wins");

        let columns = table_columns(&pool, "ethoscopes").await.unwrap();
        assert!(!columns.contains("id"));
        assert!(columns.contains("ethoscope_id"));
    }

    #[tokio::test]
    async fn test_legacy_user_import_only_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let legacy_path = dir.path().join("users.json");
        std::fs::write(
            &legacy_path,
            r#"{"alice": {"fullname": "Alice", "email": "alice@lab.org", "pin": "1234"}}"#,
        )
        .unwrap();

        let pool = init(":memory:").await.unwrap();
        let imported = migrate_legacy_users(&pool, &legacy_path).await.unwrap();
        assert_eq!(imported, 1);

        // Users table is no longer empty: a second import is a no-op.
        let imported = migrate_legacy_users(&pool, &legacy_path).await.unwrap();
        assert_eq!(imported, 0);

        let pin: String = sqlx::query_scalar("SELECT pin FROM users WHERE username = 'alice'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(pin.starts_with("pbkdf2$"), "imported PINs are hashed");
    }
}
