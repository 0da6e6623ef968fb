//! Backup-progress estimation.
//!
//! An external backup worker mirrors each device's result database to
//! `<results>/<devid>/<device_name>/<date>_<time>/<backup_filename>`. The
//! node estimates how complete that mirror is by comparing the local file
//! against whatever metadata the device reports: per-table row counts
//! (MySQL-class remotes, incremental backups) or a plain file size
//! (SQLite-class remotes, rsync backups). The policy is picked from the
//! metadata keys, never from filename guessing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Row};

/// Strict backup filename format: `YYYY-MM-DD_HH-MM-SS_<devid>.db`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFilename {
    pub date: String,
    pub time: String,
    pub device_id: String,
}

impl BackupFilename {
    /// Parse a reported backup filename. Returns `None` on any deviation
    /// from the expected format — callers degrade gracefully, they never
    /// fail a poll over a bad filename.
    pub fn parse(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".db")?;
        let mut parts = stem.splitn(3, '_');
        let date = parts.next()?;
        let time = parts.next()?;
        let device_id = parts.next()?;
        if device_id.is_empty() {
            return None;
        }

        // The leading fields must be a real timestamp.
        NaiveDateTime::parse_from_str(&format!("{date}_{time}"), "%Y-%m-%d_%H-%M-%S").ok()?;

        Some(BackupFilename {
            date: date.to_string(),
            time: time.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

/// Derive the local path of the backup file for a device.
pub fn backup_path(results_dir: &Path, device_name: &str, filename: &str) -> Option<PathBuf> {
    let parsed = BackupFilename::parse(filename)?;
    if device_name.is_empty() {
        return None;
    }
    Some(
        results_dir
            .join(&parsed.device_id)
            .join(device_name)
            .join(format!("{}_{}", parsed.date, parsed.time))
            .join(filename),
    )
}

/// Remote database metadata relevant to backup progress.
#[derive(Debug, Clone, Default)]
pub struct RemoteDbInfo {
    pub db_size_bytes: Option<u64>,
    pub table_counts: Option<BTreeMap<String, u64>>,
    /// Epoch seconds of the remote's last update, when reported.
    pub date: Option<f64>,
    pub backup_filename: Option<String>,
    pub db_version: Option<String>,
}

impl RemoteDbInfo {
    /// Extract remote info from one database entry as devices report it
    /// (either a nested `databases.{MariaDB,SQLite}` entry or the flat
    /// legacy `database_info` map).
    pub fn from_value(value: &Value) -> Self {
        let size = value
            .get("filesize")
            .or_else(|| value.get("db_size_bytes"))
            .and_then(Value::as_u64);

        let table_counts = value.get("table_counts").and_then(Value::as_object).map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                .collect()
        });

        RemoteDbInfo {
            db_size_bytes: size,
            table_counts,
            date: value.get("date").and_then(Value::as_f64),
            backup_filename: value
                .get("backup_filename")
                .and_then(Value::as_str)
                .map(str::to_string),
            db_version: value
                .get("db_version")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// How the local mirror is compared against the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupPolicy {
    /// MySQL-class remote: compare summed row counts.
    TableCount(BTreeMap<String, u64>),
    /// SQLite-class remote: compare file sizes.
    FileSize(u64),
}

/// Transfer mechanism implied by the policy, reported in the info dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMethod {
    Rsync,
    Incremental,
}

impl BackupMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMethod::Rsync => "rsync",
            BackupMethod::Incremental => "incremental",
        }
    }
}

impl BackupPolicy {
    /// Choose the policy from the remote metadata keys. A table-count map
    /// wins over a bare size.
    pub fn from_remote(remote: &RemoteDbInfo) -> Option<Self> {
        if let Some(counts) = &remote.table_counts {
            if !counts.is_empty() {
                return Some(BackupPolicy::TableCount(counts.clone()));
            }
        }
        remote.db_size_bytes.map(BackupPolicy::FileSize)
    }

    pub fn method(&self) -> BackupMethod {
        match self {
            BackupPolicy::TableCount(_) => BackupMethod::Incremental,
            BackupPolicy::FileSize(_) => BackupMethod::Rsync,
        }
    }

    /// Backup completeness in percent, clamped to [0, 100].
    pub fn percent(&self, local_size_bytes: u64, local_counts: &BTreeMap<String, u64>) -> f64 {
        match self {
            BackupPolicy::TableCount(remote_counts) => {
                let remote_total: u64 = remote_counts.values().filter(|n| **n > 0).sum();
                if remote_total == 0 {
                    return 0.0;
                }
                let local_total: u64 = remote_counts
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(table, _)| local_counts.get(table).copied().unwrap_or(0))
                    .sum();
                (local_total as f64 / remote_total as f64 * 100.0).min(100.0)
            }
            BackupPolicy::FileSize(remote_size) => {
                if *remote_size == 0 {
                    return 0.0;
                }
                (local_size_bytes as f64 / *remote_size as f64 * 100.0).min(100.0)
            }
        }
    }
}

/// Per-table row counts of a local SQLite backup file, opened read-only.
pub async fn sqlite_table_counts(path: &Path) -> Result<BTreeMap<String, u64>> {
    let options = SqliteConnectOptions::from_str(&path.display().to_string())
        .with_context(|| format!("invalid backup path {}", path.display()))?
        .read_only(true)
        .disable_statement_logging();

    let mut conn = options
        .connect()
        .await
        .with_context(|| format!("opening backup database {}", path.display()))?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_all(&mut conn)
    .await?;

    let mut counts = BTreeMap::new();
    for table in tables {
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM \"{table}\""))
            .fetch_one(&mut conn)
            .await?
            .get("n");
        counts.insert(table, count.max(0) as u64);
    }

    conn.close().await.ok();
    Ok(counts)
}
