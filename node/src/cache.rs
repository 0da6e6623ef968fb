//! Per-experiment database metadata cache.
//!
//! For every experiment the node keeps one JSON document at
//! `<cache_dir>/db_metadata_<YYYY-MM-DD_HH-MM-SS>_<device_name>_db.json`
//! snapshotting the device's database metadata (size, per-table row counts,
//! version) and experiment info. The cache is the source of remote metadata
//! whenever the device itself is unreachable, and is finalised — recording
//! whether the stop was graceful and why — when a run ends.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::status::epoch_now;

const CACHE_PREFIX: &str = "db_metadata_";
const CACHE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Terminal state of the cached database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbStatus {
    Tracking,
    Finalised,
}

/// Snapshot of a device's remote database metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbSnapshot {
    #[serde(default)]
    pub db_size_bytes: u64,
    #[serde(default)]
    pub table_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub db_version: String,
    #[serde(default)]
    pub last_db_update: f64,
}

/// Experiment information stored alongside the database snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentInfo {
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub backup_filename: String,
    #[serde(default)]
    pub result_writer: String,
}

/// One cache document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDocument {
    pub device_name: String,
    pub tracking_start_time: String,
    pub creation_timestamp: f64,
    pub db_status: DbStatus,
    #[serde(default)]
    pub last_updated: f64,
    #[serde(flatten)]
    pub snapshot: DbSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_info: Option<ExperimentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_gracefully: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_timestamp: Option<f64>,
}

/// Handle to the cache directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    dir: PathBuf,
}

impl MetadataCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        MetadataCache { dir: dir.into() }
    }

    fn file_path(&self, device_name: &str, start: DateTime<Utc>) -> PathBuf {
        let ts = start.format(CACHE_TIMESTAMP_FORMAT);
        self.dir
            .join(format!("{CACHE_PREFIX}{ts}_{device_name}_db.json"))
    }

    /// Create or update the cache document for one experiment.
    pub fn update(
        &self,
        device_name: &str,
        start: DateTime<Utc>,
        snapshot: &DbSnapshot,
        experiment: Option<&ExperimentInfo>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;

        let path = self.file_path(device_name, start);
        let mut doc = match self.read(&path) {
            Some(existing) => existing,
            None => CacheDocument {
                device_name: device_name.to_string(),
                tracking_start_time: start.format(CACHE_TIMESTAMP_FORMAT).to_string(),
                creation_timestamp: epoch_now(),
                db_status: DbStatus::Tracking,
                last_updated: 0.0,
                snapshot: DbSnapshot::default(),
                experiment_info: None,
                stopped_gracefully: None,
                stop_reason: None,
                finalized_timestamp: None,
            },
        };

        doc.snapshot = snapshot.clone();
        doc.last_updated = epoch_now();
        if let Some(info) = experiment {
            doc.experiment_info = Some(info.clone());
        }

        self.write(&path, &doc)?;
        debug!(path = %path.display(), "Updated metadata cache");
        Ok(path)
    }

    /// Finalise the document for an experiment, recording how it stopped.
    /// Finalising a document that was never written is refused.
    pub fn finalise(
        &self,
        device_name: &str,
        start: DateTime<Utc>,
        graceful: bool,
        stop_reason: &str,
    ) -> Result<()> {
        let path = self.file_path(device_name, start);
        let Some(mut doc) = self.read(&path) else {
            warn!(path = %path.display(), "Cannot finalise non-existent cache file");
            return Ok(());
        };

        doc.db_status = DbStatus::Finalised;
        doc.stopped_gracefully = Some(graceful);
        doc.stop_reason = Some(stop_reason.to_string());
        doc.finalized_timestamp = Some(epoch_now());

        self.write(&path, &doc)
    }

    /// The newest cache document for a device, by file modification time.
    pub fn latest(&self, device_name: &str) -> Option<CacheDocument> {
        let files = self.list(device_name);
        files.first().and_then(|path| self.read(path))
    }

    /// All cache files for a device, newest first.
    pub fn list(&self, device_name: &str) -> Vec<PathBuf> {
        let suffix = format!("_{device_name}_db.json");
        let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(CACHE_PREFIX) && name.ends_with(&suffix) {
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                files.push((entry.path(), mtime));
            }
        }

        files.sort_by(|a, b| b.1.cmp(&a.1));
        files.into_iter().map(|(path, _)| path).collect()
    }

    fn read(&self, path: &Path) -> Option<CacheDocument> {
        let contents = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache file");
                None
            }
        }
    }

    fn write(&self, path: &Path, doc: &CacheDocument) -> Result<()> {
        let contents = serde_json::to_string_pretty(doc)?;
        fs::write(path, contents)
            .with_context(|| format!("writing cache file {}", path.display()))?;
        Ok(())
    }
}
