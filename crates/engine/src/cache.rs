use std::collections::HashMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::probe::Prober;
use crate::score::evaluate_compress_value;

/// One fully analyzed media file.
///
/// Never materialized with a non-positive duration: probing failure yields
/// no record at all. Every derived field is recomputed together on refresh;
/// a record is never partially patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedRecord {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub duration_secs: f64,
    pub size_mb: f64,
    pub mb_per_min: f64,
    pub audio_count: u32,
    pub subtitle_count: u32,
    pub codec: String,
    pub bitrate_kbps: u64,
    pub compress_score: u8,
    pub save_pct: u8,
}

/// Persisted mapping from absolute file path to its last-known analysis.
///
/// An entry is trusted only while its stored size and modification time match
/// the file on disk; any mismatch forces a re-probe and overwrite. Loaded
/// wholesale at the start of a scan or import and flushed wholesale at the
/// end. Not designed for concurrent writers.
#[derive(Debug)]
pub struct AnalysisCache {
    path: PathBuf,
    entries: HashMap<PathBuf, AnalyzedRecord>,
}

impl AnalysisCache {
    /// Load the cache from disk. A missing, unreadable, or corrupt file is
    /// treated as an empty cache, never an error.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Discarding unreadable cache {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        debug!("Loaded {} cache entries from {}", entries.len(), path.display());
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    /// In-memory cache with a storage path but no persisted state
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, path: &Path) -> Option<&AnalyzedRecord> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, record: AnalyzedRecord) {
        self.entries.insert(record.path.clone(), record);
    }

    /// Drop an entry so a later flush forgets it
    pub fn remove(&mut self, path: &Path) -> Option<AnalyzedRecord> {
        self.entries.remove(path)
    }

    pub fn records(&self) -> impl Iterator<Item = &AnalyzedRecord> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the whole mapping. This is the only point at which the cache
    /// touches disk after loading.
    pub fn flush(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries)
            .context("Failed to serialize analysis cache")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write cache file: {}", self.path.display()))?;
        debug!("Flushed {} cache entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

/// Analyze a file, trusting a fresh cache entry when size and modification
/// time still match. Returns None when the file cannot be statted or its
/// duration cannot be probed; nothing is stored in that case.
pub async fn analyze(
    path: &Path,
    cache: &mut AnalysisCache,
    prober: &dyn Prober,
) -> Option<AnalyzedRecord> {
    let meta = std::fs::metadata(path).ok()?;
    let size = meta.len();
    let mtime: DateTime<Utc> = meta.modified().ok().map(DateTime::from)?;

    if let Some(cached) = cache.get(path) {
        if cached.size == size && cached.mtime == mtime {
            return Some(cached.clone());
        }
    }

    let duration_secs = prober.duration_secs(path).await;
    if duration_secs <= 0.0 {
        return None;
    }

    let size_mb = size as f64 / 1024.0 / 1024.0;
    let mb_per_min = size_mb / (duration_secs / 60.0);
    let (audio_count, subtitle_count) = prober.stream_counts(path).await;
    let (codec, bitrate_kbps) = prober.video_quality(path).await;
    let (compress_score, save_pct) = evaluate_compress_value(&codec, bitrate_kbps, mb_per_min);

    let record = AnalyzedRecord {
        path: path.to_path_buf(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size,
        mtime,
        duration_secs,
        size_mb,
        mb_per_min,
        audio_count,
        subtitle_count,
        codec,
        bitrate_kbps,
        compress_score,
        save_pct,
    };

    cache.insert(record.clone());
    Some(record)
}
