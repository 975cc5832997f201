use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use walkdir::WalkDir;
use crate::cache::{analyze, AnalysisCache, AnalyzedRecord};
use crate::probe::Prober;

/// Media file extensions considered for analysis (matched case-insensitively)
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "mts",
    "m2ts", "rm", "rmvb", "mpg", "mpeg", "vob", "3gp", "f4v", "asf", "ogv",
    "dv",
];

/// Events emitted by a directory scan
#[derive(Debug)]
pub enum ScanEvent {
    /// One analyzed media file
    Found(AnalyzedRecord),
    /// Terminal event, emitted exactly once, after which no further events follow
    Finished,
}

/// Handle to a running scan: drains events and requests cooperative stop
pub struct ScanHandle {
    pub events: UnboundedReceiver<ScanEvent>,
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl ScanHandle {
    /// Request the scan to stop at its next file or directory boundary.
    /// A stopped scan does not flush the cache.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Detached stop switch, usable while the handle's events are being drained
    pub fn stopper(&self) -> ScanStopper {
        ScanStopper(self.stop.clone())
    }

    /// Wait for the scan task to wind down
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Cloneable stop switch for a running scan
#[derive(Clone)]
pub struct ScanStopper(Arc<AtomicBool>);

impl ScanStopper {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Walk a directory tree in the background, emitting one `Found` event per
/// qualifying media file and a single terminal `Finished` event.
///
/// Fresh cache entries are emitted without re-probing. On natural completion
/// the cache is flushed once; on cancellation it is left unflushed so any
/// refreshes made during the aborted scan are discarded on the next load.
/// At most one scan should be active per process; that is the caller's
/// responsibility.
pub fn spawn_scan(
    root: PathBuf,
    mut cache: AnalysisCache,
    prober: Arc<dyn Prober>,
) -> ScanHandle {
    let (tx, events) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));

    let task_stop = stop.clone();
    let task = tokio::spawn(async move {
        run_scan(&root, &mut cache, prober.as_ref(), &task_stop, &tx).await;

        if !task_stop.load(Ordering::SeqCst) {
            if let Err(e) = cache.flush() {
                warn!("Failed to flush analysis cache: {:#}", e);
            }
        } else {
            info!("Scan of {} cancelled, cache left unflushed", root.display());
        }

        // Receiver may already be gone; the terminal event is best-effort
        let _ = tx.send(ScanEvent::Finished);
    });

    ScanHandle { events, stop, task }
}

async fn run_scan(
    root: &PathBuf,
    cache: &mut AnalysisCache,
    prober: &dyn Prober,
    stop: &AtomicBool,
    tx: &UnboundedSender<ScanEvent>,
) {
    info!("Scanning directory: {}", root.display());
    let mut found = 0usize;

    for entry in WalkDir::new(root).follow_links(false) {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !path.is_file() || !is_media_file(path) {
            continue;
        }

        debug!("Analyzing: {}", path.display());
        if let Some(record) = analyze(path, cache, prober).await {
            found += 1;
            if tx.send(ScanEvent::Found(record)).is_err() {
                // Receiver dropped; nobody is listening anymore
                break;
            }
        }
    }

    info!("Scan of {} produced {} records", root.display(), found);
}

/// Analyze an explicit list of files against the cache, flushing at the end.
/// Files that cannot be probed are omitted from the result.
pub async fn import(
    files: &[PathBuf],
    cache: &mut AnalysisCache,
    prober: &dyn Prober,
) -> Vec<AnalyzedRecord> {
    let mut records = Vec::new();
    for path in files {
        if let Some(record) = analyze(path, cache, prober).await {
            records.push(record);
        }
    }

    if let Err(e) = cache.flush() {
        warn!("Failed to flush analysis cache after import: {:#}", e);
    }

    records
}

fn is_media_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubProber;
    use std::path::Path;
    use std::time::Duration;

    fn touch(dir: &Path, rel: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"0123456789").unwrap();
        path
    }

    #[tokio::test]
    async fn scan_finds_media_files_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.mkv");
        touch(dir.path(), "notes.txt");
        let c = touch(dir.path(), "nested/deeper/c.MP4");
        let cache_path = dir.path().join("cache.json");

        let handle = spawn_scan(
            dir.path().to_path_buf(),
            AnalysisCache::empty(&cache_path),
            Arc::new(StubProber::with_duration(90.0)),
        );

        let mut events = handle.events;
        let mut found = Vec::new();
        let mut finished = 0;
        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::Found(r) => found.push(r.path),
                ScanEvent::Finished => finished += 1,
            }
        }

        assert_eq!(finished, 1);
        found.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(found, expected);
        // Natural completion flushes once
        assert!(cache_path.exists());
        assert_eq!(AnalysisCache::load(&cache_path).len(), 2);
    }

    #[tokio::test]
    async fn cancelled_scan_stops_early_and_skips_flush() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            touch(dir.path(), &format!("file{i}.mkv"));
        }
        let cache_path = dir.path().join("cache.json");

        let prober = StubProber::with_duration(90.0).delayed(Duration::from_millis(50));
        let handle = spawn_scan(
            dir.path().to_path_buf(),
            AnalysisCache::empty(&cache_path),
            Arc::new(prober),
        );

        let ScanHandle { mut events, stop, task: _task } = handle;
        // Wait for the first record, then request stop
        let first = events.recv().await;
        assert!(matches!(first, Some(ScanEvent::Found(_))));
        stop.store(true, Ordering::SeqCst);

        let mut later_found = 0;
        let mut finished = 0;
        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::Found(_) => later_found += 1,
                ScanEvent::Finished => finished += 1,
            }
        }

        assert_eq!(finished, 1);
        // At most the file already in flight slips through after stop
        assert!(later_found <= 1, "scan kept walking after stop: {later_found}");
        assert!(!cache_path.exists(), "cancelled scan must not flush");
    }

    #[tokio::test]
    async fn import_skips_unprobeable_files_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.mkv");
        let broken = touch(dir.path(), "broken.mkv");
        let b = touch(dir.path(), "b.avi");
        let cache_path = dir.path().join("cache.json");

        let mut cache = AnalysisCache::empty(&cache_path);
        let prober = StubProber::with_duration(90.0).failing_on("broken");

        let records = import(&[a.clone(), broken, b.clone()], &mut cache, &prober).await;

        // Input order is preserved, the unprobeable file is omitted
        let paths: Vec<_> = records.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths, vec![a.clone(), b]);

        // Import flushes unconditionally at the end
        assert!(cache_path.exists());
        let reloaded = AnalysisCache::load(&cache_path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get(&a), Some(&records[0]));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        assert!(is_media_file(Path::new("/m/video.MKV")));
        assert!(is_media_file(Path::new("/m/video.m2ts")));
        assert!(!is_media_file(Path::new("/m/video.srt")));
        assert!(!is_media_file(Path::new("/m/noext")));
    }
}
