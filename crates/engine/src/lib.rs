pub mod cache;
pub mod config;
pub mod probe;
pub mod proc;
pub mod scan;
pub mod score;
pub mod transcode;

pub use cache::{analyze, AnalysisCache, AnalyzedRecord};
pub use config::EngineConfig;
pub use probe::{FfmpegProber, Prober};
pub use scan::{import, spawn_scan, ScanEvent, ScanHandle, ScanStopper, MEDIA_EXTENSIONS};
pub use score::evaluate_compress_value;
pub use transcode::{spawn_job, Encoder, JobController, JobEvent, JobHandle, TranscodeJob};

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use async_trait::async_trait;
    use crate::probe::Prober;

    /// Scripted prober for tests; counts duration probes so freshness
    /// behavior can be asserted without touching ffmpeg
    pub struct StubProber {
        duration: f64,
        codec: String,
        bitrate_kbps: u64,
        resolution: (u32, u32),
        animation: bool,
        delay: Option<Duration>,
        fail_substr: Option<String>,
        duration_calls: AtomicUsize,
    }

    impl StubProber {
        pub fn with_duration(duration: f64) -> Self {
            Self {
                duration,
                codec: "h264".to_string(),
                bitrate_kbps: 4500,
                resolution: (1920, 1080),
                animation: false,
                delay: None,
                fail_substr: None,
                duration_calls: AtomicUsize::new(0),
            }
        }

        /// Slow every probe down, so tests can interleave cancellation
        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Report any path containing this substring as unprobeable
        pub fn failing_on(mut self, name: &str) -> Self {
            self.fail_substr = Some(name.to_string());
            self
        }

        pub fn duration_calls(&self) -> usize {
            self.duration_calls.load(Ordering::SeqCst)
        }

        async fn pause_if_configured(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl Prober for StubProber {
        async fn duration_secs(&self, path: &Path) -> f64 {
            self.pause_if_configured().await;
            self.duration_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(s) = &self.fail_substr {
                if path.to_string_lossy().contains(s.as_str()) {
                    return 0.0;
                }
            }
            self.duration
        }

        async fn video_quality(&self, _path: &Path) -> (String, u64) {
            (self.codec.clone(), self.bitrate_kbps)
        }

        async fn resolution(&self, _path: &Path) -> (u32, u32) {
            self.resolution
        }

        async fn stream_counts(&self, _path: &Path) -> (u32, u32) {
            (1, 0)
        }

        async fn detect_animation(&self, _path: &Path) -> bool {
            self.animation
        }
    }
}
