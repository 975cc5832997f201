use std::path::Path;
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;
use crate::config::EngineConfig;

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    #[serde(rename = "codec_type")]
    pub codec_type: Option<String>,
    #[serde(rename = "codec_name")]
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
}

/// Top-level ffprobe JSON output
#[derive(Debug, Clone, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

/// Read-only metadata extraction from media files.
///
/// Every operation is infallible by contract: probing failures degrade to the
/// documented default instead of propagating. A duration of `0.0` is the one
/// signal callers use to skip a file entirely.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Container duration in seconds; `0.0` when the file cannot be probed
    async fn duration_secs(&self, path: &Path) -> f64;

    /// Codec name and average bitrate in kbps of the first video stream.
    /// Missing codec yields `"unknown"`, missing bitrate yields `0`.
    async fn video_quality(&self, path: &Path) -> (String, u64);

    /// Width and height of the first video stream; `(1920, 1080)` on failure
    async fn resolution(&self, path: &Path) -> (u32, u32);

    /// Audio and subtitle stream counts; `(1, 0)` on failure
    async fn stream_counts(&self, path: &Path) -> (u32, u32);

    /// Heuristic animation classification from a bounded decode of the file
    /// head. `false` on any failure; misclassification only changes which
    /// encoder tuning hint is applied.
    async fn detect_animation(&self, path: &Path) -> bool;
}

/// Prober backed by the ffprobe and ffmpeg binaries
#[derive(Debug, Clone)]
pub struct FfmpegProber {
    ffprobe_bin: std::path::PathBuf,
    ffmpeg_bin: std::path::PathBuf,
    sample_secs: u32,
    entropy_threshold: f64,
}

impl FfmpegProber {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ffprobe_bin: config.ffprobe_bin.clone(),
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            sample_secs: config.animation_sample_secs,
            entropy_threshold: config.animation_entropy_threshold,
        }
    }

    /// Run ffprobe with the given args and return stdout, or None on any failure
    async fn run_ffprobe(&self, args: &[&str], path: &Path) -> Option<String> {
        let output = Command::new(&self.ffprobe_bin)
            .args(args)
            .arg(path)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            debug!(
                "ffprobe exited with {:?} for {}",
                output.status.code(),
                path.display()
            );
            return None;
        }

        String::from_utf8(output.stdout).ok()
    }

    async fn probe_streams(&self, args: &[&str], path: &Path) -> Option<Vec<ProbeStream>> {
        let stdout = self.run_ffprobe(args, path).await?;
        let parsed: ProbeOutput = serde_json::from_str(&stdout).ok()?;
        Some(parsed.streams)
    }
}

#[async_trait]
impl Prober for FfmpegProber {
    async fn duration_secs(&self, path: &Path) -> f64 {
        let args = [
            "-v", "error",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
        ];
        match self.run_ffprobe(&args, path).await {
            Some(stdout) => stdout.trim().parse::<f64>().unwrap_or(0.0),
            None => 0.0,
        }
    }

    async fn video_quality(&self, path: &Path) -> (String, u64) {
        let args = [
            "-v", "error",
            "-select_streams", "v:0",
            "-show_entries", "stream=codec_name,bit_rate",
            "-of", "json",
        ];
        let Some(streams) = self.probe_streams(&args, path).await else {
            return ("unknown".to_string(), 0);
        };
        let Some(stream) = streams.first() else {
            return ("unknown".to_string(), 0);
        };

        let codec = stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let bitrate_kbps = stream
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok())
            .map(|b| b / 1000)
            .unwrap_or(0);

        (codec, bitrate_kbps)
    }

    async fn resolution(&self, path: &Path) -> (u32, u32) {
        let args = [
            "-v", "error",
            "-select_streams", "v:0",
            "-show_entries", "stream=width,height",
            "-of", "json",
        ];
        self.probe_streams(&args, path)
            .await
            .and_then(|streams| {
                let s = streams.first()?;
                Some((s.width?, s.height?))
            })
            .unwrap_or((1920, 1080))
    }

    async fn stream_counts(&self, path: &Path) -> (u32, u32) {
        let args = ["-v", "error", "-show_streams", "-of", "json"];
        let Some(streams) = self.probe_streams(&args, path).await else {
            // Assume at least one audio track exists when probing fails
            return (1, 0);
        };

        let mut audio = 0;
        let mut subtitles = 0;
        for s in &streams {
            match s.codec_type.as_deref() {
                Some("audio") => audio += 1,
                Some("subtitle") => subtitles += 1,
                _ => {}
            }
        }
        (audio, subtitles)
    }

    async fn detect_animation(&self, path: &Path) -> bool {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-v").arg("error")
            .arg("-t").arg(self.sample_secs.to_string())
            .arg("-i").arg(path)
            .arg("-vf").arg("signalstats")
            .arg("-f").arg("null")
            .arg("-")
            .output()
            .await;

        let Ok(output) = output else {
            return false;
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        match average_entropy(&stderr) {
            Some(avg) => avg <= self.entropy_threshold,
            None => false,
        }
    }
}

/// Average of all per-frame entropy values found in the filter output,
/// or None when no value was produced
fn average_entropy(text: &str) -> Option<f64> {
    let values: Vec<f64> = text.lines().filter_map(parse_entropy).collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Extract the numeric value following `entropy:` on a single line
fn parse_entropy(line: &str) -> Option<f64> {
    let idx = line.find("entropy:")?;
    let rest = line[idx + "entropy:".len()..].trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entropy_line() {
        assert_eq!(
            parse_entropy("[Parsed_signalstats_0 @ 0x1] entropy: 4.25"),
            Some(4.25)
        );
        assert_eq!(parse_entropy("lavfi.signalstats.entropy:2.1 more"), Some(2.1));
        assert_eq!(parse_entropy("no signal here"), None);
        assert_eq!(parse_entropy("entropy: not-a-number"), None);
    }

    #[test]
    fn averages_entropy_across_lines() {
        let text = "frame 1 entropy: 2.0\nnoise\nframe 2 entropy: 4.0\n";
        assert_eq!(average_entropy(text), Some(3.0));
    }

    #[test]
    fn no_entropy_values_yields_none() {
        assert_eq!(average_entropy("nothing useful\nat all"), None);
    }
}
