use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the analysis and transcode engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Where the analysis cache file lives
    pub cache_path: PathBuf,
    /// How many seconds of decoded video to sample for animation detection
    pub animation_sample_secs: u32,
    /// Average frame entropy at or below this value classifies as animation
    pub animation_entropy_threshold: f64,
    /// Seconds to wait for a graceful encoder quit before force-killing
    pub stop_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EngineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            cache_path: PathBuf::from("cache.json"),
            animation_sample_secs: 20,
            animation_entropy_threshold: 2.5,
            stop_grace_secs: 5,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: EngineConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: EngineConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_carry_reference_heuristics() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.animation_sample_secs, 20);
        assert_eq!(cfg.animation_entropy_threshold, 2.5);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = EngineConfig::load_config(Some(Path::new("/nonexistent/engine.toml"))).unwrap();
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn loads_json_config() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let cfg = EngineConfig {
            ffmpeg_bin: PathBuf::from("/opt/ffmpeg"),
            ..EngineConfig::default()
        };
        write!(f, "{}", serde_json::to_string(&cfg).unwrap()).unwrap();
        let loaded = EngineConfig::load_config(Some(f.path())).unwrap();
        assert_eq!(loaded.ffmpeg_bin, PathBuf::from("/opt/ffmpeg"));
    }
}
