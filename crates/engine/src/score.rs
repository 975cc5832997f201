//! Compression-value scoring.
//!
//! Maps probed stream metrics to a 0-100 "worth transcoding" score plus a
//! coarse estimated-savings percentage. Deterministic: identical inputs
//! always produce identical output.

/// Codecs old enough that re-encoding almost always pays off
const LEGACY_CODECS: &[&str] = &["mpeg4", "xvid", "divx"];
/// Widely deployed but superseded codecs
const SUPERSEDED_CODECS: &[&str] = &["h264", "avc"];
/// Codecs already efficient enough that re-encoding rarely helps
const EFFICIENT_CODECS: &[&str] = &["hevc", "h265", "av1", "vp9"];

const LEGACY_CODEC_WEIGHT: i32 = 40;
const SUPERSEDED_CODEC_WEIGHT: i32 = 25;
const EFFICIENT_CODEC_WEIGHT: i32 = -30;

const HIGH_BITRATE_KBPS: u64 = 6000;
const MID_BITRATE_KBPS: u64 = 3500;
const LOW_BITRATE_KBPS: u64 = 2500;
const HIGH_BITRATE_WEIGHT: i32 = 30;
const MID_BITRATE_WEIGHT: i32 = 15;
const LOW_BITRATE_WEIGHT: i32 = -20;

const HIGH_DENSITY_MB_PER_MIN: f64 = 80.0;
const MID_DENSITY_MB_PER_MIN: f64 = 50.0;
const LOW_DENSITY_MB_PER_MIN: f64 = 40.0;
const HIGH_DENSITY_WEIGHT: i32 = 30;
const MID_DENSITY_WEIGHT: i32 = 15;
const LOW_DENSITY_WEIGHT: i32 = -20;

/// Savings buckets: (minimum score, estimated savings percent)
const SAVINGS_BUCKETS: &[(u8, u8)] = &[(70, 60), (50, 40), (30, 25)];
const SAVINGS_FLOOR_PCT: u8 = 10;

/// Score how much a file would benefit from re-encoding.
///
/// Returns `(score, save_pct)` where score is clamped to 0..=100 and
/// save_pct is one of the fixed bucket values (10, 25, 40, 60).
pub fn evaluate_compress_value(codec: &str, bitrate_kbps: u64, mb_per_min: f64) -> (u8, u8) {
    let mut score: i32 = 0;

    if LEGACY_CODECS.contains(&codec) {
        score += LEGACY_CODEC_WEIGHT;
    } else if SUPERSEDED_CODECS.contains(&codec) {
        score += SUPERSEDED_CODEC_WEIGHT;
    } else if EFFICIENT_CODECS.contains(&codec) {
        score += EFFICIENT_CODEC_WEIGHT;
    }

    if bitrate_kbps > HIGH_BITRATE_KBPS {
        score += HIGH_BITRATE_WEIGHT;
    } else if bitrate_kbps > MID_BITRATE_KBPS {
        score += MID_BITRATE_WEIGHT;
    } else if bitrate_kbps < LOW_BITRATE_KBPS {
        score += LOW_BITRATE_WEIGHT;
    }

    if mb_per_min > HIGH_DENSITY_MB_PER_MIN {
        score += HIGH_DENSITY_WEIGHT;
    } else if mb_per_min > MID_DENSITY_MB_PER_MIN {
        score += MID_DENSITY_WEIGHT;
    } else if mb_per_min < LOW_DENSITY_MB_PER_MIN {
        score += LOW_DENSITY_WEIGHT;
    }

    let score = score.clamp(0, 100) as u8;

    let save_pct = SAVINGS_BUCKETS
        .iter()
        .find(|(min, _)| score >= *min)
        .map(|(_, pct)| *pct)
        .unwrap_or(SAVINGS_FLOOR_PCT);

    (score, save_pct)
}
