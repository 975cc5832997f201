use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;
use crate::config::EngineConfig;
use crate::probe::Prober;
use crate::proc;

/// Resolution buckets mapping pixel count to (reference frames, max B-frames)
const REF_BFRAME_BUCKETS: &[(u64, (u32, u32))] = &[
    (1280 * 720, (6, 8)),
    (1920 * 1080, (5, 8)),
    (2560 * 1440, (4, 6)),
];
/// Tier used above the largest bucket
const REF_BFRAMES_FLOOR: (u32, u32) = (3, 4);

/// The closed set of supported encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    X264,
    X265,
    Vp9,
    Av1,
}

impl Encoder {
    /// The ffmpeg encoder name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            Encoder::X264 => "libx264",
            Encoder::X265 => "libx265",
            Encoder::Vp9 => "libvpx-vp9",
            Encoder::Av1 => "libaom-av1",
        }
    }

    /// Short tag appended to output file names
    pub fn tag(&self) -> &'static str {
        match self {
            Encoder::X264 => "x264",
            Encoder::X265 => "x265",
            Encoder::Vp9 => "vp9",
            Encoder::Av1 => "av1",
        }
    }

    /// Sensible default quality parameter; the CRF scales differ per encoder
    pub fn default_crf(&self) -> u32 {
        match self {
            Encoder::X264 => 21,
            Encoder::X265 => 23,
            Encoder::Vp9 => 33,
            Encoder::Av1 => 32,
        }
    }
}

impl std::str::FromStr for Encoder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x264" | "libx264" | "h264" => Ok(Encoder::X264),
            "x265" | "libx265" | "hevc" => Ok(Encoder::X265),
            "vp9" | "libvpx-vp9" => Ok(Encoder::Vp9),
            "av1" | "libaom-av1" => Ok(Encoder::Av1),
            other => Err(format!(
                "unknown encoder '{}', expected one of: x264, x265, vp9, av1",
                other
            )),
        }
    }
}

/// One transcode run over an ordered list of source files
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub files: Vec<PathBuf>,
    pub encoder: Encoder,
    pub crf: u32,
    pub delete_source: bool,
}

/// Events streamed from a running job to its caller
#[derive(Debug)]
pub enum JobEvent {
    /// Percent done of the current file and of the whole run, both 0..=100
    Progress { file_pct: u8, total_pct: u8 },
    /// Human-readable log line (encode parameters, failures, cleanup outcomes)
    Log(String),
    /// A file finished with a non-empty output
    OutputReady { source: PathBuf, output: PathBuf },
    /// Terminal event, emitted exactly once per run
    Finished,
}

/// State shared between the runner task and its handle
#[derive(Default)]
struct JobShared {
    stop: AtomicBool,
    paused: AtomicBool,
    /// pid of the live encoder process, 0 when none
    current_pid: AtomicU32,
    stop_notify: Notify,
}

/// Handle to a running transcode job
pub struct JobHandle {
    pub events: UnboundedReceiver<JobEvent>,
    pub id: Uuid,
    shared: Arc<JobShared>,
    task: tokio::task::JoinHandle<()>,
}

impl JobHandle {
    /// Suspend the current encoder process at OS level so it consumes no CPU
    /// while paused. No-op when nothing is encoding or already paused; a
    /// process that exited in the meantime is tolerated silently.
    pub fn pause(&self) {
        self.controller().pause();
    }

    /// Resume a paused encoder process. No-op when not paused.
    pub fn resume(&self) {
        self.controller().resume();
    }

    /// Request cancellation. The runner sends the encoder a graceful quit,
    /// force-kills it after a bounded grace period, removes the partial
    /// output of the in-flight file, and then emits `Finished`.
    pub fn stop(&self) {
        self.controller().stop();
    }

    /// Detached controls, usable while the handle's events are being drained
    pub fn controller(&self) -> JobController {
        JobController {
            shared: self.shared.clone(),
        }
    }

    /// Wait for the runner task to wind down
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Cloneable pause/resume/cancel controls for a running job
#[derive(Clone)]
pub struct JobController {
    shared: Arc<JobShared>,
}

impl JobController {
    pub fn pause(&self) {
        if self.shared.paused.load(Ordering::SeqCst) {
            return;
        }
        let pid = self.shared.current_pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        proc::suspend(pid);
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        if !self.shared.paused.load(Ordering::SeqCst) {
            return;
        }
        let pid = self.shared.current_pid.load(Ordering::SeqCst);
        if pid != 0 {
            proc::resume(pid);
        }
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        // A paused process cannot react to the quit command
        self.resume();
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.stop_notify.notify_one();
    }
}

/// Start a transcode run in the background. Files are encoded strictly one
/// at a time, in order; events for file *i* are never interleaved with
/// events for file *i+1*.
pub fn spawn_job(
    job: TranscodeJob,
    config: &EngineConfig,
    prober: Arc<dyn Prober>,
) -> JobHandle {
    let (tx, events) = mpsc::unbounded_channel();
    let shared = Arc::new(JobShared::default());
    let id = Uuid::new_v4();

    let cfg = config.clone();
    let task_shared = shared.clone();
    let task = tokio::spawn(async move {
        run_job(id, job, cfg, prober, task_shared, tx).await;
    });

    JobHandle {
        events,
        id,
        shared,
        task,
    }
}

/// Outcome of a single file within a run
enum FileOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

async fn run_job(
    id: Uuid,
    job: TranscodeJob,
    cfg: EngineConfig,
    prober: Arc<dyn Prober>,
    shared: Arc<JobShared>,
    tx: UnboundedSender<JobEvent>,
) {
    info!(
        "Run {} starting: {} file(s), encoder {}",
        id,
        job.files.len(),
        job.encoder.ffmpeg_name()
    );

    let total = job.files.len();
    // Output path of the file currently being written, kept only while it is
    // genuinely in flight so cancellation cleanup can never touch a
    // completed output
    let mut in_flight: Option<PathBuf> = None;

    for (idx, src) in job.files.iter().enumerate() {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let duration_secs = prober.duration_secs(src).await;
        if duration_secs <= 0.0 {
            // Unprobeable files are omitted, not failed
            debug!("Run {}: skipping unprobeable file {}", id, src.display());
            continue;
        }

        let dst = output_path(src, job.encoder);
        let (width, height) = prober.resolution(src).await;
        let (refs, bframes) = pick_ref_bframes(width, height);
        let animation = prober.detect_animation(src).await;

        emit(
            &tx,
            JobEvent::Log(format!(
                "{}x{} | {} | encoder={} | crf={}",
                width,
                height,
                if animation { "animation" } else { "live-action" },
                job.encoder.ffmpeg_name(),
                job.crf
            )),
        );
        emit(
            &tx,
            JobEvent::Log(format!("Encoding: {}", display_name(src))),
        );

        let args = build_encode_command(src, &dst, job.encoder, job.crf, refs, bframes, animation);
        in_flight = Some(dst.clone());

        let outcome = encode_one(&cfg, &shared, &tx, &dst, duration_secs, idx, total, args).await;
        shared.current_pid.store(0, Ordering::SeqCst);
        // Pause state belongs to the process that just went away
        shared.paused.store(false, Ordering::SeqCst);

        match outcome {
            FileOutcome::Completed => {
                in_flight = None;
                emit(
                    &tx,
                    JobEvent::OutputReady {
                        source: src.clone(),
                        output: dst.clone(),
                    },
                );
                if job.delete_source {
                    if let Err(e) = std::fs::remove_file(src) {
                        emit(
                            &tx,
                            JobEvent::Log(format!(
                                "Failed to delete source {}: {}",
                                src.display(),
                                e
                            )),
                        );
                    }
                }
            }
            FileOutcome::Failed(reason) => {
                in_flight = None;
                emit(
                    &tx,
                    JobEvent::Log(format!("Encode failed for {}: {}", display_name(src), reason)),
                );
            }
            FileOutcome::Cancelled => break,
        }
    }

    if shared.stop.load(Ordering::SeqCst) {
        if let Some(partial) = in_flight {
            cleanup_partial(&partial, &tx);
        }
        info!("Run {} cancelled", id);
    } else {
        info!("Run {} finished", id);
    }

    emit(&tx, JobEvent::Finished);
}

#[allow(clippy::too_many_arguments)]
async fn encode_one(
    cfg: &EngineConfig,
    shared: &JobShared,
    tx: &UnboundedSender<JobEvent>,
    dst: &Path,
    duration_secs: f64,
    idx: usize,
    total: usize,
    args: Vec<String>,
) -> FileOutcome {
    let mut child = match Command::new(&cfg.ffmpeg_bin)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return FileOutcome::Failed(format!("failed to start encoder: {}", e)),
    };

    if let Some(pid) = child.id() {
        shared.current_pid.store(pid, Ordering::SeqCst);
    }

    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill().await;
        return FileOutcome::Failed("failed to capture encoder output".to_string());
    };
    let mut stdin = child.stdin.take();

    // Encoder diagnostics go to stderr; forward them as log events
    let stderr_task = child.stderr.take().map(|stderr| {
        let err_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    let _ = err_tx.send(JobEvent::Log(format!("encoder: {}", line)));
                }
            }
        })
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut cancelled = false;
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }

        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(out_us) = parse_out_time_us(&line) {
                            let file_pct = file_percent(out_us, duration_secs);
                            let total_pct = overall_percent(idx, total, file_pct);
                            emit(tx, JobEvent::Progress { file_pct, total_pct });
                        }
                    }
                    // Output closed: the process is exiting
                    Ok(None) | Err(_) => break,
                }
            }
            _ = shared.stop_notify.notified() => {
                cancelled = true;
                break;
            }
        }
    }

    if cancelled {
        // Graceful quit first, force-kill if it does not land in time
        if let Some(mut quit) = stdin.take() {
            let _ = quit.write_all(b"q\n").await;
            let _ = quit.flush().await;
        }
        let grace = Duration::from_secs(cfg.stop_grace_secs);
        match timeout(grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Encoder ignored quit for {:?}, killing", grace);
                let _ = child.kill().await;
            }
        }
        if let Some(task) = stderr_task {
            task.abort();
        }
        return FileOutcome::Cancelled;
    }

    drop(stdin);
    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => return FileOutcome::Failed(format!("failed to wait for encoder: {}", e)),
    };
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if !status.success() {
        return FileOutcome::Failed(format!(
            "encoder exited with code {}",
            status.code().map_or_else(|| "unknown".to_string(), |c| c.to_string())
        ));
    }

    match std::fs::metadata(dst) {
        Ok(meta) if meta.len() > 0 => FileOutcome::Completed,
        Ok(_) => FileOutcome::Failed("output file is empty".to_string()),
        Err(e) => FileOutcome::Failed(format!("output file missing: {}", e)),
    }
}

/// Delete the partially written output of a cancelled file. Failure to
/// delete is reported through the log stream, never escalated.
fn cleanup_partial(path: &Path, tx: &UnboundedSender<JobEvent>) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => emit(
            tx,
            JobEvent::Log(format!("Removed incomplete output: {}", display_name(path))),
        ),
        Err(e) => emit(
            tx,
            JobEvent::Log(format!(
                "Failed to remove incomplete output {}: {}",
                display_name(path),
                e
            )),
        ),
    }
}

fn emit(tx: &UnboundedSender<JobEvent>, event: JobEvent) {
    // The caller may have stopped listening; events are fire-and-forget
    let _ = tx.send(event);
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Output path: source path with the extension replaced by `_<tag>.mkv`
pub fn output_path(src: &Path, encoder: Encoder) -> PathBuf {
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    src.with_file_name(format!("{}_{}.mkv", stem, encoder.tag()))
}

/// Reference-frame and max-B-frame counts for a resolution
pub fn pick_ref_bframes(width: u32, height: u32) -> (u32, u32) {
    let pixels = width as u64 * height as u64;
    for (max_pixels, counts) in REF_BFRAME_BUCKETS {
        if pixels <= *max_pixels {
            return *counts;
        }
    }
    REF_BFRAMES_FLOOR
}

/// Elapsed output time fields from ffmpeg's machine-readable progress lines.
/// Both keys carry microseconds; `out_time_ms` is microseconds despite its
/// name.
fn parse_out_time_us(line: &str) -> Option<u64> {
    let value = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    value.trim().parse::<u64>().ok()
}

/// Percent of the current file encoded, floored and clamped to 100
fn file_percent(out_time_us: u64, duration_secs: f64) -> u8 {
    let pct = (out_time_us as f64 / (duration_secs * 1_000_000.0) * 100.0) as u64;
    pct.min(100) as u8
}

/// Percent of the whole run done, given how many list entries precede the
/// current file
fn overall_percent(files_before: usize, total: usize, file_pct: u8) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = ((files_before as f64 + file_pct as f64 / 100.0) / total as f64 * 100.0) as u64;
    pct.min(100) as u8
}

fn build_encode_command(
    src: &Path,
    dst: &Path,
    encoder: Encoder,
    crf: u32,
    refs: u32,
    bframes: u32,
    animation: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-v".into(),
        "error".into(),
        "-i".into(),
        src.to_string_lossy().into_owned(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a?".into(),
        "-map".into(),
        "0:s?".into(),
    ];

    args.push("-c:v".into());
    args.push(encoder.ffmpeg_name().into());
    args.push("-crf".into());
    args.push(crf.to_string());

    match encoder {
        Encoder::X264 => {
            args.push("-preset".into());
            args.push("slow".into());
            args.push("-tune".into());
            args.push(if animation { "animation" } else { "film" }.into());
            args.push("-x264-params".into());
            args.push(format!(
                "ref={}:bframes={}:b-adapt=2:me=umh:subme=10:rc-lookahead=50:\
                 trellis=2:aq-mode=3:aq-strength=1.1:psy-rd=1.0\\:-0.15:deblock=-1\\:-1",
                refs, bframes
            ));
        }
        Encoder::X265 => {
            args.push("-preset".into());
            args.push("slow".into());
            // Live action gets no tune at all for x265
            if animation {
                args.push("-tune".into());
                args.push("animation".into());
            }
            args.push("-x265-params".into());
            args.push("log-level=error".into());
        }
        Encoder::Vp9 => {
            args.push("-b:v".into());
            args.push("0".into());
            args.push("-deadline".into());
            args.push("good".into());
            args.push("-cpu-used".into());
            args.push("2".into());
            args.push("-row-mt".into());
            args.push("1".into());
        }
        Encoder::Av1 => {
            args.push("-b:v".into());
            args.push("0".into());
            args.push("-cpu-used".into());
            args.push("6".into());
            args.push("-row-mt".into());
            args.push("1".into());
            args.push("-tiles".into());
            args.push("2x2".into());
            args.push("-strict".into());
            args.push("-2".into());
        }
    }

    args.extend([
        "-c:a".into(),
        "copy".into(),
        "-c:s".into(),
        "copy".into(),
        "-map_metadata".into(),
        "0".into(),
        "-map_chapters".into(),
        "0".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-nostats".into(),
        dst.to_string_lossy().into_owned(),
    ]);

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn resolution_buckets_match_tiers() {
        assert_eq!(pick_ref_bframes(1280, 720), (6, 8));
        assert_eq!(pick_ref_bframes(1920, 1080), (5, 8));
        assert_eq!(pick_ref_bframes(2560, 1440), (4, 6));
        assert_eq!(pick_ref_bframes(3840, 2160), (3, 4));
        // Oddball sizes fall into the smallest bucket that fits
        assert_eq!(pick_ref_bframes(640, 480), (6, 8));
        assert_eq!(pick_ref_bframes(1920, 800), (5, 8));
    }

    #[test]
    fn output_path_swaps_extension_for_tagged_mkv() {
        assert_eq!(
            output_path(Path::new("/media/movie.avi"), Encoder::X265),
            PathBuf::from("/media/movie_x265.mkv")
        );
        assert_eq!(
            output_path(Path::new("show.s01e01.mp4"), Encoder::Av1),
            PathBuf::from("show.s01e01_av1.mkv")
        );
    }

    #[test]
    fn parses_both_progress_keys_as_microseconds() {
        assert_eq!(parse_out_time_us("out_time_us=1500000"), Some(1_500_000));
        assert_eq!(parse_out_time_us("out_time_ms=1500000"), Some(1_500_000));
        assert_eq!(parse_out_time_us("out_time=00:00:01.50"), None);
        assert_eq!(parse_out_time_us("out_time_us=N/A"), None);
        assert_eq!(parse_out_time_us("frame=42"), None);
    }

    #[test]
    fn file_percent_floors_and_clamps() {
        // 1.5s of a 4s file = 37.5% -> 37
        assert_eq!(file_percent(1_500_000, 4.0), 37);
        assert_eq!(file_percent(4_000_000, 4.0), 100);
        // Encoder output time can overshoot the probed duration
        assert_eq!(file_percent(9_000_000, 4.0), 100);
        assert_eq!(file_percent(0, 4.0), 0);
    }

    #[test]
    fn overall_percent_accounts_for_finished_files() {
        assert_eq!(overall_percent(0, 2, 50), 25);
        assert_eq!(overall_percent(1, 2, 0), 50);
        assert_eq!(overall_percent(1, 2, 100), 100);
        assert_eq!(overall_percent(2, 3, 40), 80);
    }

    #[test]
    fn encoder_names_tags_and_defaults() {
        assert_eq!("x264".parse::<Encoder>().unwrap(), Encoder::X264);
        assert_eq!("libvpx-vp9".parse::<Encoder>().unwrap(), Encoder::Vp9);
        assert!("mpeg2".parse::<Encoder>().is_err());
        assert_eq!(Encoder::X264.default_crf(), 21);
        assert_eq!(Encoder::X265.default_crf(), 23);
        assert_eq!(Encoder::Vp9.default_crf(), 33);
        assert_eq!(Encoder::Av1.default_crf(), 32);
    }

    #[test]
    fn x264_command_carries_tune_and_params() {
        let args = build_encode_command(
            Path::new("/m/in.mp4"),
            Path::new("/m/in_x264.mkv"),
            Encoder::X264,
            21,
            5,
            8,
            false,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-tune film"));
        assert!(joined.contains("ref=5:bframes=8"));
        assert!(joined.contains("-progress pipe:1"));
        assert!(joined.contains("-map 0:v:0"));
        assert_eq!(args.last().unwrap(), "/m/in_x264.mkv");
    }

    #[test]
    fn x265_tune_only_applies_to_animation() {
        let live = build_encode_command(
            Path::new("a.mkv"),
            Path::new("a_x265.mkv"),
            Encoder::X265,
            23,
            5,
            8,
            false,
        );
        assert!(!live.iter().any(|a| a == "-tune"));

        let anim = build_encode_command(
            Path::new("a.mkv"),
            Path::new("a_x265.mkv"),
            Encoder::X265,
            23,
            5,
            8,
            true,
        );
        let joined = anim.join(" ");
        assert!(joined.contains("-tune animation"));
    }

    proptest! {
        /// Per-file percent is bounded and non-decreasing in elapsed time
        #[test]
        fn file_percent_is_monotonic(
            a in 0u64..100_000_000,
            b in 0u64..100_000_000,
            duration in 0.1f64..100_000.0,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let p_lo = file_percent(lo, duration);
            let p_hi = file_percent(hi, duration);
            prop_assert!(p_lo <= p_hi);
            prop_assert!(p_hi <= 100);
        }

        /// Overall percent is bounded and non-decreasing as the run advances
        /// through files and through each file
        #[test]
        fn overall_percent_is_monotonic(
            total in 1usize..50,
            step in 0usize..200,
        ) {
            let mut last = 0u8;
            let mut steps = 0usize;
            'outer: for idx in 0..total {
                for pct in [0u8, 25, 50, 75, 100] {
                    let overall = overall_percent(idx, total, pct);
                    prop_assert!(overall >= last);
                    prop_assert!(overall <= 100);
                    last = overall;
                    steps += 1;
                    if steps > step {
                        break 'outer;
                    }
                }
            }
        }
    }
}
