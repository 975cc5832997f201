use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::{
    import, spawn_job, spawn_scan, AnalysisCache, AnalyzedRecord, Encoder, EngineConfig,
    FfmpegProber, JobEvent, ScanEvent, TranscodeJob,
};
use humansize::{format_size, DECIMAL};
use log::{info, warn};

/// Media compression-value scanner and transcode runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the analysis cache location
    #[arg(long)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk a directory tree and analyze every media file in it
    Scan {
        /// Root directory to scan
        root: PathBuf,
    },
    /// Analyze an explicit list of media files
    Import {
        /// Files to analyze
        files: Vec<PathBuf>,
    },
    /// Print the cached analysis records
    List,
    /// Transcode the given files, one at a time
    Transcode {
        /// Source files, encoded in the given order
        files: Vec<PathBuf>,

        /// Encoder to use: x264, x265, vp9, av1
        #[arg(long, default_value = "x264")]
        encoder: Encoder,

        /// Quality parameter; defaults to the encoder's usual CRF
        #[arg(long)]
        crf: Option<u32>,

        /// Delete each source file after a successful encode
        #[arg(long)]
        delete_source: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let mut cfg = EngineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(cache_path) = args.cache {
        cfg.cache_path = cache_path;
    }

    match args.command {
        Command::Scan { root } => run_scan(&cfg, root).await,
        Command::Import { files } => run_import(&cfg, files).await,
        Command::List => run_list(&cfg),
        Command::Transcode {
            files,
            encoder,
            crf,
            delete_source,
        } => run_transcode(&cfg, files, encoder, crf, delete_source).await,
    }
}

async fn run_scan(cfg: &EngineConfig, root: PathBuf) -> Result<()> {
    let cache = AnalysisCache::load(&cfg.cache_path);
    let prober = Arc::new(FfmpegProber::new(cfg));
    let mut handle = spawn_scan(root, cache, prober);

    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping scan (cache will not be flushed)");
            stopper.stop();
        }
    });

    let mut found = 0usize;
    while let Some(event) = handle.events.recv().await {
        match event {
            ScanEvent::Found(record) => {
                found += 1;
                print_record(&record);
            }
            ScanEvent::Finished => break,
        }
    }

    info!("Scan finished: {} record(s)", found);
    Ok(())
}

async fn run_import(cfg: &EngineConfig, files: Vec<PathBuf>) -> Result<()> {
    let mut cache = AnalysisCache::load(&cfg.cache_path);
    let prober = FfmpegProber::new(cfg);

    let records = import(&files, &mut cache, &prober).await;
    for record in &records {
        print_record(record);
    }
    if records.len() < files.len() {
        warn!("{} file(s) could not be analyzed", files.len() - records.len());
    }
    Ok(())
}

fn run_list(cfg: &EngineConfig) -> Result<()> {
    let cache = AnalysisCache::load(&cfg.cache_path);
    let mut records: Vec<&AnalyzedRecord> = cache.records().collect();
    records.sort_by(|a, b| b.compress_score.cmp(&a.compress_score));
    for record in records {
        print_record(record);
    }
    Ok(())
}

async fn run_transcode(
    cfg: &EngineConfig,
    files: Vec<PathBuf>,
    encoder: Encoder,
    crf: Option<u32>,
    delete_source: bool,
) -> Result<()> {
    anyhow::ensure!(!files.is_empty(), "no input files given");

    let job = TranscodeJob {
        files,
        encoder,
        crf: crf.unwrap_or_else(|| encoder.default_crf()),
        delete_source,
    };
    let prober = Arc::new(FfmpegProber::new(cfg));
    let mut handle = spawn_job(job, cfg, prober);
    info!("Run {} started", handle.id);

    let controller = handle.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling run");
            controller.stop();
        }
    });

    while let Some(event) = handle.events.recv().await {
        match event {
            JobEvent::Progress { file_pct, total_pct } => {
                info!("progress: file {:>3}% | total {:>3}%", file_pct, total_pct);
            }
            JobEvent::Log(line) => info!("{}", line),
            JobEvent::OutputReady { source, output } => {
                info!("ready: {} -> {}", source.display(), output.display());
            }
            JobEvent::Finished => break,
        }
    }

    info!("Run finished");
    Ok(())
}

fn print_record(record: &AnalyzedRecord) {
    println!(
        "{:>10}  {:>6.1} min  {:>6.1} MB/min  {:>7}  score {:>3}  save ~{:>2}%  {}",
        format_size(record.size, DECIMAL),
        record.duration_secs / 60.0,
        record.mb_per_min,
        record.codec,
        record.compress_score,
        record.save_pct,
        record.path.display(),
    );
}
