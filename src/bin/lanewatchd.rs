//! lanewatchd - vehicle counting daemon.
//!
//! Runs the counting pipeline against a synthetic source and detector,
//! logging live statistics until the stream ends or a shutdown signal
//! arrives, then prints the daily report and applies retention.

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use lanewatch::config::PipelineConfig;
use lanewatch::detect::SyntheticDetector;
use lanewatch::ingest::{Frame, FrameSource, SyntheticSource};
use lanewatch::storage::{CrossingStore, SqliteCrossingStore};
use lanewatch::Pipeline;
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "lanewatchd", about = "Lane-attributed vehicle counting daemon")]
struct Args {
    /// TOML config file (also via LANEWATCH_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many frames instead of running until interrupted.
    #[arg(long)]
    frames: Option<u64>,

    /// SQLite database path (overrides config and LANEWATCH_DB_PATH).
    #[arg(long, env = "LANEWATCH_DB_PATH")]
    db_path: Option<String>,

    /// Print the daily report as JSON on stdout after the session ends.
    #[arg(long)]
    json_report: bool,
}

/// Throttles an inner source to the configured frame rate. The synthetic
/// source produces frames instantly; a real capture source paces itself.
struct PacedSource {
    inner: SyntheticSource,
    interval: Duration,
    last: Option<Instant>,
}

impl PacedSource {
    fn new(inner: SyntheticSource, target_fps: u32) -> Self {
        Self {
            inner,
            interval: Duration::from_secs(1) / target_fps.max(1),
            last: None,
        }
    }
}

impl FrameSource for PacedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
        self.inner.next_frame()
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = PipelineConfig::load(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        cfg.storage.db_path = db_path;
    }
    cfg.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let source = match args.frames {
        Some(limit) => SyntheticSource::with_limit(cfg.source.width, cfg.source.height, limit),
        None => SyntheticSource::new(cfg.source.width, cfg.source.height),
    };
    let source = PacedSource::new(source, cfg.source.target_fps);
    let store = SqliteCrossingStore::open(&cfg.storage.db_path)?;
    let db_path = cfg.storage.db_path.clone();
    let retention_days = cfg.storage.retention_days;

    let mut pipeline = Pipeline::new(cfg);
    let session_id = pipeline.start(
        Box::new(source),
        Box::new(SyntheticDetector::default()),
        Box::new(store),
    )?;
    info!("counting session {} running; press Ctrl-C to stop", session_id);

    while pipeline.is_running() && !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
        let stats = pipeline.current_stats();
        info!(
            "frames={} vehicles={} today={} rate={:.1}/h degraded={} lost={}",
            stats.frames_processed,
            stats.session_total,
            stats.today_total,
            stats.hourly_rate,
            stats.degraded_frames,
            stats.lost_writes
        );
    }

    let summary = pipeline.stop()?;
    info!(
        "session {} finished: {} vehicles across {} frames",
        session_id, summary.session_total, summary.frames_processed
    );
    for (lane, count) in summary.per_lane.iter().enumerate() {
        info!("  lane {}: {}", lane, count);
    }
    for class in lanewatch::VehicleClass::ALL {
        info!("  {}: {}", class.label(), summary.class_count(class));
    }

    // The writer thread owned the store; reopen for reporting and retention.
    let mut store = SqliteCrossingStore::open(&db_path)?;
    let report = store.daily_report(Local::now().date_naive())?;
    info!(
        "today {}: {} vehicles, {:.1} avg/active-hour",
        report.day, report.total, report.avg_per_hour
    );
    if let Some((hour, count)) = report.peak_hour {
        info!("  peak hour {:02}:00 with {} vehicles", hour, count);
    }
    if args.json_report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    let pruned = store.prune_older_than(retention_days)?;
    if pruned > 0 {
        info!("pruned {} entries older than {} days", pruned, retention_days);
    }

    Ok(())
}
