//! End-to-end pipeline tests: synthetic frames in, durable counts out.

use anyhow::{anyhow, Result};
use chrono::Local;
use lanewatch::config::PipelineConfig;
use lanewatch::detect::ScriptedDetector;
use lanewatch::ingest::SyntheticSource;
use lanewatch::storage::{
    CrossingRow, CrossingStore, DailyReport, DateRange, HourlyBucket, InMemoryCrossingStore,
    SqliteCrossingStore,
};
use lanewatch::{
    BoundingBox, ControlError, CrossingEvent, Detection, Pipeline, SessionStatus, VehicleClass,
};
use std::time::{Duration, Instant};

fn config_for(width: u32, height: u32) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.source.width = width;
    cfg.source.height = height;
    cfg
}

fn wait_until_stopped(pipeline: &Pipeline) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while pipeline.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!pipeline.is_running(), "pipeline did not stop in time");
}

fn car_at(x: f32, cy: f32) -> Detection {
    Detection {
        bbox: BoundingBox::new(x - 0.06, cy - 0.05, 0.12, 0.1),
        class: VehicleClass::Car,
        confidence: 0.9,
    }
}

/// Script one vehicle in lane 2 (x = 0.6) moving down across the default
/// counting line at y = 0.5.
fn crossing_script() -> ScriptedDetector {
    let mut script = ScriptedDetector::new();
    for cy in [0.40f32, 0.44, 0.48, 0.52, 0.56, 0.60] {
        script.push_detections(vec![car_at(0.6, cy)]);
    }
    script
}

#[test]
fn scripted_crossing_is_counted_once_and_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir
        .path()
        .join("counts.db")
        .to_str()
        .expect("utf8 path")
        .to_string();

    let mut pipeline = Pipeline::new(config_for(16, 16));
    let session_id = pipeline
        .start(
            Box::new(SyntheticSource::with_limit(16, 16, 6)),
            Box::new(crossing_script()),
            Box::new(SqliteCrossingStore::open(&db_path).expect("open")),
        )
        .expect("start");
    wait_until_stopped(&pipeline);
    let snapshot = pipeline.stop().expect("stop");

    assert_eq!(snapshot.session_total, 1);
    assert_eq!(snapshot.per_lane, vec![0, 0, 1, 0]);
    assert_eq!(snapshot.class_count(VehicleClass::Car), 1);
    assert_eq!(snapshot.frames_processed, 6);
    assert_eq!(snapshot.degraded_frames, 0);
    assert_eq!(snapshot.lost_writes, 0);
    assert_eq!(snapshot.status, SessionStatus::Stopped);

    // The crossing and the session row both survive a fresh connection.
    let mut store = SqliteCrossingStore::open(&db_path).expect("reopen");
    let rows = store
        .query_history(&DateRange::single_day(Local::now().date_naive()))
        .expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].lane, 2);
    assert_eq!(rows[0].class, VehicleClass::Car);
    assert_eq!(rows[0].session_id, session_id);
    assert_eq!(store.today_count().expect("count"), 1);
}

#[test]
fn detector_failure_degrades_one_frame_without_stopping() {
    let mut script = ScriptedDetector::new();
    script.push_empty_frames(10);
    script.push_failure("inference backend unavailable");
    // Script ends here; the remaining frames come back empty.

    let mut pipeline = Pipeline::new(config_for(16, 16));
    pipeline
        .start(
            Box::new(SyntheticSource::with_limit(16, 16, 100)),
            Box::new(script),
            Box::new(InMemoryCrossingStore::new()),
        )
        .expect("start");
    wait_until_stopped(&pipeline);
    let snapshot = pipeline.stop().expect("stop");

    assert_eq!(snapshot.frames_processed, 100);
    assert_eq!(snapshot.degraded_frames, 1);
    assert_eq!(snapshot.session_total, 0);
}

#[test]
fn second_start_is_rejected_and_mutates_nothing() {
    let mut pipeline = Pipeline::new(config_for(16, 16));
    pipeline
        .start(
            Box::new(SyntheticSource::new(16, 16)),
            Box::new(crossing_script()),
            Box::new(InMemoryCrossingStore::new()),
        )
        .expect("start");

    // Give the worker time to count the scripted vehicle.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.current_stats().session_total == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let before = pipeline.current_stats();
    assert_eq!(before.session_total, 1);

    let err = pipeline
        .start(
            Box::new(SyntheticSource::new(16, 16)),
            Box::new(ScriptedDetector::new()),
            Box::new(InMemoryCrossingStore::new()),
        )
        .expect_err("second start");
    assert_eq!(
        err.downcast_ref::<ControlError>(),
        Some(&ControlError::AlreadyRunning)
    );

    let after = pipeline.current_stats();
    assert_eq!(after.session_total, before.session_total);
    assert_eq!(after.session_id, before.session_id);
    assert!(pipeline.is_running());

    pipeline.stop().expect("stop");
}

/// Store whose writes always fail but whose reads succeed.
struct WriteFailingStore;

impl CrossingStore for WriteFailingStore {
    fn insert_crossing(&mut self, _event: &CrossingEvent) -> Result<()> {
        Err(anyhow!("database locked"))
    }
    fn upsert_hourly(&mut self, _b: &HourlyBucket, _c: u64, _conf: f32) -> Result<()> {
        Err(anyhow!("database locked"))
    }
    fn record_session_start(&mut self, _s: &str, _t: u64) -> Result<()> {
        Ok(())
    }
    fn record_session_end(&mut self, _s: &str, _t: u64, _n: u64) -> Result<()> {
        Ok(())
    }
    fn today_count(&mut self) -> Result<u64> {
        Ok(0)
    }
    fn query_history(&mut self, _r: &DateRange) -> Result<Vec<CrossingRow>> {
        Ok(Vec::new())
    }
    fn daily_report(&mut self, _d: chrono::NaiveDate) -> Result<DailyReport> {
        Ok(DailyReport::default())
    }
    fn export_csv(&mut self, _r: &DateRange) -> Result<String> {
        Ok(String::new())
    }
    fn prune_older_than(&mut self, _d: u32) -> Result<usize> {
        Ok(0)
    }
}

#[test]
fn store_failure_degrades_history_but_live_counts_stay_accurate() {
    let mut cfg = config_for(16, 16);
    // Keep retry delays out of the test runtime.
    cfg.storage.write_retries = 1;
    cfg.storage.retry_backoff_ms = 1;

    let mut pipeline = Pipeline::new(cfg);
    pipeline
        .start(
            Box::new(SyntheticSource::with_limit(16, 16, 6)),
            Box::new(crossing_script()),
            Box::new(WriteFailingStore),
        )
        .expect("start");
    wait_until_stopped(&pipeline);
    let snapshot = pipeline.stop().expect("stop");

    // The crossing is still counted live; only durability degraded.
    assert_eq!(snapshot.session_total, 1);
    assert_eq!(snapshot.lost_writes, 1);
}

#[test]
fn reset_after_stop_clears_everything() {
    let mut pipeline = Pipeline::new(config_for(16, 16));
    pipeline
        .start(
            Box::new(SyntheticSource::with_limit(16, 16, 6)),
            Box::new(crossing_script()),
            Box::new(InMemoryCrossingStore::new()),
        )
        .expect("start");
    wait_until_stopped(&pipeline);
    pipeline.stop().expect("stop");
    pipeline.reset().expect("reset");

    let snapshot = pipeline.current_stats();
    assert_eq!(snapshot.status, SessionStatus::Idle);
    assert_eq!(snapshot.session_total, 0);
    assert_eq!(snapshot.frames_processed, 0);
    assert!(snapshot.session_id.is_none());
}
