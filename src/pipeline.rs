//! Frame loop orchestration and the control surface.
//!
//! `Pipeline` owns one worker thread running the per-frame loop:
//!
//! frame -> detect -> track update -> crossing evaluation -> aggregate
//!
//! The worker is the single mutator of track and session state. Readers get
//! immutable snapshots swapped atomically under a short-lived lock, so
//! `current_stats()` never observes a partially updated frame.
//!
//! Pacing is the source's job: live capture blocks on the next frame, file
//! playback runs as fast as the loop allows.

use anyhow::Result;
use chrono::Local;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::aggregate::{SessionAggregator, SessionStatus, StatsSnapshot};
use crate::annotate::{self, AnnotatedFrame};
use crate::config::{CountingSettings, PipelineConfig};
use crate::counting::LineCounter;
use crate::detect::{DetectionAdapter, Detector};
use crate::ingest::FrameSource;
use crate::storage::CrossingStore;
use crate::track::TrackManager;
use crate::{now_s, ControlError};

/// State shared between the control surface and the worker thread.
struct SharedState {
    running: AtomicBool,
    stop_requested: AtomicBool,
    stats: Mutex<Arc<StatsSnapshot>>,
    annotated: Mutex<Option<Arc<AnnotatedFrame>>>,
}

/// Poison recovery: the shared cells hold plain data that is always left
/// whole, so a panicked holder does not invalidate them.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Pipeline {
    cfg: PipelineConfig,
    shared: Arc<SharedState>,
    aggregator: Arc<Mutex<SessionAggregator>>,
    worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig) -> Self {
        let lane_count = cfg.counting.lane_count();
        Self {
            cfg,
            shared: Arc::new(SharedState {
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                stats: Mutex::new(Arc::new(StatsSnapshot::empty(lane_count))),
                annotated: Mutex::new(None),
            }),
            aggregator: Arc::new(Mutex::new(SessionAggregator::new(lane_count))),
            worker: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Start a counting session. Returns the new session id.
    ///
    /// Rejected with `ControlError::AlreadyRunning` while a session runs;
    /// the rejection mutates nothing.
    pub fn start(
        &mut self,
        source: Box<dyn FrameSource>,
        mut detector: Box<dyn Detector>,
        store: Box<dyn CrossingStore>,
    ) -> Result<String> {
        if let Some(handle) = self.worker.take() {
            if self.shared.running.load(Ordering::SeqCst) {
                self.worker = Some(handle);
                return Err(ControlError::AlreadyRunning.into());
            }
            // Worker already finished (end of stream); reap it.
            if handle.join().is_err() {
                error!("previous pipeline worker panicked");
            }
        }

        let session_id = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let start_s = now_s()?;

        detector.warm_up()?;

        lock(&self.aggregator).start(store, session_id.clone(), start_s, &self.cfg.storage)?;

        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let adapter = DetectionAdapter::new(detector, &self.cfg.detection, &self.cfg.source);
        let manager = TrackManager::new(self.cfg.tracking.clone());
        let counter = LineCounter::new(&self.cfg.counting, self.cfg.tracking.lookback);
        let counting = self.cfg.counting.clone();
        let shared = Arc::clone(&self.shared);
        let aggregator = Arc::clone(&self.aggregator);
        let worker_session = session_id.clone();

        let handle = thread::Builder::new()
            .name("lanewatch-pipeline".to_string())
            .spawn(move || {
                run_loop(
                    source,
                    adapter,
                    manager,
                    counter,
                    counting,
                    worker_session,
                    shared,
                    aggregator,
                );
            })?;
        self.worker = Some(handle);

        info!("session {} started", session_id);
        Ok(session_id)
    }

    /// Stop the running session: signal the worker, join it, and return the
    /// final snapshot. A worker that already hit end of stream joins
    /// immediately.
    pub fn stop(&mut self) -> Result<Arc<StatsSnapshot>> {
        let handle = self.worker.take().ok_or(ControlError::NotRunning)?;
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            error!("pipeline worker panicked");
        }
        let snapshot = Arc::clone(&lock(&self.shared.stats));
        info!(
            "session stopped: {} vehicles, {} frames, {} lost writes",
            snapshot.session_total, snapshot.frames_processed, snapshot.lost_writes
        );
        Ok(snapshot)
    }

    /// Clear counters back to idle. Rejected while a session is running.
    pub fn reset(&mut self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(ControlError::SessionStillRunning.into());
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("pipeline worker panicked");
            }
        }
        let mut agg = lock(&self.aggregator);
        agg.reset()?;
        *lock(&self.shared.stats) =
            Arc::new(StatsSnapshot::empty(self.cfg.counting.lane_count()));
        *lock(&self.shared.annotated) = None;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Latest published snapshot. Cheap: clones an `Arc`, never blocks on
    /// the frame loop.
    pub fn current_stats(&self) -> Arc<StatsSnapshot> {
        Arc::clone(&lock(&self.shared.stats))
    }

    /// Latest annotated frame, if any frame has been processed.
    pub fn current_annotated(&self) -> Option<Arc<AnnotatedFrame>> {
        lock(&self.shared.annotated).clone()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    mut source: Box<dyn FrameSource>,
    mut adapter: DetectionAdapter,
    mut manager: TrackManager,
    counter: LineCounter,
    counting: CountingSettings,
    session_id: String,
    shared: Arc<SharedState>,
    aggregator: Arc<Mutex<SessionAggregator>>,
) {
    loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("frame source reached end of stream");
                break;
            }
            Err(e) => {
                error!("frame acquisition failed: {:#}", e);
                break;
            }
        };

        let result = adapter.detect(&frame);
        manager.update(frame.index, &result.detections);

        let ts = now_s().unwrap_or_default();
        {
            let mut agg = lock(&aggregator);
            agg.record_frame(result.degraded);
            for track in manager.tracks_mut() {
                if let Some(event) = counter.evaluate(track, ts, &session_id) {
                    debug!(
                        "track {} crossed: lane {} class {}",
                        event.track_id,
                        event.lane,
                        event.class.label()
                    );
                    agg.on_event(event);
                }
            }
            *lock(&shared.stats) = Arc::new(agg.snapshot(ts));
        }

        if let Some(annotated) = annotate::render(
            &frame.pixels,
            frame.width,
            frame.height,
            manager.tracks(),
            &counting,
        ) {
            *lock(&shared.annotated) = Some(Arc::new(annotated));
        }
    }

    // Close the session: drain pending writes, finalize the session row,
    // publish the final snapshot, then release the running flag.
    let end_s = now_s().unwrap_or_default();
    {
        let mut agg = lock(&aggregator);
        if agg.status() == SessionStatus::Running {
            if let Err(e) = agg.stop(end_s) {
                error!("failed to close session {}: {:#}", session_id, e);
            }
        }
        *lock(&shared.stats) = Arc::new(agg.snapshot(end_s));
    }
    shared.running.store(false, Ordering::SeqCst);
}
