//! Session aggregation and durable writes.
//!
//! Live counters are the source of truth: crossing events update in-memory
//! totals synchronously, then go onto a bounded queue for a writer thread to
//! persist. A slow or failing store degrades history (tracked in
//! `lost_writes`) but never stalls the frame loop or loses a live count.

use anyhow::Result;
use log::{error, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::StorageSettings;
use crate::storage::{CrossingStore, HourlyBucket};
use crate::{ControlError, CrossingEvent, VehicleClass};

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Stopped,
}

/// Immutable point-in-time view of the live counters. Published by the
/// pipeline worker after each frame; readers never see a partial update.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub session_id: Option<String>,
    pub status: SessionStatus,
    /// Crossings counted in this session.
    pub session_total: u64,
    /// Today's persisted count at session start plus this session's total.
    pub today_total: u64,
    pub per_lane: Vec<u64>,
    /// Indexed by `VehicleClass::index()`.
    pub per_class: [u64; 4],
    /// Session total divided by elapsed session hours.
    pub hourly_rate: f32,
    pub frames_processed: u64,
    pub degraded_frames: u64,
    /// Events that never reached the store (queue overflow or exhausted
    /// write retries).
    pub lost_writes: u64,
}

impl StatsSnapshot {
    pub fn empty(lane_count: usize) -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Idle,
            session_total: 0,
            today_total: 0,
            per_lane: vec![0; lane_count],
            per_class: [0; 4],
            hourly_rate: 0.0,
            frames_processed: 0,
            degraded_frames: 0,
            lost_writes: 0,
        }
    }

    pub fn class_count(&self, class: VehicleClass) -> u64 {
        self.per_class[class.index()]
    }
}

// ----------------------------------------------------------------------------
// Write queue and writer thread
// ----------------------------------------------------------------------------

struct WriteQueue {
    events: Mutex<VecDeque<CrossingEvent>>,
    ready: Condvar,
    cap: usize,
    closed: AtomicBool,
    lost: AtomicU64,
    /// Session-end record to persist after the queue drains, set at close.
    final_end: Mutex<Option<(String, u64, u64)>>,
}

impl WriteQueue {
    fn new(cap: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            cap,
            closed: AtomicBool::new(false),
            lost: AtomicU64::new(0),
            final_end: Mutex::new(None),
        }
    }

    /// Enqueue, dropping the oldest event on overflow.
    fn push(&self, event: CrossingEvent) {
        let mut events = lock(&self.events);
        if events.len() >= self.cap {
            events.pop_front();
            self.lost.fetch_add(1, Ordering::Relaxed);
            warn!("write queue full; dropped oldest pending crossing");
        }
        events.push_back(event);
        drop(events);
        self.ready.notify_one();
    }

    fn close(&self, end: Option<(String, u64, u64)>) {
        *lock(&self.final_end) = end;
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    /// Next event to persist, or `None` once closed and drained.
    fn pop_blocking(&self) -> Option<CrossingEvent> {
        let mut events = lock(&self.events);
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            events = match self.ready.wait(events) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/// Lock that shrugs off poisoning: a panicked writer leaves counters in a
/// consistent-enough state for draining, and aborting counting over it would
/// violate the no-lost-count rule.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the store on a background thread and drains the write queue.
pub struct DurableWriter {
    queue: Arc<WriteQueue>,
    handle: Option<JoinHandle<()>>,
}

impl DurableWriter {
    pub fn spawn(mut store: Box<dyn CrossingStore>, settings: &StorageSettings) -> Result<Self> {
        let queue = Arc::new(WriteQueue::new(settings.write_queue_cap));
        let retries = settings.write_retries;
        let backoff = Duration::from_millis(settings.retry_backoff_ms);
        let worker_queue = Arc::clone(&queue);

        let handle = thread::Builder::new()
            .name("lanewatch-writer".to_string())
            .spawn(move || {
                while let Some(event) = worker_queue.pop_blocking() {
                    if write_with_retry(store.as_mut(), &event, retries, backoff).is_err() {
                        worker_queue.lost.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if let Some((session_id, end_s, total)) = lock(&worker_queue.final_end).take() {
                    if let Err(e) = store.record_session_end(&session_id, end_s, total) {
                        error!("failed to finalize session {}: {:#}", session_id, e);
                    }
                }
            })?;

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn enqueue(&self, event: CrossingEvent) {
        self.queue.push(event);
    }

    pub fn lost(&self) -> u64 {
        self.queue.lost.load(Ordering::Relaxed)
    }

    /// Close the queue, drain it, write the session-end record, and join.
    /// Returns the total number of lost writes.
    pub fn finish(mut self, end: Option<(String, u64, u64)>) -> u64 {
        self.queue.close(end);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("writer thread panicked while draining");
            }
        }
        self.queue.lost.load(Ordering::Relaxed)
    }
}

fn write_with_retry(
    store: &mut dyn CrossingStore,
    event: &CrossingEvent,
    retries: u32,
    backoff: Duration,
) -> Result<()> {
    let mut attempt = 0;
    // The entry insert and the hourly upsert are separate store calls; a
    // retry must redo only the one that failed, or a transient upsert error
    // would duplicate the entry row.
    let mut inserted = false;
    loop {
        let result = (|| {
            if !inserted {
                store.insert_crossing(event)?;
                inserted = true;
            }
            let bucket = HourlyBucket::for_timestamp(event.timestamp_s);
            store.upsert_hourly(&bucket, 1, event.confidence)
        })();
        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(
                    "store write failed (attempt {}/{}): {:#}",
                    attempt, retries, e
                );
                thread::sleep(backoff * attempt);
            }
            Err(e) => {
                error!("store write failed permanently: {:#}", e);
                return Err(e);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Session aggregator
// ----------------------------------------------------------------------------

/// Per-session counters plus the handle to the durable writer. Mutated only
/// by the pipeline worker (and by control calls while no worker runs).
pub struct SessionAggregator {
    lane_count: usize,
    session_id: Option<String>,
    status: SessionStatus,
    session_start_s: u64,
    session_total: u64,
    per_lane: Vec<u64>,
    per_class: [u64; 4],
    frames_processed: u64,
    degraded_frames: u64,
    /// Persisted count for today at session start; added to the live total
    /// so `today_total` survives restarts.
    today_baseline: u64,
    writer: Option<DurableWriter>,
    /// Lost-write total carried over after the writer is finished.
    final_lost: u64,
}

impl SessionAggregator {
    pub fn new(lane_count: usize) -> Self {
        Self {
            lane_count,
            session_id: None,
            status: SessionStatus::Idle,
            session_start_s: 0,
            session_total: 0,
            per_lane: vec![0; lane_count],
            per_class: [0; 4],
            frames_processed: 0,
            degraded_frames: 0,
            today_baseline: 0,
            writer: None,
            final_lost: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Open a session: record it in the store, capture today's persisted
    /// baseline, then hand the store to the writer thread.
    pub fn start(
        &mut self,
        mut store: Box<dyn CrossingStore>,
        session_id: String,
        start_s: u64,
        settings: &StorageSettings,
    ) -> Result<()> {
        if self.status == SessionStatus::Running {
            return Err(ControlError::SessionAlreadyActive.into());
        }

        store.record_session_start(&session_id, start_s)?;
        let baseline = store.today_count()?;
        let writer = DurableWriter::spawn(store, settings)?;

        self.session_id = Some(session_id);
        self.status = SessionStatus::Running;
        self.session_start_s = start_s;
        self.session_total = 0;
        self.per_lane = vec![0; self.lane_count];
        self.per_class = [0; 4];
        self.frames_processed = 0;
        self.degraded_frames = 0;
        self.today_baseline = baseline;
        self.final_lost = 0;
        self.writer = Some(writer);
        Ok(())
    }

    /// Fold one crossing into the live counters and queue it for persistence.
    pub fn on_event(&mut self, event: CrossingEvent) {
        self.session_total += 1;
        if let Some(slot) = self.per_lane.get_mut(event.lane) {
            *slot += 1;
        }
        self.per_class[event.class.index()] += 1;
        if let Some(writer) = &self.writer {
            writer.enqueue(event);
        }
    }

    pub fn record_frame(&mut self, degraded: bool) {
        self.frames_processed += 1;
        if degraded {
            self.degraded_frames += 1;
        }
    }

    /// Close the session: drain pending writes and finalize the session row.
    pub fn stop(&mut self, end_s: u64) -> Result<()> {
        if self.status != SessionStatus::Running {
            return Err(ControlError::NotRunning.into());
        }
        self.status = SessionStatus::Stopped;
        if let Some(writer) = self.writer.take() {
            let end = self
                .session_id
                .clone()
                .map(|id| (id, end_s, self.session_total));
            self.final_lost = writer.finish(end);
        }
        Ok(())
    }

    /// Clear counters back to idle. Rejected while a session is running.
    pub fn reset(&mut self) -> Result<()> {
        if self.status == SessionStatus::Running {
            return Err(ControlError::SessionStillRunning.into());
        }
        self.session_id = None;
        self.status = SessionStatus::Idle;
        self.session_start_s = 0;
        self.session_total = 0;
        self.per_lane = vec![0; self.lane_count];
        self.per_class = [0; 4];
        self.frames_processed = 0;
        self.degraded_frames = 0;
        self.today_baseline = 0;
        self.final_lost = 0;
        Ok(())
    }

    pub fn snapshot(&self, now_s: u64) -> StatsSnapshot {
        let elapsed_s = now_s.saturating_sub(self.session_start_s);
        let hourly_rate = if self.status == SessionStatus::Idle || elapsed_s == 0 {
            0.0
        } else {
            self.session_total as f32 / (elapsed_s as f32 / 3600.0)
        };
        let lost_writes = match &self.writer {
            Some(writer) => writer.lost(),
            None => self.final_lost,
        };
        StatsSnapshot {
            session_id: self.session_id.clone(),
            status: self.status,
            session_total: self.session_total,
            today_total: self.today_baseline + self.session_total,
            per_lane: self.per_lane.clone(),
            per_class: self.per_class,
            hourly_rate,
            frames_processed: self.frames_processed,
            degraded_frames: self.degraded_frames,
            lost_writes,
        }
    }
}
