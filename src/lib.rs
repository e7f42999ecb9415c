//! lanewatch - lane-attributed vehicle counting core.
//!
//! This crate turns a raw sequence of per-frame bounding-box detections into
//! a stream of discrete "vehicle crossed" events with lane and class
//! attribution, plus the session/aggregation state machine that turns those
//! events into durable statistics.
//!
//! # Architecture
//!
//! Data flows strictly one direction per frame:
//!
//! frame -> detections -> track updates -> crossing events -> aggregates -> store
//!
//! The core invariants:
//!
//! 1. **No double count**: a track emits at most one crossing event, ever.
//! 2. **No lost count**: live counters are the source of truth; durable-write
//!    failure degrades history, never live counting.
//! 3. **Idempotent restart**: a second `start()` while running is rejected,
//!    it never spawns a second loop or resets live counters.
//! 4. **Single writer**: only the pipeline worker mutates track and session
//!    state; readers see atomically swapped snapshots.
//!
//! # Module Structure
//!
//! - `detect`: `Detector` trait and the filtering `DetectionAdapter`
//! - `track`: active track set and greedy detection/track association
//! - `counting`: counting line, lane partition, crossing evaluation
//! - `aggregate`: session state machine, counters, durable-write queue
//! - `pipeline`: frame loop orchestration and control surface
//! - `storage`: `CrossingStore` trait with SQLite and in-memory stores
//! - `ingest`: `FrameSource` trait and the synthetic source
//! - `annotate`: annotated-frame rendering for the serving layer

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod aggregate;
pub mod annotate;
pub mod config;
pub mod counting;
pub mod detect;
pub mod ingest;
pub mod pipeline;
pub mod storage;
pub mod track;

pub use aggregate::{SessionAggregator, SessionStatus, StatsSnapshot};
pub use annotate::AnnotatedFrame;
pub use config::PipelineConfig;
pub use counting::{LaneLayout, LineCounter, LineOrientation};
pub use detect::{DetectionAdapter, Detector, FrameDetections, ScriptedDetector, SyntheticDetector};
pub use ingest::{Frame, FrameSource, SyntheticSource};
pub use pipeline::Pipeline;
pub use storage::{CrossingStore, InMemoryCrossingStore, SqliteCrossingStore};
pub use track::{Track, TrackId, TrackManager};

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- Vehicle classes --------------------

/// Fixed vehicle-class set (the COCO vehicle classes of the upstream
/// detector: car=2, motorcycle=3, bus=5, truck=7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Car,
        VehicleClass::Motorcycle,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];

    pub fn label(self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Motorcycle => "motorcycle",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "car" => Some(VehicleClass::Car),
            "motorcycle" => Some(VehicleClass::Motorcycle),
            "bus" => Some(VehicleClass::Bus),
            "truck" => Some(VehicleClass::Truck),
            _ => None,
        }
    }

    /// Stable index into per-class counter arrays.
    pub fn index(self) -> usize {
        match self {
            VehicleClass::Car => 0,
            VehicleClass::Motorcycle => 1,
            VehicleClass::Bus => 2,
            VehicleClass::Truck => 3,
        }
    }
}

// -------------------- Geometry --------------------

/// Axis-aligned bounding box in normalized [0,1] frame coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

// -------------------- Detections and events --------------------

/// One detected object in one frame. Transient; owned by the current frame's
/// processing step and never persisted.
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: VehicleClass,
    pub confidence: f32,
}

/// Counting direction relative to increasing line-axis coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Either sign transition counts.
    Either,
    /// Only transitions toward increasing coordinate count.
    Forward,
    /// Only transitions toward decreasing coordinate count.
    Backward,
}

/// The discrete, at-most-once signal that a track has passed the counting
/// line. Consumed exactly once by the session aggregator.
#[derive(Clone, Debug, PartialEq)]
pub struct CrossingEvent {
    pub track_id: TrackId,
    pub timestamp_s: u64,
    pub lane: usize,
    pub class: VehicleClass,
    pub confidence: f32,
    pub session_id: String,
}

// -------------------- Control errors --------------------

/// Synchronous control-API misuse. These reject without mutating any state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("pipeline is not running")]
    NotRunning,
    #[error("a session is already active")]
    SessionAlreadyActive,
    #[error("session is still running; stop it before reset")]
    SessionStillRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 0.1, 0.1);
        let b = BoundingBox::new(0.5, 0.5, 0.1, 0.1);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_partial_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 0.2, 0.2);
        let b = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        // intersection 0.1*0.1, union 0.04+0.04-0.01
        let expected = 0.01 / 0.07;
        assert!((a.iou(&b) - expected).abs() < 1e-6);
    }

    #[test]
    fn class_labels_round_trip() {
        for class in VehicleClass::ALL {
            assert_eq!(VehicleClass::from_label(class.label()), Some(class));
        }
        assert_eq!(VehicleClass::from_label("bicycle"), None);
    }
}
