//! Counting line, lane partition, and crossing evaluation.
//!
//! A crossing is a sign change of the signed perpendicular distance between
//! the track's newest centroid and the centroid N frames prior. A track with
//! a single history sample can never trigger a crossing, which filters
//! one-frame flicker detections.

use serde::Deserialize;

use crate::config::CountingSettings;
use crate::track::Track;
use crate::{CrossingEvent, Direction};

/// Orientation of the counting line.
///
/// A horizontal line is crossed along the y axis and lanes partition x;
/// a vertical line is crossed along x and lanes partition y.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineOrientation {
    Horizontal,
    Vertical,
}

/// Ordered, non-overlapping lane bands along the lane axis.
#[derive(Clone, Debug)]
pub struct LaneLayout {
    boundaries: Vec<f32>,
}

impl LaneLayout {
    pub fn new(boundaries: Vec<f32>) -> Self {
        Self { boundaries }
    }

    pub fn lane_count(&self) -> usize {
        self.boundaries.len() + 1
    }

    /// Lane index for a position along the lane axis. A centroid exactly on
    /// a boundary goes to the lower-indexed lane.
    pub fn lane_for(&self, pos: f32) -> usize {
        self.boundaries.iter().filter(|b| pos > **b).count()
    }
}

/// Evaluates track trajectories against the counting line. Reads track
/// identity but mutates only the `counted` flag, exactly once per track.
pub struct LineCounter {
    layout: LaneLayout,
    line_position: f32,
    orientation: LineOrientation,
    direction: Direction,
    lookback: usize,
}

impl LineCounter {
    pub fn new(cfg: &CountingSettings, lookback: usize) -> Self {
        Self {
            layout: LaneLayout::new(cfg.lane_boundaries.clone()),
            line_position: cfg.line_position,
            orientation: cfg.orientation,
            direction: cfg.direction,
            lookback,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.layout.lane_count()
    }

    /// (crossing-axis coordinate, lane-axis coordinate) of a centroid.
    fn split(&self, centroid: (f32, f32)) -> (f32, f32) {
        match self.orientation {
            LineOrientation::Horizontal => (centroid.1, centroid.0),
            LineOrientation::Vertical => (centroid.0, centroid.1),
        }
    }

    /// Evaluate one track. Emits at most one event per track, ever: on a
    /// qualifying sign change the track is marked counted, irreversibly.
    pub fn evaluate(
        &self,
        track: &mut Track,
        timestamp_s: u64,
        session_id: &str,
    ) -> Option<CrossingEvent> {
        if track.counted() || track.history_len() < 2 {
            return None;
        }

        let newest = track.newest_centroid()?;
        let back = self.lookback.min(track.history_len() - 1);
        let prior = track.centroid_back(back)?;

        let (now_c, lane_c) = self.split(newest);
        let (prev_c, _) = self.split(prior);
        let d_now = now_c - self.line_position;
        let d_prev = prev_c - self.line_position;

        // Exactly on the line is "not yet crossed"; wait for a signed side.
        if d_now == 0.0 || d_prev == 0.0 || d_now.signum() == d_prev.signum() {
            return None;
        }

        let forward = d_prev < 0.0;
        let allowed = match self.direction {
            Direction::Either => true,
            Direction::Forward => forward,
            Direction::Backward => !forward,
        };
        if !allowed {
            return None;
        }

        track.mark_counted();
        Some(CrossingEvent {
            track_id: track.id,
            timestamp_s,
            lane: self.layout.lane_for(lane_c),
            class: track.class(),
            confidence: track.confidence,
            session_id: session_id.to_string(),
        })
    }
}
