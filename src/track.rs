//! Active track set and detection/track association.
//!
//! Association is greedy nearest-neighbor: every eligible (track, detection)
//! pair gets a cost combining normalized centroid distance and bounding-box
//! overlap, pairs are resolved in increasing cost order, and each side is
//! used at most once. This favors determinism and O(n*m) cost over optimal
//! bipartite matching, which is acceptable at tens of tracks per frame.

use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::config::TrackingSettings;
use crate::{BoundingBox, Detection, VehicleClass};

pub type TrackId = u64;

/// Persistent identity of one physical vehicle across consecutive frames.
///
/// Created on an unmatched detection, mutated on each successful match,
/// retired when the miss count exceeds the configured threshold. The
/// `counted` flag flips false -> true exactly once, irreversibly.
#[derive(Clone, Debug)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Frame index of the last successful match.
    pub last_seen: u64,
    /// Frames since creation.
    pub age: u32,
    /// Consecutive frames with no matching detection.
    pub misses: u32,
    counted: bool,
    /// Bounded centroid history, newest at the back.
    history: VecDeque<(f32, f32)>,
    class_votes: [u32; 4],
    latest_class: VehicleClass,
    history_cap: usize,
}

impl Track {
    fn new(id: TrackId, det: &Detection, frame_index: u64, history_cap: usize) -> Self {
        let mut track = Self {
            id,
            bbox: det.bbox,
            confidence: det.confidence,
            last_seen: frame_index,
            age: 0,
            misses: 0,
            counted: false,
            history: VecDeque::with_capacity(history_cap),
            class_votes: [0; 4],
            latest_class: det.class,
            history_cap,
        };
        track.class_votes[det.class.index()] += 1;
        track.history.push_back(det.bbox.center());
        track
    }

    fn observe(&mut self, det: &Detection, frame_index: u64) {
        self.bbox = det.bbox;
        self.confidence = det.confidence;
        self.last_seen = frame_index;
        self.misses = 0;
        self.latest_class = det.class;
        self.class_votes[det.class.index()] += 1;
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(det.bbox.center());
    }

    fn mark_missed(&mut self) {
        self.misses += 1;
    }

    /// Majority-vote class; the most recently seen class wins ties.
    pub fn class(&self) -> VehicleClass {
        let mut best = self.latest_class;
        let mut best_votes = self.class_votes[self.latest_class.index()];
        for class in VehicleClass::ALL {
            if self.class_votes[class.index()] > best_votes {
                best = class;
                best_votes = self.class_votes[class.index()];
            }
        }
        best
    }

    pub fn counted(&self) -> bool {
        self.counted
    }

    /// Irreversible; the crossing counter is the only caller.
    pub(crate) fn mark_counted(&mut self) {
        self.counted = true;
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Most recent centroid.
    pub fn newest_centroid(&self) -> Option<(f32, f32)> {
        self.history.back().copied()
    }

    /// Centroid `back` samples before the newest (0 = newest).
    pub fn centroid_back(&self, back: usize) -> Option<(f32, f32)> {
        let len = self.history.len();
        if back >= len {
            return None;
        }
        self.history.get(len - 1 - back).copied()
    }
}

/// Owns the set of active tracks. The single mutator in the pipeline.
pub struct TrackManager {
    cfg: TrackingSettings,
    tracks: Vec<Track>,
    next_id: TrackId,
}

impl TrackManager {
    pub fn new(cfg: TrackingSettings) -> Self {
        Self {
            cfg,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    /// Associate one frame's detections to the active tracks.
    ///
    /// Matched tracks absorb their detection, unmatched tracks accrue a miss,
    /// tracks over the retirement threshold are removed, and unmatched
    /// detections spawn new tracks in detection order.
    pub fn update(&mut self, frame_index: u64, detections: &[Detection]) {
        for track in &mut self.tracks {
            track.age = track.age.saturating_add(1);
        }

        // Eligible pairs: enough overlap, or close enough for fast motion.
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            let (tx, ty) = track.bbox.center();
            for (di, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                let (dx, dy) = det.bbox.center();
                let dist = ((tx - dx).powi(2) + (ty - dy).powi(2)).sqrt();
                if iou >= self.cfg.min_iou || dist <= self.cfg.max_displacement {
                    candidates.push((dist + (1.0 - iou), ti, di));
                }
            }
        }

        // Closest/most-overlapping pairs first; index order breaks cost ties
        // so the result is stable across runs.
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];
        for (_, ti, di) in candidates {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            self.tracks[ti].observe(&detections[di], frame_index);
        }

        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if !track_used[ti] {
                track.mark_missed();
            }
        }

        let max_misses = self.cfg.max_misses;
        self.tracks.retain(|t| t.misses <= max_misses);

        for (di, det) in detections.iter().enumerate() {
            if !det_used[di] {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks
                    .push(Track::new(id, det, frame_index, self.cfg.history_len));
            }
        }
    }
}
