//! Detection boundary.
//!
//! The external inference step lives behind the `Detector` trait; the
//! `DetectionAdapter` is the only thing the pipeline talks to. The adapter
//! filters by confidence and the vehicle-class allow-list, and converts
//! detector failures and over-budget calls into an empty detection list plus
//! a degraded-frame signal. A single bad frame must never stop the pipeline.

use anyhow::Result;
use std::time::{Duration, Instant};

use crate::config::{DetectionSettings, SourceSettings};
use crate::ingest::Frame;
use crate::{Detection, VehicleClass};

pub mod backends;

pub use backends::scripted::ScriptedDetector;
pub use backends::synthetic::SyntheticDetector;

/// Detector backend trait.
///
/// Implementations may be slow and may fail; the adapter absorbs both. The
/// pixel slice is read-only and ephemeral: implementations must not retain
/// it beyond the `infer` call.
pub trait Detector: Send {
    /// Backend identifier, used in degraded-frame logs.
    fn name(&self) -> &'static str;

    /// Run inference on one frame, returning raw unfiltered detections.
    fn infer(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One frame's filtered detections plus the degraded flag.
#[derive(Clone, Debug, Default)]
pub struct FrameDetections {
    pub detections: Vec<Detection>,
    /// True when the detector failed or blew its time budget and the frame
    /// was treated as empty.
    pub degraded: bool,
}

/// Filters raw detector output by confidence threshold and class allow-list.
/// Configuration is fixed for the pipeline's lifetime.
pub struct DetectionAdapter {
    detector: Box<dyn Detector>,
    confidence_threshold: f32,
    allowed_classes: Vec<VehicleClass>,
    budget: Duration,
    expected_width: u32,
    expected_height: u32,
}

impl DetectionAdapter {
    pub fn new(
        detector: Box<dyn Detector>,
        cfg: &DetectionSettings,
        source: &SourceSettings,
    ) -> Self {
        Self {
            detector,
            confidence_threshold: cfg.confidence_threshold,
            allowed_classes: cfg.allowed_classes.clone(),
            budget: Duration::from_millis(cfg.budget_ms),
            expected_width: source.width,
            expected_height: source.height,
        }
    }

    /// Detect vehicles in one frame. Never fails: mis-sized frames, detector
    /// errors, and over-budget calls all degrade to an empty result.
    pub fn detect(&mut self, frame: &Frame) -> FrameDetections {
        if frame.width != self.expected_width || frame.height != self.expected_height {
            log::warn!(
                "frame {} is {}x{}, expected {}x{}; treating as empty",
                frame.index,
                frame.width,
                frame.height,
                self.expected_width,
                self.expected_height,
            );
            return FrameDetections {
                detections: Vec::new(),
                degraded: true,
            };
        }

        let started = Instant::now();
        match self
            .detector
            .infer(&frame.pixels, frame.width, frame.height)
        {
            Ok(raw) => {
                if started.elapsed() > self.budget {
                    log::warn!(
                        "detector '{}' exceeded {}ms budget on frame {}; treating as empty",
                        self.detector.name(),
                        self.budget.as_millis(),
                        frame.index,
                    );
                    return FrameDetections {
                        detections: Vec::new(),
                        degraded: true,
                    };
                }
                let detections = raw
                    .into_iter()
                    .filter(|d| {
                        d.confidence > self.confidence_threshold
                            && self.allowed_classes.contains(&d.class)
                    })
                    .collect();
                FrameDetections {
                    detections,
                    degraded: false,
                }
            }
            Err(e) => {
                log::warn!(
                    "detector '{}' failed on frame {}: {}; treating as empty",
                    self.detector.name(),
                    frame.index,
                    e
                );
                FrameDetections {
                    detections: Vec::new(),
                    degraded: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn frame() -> Frame {
        Frame {
            pixels: vec![0u8; 4 * 4 * 3],
            width: 4,
            height: 4,
            index: 0,
        }
    }

    fn settings() -> DetectionSettings {
        DetectionSettings {
            confidence_threshold: 0.5,
            allowed_classes: vec![VehicleClass::Car, VehicleClass::Truck],
            budget_ms: 1_000,
        }
    }

    fn source() -> SourceSettings {
        SourceSettings {
            width: 4,
            height: 4,
            target_fps: 10,
        }
    }

    fn det(class: VehicleClass, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
            class,
            confidence,
        }
    }

    #[test]
    fn filters_by_confidence_and_allow_list() {
        let mut script = ScriptedDetector::new();
        script.push_detections(vec![
            det(VehicleClass::Car, 0.9),
            det(VehicleClass::Car, 0.3),
            det(VehicleClass::Bus, 0.9),
        ]);
        let mut adapter = DetectionAdapter::new(Box::new(script), &settings(), &source());
        let result = adapter.detect(&frame());
        assert!(!result.degraded);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].class, VehicleClass::Car);
    }

    #[test]
    fn detector_failure_degrades_instead_of_propagating() {
        let mut script = ScriptedDetector::new();
        script.push_failure("inference socket timed out");
        let mut adapter = DetectionAdapter::new(Box::new(script), &settings(), &source());
        let result = adapter.detect(&frame());
        assert!(result.degraded);
        assert!(result.detections.is_empty());
    }

    #[test]
    fn exhausted_script_yields_clean_empty_frames() {
        let script = ScriptedDetector::new();
        let mut adapter = DetectionAdapter::new(Box::new(script), &settings(), &source());
        let result = adapter.detect(&frame());
        assert!(!result.degraded);
        assert!(result.detections.is_empty());
    }

    /// Sleeps past any reasonable budget, then reports a detection that
    /// must be discarded.
    struct SlowDetector {
        delay: Duration,
    }

    impl Detector for SlowDetector {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn infer(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<Vec<Detection>> {
            std::thread::sleep(self.delay);
            Ok(vec![det(VehicleClass::Car, 0.9)])
        }
    }

    #[test]
    fn over_budget_inference_is_discarded_and_degrades_the_frame() {
        let mut cfg = settings();
        cfg.budget_ms = 1;
        let slow = SlowDetector {
            delay: Duration::from_millis(50),
        };
        let mut adapter = DetectionAdapter::new(Box::new(slow), &cfg, &source());
        let result = adapter.detect(&frame());
        assert!(result.degraded);
        assert!(result.detections.is_empty());
    }

    #[test]
    fn mismatched_frame_dimensions_degrade_without_inference() {
        let mut script = ScriptedDetector::new();
        script.push_detections(vec![det(VehicleClass::Car, 0.9)]);
        let mut adapter = DetectionAdapter::new(Box::new(script), &settings(), &source());

        let wrong = Frame {
            pixels: vec![0u8; 8 * 8 * 3],
            width: 8,
            height: 8,
            index: 0,
        };
        let result = adapter.detect(&wrong);
        assert!(result.degraded);
        assert!(result.detections.is_empty());

        // The script was never consumed; a well-sized frame still sees it.
        let result = adapter.detect(&frame());
        assert!(!result.degraded);
        assert_eq!(result.detections.len(), 1);
    }
}
