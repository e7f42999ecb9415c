//! Synthetic detector backend.
//!
//! Generates a plausible traffic scene without any model: one vehicle at a
//! time sweeps across the counting axis, cycling through lanes and classes.
//! Used by the demo daemon and for bring-up against a real store.

use anyhow::Result;

use crate::detect::Detector;
use crate::{BoundingBox, Detection, VehicleClass};

/// Emits one vehicle sweeping from 0.1 to 0.9 along y every `period` frames.
/// Each pass uses the next lane and the next vehicle class. A few frames per
/// pass are dropped to simulate detector flicker.
pub struct SyntheticDetector {
    frame: u64,
    period: u64,
}

impl SyntheticDetector {
    pub fn new(period: u64) -> Self {
        Self {
            frame: 0,
            period: period.max(4),
        }
    }
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self::new(40)
    }
}

impl Detector for SyntheticDetector {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn infer(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        let frame = self.frame;
        self.frame += 1;

        let phase = frame % self.period;
        let pass = frame / self.period;

        // Simulated flicker: occasionally miss the vehicle for a frame.
        if phase % 13 == 7 {
            return Ok(Vec::new());
        }

        let t = phase as f32 / self.period as f32;
        let cy = 0.1 + 0.8 * t;
        let cx = 0.125 + 0.25 * (pass % 4) as f32;
        let class = VehicleClass::ALL[(pass % 4) as usize];

        Ok(vec![Detection {
            bbox: BoundingBox::new(cx - 0.06, cy - 0.05, 0.12, 0.1),
            class,
            confidence: 0.88,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweeps_across_the_frame_over_one_period() {
        let mut det = SyntheticDetector::new(40);
        let mut first = None;
        let mut last = None;
        for _ in 0..40 {
            let out = det.infer(&[], 0, 0).expect("infer");
            if let Some(d) = out.first() {
                let cy = d.bbox.center().1;
                if first.is_none() {
                    first = Some(cy);
                }
                last = Some(cy);
            }
        }
        let (first, last) = (first.expect("some frames"), last.expect("some frames"));
        assert!(first < 0.2);
        assert!(last > 0.8);
    }

    #[test]
    fn lane_and_class_rotate_between_passes() {
        let mut det = SyntheticDetector::new(8);
        let first_pass = det.infer(&[], 0, 0).expect("infer");
        for _ in 0..8 {
            let _ = det.infer(&[], 0, 0);
        }
        let second_pass = det.infer(&[], 0, 0).expect("infer");
        assert_ne!(first_pass[0].class, second_pass[0].class);
        assert_ne!(
            first_pass[0].bbox.center().0,
            second_pass[0].bbox.center().0
        );
    }
}
