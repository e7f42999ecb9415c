//! Synthetic frame source for tests and bring-up.

use anyhow::Result;

use crate::ingest::{Frame, FrameSource};

/// Generates patterned RGB frames. With a limit it behaves like finite file
/// playback (end-of-stream after N frames); without one it runs like live
/// capture.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    limit: Option<u64>,
    produced: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            limit: None,
            produced: 0,
        }
    }

    /// Finite playback: end-of-stream after `limit` frames.
    pub fn with_limit(width: u32, height: u32, limit: u64) -> Self {
        Self {
            width,
            height,
            limit: Some(limit),
            produced: 0,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let len = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            // Mix position and frame count for cheap variation.
            *pixel = ((i as u64 + self.produced) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.limit {
            if self.produced >= limit {
                return Ok(None);
            }
        }
        let frame = Frame {
            pixels: self.generate_pixels(),
            width: self.width,
            height: self.height,
            index: self.produced,
        };
        self.produced += 1;
        Ok(Some(frame))
    }
}
