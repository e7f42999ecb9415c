//! Scripted detector backend for deterministic tests.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::Detector;
use crate::Detection;

enum Step {
    Detections(Vec<Detection>),
    Failure(String),
}

/// Replays a fixed per-frame script. Once the script is exhausted every
/// frame comes back empty, so a short script in a long run is fine.
pub struct ScriptedDetector {
    steps: VecDeque<Step>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
        }
    }

    /// Append one frame's detections to the script.
    pub fn push_detections(&mut self, detections: Vec<Detection>) {
        self.steps.push_back(Step::Detections(detections));
    }

    /// Append a frame on which inference fails.
    pub fn push_failure(&mut self, message: &str) {
        self.steps.push_back(Step::Failure(message.to_string()));
    }

    /// Append `n` empty frames.
    pub fn push_empty_frames(&mut self, n: usize) {
        for _ in 0..n {
            self.steps.push_back(Step::Detections(Vec::new()));
        }
    }
}

impl Default for ScriptedDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        match self.steps.pop_front() {
            Some(Step::Detections(d)) => Ok(d),
            Some(Step::Failure(msg)) => Err(anyhow!("{}", msg)),
            None => Ok(Vec::new()),
        }
    }
}
