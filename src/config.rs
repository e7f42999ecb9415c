//! Pipeline configuration.
//!
//! Layering follows file -> environment -> validate: an optional TOML file is
//! read first, selected environment variables override it, then `validate()`
//! rejects anything out of range. The validated config is immutable for the
//! pipeline's lifetime so counting semantics stay stable mid-session.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::counting::LineOrientation;
use crate::{Direction, VehicleClass};

const DEFAULT_DB_PATH: &str = "lanewatch.db";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_DETECTION_BUDGET_MS: u64 = 500;
const DEFAULT_MAX_MISSES: u32 = 10;
const DEFAULT_MIN_IOU: f32 = 0.1;
const DEFAULT_MAX_DISPLACEMENT: f32 = 0.08;
const DEFAULT_HISTORY_LEN: usize = 32;
const DEFAULT_LOOKBACK: usize = 3;
const DEFAULT_LINE_POSITION: f32 = 0.5;
const DEFAULT_LANE_BOUNDARIES: [f32; 3] = [0.25, 0.5, 0.75];
const DEFAULT_WRITE_QUEUE_CAP: usize = 256;
const DEFAULT_WRITE_RETRIES: u32 = 5;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;
const DEFAULT_RETENTION_DAYS: u32 = 90;
const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_TARGET_FPS: u32 = 10;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    detection: Option<DetectionFile>,
    tracking: Option<TrackingFile>,
    counting: Option<CountingFile>,
    storage: Option<StorageFile>,
    source: Option<SourceFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionFile {
    confidence_threshold: Option<f32>,
    allowed_classes: Option<Vec<VehicleClass>>,
    budget_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingFile {
    max_misses: Option<u32>,
    min_iou: Option<f32>,
    max_displacement: Option<f32>,
    history_len: Option<usize>,
    lookback: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CountingFile {
    line_position: Option<f32>,
    lane_boundaries: Option<Vec<f32>>,
    orientation: Option<LineOrientation>,
    direction: Option<Direction>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageFile {
    db_path: Option<String>,
    write_queue_cap: Option<usize>,
    write_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub detection: DetectionSettings,
    pub tracking: TrackingSettings,
    pub counting: CountingSettings,
    pub storage: StorageSettings,
    pub source: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Minimum detector confidence, exclusive bounds (0,1).
    pub confidence_threshold: f32,
    /// Vehicle classes that may produce counts.
    pub allowed_classes: Vec<VehicleClass>,
    /// Per-frame detection time budget; over-budget frames count as degraded.
    pub budget_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    /// Consecutive unmatched frames before a track is retired.
    pub max_misses: u32,
    /// Minimum IoU for a detection to be eligible to match a track.
    pub min_iou: f32,
    /// Maximum normalized centroid displacement for eligibility (handles
    /// fast motion with low overlap).
    pub max_displacement: f32,
    /// Bound on centroid history length.
    pub history_len: usize,
    /// How many frames back the counter compares against.
    pub lookback: usize,
}

#[derive(Debug, Clone)]
pub struct CountingSettings {
    /// Fractional offset of the counting line along the crossing axis.
    pub line_position: f32,
    /// Ordered interior lane boundaries along the lane axis.
    pub lane_boundaries: Vec<f32>,
    pub orientation: LineOrientation,
    pub direction: Direction,
}

impl CountingSettings {
    pub fn lane_count(&self) -> usize {
        self.lane_boundaries.len() + 1
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub db_path: String,
    pub write_queue_cap: usize,
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl PipelineConfig {
    /// Load configuration: optional TOML file (path argument or
    /// `LANEWATCH_CONFIG`), then env overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("LANEWATCH_CONFIG").ok();
        let chosen = path.or_else(|| env_path.as_deref().map(Path::new));
        let file_cfg = match chosen {
            Some(p) => read_config_file(p)?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let detection = file.detection.unwrap_or_default();
        let tracking = file.tracking.unwrap_or_default();
        let counting = file.counting.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let source = file.source.unwrap_or_default();

        Self {
            detection: DetectionSettings {
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                allowed_classes: detection
                    .allowed_classes
                    .unwrap_or_else(|| VehicleClass::ALL.to_vec()),
                budget_ms: detection.budget_ms.unwrap_or(DEFAULT_DETECTION_BUDGET_MS),
            },
            tracking: TrackingSettings {
                max_misses: tracking.max_misses.unwrap_or(DEFAULT_MAX_MISSES),
                min_iou: tracking.min_iou.unwrap_or(DEFAULT_MIN_IOU),
                max_displacement: tracking
                    .max_displacement
                    .unwrap_or(DEFAULT_MAX_DISPLACEMENT),
                history_len: tracking.history_len.unwrap_or(DEFAULT_HISTORY_LEN),
                lookback: tracking.lookback.unwrap_or(DEFAULT_LOOKBACK),
            },
            counting: CountingSettings {
                line_position: counting.line_position.unwrap_or(DEFAULT_LINE_POSITION),
                lane_boundaries: counting
                    .lane_boundaries
                    .unwrap_or_else(|| DEFAULT_LANE_BOUNDARIES.to_vec()),
                orientation: counting.orientation.unwrap_or(LineOrientation::Horizontal),
                direction: counting.direction.unwrap_or(Direction::Either),
            },
            storage: StorageSettings {
                db_path: storage.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                write_queue_cap: storage.write_queue_cap.unwrap_or(DEFAULT_WRITE_QUEUE_CAP),
                write_retries: storage.write_retries.unwrap_or(DEFAULT_WRITE_RETRIES),
                retry_backoff_ms: storage
                    .retry_backoff_ms
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                retention_days: storage.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
            },
            source: SourceSettings {
                width: source.width.unwrap_or(DEFAULT_FRAME_WIDTH),
                height: source.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
                target_fps: source.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("LANEWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.storage.db_path = path;
            }
        }
        if let Ok(value) = std::env::var("LANEWATCH_CONFIDENCE_THRESHOLD") {
            self.detection.confidence_threshold = value
                .parse()
                .map_err(|_| anyhow!("LANEWATCH_CONFIDENCE_THRESHOLD must be a float"))?;
        }
        if let Ok(value) = std::env::var("LANEWATCH_LINE_POSITION") {
            self.counting.line_position = value
                .parse()
                .map_err(|_| anyhow!("LANEWATCH_LINE_POSITION must be a float"))?;
        }
        if let Ok(value) = std::env::var("LANEWATCH_MAX_MISSES") {
            self.tracking.max_misses = value
                .parse()
                .map_err(|_| anyhow!("LANEWATCH_MAX_MISSES must be an integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        if !(d.confidence_threshold > 0.0 && d.confidence_threshold < 1.0) {
            return Err(anyhow!("confidence_threshold must be in (0,1)"));
        }
        if d.allowed_classes.is_empty() {
            return Err(anyhow!("allowed_classes must not be empty"));
        }

        let t = &self.tracking;
        if t.max_misses == 0 {
            return Err(anyhow!("max_misses must be >= 1"));
        }
        if !(0.0..1.0).contains(&t.min_iou) {
            return Err(anyhow!("min_iou must be in [0,1)"));
        }
        if t.max_displacement <= 0.0 {
            return Err(anyhow!("max_displacement must be > 0"));
        }
        if t.history_len < 2 {
            return Err(anyhow!("history_len must be >= 2"));
        }
        if t.lookback == 0 || t.lookback >= t.history_len {
            return Err(anyhow!("lookback must be >= 1 and < history_len"));
        }

        let c = &self.counting;
        if !(c.line_position > 0.0 && c.line_position < 1.0) {
            return Err(anyhow!("line_position must be in (0,1)"));
        }
        let mut prev = 0.0f32;
        for &b in &c.lane_boundaries {
            if !(b > 0.0 && b < 1.0) {
                return Err(anyhow!("lane boundaries must be in (0,1)"));
            }
            if b <= prev {
                return Err(anyhow!("lane boundaries must be strictly increasing"));
            }
            prev = b;
        }

        if self.storage.write_queue_cap == 0 {
            return Err(anyhow!("write_queue_cap must be >= 1"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source dimensions must be non-zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
