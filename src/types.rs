use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub tracking: TrackingConfig,
    pub counting: CountingConfig,
    pub region: RegionConfig,
    pub video: VideoConfig,
    pub schedule: ScheduleConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub person_model_path: String,
    pub age_model_path: String,
    pub gender_model_path: String,
    pub age_labels: Vec<String>,
    pub gender_labels: Vec<String>,
    pub classifier_input_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub min_iou: f32,
    /// Frames a track survives without a detection before deletion
    pub max_coast_frames: u32,
    /// Frames a coasting track keeps appearing in tracker output, so a box
    /// that flickers off for 1-2 frames never reaches the counting logic
    pub flicker_bridge_frames: u32,
    pub max_centroid_distance_ratio: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountingConfig {
    /// Frames between classification reevaluation passes
    pub reevaluation_interval: u64,
    /// Stored classifications below this confidence are re-submitted
    pub low_confidence_threshold: f32,
    /// Seconds of source video between report flushes
    pub report_interval_seconds: u32,
}

/// The monitored boundary. Two points define an entrance line,
/// three or more a containment polygon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub points: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub input_dir: String,
    pub output_dir: String,
    pub save_annotated: bool,
}

/// Wall-clock placement of the footage being analyzed. The media clock maps
/// frame indices onto this range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub date: String,
    pub start_time: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub report_endpoint: String,
    pub heatmap_endpoint: String,
    pub upload_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// One decoded frame, RGB bytes in row-major HWC order.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}

/// One tracked detection as produced by the tracker adapter:
/// a persistent id, the detector class, and the box in pixel coordinates.
#[derive(Debug, Clone)]
pub struct TrackedDetection {
    pub track_id: u32,
    pub class_name: String,
    pub bbox: [f32; 4], // [x1, y1, x2, y2]
}

impl TrackedDetection {
    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) * 0.5,
            (self.bbox[1] + self.bbox[3]) * 0.5,
        )
    }
}

/// A single classifier verdict for one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// Display fallback for identities that have no stored classification.
pub const NOT_DETECTED: &str = "Not Detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntranceType {
    /// Visible on the very first analyzed frame, assumed already inside
    Initial,
    /// Crossed the monitored boundary inward
    Clean,
    /// Appeared in frame without crossing the boundary
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitType {
    /// Crossed the monitored boundary outward
    Clean,
    /// Disappeared from the detection stream without crossing
    Dirty,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
        }
    }
}

/// Immutable snapshot of a finalized identity. Constructed only through
/// `PastCustomer::new`, which rejects records with missing or inverted
/// dwell bounds, so a partially-initialized snapshot cannot exist.
#[derive(Debug, Clone)]
pub struct PastCustomer {
    pub track_id: u32,
    pub entrance_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    pub dwell_seconds: f64,
    pub entrance_type: EntranceType,
    pub exit_type: ExitType,
    pub age: Option<Classification>,
    pub gender: Option<Classification>,
}

impl PastCustomer {
    pub fn new(
        track_id: u32,
        entrance_time: Option<NaiveDateTime>,
        exit_time: Option<NaiveDateTime>,
        entrance_type: EntranceType,
        exit_type: ExitType,
        age: Option<Classification>,
        gender: Option<Classification>,
    ) -> anyhow::Result<Self> {
        let entrance_time = entrance_time.ok_or_else(|| {
            anyhow::anyhow!("integrity violation: finalizing id {track_id} with no entrance time")
        })?;
        let exit_time = exit_time.ok_or_else(|| {
            anyhow::anyhow!("integrity violation: finalizing id {track_id} with no exit time")
        })?;
        let dwell_seconds = (exit_time - entrance_time).num_milliseconds() as f64 / 1000.0;
        if dwell_seconds < 0.0 {
            anyhow::bail!(
                "integrity violation: id {track_id} exit {exit_time} precedes entrance {entrance_time}"
            );
        }
        Ok(Self {
            track_id,
            entrance_time,
            exit_time,
            dwell_seconds,
            entrance_type,
            exit_type,
            age,
            gender,
        })
    }
}
