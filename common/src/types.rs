use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::epoch_secs;

/// One decoded frame from the upstream stream.
///
/// Immutable once emitted by the reader; clones share the JPEG buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Seconds since session start.
    pub relative_secs: f64,
    pub width: u32,
    pub height: u32,
    /// Dimensions after the packager's resize, when it applied one.
    pub resized: Option<(u32, u32)>,
    /// Encoded JPEG bytes.
    pub data: Bytes,
}

impl Frame {
    pub fn epoch_secs(&self) -> f64 {
        self.timestamp.timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Reader health as observed by downstream subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderStatus {
    Connecting,
    Up,
    Reconnecting,
    /// Retry budget exhausted; the reader stays down until restarted.
    Down,
}

/// Bounding box stored exactly as received from the model.
///
/// The model may emit pixel or normalized coordinates; consumers remap using
/// the `ImageDimensions` recorded alongside.
pub type BBox = [f64; 4];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ImageDimensions {
    pub model_width: u32,
    pub model_height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Person {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub bbox: BBox,
    #[serde(default)]
    pub activity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Vehicle {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub bbox: BBox,
    #[serde(rename = "type", default)]
    pub vehicle_type: String,
    #[serde(default)]
    pub status: String,
}

/// Structured scene description parsed from the VLM response.
///
/// Every field is defaulted so a partial model reply still parses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SceneResult {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub people_count: u64,
    #[serde(default)]
    pub vehicle_count: u64,
    #[serde(default)]
    pub people: Vec<Person>,
    #[serde(default)]
    pub vehicles: Vec<Vehicle>,
    #[serde(default)]
    pub summary: String,
    /// Direct answer to the bound user question, when the model gave one.
    #[serde(default)]
    pub response: String,
}

/// Outcome of a camera-control request through the MCP bridge.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub ai_response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuestion {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

/// One sampled frame inside a video artifact (or the single frame of an
/// image artifact), as persisted in `video_details.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampledFrame {
    pub index: usize,
    pub original_frame_number: u64,
    pub timestamp: f64,
    pub timestamp_iso: String,
    pub relative_timestamp: f64,
    pub file_name: String,
}

/// A packaged piece of media awaiting (or holding) an inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaArtifact {
    pub id: String,
    pub kind: MediaKind,
    /// Details directory holding the media file and its JSON companions.
    pub dir: std::path::PathBuf,
    pub media_path: std::path::PathBuf,
    /// First and last upstream sequence numbers covered by this artifact.
    pub original_frame_range: [u64; 2],
    pub sampled_frames: Vec<SampledFrame>,
    pub target_duration: f64,
    pub output_fps: u32,
    pub start_relative_timestamp: f64,
    pub end_relative_timestamp: f64,
    pub created_at: DateTime<Utc>,
    pub image_dimensions: Option<ImageDimensions>,
}

impl MediaArtifact {
    pub fn file_name(&self) -> String {
        self.media_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Persisted body of `video_details.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDetails {
    pub video_path: String,
    pub frame_count: usize,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub start_relative_timestamp: f64,
    pub end_relative_timestamp: f64,
    pub original_frame_range: [u64; 2],
    pub sampling_info: SamplingInfo,
    pub creation_time: f64,
    pub creation_timestamp: String,
    pub sampled_frames: Vec<SampledFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingInfo {
    pub target_duration: f64,
    pub frames_per_second: u32,
    pub target_frames: usize,
    pub source_frames: usize,
}

/// Full record of one inference, persisted as `inference_result.json`.
///
/// `inference_end_*` stay empty while the remote call is in flight; such a
/// record is "in progress" and excluded from latest-with-AI queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRecord {
    pub media_id: String,
    pub media_path: String,
    pub media_kind: MediaKind,
    pub original_frame_range: [u64; 2],
    pub inference_start_time: f64,
    pub inference_start_timestamp: String,
    #[serde(default)]
    pub inference_end_time: Option<f64>,
    #[serde(default)]
    pub inference_end_timestamp: Option<String>,
    #[serde(default)]
    pub inference_duration: Option<f64>,
    #[serde(default)]
    pub raw_result: String,
    #[serde(default)]
    pub parsed_result: SceneResult,
    /// Non-JSON prose the model emitted before the fenced JSON block.
    #[serde(default)]
    pub ai_response: Option<String>,
    #[serde(default)]
    pub user_question: Option<String>,
    #[serde(default)]
    pub image_dimensions: Option<ImageDimensions>,
    #[serde(default)]
    pub mcp_result: Option<McpResult>,
    /// Stable error kind when the inference failed (timeout, transport, ...).
    #[serde(default)]
    pub error: Option<String>,
}

impl InferenceRecord {
    pub fn is_complete(&self) -> bool {
        self.inference_end_time.is_some()
    }

    /// Whether this record is "analytically meaningful": it detected
    /// something, answered the user, or carried a camera action.
    pub fn has_ai_content(&self) -> bool {
        self.parsed_result.people_count > 0
            || self.parsed_result.vehicle_count > 0
            || !self.parsed_result.response.is_empty()
            || self.mcp_result.is_some()
    }
}

/// Snapshot of pipeline counters, persisted in `experiment_log.json` and
/// served by `/api/status`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsSnapshot {
    pub total_frames_received: u64,
    pub frames_resized: u64,
    pub frames_invalid: u64,
    pub protocol_errors: u64,
    pub total_videos_created: u64,
    pub total_inferences_started: u64,
    pub total_inferences_completed: u64,
    pub skipped_sync_mode: u64,
    pub start_time: f64,
    pub start_timestamp: String,
    pub total_duration: f64,
}

/// Body of `experiment_log.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentLog {
    pub processor_config: Value,
    pub statistics: StatsSnapshot,
    pub inference_log: Vec<InferenceRecord>,
}

/// Uniform REST envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: f64,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: epoch_secs(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            timestamp: epoch_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_result_defaults_missing_fields() {
        let scene: SceneResult = serde_json::from_str(r#"{"people_count": 2}"#).unwrap();
        assert_eq!(scene.people_count, 2);
        assert_eq!(scene.vehicle_count, 0);
        assert!(scene.people.is_empty());
        assert!(scene.summary.is_empty());
        assert!(scene.response.is_empty());
    }

    #[test]
    fn scene_result_ignores_unknown_fields() {
        let scene: SceneResult =
            serde_json::from_str(r#"{"summary": "quiet street", "confidence": 0.9}"#).unwrap();
        assert_eq!(scene.summary, "quiet street");
    }

    #[test]
    fn ai_content_predicate() {
        let mut record = InferenceRecord {
            media_id: "m1".into(),
            media_path: "m1.mp4".into(),
            media_kind: MediaKind::Video,
            original_frame_range: [1, 75],
            inference_start_time: 0.0,
            inference_start_timestamp: String::new(),
            inference_end_time: Some(1.0),
            inference_end_timestamp: None,
            inference_duration: Some(1.0),
            raw_result: String::new(),
            parsed_result: SceneResult::default(),
            ai_response: None,
            user_question: None,
            image_dimensions: None,
            mcp_result: None,
            error: None,
        };
        assert!(!record.has_ai_content());

        record.parsed_result.people_count = 3;
        assert!(record.has_ai_content());

        record.parsed_result.people_count = 0;
        record.mcp_result = Some(McpResult::default());
        assert!(record.has_ai_content());
    }
}
