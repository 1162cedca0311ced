use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{MonitorError, Result};

/// Environment variable holding the VLM API key when the config file leaves
/// it empty.
pub const API_KEY_ENV: &str = "VLM_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub stream: StreamConfig,
    pub video: VideoConfig,
    pub vlm: VlmConfig,
    pub question: QuestionConfig,
    pub mcp: McpConfig,
    pub server: ServerConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Reconnect attempts before the reader goes terminally down.
    pub max_retries: u32,
    /// Upstream frame rate; sizes the packager's collection window.
    pub fps: f64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VideoConfig {
    pub target_duration_secs: f64,
    pub frames_per_second: u32,
    pub enable_resize: bool,
    pub target_width: u32,
    pub target_height: u32,
    pub jpeg_quality: u8,
    pub frame_queue_capacity: usize,
    pub ready_queue_capacity: usize,
    /// Encoded MP4s above this size are discarded.
    pub max_video_size_mb: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    Sync,
    Async,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub mode: InferenceMode,
    pub max_concurrent: usize,
    pub request_timeout_secs: u64,
    pub max_media_size_mb: f64,
    pub max_base64_size_mb: f64,
    pub system_prompt: String,
    pub user_prompt_template: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QuestionConfig {
    pub expiry_secs: u64,
    pub max_length: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum McpMode {
    Off,
    /// Invoke the control bridge only for inferences that carried a user
    /// question.
    OnQuestion,
    /// Sentry mode: invoke it for every completed inference.
    Always,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct McpConfig {
    pub base_url: String,
    pub mode: McpMode,
    pub request_timeout_secs: u64,
    /// Instruction synthesized when sentry mode runs without a question.
    pub sentry_prompt: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Per-connection WS send queue; full queues shed video frames first.
    pub ws_send_queue: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AsrConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TtsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    pub check_interval_secs: f64,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub output_dir: PathBuf,
    pub log_level: String,
    /// Cadence of the periodic experiment-log rewrite.
    pub log_checkpoint_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            connect_timeout_secs: 5,
            max_retries: 5,
            fps: 25.0,
            max_frame_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            target_duration_secs: 3.0,
            frames_per_second: 5,
            enable_resize: true,
            target_width: 640,
            target_height: 360,
            jpeg_quality: 80,
            frame_queue_capacity: 100,
            ready_queue_capacity: 10,
            max_video_size_mb: 95.0,
        }
    }
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            model: "qwen-vl-max-latest".to_string(),
            api_key: String::new(),
            mode: InferenceMode::Sync,
            max_concurrent: 1,
            request_timeout_secs: 60,
            max_media_size_mb: 100.0,
            max_base64_size_mb: 10.0,
            system_prompt: "You are a helpful assistant that analyzes videos and returns \
                            structured JSON responses."
                .to_string(),
            user_prompt_template: DEFAULT_USER_PROMPT.to_string(),
        }
    }
}

impl Default for QuestionConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 300,
            max_length: 500,
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8082".to_string(),
            mode: McpMode::OnQuestion,
            request_timeout_secs: 30,
            sentry_prompt: "Survey the scene and adjust the camera if anything needs a closer look"
                .to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["http://localhost:5173".to_string()],
            ws_send_queue: 32,
        }
    }
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 8888,
            endpoint: "/speak".to_string(),
            check_interval_secs: 5.0,
            max_retries: 3,
            timeout_secs: 10,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            log_level: "info".to_string(),
            log_checkpoint_secs: 30,
        }
    }
}

const DEFAULT_USER_PROMPT: &str = r#"Analyze this footage and reply with JSON only:
{
  "timestamp": "current time (ISO format)",
  "people_count": <number>,
  "vehicle_count": <number>,
  "people": [{"id": <n>, "bbox": [x1, y1, x2, y2], "activity": "short phrase"}],
  "vehicles": [{"id": <n>, "bbox": [x1, y1, x2, y2], "type": "car|truck|...", "status": "moving|parked"}],
  "summary": "one sentence",
  "response": "answer to the user's question, empty if none"
}
User question: {question}"#;

impl MonitorConfig {
    /// Load from an optional file plus `VIGIL_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| MonitorError::ConfigError(e.to_string()))?;

        let mut cfg: MonitorConfig = settings
            .try_deserialize()
            .map_err(|e| MonitorError::ConfigError(e.to_string()))?;

        if cfg.vlm.api_key.is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                cfg.vlm.api_key = key;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video.target_duration_secs <= 0.0 {
            return Err(MonitorError::ConfigError(
                "video.target_duration_secs must be positive".to_string(),
            ));
        }
        if self.video.frames_per_second == 0 {
            return Err(MonitorError::ConfigError(
                "video.frames_per_second must be positive".to_string(),
            ));
        }
        if self.stream.fps <= 0.0 {
            return Err(MonitorError::ConfigError(
                "stream.fps must be positive".to_string(),
            ));
        }
        if self.vlm.max_concurrent == 0 {
            return Err(MonitorError::ConfigError(
                "vlm.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.tts.enabled && self.tts.check_interval_secs < 0.1 {
            return Err(MonitorError::ConfigError(
                "tts.check_interval_secs must be at least 0.1".to_string(),
            ));
        }
        Ok(())
    }

    /// Image mode is the degenerate (1, 1, 1) packaging triple.
    pub fn is_image_mode(&self) -> bool {
        self.video.target_duration_secs == 1.0
            && self.video.frames_per_second == 1
            && self.target_frames_per_video() == 1
    }

    pub fn target_frames_per_video(&self) -> usize {
        (self.video.target_duration_secs * self.video.frames_per_second as f64).round() as usize
    }

    /// Raw frames collected per batch: ceil(duration x upstream fps).
    pub fn frames_to_collect(&self) -> usize {
        (self.video.target_duration_secs * self.stream.fps).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = MonitorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.target_frames_per_video(), 15);
        assert_eq!(cfg.frames_to_collect(), 75);
        assert!(!cfg.is_image_mode());
    }

    #[test]
    fn image_mode_triple() {
        let mut cfg = MonitorConfig::default();
        cfg.video.target_duration_secs = 1.0;
        cfg.video.frames_per_second = 1;
        assert!(cfg.is_image_mode());
        assert_eq!(cfg.target_frames_per_video(), 1);
    }

    #[test]
    fn zero_duration_rejected() {
        let mut cfg = MonitorConfig::default();
        cfg.video.target_duration_secs = 0.0;
        assert!(cfg.validate().is_err());
    }
}
