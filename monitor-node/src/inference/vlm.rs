use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use vigil_common::{McpResult, MediaArtifact, MediaKind, SceneResult};

use crate::config::VlmConfig;
use crate::error::{MonitorError, Result};

/// Remote scene-understanding backend. The production implementation is the
/// chat-completions client below; tests substitute their own.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, artifact: &MediaArtifact, question: Option<&str>) -> Result<Analysis>;
}

/// Parsed outcome of one remote analysis call.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub raw: String,
    /// Prose the model emitted before the fenced JSON block, if any.
    pub ai_response: Option<String>,
    pub scene: SceneResult,
    /// Set when the payload was not valid scene JSON; `scene` holds defaults.
    pub parse_error: Option<String>,
    /// Camera-action intent embedded in the response. Execution is the
    /// control bridge's job; this is only parsed intent.
    pub mcp_intent: Option<McpResult>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat-completions endpoint that accepts
/// base64 media parts.
pub struct VlmClient {
    http: reqwest::Client,
    config: VlmConfig,
}

impl VlmClient {
    pub fn new(config: VlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(MonitorError::ConfigError(
                "VLM API key is not set (config vlm.api_key or VLM_API_KEY)".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MonitorError::ConfigError(e.to_string()))?;
        info!(model = %config.model, base_url = %config.base_url, "VLM client ready");
        Ok(Self { http, config })
    }

    async fn encode_media(&self, artifact: &MediaArtifact) -> Result<String> {
        let data = tokio::fs::read(&artifact.media_path).await?;
        let size_mb = data.len() as f64 / (1024.0 * 1024.0);
        if size_mb > self.config.max_media_size_mb {
            return Err(MonitorError::EncodeError(format!(
                "media too large: {size_mb:.2}MB > {:.2}MB",
                self.config.max_media_size_mb
            )));
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
        let encoded_mb = encoded.len() as f64 / (1024.0 * 1024.0);
        if encoded_mb > self.config.max_base64_size_mb {
            return Err(MonitorError::EncodeError(format!(
                "base64 payload too large: {encoded_mb:.2}MB > {:.2}MB",
                self.config.max_base64_size_mb
            )));
        }
        debug!(size_mb, encoded_mb, "Media encoded for upload");
        Ok(encoded)
    }

    fn media_part(&self, artifact: &MediaArtifact, encoded: &str) -> serde_json::Value {
        match artifact.kind {
            MediaKind::Video => json!({
                "type": "video_url",
                "video_url": { "url": format!("data:video/mp4;base64,{encoded}") },
            }),
            MediaKind::Image => json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{encoded}") },
            }),
        }
    }

}

#[async_trait]
impl Analyzer for VlmClient {
    /// Run one analysis against the remote model. Network and HTTP failures
    /// are transient errors; response parsing is total and never fails the
    /// call.
    async fn analyze(&self, artifact: &MediaArtifact, question: Option<&str>) -> Result<Analysis> {
        let encoded = self.encode_media(artifact).await?;
        let prompt = self
            .config
            .user_prompt_template
            .replace("{question}", question.unwrap_or(""));

        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": self.config.system_prompt },
                {
                    "role": "user",
                    "content": [
                        self.media_part(artifact, &encoded),
                        { "type": "text", "text": prompt },
                    ],
                },
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MonitorError::InferenceTransient(format!(
                "HTTP {status}: {text}"
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| MonitorError::InferenceTransient(format!("bad response body: {e}")))?;
        let raw = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                MonitorError::InferenceTransient("response carried no content".to_string())
            })?;

        debug!(chars = raw.len(), "VLM analysis returned");
        Ok(parse_analysis(raw))
    }
}

/// Total parse of a model reply: `prelude? + fenced_json + postlude?`.
/// The prelude is retained as prose; malformed JSON yields defaults plus a
/// parse-error note rather than a failure.
pub fn parse_analysis(raw: String) -> Analysis {
    let (prelude, payload) = extract_json_payload(&raw);

    let (scene, parse_error) = match serde_json::from_str::<SceneResult>(&payload) {
        Ok(scene) => (scene, None),
        Err(e) => {
            warn!("Scene JSON did not parse: {e}");
            (SceneResult::default(), Some(e.to_string()))
        }
    };

    let mcp_intent = parse_mcp_block(&raw);

    Analysis {
        ai_response: prelude,
        raw,
        scene,
        parse_error,
        mcp_intent,
    }
}

/// Split a reply into (non-empty prelude prose, JSON payload text).
fn extract_json_payload(raw: &str) -> (Option<String>, String) {
    if let Some(fence_start) = raw.find("```json") {
        let after = &raw[fence_start + 7..];
        let payload = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
        let prelude = raw[..fence_start].trim();
        let prelude = (!prelude.is_empty()).then(|| prelude.to_string());
        return (prelude, payload.trim().to_string());
    }
    (None, raw.trim().to_string())
}

fn extract_xml_tag<'a>(content: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = content.find(&open)? + open.len();
    let end = content[start..].find(&close)? + start;
    Some(content[start..end].trim())
}

/// Extract a `<use_mcp_tool>` block into an intent-only McpResult skeleton.
fn parse_mcp_block(raw: &str) -> Option<McpResult> {
    let block = extract_xml_tag(raw, "use_mcp_tool")?;
    let tool_name = extract_xml_tag(block, "tool_name")?.to_string();
    let arguments = extract_xml_tag(block, "arguments")
        .and_then(|s| serde_json::from_str::<serde_json::Map<_, _>>(s).ok())
        .unwrap_or_default();
    let reason = extract_xml_tag(block, "reason")
        .unwrap_or_default()
        .to_string();

    Some(McpResult {
        success: false,
        tool_name,
        arguments,
        reason,
        result: String::new(),
        ai_response: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let analysis = parse_analysis(
            r#"{"people_count": 2, "summary": "two people walking"}"#.to_string(),
        );
        assert_eq!(analysis.scene.people_count, 2);
        assert_eq!(analysis.scene.summary, "two people walking");
        assert!(analysis.ai_response.is_none());
        assert!(analysis.parse_error.is_none());
    }

    #[test]
    fn keeps_prelude_before_fenced_json() {
        let raw = "The scene looks calm.\n```json\n{\"people_count\": 1}\n```\n".to_string();
        let analysis = parse_analysis(raw);
        assert_eq!(analysis.ai_response.as_deref(), Some("The scene looks calm."));
        assert_eq!(analysis.scene.people_count, 1);
    }

    #[test]
    fn fenced_json_without_prelude() {
        let analysis = parse_analysis("```json\n{\"vehicle_count\": 3}\n```".to_string());
        assert!(analysis.ai_response.is_none());
        assert_eq!(analysis.scene.vehicle_count, 3);
    }

    #[test]
    fn malformed_json_defaults_with_note() {
        let analysis = parse_analysis("not json at all".to_string());
        assert!(analysis.parse_error.is_some());
        assert_eq!(analysis.scene.people_count, 0);
        assert!(analysis.scene.summary.is_empty());
    }

    #[test]
    fn missing_summary_still_succeeds() {
        let analysis = parse_analysis(r#"{"people_count": 4}"#.to_string());
        assert!(analysis.parse_error.is_none());
        assert_eq!(analysis.scene.people_count, 4);
        assert!(analysis.scene.summary.is_empty());
    }

    #[test]
    fn extracts_mcp_tool_block() {
        let raw = concat!(
            "```json\n{\"summary\": \"tracking\"}\n```\n",
            "<use_mcp_tool>\n",
            "<tool_name>pan_camera</tool_name>\n",
            "<arguments>{\"direction\": \"left\", \"degrees\": 30}</arguments>\n",
            "<reason>subject leaving frame</reason>\n",
            "</use_mcp_tool>"
        )
        .to_string();
        let analysis = parse_analysis(raw);
        let intent = analysis.mcp_intent.unwrap();
        assert_eq!(intent.tool_name, "pan_camera");
        assert_eq!(intent.arguments["direction"], "left");
        assert_eq!(intent.reason, "subject leaving frame");
        assert!(!intent.success);
    }

    #[test]
    fn no_mcp_block_means_no_intent() {
        let analysis = parse_analysis(r#"{"people_count": 0}"#.to_string());
        assert!(analysis.mcp_intent.is_none());
    }
}
