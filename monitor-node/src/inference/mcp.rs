use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use vigil_common::McpResult;

use crate::config::McpConfig;
use crate::error::{MonitorError, Result};

/// Camera-control side channel invoked after qualifying inferences.
#[async_trait]
pub trait ControlBridge: Send + Sync {
    async fn analyze(&self, image_path: &str, user_question: &str) -> McpResult;
}

/// Thin HTTP client to the external camera-control inference service.
///
/// Failures never propagate to the parent inference: they fold into an
/// `McpResult` with `success = false` and a diagnostic `result`.
pub struct McpBridge {
    http: reqwest::Client,
    base_url: String,
}

impl McpBridge {
    pub fn new(config: &McpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MonitorError::ConfigError(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ControlBridge for McpBridge {
    async fn analyze(&self, image_path: &str, user_question: &str) -> McpResult {
        let body = json!({
            "image_path": image_path,
            "user_question": user_question,
        });

        let response = self
            .http
            .post(format!("{}/analyze", self.base_url))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<McpResult>().await {
                Ok(result) => {
                    info!(
                        tool = %result.tool_name,
                        success = result.success,
                        "Control bridge responded"
                    );
                    result
                }
                Err(e) => {
                    warn!("Control bridge returned an unreadable body: {e}");
                    bridge_failure(format!("unreadable control response: {e}"))
                }
            },
            Ok(resp) => {
                let status = resp.status();
                warn!(%status, "Control bridge request rejected");
                bridge_failure(format!("control service returned HTTP {status}"))
            }
            Err(e) => {
                warn!("Control bridge unreachable: {e}");
                bridge_failure(format!("control service unreachable: {e}"))
            }
        }
    }
}

fn bridge_failure(diagnostic: String) -> McpResult {
    McpResult {
        success: false,
        result: diagnostic,
        ..Default::default()
    }
}
