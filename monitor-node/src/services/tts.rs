use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_common::InferenceRecord;

use crate::config::TtsConfig;
use crate::error::{MonitorError, Result};
use crate::storage::ResultStore;

/// Speaks freshly finalized scene summaries through an external TTS service.
///
/// Polls the store on a fixed cadence, forwards each new non-empty summary,
/// and de-duplicates by (artifact directory, inference end timestamp) so a
/// worker restart never replays old records.
pub struct TtsWorker {
    http: reqwest::Client,
    config: TtsConfig,
    store: Arc<ResultStore>,
    processed: HashSet<String>,
}

fn record_key(record: &InferenceRecord) -> String {
    let dir = Path::new(&record.media_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "{dir}_{}",
        record.inference_end_timestamp.as_deref().unwrap_or("")
    )
}

impl TtsWorker {
    pub fn new(config: TtsConfig, store: Arc<ResultStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MonitorError::ConfigError(e.to_string()))?;
        Ok(Self {
            http,
            config,
            store,
            processed: HashSet::new(),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.config.host, self.config.port, self.config.endpoint
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        // Practical floor of 0.1s keeps a misconfigured cadence from spinning.
        let interval = Duration::from_secs_f64(self.config.check_interval_secs.max(0.1));
        info!(url = %self.endpoint(), ?interval, "TTS worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.process_new_records().await;
        }
        info!("TTS worker stopped");
    }

    async fn process_new_records(&mut self) {
        let records = self.store.history(usize::MAX);
        for record in records {
            if !record.is_complete() {
                continue;
            }
            let key = record_key(&record);
            if self.processed.contains(&key) {
                continue;
            }

            let summary = record.parsed_result.summary.trim();
            if summary.is_empty() {
                // Mark so empty summaries are not rechecked every tick.
                self.processed.insert(key);
                continue;
            }

            if self.speak(summary).await {
                self.processed.insert(key);
            }
        }
    }

    /// Post `{text}`; 2xx is success. Transient failures retry with a 1s gap.
    async fn speak(&self, text: &str) -> bool {
        let url = self.endpoint();
        for attempt in 1..=self.config.max_retries {
            match self
                .http
                .post(&url)
                .json(&json!({ "text": text }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    debug!(attempt, "TTS accepted: {text}");
                    return true;
                }
                Ok(resp) => warn!(
                    attempt,
                    status = %resp.status(),
                    "TTS request rejected"
                ),
                Err(e) => warn!(attempt, "TTS request failed: {e}"),
            }
            if attempt < self.config.max_retries {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        warn!("TTS giving up on summary: {text}");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::{MediaKind, SceneResult};

    fn record(dir: &str, end_iso: &str) -> InferenceRecord {
        InferenceRecord {
            media_id: "m".into(),
            media_path: format!("{dir}/clip.mp4"),
            media_kind: MediaKind::Video,
            original_frame_range: [1, 75],
            inference_start_time: 0.0,
            inference_start_timestamp: String::new(),
            inference_end_time: Some(1.0),
            inference_end_timestamp: Some(end_iso.to_string()),
            inference_duration: Some(1.0),
            raw_result: String::new(),
            parsed_result: SceneResult::default(),
            ai_response: None,
            user_question: None,
            image_dimensions: None,
            mcp_result: None,
            error: None,
        }
    }

    #[test]
    fn key_combines_dir_and_end_timestamp() {
        let a = record("/s/one_details", "2025-01-01T00:00:00Z");
        let b = record("/s/one_details", "2025-01-01T00:00:05Z");
        let c = record("/s/two_details", "2025-01-01T00:00:00Z");
        assert_ne!(record_key(&a), record_key(&b));
        assert_ne!(record_key(&a), record_key(&c));
        // Re-finalizing the same record keys identically.
        assert_eq!(record_key(&a), record_key(&record("/s/one_details", "2025-01-01T00:00:00Z")));
    }
}
