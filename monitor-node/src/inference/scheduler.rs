use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_common::utils::iso_from_epoch;
use vigil_common::{InferenceRecord, MediaArtifact, UserQuestion};

use crate::config::{InferenceMode, McpMode, VlmConfig};
use crate::error::MonitorError;
use crate::events::{EventSender, MonitorEvent};
use crate::inference::mcp::ControlBridge;
use crate::inference::question::QuestionRegistry;
use crate::inference::vlm::Analyzer;
use crate::stats::PipelineStats;
use crate::storage::ResultStore;

#[derive(Default)]
struct SchedState {
    active: usize,
    /// Newest artifact observed while the gate was closed; replaced silently
    /// by newer arrivals so only the freshest media is re-entered.
    pending_latest: Option<MediaArtifact>,
    current: Option<String>,
}

struct Shared {
    mode: InferenceMode,
    max_concurrent: usize,
    call_timeout: Duration,
    sentry_prompt: String,
    /// Runtime-toggleable; `Always` is sentry mode.
    mcp_mode: RwLock<McpMode>,
    /// What the sentry toggle falls back to when switched off.
    mcp_base_mode: Mutex<McpMode>,
    state: Mutex<SchedState>,
    vlm: Arc<dyn Analyzer>,
    mcp: Arc<dyn ControlBridge>,
    questions: Arc<QuestionRegistry>,
    store: Arc<ResultStore>,
    stats: Arc<PipelineStats>,
    events: EventSender,
}

/// Enforces the inference discipline: sync-or-async dispatch, the single
/// pending-latest slot, user-question preemption and MCP control follow-up.
///
/// All decision state is guarded by one mutex that is never held across I/O;
/// dispatched calls run on their own tasks.
pub struct InferenceScheduler {
    shared: Arc<Shared>,
}

impl InferenceScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vlm_config: &VlmConfig,
        mcp_mode: McpMode,
        sentry_prompt: String,
        vlm: Arc<dyn Analyzer>,
        mcp: Arc<dyn ControlBridge>,
        questions: Arc<QuestionRegistry>,
        store: Arc<ResultStore>,
        stats: Arc<PipelineStats>,
        events: EventSender,
    ) -> Self {
        let base = if mcp_mode == McpMode::Always {
            McpMode::OnQuestion
        } else {
            mcp_mode
        };
        Self {
            shared: Arc::new(Shared {
                mode: vlm_config.mode,
                max_concurrent: vlm_config.max_concurrent,
                call_timeout: Duration::from_secs(vlm_config.request_timeout_secs),
                sentry_prompt,
                mcp_mode: RwLock::new(mcp_mode),
                mcp_base_mode: Mutex::new(base),
                state: Mutex::new(SchedState::default()),
                vlm,
                mcp,
                questions,
                store,
                stats,
                events,
            }),
        }
    }

    /// Consume artifacts from the packager's ready queue until cancelled.
    pub async fn run(
        &self,
        mut ready_rx: mpsc::Receiver<MediaArtifact>,
        cancel: CancellationToken,
    ) {
        loop {
            let artifact = tokio::select! {
                _ = cancel.cancelled() => break,
                artifact = ready_rx.recv() => match artifact {
                    Some(a) => a,
                    None => break,
                },
            };
            self.shared.store.register_artifact(&artifact);
            self.submit(artifact);
        }
        info!("Inference scheduler stopped");
    }

    pub fn submit(&self, artifact: MediaArtifact) {
        let mut state = self.shared.state.lock().unwrap();
        Shared::decide_locked(&self.shared, &mut state, artifact);
    }

    pub fn is_sentry(&self) -> bool {
        *self.shared.mcp_mode.read().unwrap() == McpMode::Always
    }

    /// Flip sentry mode; toggling twice restores the initial state.
    pub fn toggle_sentry(&self) -> bool {
        let mut mode = self.shared.mcp_mode.write().unwrap();
        let mut base = self.shared.mcp_base_mode.lock().unwrap();
        if *mode == McpMode::Always {
            *mode = *base;
            info!(mode = ?*mode, "Sentry mode off");
            false
        } else {
            *base = *mode;
            *mode = McpMode::Always;
            info!("Sentry mode on");
            true
        }
    }

    /// (active, pending present, skipped counter) snapshot for status
    /// reporting.
    pub fn status(&self) -> (usize, bool, u64) {
        let state = self.shared.state.lock().unwrap();
        (
            state.active,
            state.pending_latest.is_some(),
            self.shared.stats.skipped_sync_mode.load(Ordering::Relaxed),
        )
    }
}

impl Shared {
    /// The dispatch algorithm of the scheduling discipline. Runs under the
    /// state mutex; also invoked from the completion path so the
    /// freshest-between-completion-and-reentry race cannot occur.
    fn decide_locked(shared: &Arc<Shared>, state: &mut SchedState, artifact: MediaArtifact) {
        // An active question preempts the gate, but never an inference
        // already in flight.
        if state.active == 0 {
            if let Some(question) = shared.questions.take() {
                Shared::dispatch_locked(shared, state, artifact, Some(question));
                return;
            }
        }

        match shared.mode {
            InferenceMode::Async if state.active < shared.max_concurrent => {
                Shared::dispatch_locked(shared, state, artifact, None);
            }
            InferenceMode::Sync if state.active == 0 => {
                match state.pending_latest.take() {
                    // The pending artifact is the freshest observed at the
                    // moment the previous inference finished; run it and
                    // stage the newcomer.
                    Some(pending) => {
                        state.pending_latest = Some(artifact);
                        Shared::dispatch_locked(shared, state, pending, None);
                    }
                    None => Shared::dispatch_locked(shared, state, artifact, None),
                }
            }
            _ => {
                if let Some(discarded) = state.pending_latest.replace(artifact) {
                    shared
                        .stats
                        .skipped_sync_mode
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(id = %discarded.id, "Replaced pending artifact");
                }
            }
        }
    }

    fn dispatch_locked(
        shared: &Arc<Shared>,
        state: &mut SchedState,
        artifact: MediaArtifact,
        question: Option<UserQuestion>,
    ) {
        state.active += 1;
        state.current = Some(artifact.id.clone());
        shared
            .stats
            .inferences_started
            .fetch_add(1, Ordering::Relaxed);
        info!(
            id = %artifact.id,
            active = state.active,
            question = question.is_some(),
            "Dispatching inference"
        );

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let _guard = CompletionGuard {
                shared: Arc::clone(&shared),
            };
            shared.run_inference(artifact, question).await;
        });
    }

    /// Decrement and re-enter the freshest pending artifact, all under the
    /// same mutex that guards enqueue.
    fn complete(shared: &Arc<Shared>) {
        let mut state = shared.state.lock().unwrap();
        state.active = state.active.saturating_sub(1);
        if let Some(id) = state.current.take() {
            debug!(%id, "Inference slot cleared");
        }
        shared
            .stats
            .inferences_completed
            .fetch_add(1, Ordering::Relaxed);
        if let Some(pending) = state.pending_latest.take() {
            Shared::decide_locked(shared, &mut state, pending);
        }
    }

    async fn run_inference(&self, artifact: MediaArtifact, question: Option<UserQuestion>) {
        let start = Utc::now();
        let start_secs = start.timestamp_micros() as f64 / 1_000_000.0;
        let question_text = question.map(|q| q.text);

        let mut record = InferenceRecord {
            media_id: artifact.id.clone(),
            media_path: artifact.media_path.to_string_lossy().into_owned(),
            media_kind: artifact.kind,
            original_frame_range: artifact.original_frame_range,
            inference_start_time: start_secs,
            inference_start_timestamp: iso_from_epoch(start_secs),
            inference_end_time: None,
            inference_end_timestamp: None,
            inference_duration: None,
            raw_result: String::new(),
            parsed_result: Default::default(),
            ai_response: None,
            user_question: question_text.clone(),
            image_dimensions: artifact.image_dimensions,
            mcp_result: None,
            error: None,
        };

        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.vlm.analyze(&artifact, question_text.as_deref()),
        )
        .await;

        let mut succeeded = false;
        match outcome {
            Ok(Ok(analysis)) => {
                succeeded = true;
                record.raw_result = analysis.raw;
                record.parsed_result = analysis.scene;
                record.ai_response = analysis.ai_response;
                record.mcp_result = analysis.mcp_intent;
                if analysis.parse_error.is_some() {
                    record.error =
                        Some(MonitorError::InferenceParse(String::new()).kind().to_string());
                }
            }
            Ok(Err(e)) => {
                warn!(id = %artifact.id, "Inference failed: {e}");
                record.error = Some(e.kind().to_string());
                let _ = self.events.send(MonitorEvent::Error(format!(
                    "inference {} failed: {e}",
                    artifact.id
                )));
            }
            Err(_) => {
                warn!(
                    id = %artifact.id,
                    timeout = ?self.call_timeout,
                    "Inference timed out"
                );
                record.error = Some(
                    MonitorError::InferenceTimeout(self.call_timeout.as_secs())
                        .kind()
                        .to_string(),
                );
            }
        }

        if succeeded {
            if let Some(result) = self
                .maybe_run_control(&artifact, question_text.as_deref(), record.mcp_result.take())
                .await
            {
                record.mcp_result = Some(result);
            }
        }

        let end = Utc::now();
        let end_secs = end.timestamp_micros() as f64 / 1_000_000.0;
        record.inference_end_time = Some(end_secs);
        record.inference_end_timestamp = Some(iso_from_epoch(end_secs));
        record.inference_duration = Some(end_secs - start_secs);

        if let Err(e) = self.store.finalize_record(&artifact, record.clone()).await {
            error!(id = %artifact.id, "Failed to persist inference record: {e}");
        }
        let _ = self.events.send(MonitorEvent::InferenceResult(record));
    }

    /// Invoke the control bridge per the configured trigger, folding the
    /// outcome (or the unexecuted intent) into the record.
    async fn maybe_run_control(
        &self,
        artifact: &MediaArtifact,
        question: Option<&str>,
        intent: Option<vigil_common::McpResult>,
    ) -> Option<vigil_common::McpResult> {
        let mode = *self.mcp_mode.read().unwrap();
        let triggered = match mode {
            McpMode::Off => false,
            McpMode::OnQuestion => question.is_some() || intent.is_some(),
            McpMode::Always => true,
        };
        if !triggered {
            return intent;
        }

        let instruction = question.unwrap_or(&self.sentry_prompt);
        let media_path = artifact.media_path.to_string_lossy();
        Some(self.mcp.analyze(&media_path, instruction).await)
    }
}

/// Runs the completion bookkeeping even if the worker panics, so the
/// active counter can never leak.
struct CompletionGuard {
    shared: Arc<Shared>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        Shared::complete(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;
    use vigil_common::{McpResult, MediaKind};

    use crate::config::MonitorConfig;
    use crate::inference::vlm::{parse_analysis, Analysis};
    use crate::storage::Session;

    /// Analyzer that blocks until the test hands it a permit, recording the
    /// (artifact id, question) of every call.
    struct GatedAnalyzer {
        gate: Semaphore,
        calls: StdMutex<Vec<(String, Option<String>)>>,
        reply: String,
    }

    impl GatedAnalyzer {
        fn new(reply: &str) -> Self {
            Self {
                gate: Semaphore::new(0),
                calls: StdMutex::new(Vec::new()),
                reply: reply.to_string(),
            }
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }

        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Analyzer for GatedAnalyzer {
        async fn analyze(
            &self,
            artifact: &MediaArtifact,
            question: Option<&str>,
        ) -> crate::error::Result<Analysis> {
            self.calls
                .lock()
                .unwrap()
                .push((artifact.id.clone(), question.map(str::to_string)));
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            Ok(parse_analysis(self.reply.clone()))
        }
    }

    struct NoopBridge;

    #[async_trait]
    impl ControlBridge for NoopBridge {
        async fn analyze(&self, _image_path: &str, _user_question: &str) -> McpResult {
            McpResult {
                success: true,
                tool_name: "noop".into(),
                ..Default::default()
            }
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        scheduler: InferenceScheduler,
        analyzer: Arc<GatedAnalyzer>,
        store: Arc<ResultStore>,
        events: tokio::sync::broadcast::Receiver<MonitorEvent>,
        session: Arc<Session>,
    }

    fn fixture(mode: InferenceMode, mcp_mode: McpMode) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::create(tmp.path()).unwrap());
        let stats = Arc::new(PipelineStats::new(Utc::now()));
        let store = Arc::new(ResultStore::new(
            Arc::clone(&session),
            Arc::clone(&stats),
            serde_json::Value::Null,
        ));
        let analyzer = Arc::new(GatedAnalyzer::new(r#"{"people_count": 1}"#));
        let questions = Arc::new(QuestionRegistry::new(Duration::from_secs(300)));
        let events = crate::events::channel();
        let events_rx = events.subscribe();

        let mut vlm_config = MonitorConfig::default().vlm;
        vlm_config.mode = mode;
        vlm_config.request_timeout_secs = 5;

        let scheduler = InferenceScheduler::new(
            &vlm_config,
            mcp_mode,
            "look around".to_string(),
            Arc::clone(&analyzer) as Arc<dyn Analyzer>,
            Arc::new(NoopBridge) as Arc<dyn ControlBridge>,
            questions,
            Arc::clone(&store),
            stats,
            events,
        );

        Fixture {
            _tmp: tmp,
            scheduler,
            analyzer,
            store,
            events: events_rx,
            session,
        }
    }

    fn artifact(session: &Session, id: &str, first_seq: u64) -> MediaArtifact {
        let dir = session.video_artifact_dir(id);
        std::fs::create_dir_all(&dir).unwrap();
        MediaArtifact {
            id: id.to_string(),
            kind: MediaKind::Video,
            media_path: dir.join(format!("sampled_video_{id}.mp4")),
            dir,
            original_frame_range: [first_seq, first_seq + 74],
            sampled_frames: vec![],
            target_duration: 3.0,
            output_fps: 1,
            start_relative_timestamp: 0.0,
            end_relative_timestamp: 2.96,
            created_at: Utc::now(),
            image_dimensions: None,
        }
    }

    async fn next_record(
        events: &mut tokio::sync::broadcast::Receiver<MonitorEvent>,
    ) -> InferenceRecord {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("no event")
                .expect("channel closed")
            {
                MonitorEvent::InferenceResult(record) => return record,
                _ => continue,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_mode_runs_latest_pending_only() {
        let mut fx = fixture(InferenceMode::Sync, McpMode::Off);

        fx.scheduler.submit(artifact(&fx.session, "a0", 1));
        // Wait until the worker is actually inside the analyzer.
        while fx.analyzer.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        fx.scheduler.submit(artifact(&fx.session, "a1", 76));
        fx.scheduler.submit(artifact(&fx.session, "a2", 151));
        fx.scheduler.submit(artifact(&fx.session, "a3", 226));

        fx.analyzer.release(2);
        let first = next_record(&mut fx.events).await;
        let second = next_record(&mut fx.events).await;
        assert_eq!(first.media_id, "a0");
        assert_eq!(second.media_id, "a3");

        let calls: Vec<String> = fx.analyzer.calls().into_iter().map(|c| c.0).collect();
        assert_eq!(calls, vec!["a0", "a3"]);

        // The completion bookkeeping runs just after the result event.
        while fx.scheduler.status().0 != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (_, pending, skipped) = fx.scheduler.status();
        assert!(!pending);
        assert_eq!(skipped, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn question_binds_to_exactly_one_inference() {
        let mut fx = fixture(InferenceMode::Sync, McpMode::Off);
        fx.scheduler
            .shared
            .questions
            .set("how many people".to_string());

        fx.scheduler.submit(artifact(&fx.session, "q1", 1));
        fx.analyzer.release(1);
        let first = next_record(&mut fx.events).await;
        assert_eq!(first.user_question.as_deref(), Some("how many people"));
        assert!(!fx.scheduler.shared.questions.has_question());

        fx.scheduler.submit(artifact(&fx.session, "q2", 76));
        fx.analyzer.release(1);
        let second = next_record(&mut fx.events).await;
        assert!(second.user_question.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn question_does_not_preempt_inflight_inference() {
        let mut fx = fixture(InferenceMode::Sync, McpMode::Off);

        fx.scheduler.submit(artifact(&fx.session, "b0", 1));
        while fx.analyzer.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        fx.scheduler
            .shared
            .questions
            .set("anything moving?".to_string());
        fx.scheduler.submit(artifact(&fx.session, "b1", 76));

        fx.analyzer.release(2);
        let first = next_record(&mut fx.events).await;
        let second = next_record(&mut fx.events).await;
        assert!(first.user_question.is_none());
        assert_eq!(second.media_id, "b1");
        assert_eq!(second.user_question.as_deref(), Some("anything moving?"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_mode_honors_concurrency_cap() {
        let mut fx = fixture(InferenceMode::Async, McpMode::Off);
        // Default max_concurrent is 1, so the second artifact must wait.
        fx.scheduler.submit(artifact(&fx.session, "c0", 1));
        while fx.analyzer.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fx.scheduler.submit(artifact(&fx.session, "c1", 76));

        let (active, pending, _) = fx.scheduler.status();
        assert_eq!(active, 1);
        assert!(pending);

        fx.analyzer.release(2);
        next_record(&mut fx.events).await;
        let second = next_record(&mut fx.events).await;
        assert_eq!(second.media_id, "c1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_persisted_on_completion() {
        let mut fx = fixture(InferenceMode::Sync, McpMode::Off);
        let a = artifact(&fx.session, "d0", 1);
        let dir = a.dir.clone();
        fx.scheduler.submit(a);
        fx.analyzer.release(1);
        let record = next_record(&mut fx.events).await;

        assert_eq!(record.parsed_result.people_count, 1);
        assert!(record.inference_end_time.unwrap() >= record.inference_start_time);
        assert!(dir.join("inference_result.json").exists());
        assert_eq!(fx.store.latest_inference().unwrap().media_id, "d0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sentry_mode_attaches_control_result() {
        let mut fx = fixture(InferenceMode::Sync, McpMode::Always);
        fx.scheduler.submit(artifact(&fx.session, "e0", 1));
        fx.analyzer.release(1);
        let record = next_record(&mut fx.events).await;
        let mcp = record.mcp_result.expect("sentry mode must attach MCP");
        assert!(mcp.success);
        assert_eq!(mcp.tool_name, "noop");
    }

    #[test]
    fn sentry_toggle_round_trips() {
        let fx = fixture(InferenceMode::Sync, McpMode::OnQuestion);
        assert!(!fx.scheduler.is_sentry());
        assert!(fx.scheduler.toggle_sentry());
        assert!(fx.scheduler.is_sentry());
        assert!(!fx.scheduler.toggle_sentry());
        assert!(!fx.scheduler.is_sentry());
    }
}
