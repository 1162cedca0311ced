use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_common::{
    ExperimentLog, InferenceRecord, MediaArtifact, MediaKind, VideoDetails,
};

use crate::error::{MonitorError, Result};
use crate::stats::PipelineStats;
use crate::storage::session::{write_json_atomic, Session};

#[derive(Default)]
struct StoreCache {
    artifacts: HashMap<String, MediaArtifact>,
    records: HashMap<String, InferenceRecord>,
}

/// Session-scoped record store.
///
/// The session directory is the only persistence; the in-memory cache is a
/// convenience rebuilt by rescanning the directory on cold start. Writes
/// within one artifact directory are serialized; across directories they are
/// independent.
pub struct ResultStore {
    session: Arc<Session>,
    stats: Arc<PipelineStats>,
    config_snapshot: Value,
    cache: Mutex<StoreCache>,
    artifact_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ResultStore {
    pub fn new(session: Arc<Session>, stats: Arc<PipelineStats>, config_snapshot: Value) -> Self {
        let store = Self {
            session,
            stats,
            config_snapshot,
            cache: Mutex::new(StoreCache::default()),
            artifact_locks: DashMap::new(),
        };
        if let Err(e) = store.rescan() {
            warn!("Session directory rescan failed: {e}");
        }
        store
    }

    /// Rebuild the cache from artifact directories already on disk.
    fn rescan(&self) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        let entries = match std::fs::read_dir(&self.session.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        let mut found = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_dir() || !name.ends_with("_details") {
                continue;
            }
            match read_artifact_dir(&path, &name) {
                Ok(Some((artifact, record))) => {
                    found += 1;
                    if let Some(record) = record {
                        cache.records.insert(artifact.id.clone(), record);
                    }
                    cache.artifacts.insert(artifact.id.clone(), artifact);
                }
                Ok(None) => {}
                Err(e) => debug!(dir = %name, "Skipping unreadable artifact dir: {e}"),
            }
        }
        if found > 0 {
            info!(artifacts = found, "Rebuilt store cache from session directory");
        }
        Ok(())
    }

    fn artifact_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.artifact_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn register_artifact(&self, artifact: &MediaArtifact) {
        let mut cache = self.cache.lock().unwrap();
        cache
            .artifacts
            .insert(artifact.id.clone(), artifact.clone());
    }

    /// Persist a finalized record: `inference_result.json` (and
    /// `mcp_result.json` when present) in the artifact directory, then the
    /// cache.
    pub async fn finalize_record(
        &self,
        artifact: &MediaArtifact,
        record: InferenceRecord,
    ) -> Result<()> {
        let lock = self.artifact_lock(&artifact.id);
        let _guard = lock.lock().await;

        write_json_atomic(&artifact.dir.join("inference_result.json"), &record).await?;
        if let Some(mcp) = &record.mcp_result {
            write_json_atomic(&artifact.dir.join("mcp_result.json"), mcp).await?;
        }

        let mut cache = self.cache.lock().unwrap();
        cache
            .artifacts
            .entry(artifact.id.clone())
            .or_insert_with(|| artifact.clone());
        cache.records.insert(artifact.id.clone(), record);
        Ok(())
    }

    /// Most recently created artifact, ties broken by id.
    pub fn latest_media(&self) -> Option<MediaArtifact> {
        let cache = self.cache.lock().unwrap();
        cache
            .artifacts
            .values()
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Latest artifact holding a completed inference record.
    pub fn latest_inference(&self) -> Option<InferenceRecord> {
        self.latest_record_matching(|_| true)
    }

    /// Latest completed record that is analytically meaningful.
    pub fn latest_inference_with_ai(&self) -> Option<InferenceRecord> {
        self.latest_record_matching(InferenceRecord::has_ai_content)
    }

    fn latest_record_matching(
        &self,
        pred: impl Fn(&InferenceRecord) -> bool,
    ) -> Option<InferenceRecord> {
        let cache = self.cache.lock().unwrap();
        cache
            .records
            .values()
            .filter(|r| r.is_complete() && pred(r))
            .max_by(|a, b| {
                a.inference_end_time
                    .partial_cmp(&b.inference_end_time)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.media_id.cmp(&b.media_id))
            })
            .cloned()
    }

    /// Completed records, newest first, bounded.
    pub fn history(&self, limit: usize) -> Vec<InferenceRecord> {
        let cache = self.cache.lock().unwrap();
        let mut records: Vec<InferenceRecord> = cache.records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.inference_end_time
                .partial_cmp(&a.inference_end_time)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.media_id.cmp(&a.media_id))
        });
        records.truncate(limit);
        records
    }

    /// Artifacts, newest first, bounded.
    pub fn media_history(&self, limit: usize) -> Vec<MediaArtifact> {
        let cache = self.cache.lock().unwrap();
        let mut artifacts: Vec<MediaArtifact> = cache.artifacts.values().cloned().collect();
        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        artifacts.truncate(limit);
        artifacts
    }

    pub fn inference_count(&self) -> usize {
        self.cache.lock().unwrap().records.len()
    }

    /// Locate a media file by name for ranged serving. Only files registered
    /// under this session's artifact directories resolve.
    pub fn find_media(&self, filename: &str) -> Option<PathBuf> {
        let cache = self.cache.lock().unwrap();
        cache
            .artifacts
            .values()
            .find(|a| a.file_name() == filename)
            .map(|a| a.media_path.clone())
    }

    /// Drop the in-memory history. Session files stay on disk.
    pub fn clear_history(&self) {
        let mut cache = self.cache.lock().unwrap();
        cache.records.clear();
        cache.artifacts.clear();
        info!("In-memory history cleared");
    }

    /// Assemble the session log, `inference_log` sorted ascending by the
    /// media's first frame so logs diff cleanly across runs.
    pub fn experiment_log(&self) -> ExperimentLog {
        let cache = self.cache.lock().unwrap();
        let mut log: Vec<InferenceRecord> = cache.records.values().cloned().collect();
        log.sort_by(|a, b| {
            a.original_frame_range[0]
                .cmp(&b.original_frame_range[0])
                .then_with(|| a.media_id.cmp(&b.media_id))
        });
        ExperimentLog {
            processor_config: self.config_snapshot.clone(),
            statistics: self.stats.snapshot(),
            inference_log: log,
        }
    }

    /// Atomically rewrite `experiment_log.json`.
    pub async fn checkpoint(&self) -> Result<()> {
        let log = self.experiment_log();
        write_json_atomic(&self.session.experiment_log_path(), &log).await
    }

    pub fn has_experiment_log(&self) -> bool {
        self.session.experiment_log_path().exists()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Periodic checkpoint loop with a final flush on shutdown.
    pub async fn run_checkpoints(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.checkpoint().await {
                        warn!("Experiment log checkpoint failed: {e}");
                    }
                }
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!("Final experiment log write failed: {e}");
        } else {
            info!("Experiment log written");
        }
    }
}

/// Reconstruct an artifact (and its record, if finalized) from one details
/// directory.
fn read_artifact_dir(
    dir: &std::path::Path,
    name: &str,
) -> Result<Option<(MediaArtifact, Option<InferenceRecord>)>> {
    let details_path = dir.join("video_details.json");
    if !details_path.exists() {
        return Ok(None);
    }
    let details: VideoDetails = serde_json::from_slice(&std::fs::read(&details_path)?)?;

    let kind = if name.starts_with("sampled_video_") {
        MediaKind::Video
    } else {
        MediaKind::Image
    };
    let id = match kind {
        MediaKind::Video => name
            .trim_start_matches("sampled_video_")
            .trim_end_matches("_details")
            .to_string(),
        MediaKind::Image => PathBuf::from(&details.video_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| MonitorError::StoreError(format!("no media file name in {name}")))?,
    };

    let created_at = chrono::DateTime::parse_from_rfc3339(&details.creation_timestamp)
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());

    let artifact = MediaArtifact {
        id: id.clone(),
        kind,
        dir: dir.to_path_buf(),
        media_path: PathBuf::from(&details.video_path),
        original_frame_range: details.original_frame_range,
        sampled_frames: details.sampled_frames.clone(),
        target_duration: details.sampling_info.target_duration,
        output_fps: details.sampling_info.frames_per_second,
        start_relative_timestamp: details.start_relative_timestamp,
        end_relative_timestamp: details.end_relative_timestamp,
        created_at,
        image_dimensions: None,
    };

    let record_path = dir.join("inference_result.json");
    let record = if record_path.exists() {
        serde_json::from_slice(&std::fs::read(&record_path)?).ok()
    } else {
        None
    };

    Ok(Some((artifact, record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_common::SceneResult;

    fn test_store() -> (tempfile::TempDir, Arc<ResultStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::create(tmp.path()).unwrap());
        let stats = Arc::new(PipelineStats::new(Utc::now()));
        let store = Arc::new(ResultStore::new(
            session,
            stats,
            serde_json::json!({"target_video_duration": 3.0}),
        ));
        (tmp, store)
    }

    fn artifact(store: &ResultStore, id: &str, first_seq: u64) -> MediaArtifact {
        let dir = store.session().video_artifact_dir(id);
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

    fn record(artifact: &MediaArtifact, end_time: f64, scene: SceneResult) -> InferenceRecord {
        InferenceRecord {
            media_id: artifact.id.clone(),
            media_path: artifact.media_path.to_string_lossy().into_owned(),
            media_kind: artifact.kind,
            original_frame_range: artifact.original_frame_range,
            inference_start_time: end_time - 1.0,
            inference_start_timestamp: String::new(),
            inference_end_time: Some(end_time),
            inference_end_timestamp: None,
            inference_duration: Some(1.0),
            raw_result: String::new(),
            parsed_result: scene,
            ai_response: None,
            user_question: None,
            image_dimensions: None,
            mcp_result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn finalize_round_trips_stable_fields() {
        let (_tmp, store) = test_store();
        let a = artifact(&store, "100", 1);
        let mut scene = SceneResult::default();
        scene.people_count = 2;
        scene.summary = "two people".into();
        let rec = record(&a, 10.0, scene);

        store.finalize_record(&a, rec.clone()).await.unwrap();

        let on_disk: InferenceRecord = serde_json::from_slice(
            &std::fs::read(a.dir.join("inference_result.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.raw_result, rec.raw_result);
        assert_eq!(on_disk.parsed_result.people_count, 2);
        assert_eq!(on_disk.inference_start_time, rec.inference_start_time);
        assert_eq!(on_disk.inference_end_time, rec.inference_end_time);
    }

    #[tokio::test]
    async fn latest_with_ai_skips_empty_newer_record() {
        let (_tmp, store) = test_store();

        let older = artifact(&store, "100", 1);
        let mut scene = SceneResult::default();
        scene.people_count = 3;
        store
            .finalize_record(&older, record(&older, 10.0, scene))
            .await
            .unwrap();

        let newer = artifact(&store, "200", 76);
        store
            .finalize_record(&newer, record(&newer, 20.0, SceneResult::default()))
            .await
            .unwrap();

        assert_eq!(store.latest_inference().unwrap().media_id, "200");
        assert_eq!(store.latest_inference_with_ai().unwrap().media_id, "100");
    }

    #[tokio::test]
    async fn mcp_alone_qualifies_as_ai_content() {
        let (_tmp, store) = test_store();
        let a = artifact(&store, "300", 1);
        let mut rec = record(&a, 5.0, SceneResult::default());
        rec.mcp_result = Some(vigil_common::McpResult::default());
        store.finalize_record(&a, rec).await.unwrap();

        assert_eq!(store.latest_inference_with_ai().unwrap().media_id, "300");
        assert!(a.dir.join("mcp_result.json").exists());
    }

    #[tokio::test]
    async fn experiment_log_sorted_by_first_frame() {
        let (_tmp, store) = test_store();
        for (id, first) in [("b", 76u64), ("a", 1u64), ("c", 151u64)] {
            let a = artifact(&store, id, first);
            store
                .finalize_record(&a, record(&a, first as f64, SceneResult::default()))
                .await
                .unwrap();
        }
        let log = store.experiment_log();
        let firsts: Vec<u64> = log
            .inference_log
            .iter()
            .map(|r| r.original_frame_range[0])
            .collect();
        assert_eq!(firsts, vec![1, 76, 151]);
    }

    #[tokio::test]
    async fn checkpoint_then_rescan_recovers_history() {
        let (_tmp, store) = test_store();
        let a = artifact(&store, "400", 1);

        // Details file is what the packager writes; reconstruct enough of it.
        let details = VideoDetails {
            video_path: a.media_path.to_string_lossy().into_owned(),
            frame_count: 3,
            start_timestamp: 0.0,
            end_timestamp: 3.0,
            start_relative_timestamp: 0.0,
            end_relative_timestamp: 2.96,
            original_frame_range: a.original_frame_range,
            sampling_info: vigil_common::SamplingInfo {
                target_duration: 3.0,
                frames_per_second: 1,
                target_frames: 3,
                source_frames: 75,
            },
            creation_time: 0.0,
            creation_timestamp: Utc::now().to_rfc3339(),
            sampled_frames: vec![],
        };
        write_json_atomic(&a.dir.join("video_details.json"), &details)
            .await
            .unwrap();
        store
            .finalize_record(&a, record(&a, 9.0, SceneResult::default()))
            .await
            .unwrap();
        store.checkpoint().await.unwrap();

        // A fresh store over the same directory sees the artifact again.
        let stats = Arc::new(PipelineStats::new(Utc::now()));
        let reopened = ResultStore::new(
            Arc::clone(store.session()),
            stats,
            serde_json::Value::Null,
        );
        assert_eq!(reopened.inference_count(), 1);
        assert_eq!(reopened.latest_inference().unwrap().media_id, "400");
    }

    #[tokio::test]
    async fn latest_media_prefers_newest_then_id() {
        let (_tmp, store) = test_store();
        let mut a = artifact(&store, "100", 1);
        let mut b = artifact(&store, "200", 76);
        let now = Utc::now();
        a.created_at = now;
        b.created_at = now;
        store.register_artifact(&a);
        store.register_artifact(&b);
        // Same creation instant: the higher id wins the tie.
        assert_eq!(store.latest_media().unwrap().id, "200");

        let mut c = artifact(&store, "050", 151);
        c.created_at = now + chrono::Duration::seconds(1);
        store.register_artifact(&c);
        assert_eq!(store.latest_media().unwrap().id, "050");
    }

    #[tokio::test]
    async fn clear_history_resets_memory_not_disk() {
        let (_tmp, store) = test_store();
        let a = artifact(&store, "500", 1);
        store
            .finalize_record(&a, record(&a, 3.0, SceneResult::default()))
            .await
            .unwrap();
        assert_eq!(store.inference_count(), 1);

        store.clear_history();
        assert_eq!(store.inference_count(), 0);
        assert!(a.dir.join("inference_result.json").exists());
    }
}
