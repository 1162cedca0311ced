use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::info;

use vigil_common::utils::{frame_dir_stamp, session_name};

use crate::error::{MonitorError, Result};

/// One process-run container: the timestamped on-disk directory plus the
/// session-scoped artifact counter.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub dir: PathBuf,
    pub started_at: DateTime<Utc>,
    artifact_counter: AtomicU64,
}

impl Session {
    pub fn create(output_dir: &Path) -> Result<Self> {
        let started_local = Local::now();
        let id = session_name(started_local);
        let dir = output_dir.join(&id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| MonitorError::StoreError(format!("create {}: {e}", dir.display())))?;
        info!(session = %id, dir = %dir.display(), "Session directory created");
        Ok(Self {
            id,
            dir,
            started_at: started_local.with_timezone(&Utc),
            artifact_counter: AtomicU64::new(0),
        })
    }

    /// Next value of the session-scoped artifact counter (1-based).
    pub fn next_artifact_id(&self) -> u64 {
        self.artifact_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Details directory for an image-mode artifact:
    /// `frame_<seq>_<hhmmss>_<ms>_details`.
    pub fn image_artifact_dir(&self, frame_seq: u64, at: DateTime<Local>) -> PathBuf {
        let (hhmmss, ms) = frame_dir_stamp(at);
        self.dir
            .join(format!("frame_{frame_seq}_{hhmmss}_{ms:03}_details"))
    }

    /// Details directory for a video-mode artifact:
    /// `sampled_video_<id>_details`.
    pub fn video_artifact_dir(&self, id: &str) -> PathBuf {
        self.dir.join(format!("sampled_video_{id}_details"))
    }

    pub fn experiment_log_path(&self) -> PathBuf {
        self.dir.join("experiment_log.json")
    }
}

/// Write JSON via a temp file in the same directory plus rename, so readers
/// never observe a partial file.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| MonitorError::StoreError(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| MonitorError::StoreError(format!("rename to {}: {e}", path.display())))?;
    Ok(())
}
