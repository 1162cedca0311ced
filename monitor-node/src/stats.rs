use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use vigil_common::utils::iso_from_epoch;
use vigil_common::StatsSnapshot;

/// Shared pipeline counters. Updated by the reader, packager and scheduler;
/// snapshotted by the store checkpoint and the status endpoints.
#[derive(Debug)]
pub struct PipelineStats {
    pub frames_received: AtomicU64,
    pub frames_resized: AtomicU64,
    pub frames_invalid: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub videos_created: AtomicU64,
    pub inferences_started: AtomicU64,
    pub inferences_completed: AtomicU64,
    pub skipped_sync_mode: AtomicU64,
    start: DateTime<Utc>,
}

impl PipelineStats {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_resized: AtomicU64::new(0),
            frames_invalid: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            videos_created: AtomicU64::new(0),
            inferences_started: AtomicU64::new(0),
            inferences_completed: AtomicU64::new(0),
            skipped_sync_mode: AtomicU64::new(0),
            start,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let start_secs = self.start.timestamp_micros() as f64 / 1_000_000.0;
        StatsSnapshot {
            total_frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_resized: self.frames_resized.load(Ordering::Relaxed),
            frames_invalid: self.frames_invalid.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            total_videos_created: self.videos_created.load(Ordering::Relaxed),
            total_inferences_started: self.inferences_started.load(Ordering::Relaxed),
            total_inferences_completed: self.inferences_completed.load(Ordering::Relaxed),
            skipped_sync_mode: self.skipped_sync_mode.load(Ordering::Relaxed),
            start_time: start_secs,
            start_timestamp: iso_from_epoch(start_secs),
            total_duration: (Utc::now() - self.start).num_milliseconds() as f64 / 1000.0,
        }
    }
}
