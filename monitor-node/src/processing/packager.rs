use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_common::utils::iso_from_epoch;
use vigil_common::{
    Frame, ImageDimensions, MediaArtifact, MediaKind, SampledFrame, SamplingInfo, VideoDetails,
};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::processing::encoder;
use crate::stats::PipelineStats;
use crate::storage::session::{write_json_atomic, Session};
use crate::stream::FrameDistributor;

/// Bounded frame intake queue with drop-oldest overflow.
///
/// The live stream must never backpressure the reader, so a full queue sheds
/// its oldest entry instead of blocking the producer.
pub struct FrameQueue {
    inner: Mutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Returns true when an unread frame was dropped to make room.
    pub fn push(&self, frame: Frame) -> bool {
        let dropped = {
            let mut queue = self.inner.lock().unwrap();
            let dropped = if queue.len() == self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(frame);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Frame> {
        loop {
            if let Some(frame) = self.inner.lock().unwrap().pop_front() {
                return Some(frame);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Nearest-timestamp selection of `target` frames over an evenly spaced grid
/// across the batch's time span. Ties break toward the earlier frame.
pub fn sample_by_time(frames: &[Frame], target: usize) -> Vec<Frame> {
    if frames.len() <= target {
        if frames.len() < target {
            warn!(
                have = frames.len(),
                want = target,
                "Not enough frames for sampling, using all"
            );
        }
        return frames.to_vec();
    }

    let t0 = frames[0].relative_secs;
    let tn = frames[frames.len() - 1].relative_secs;
    let span = tn - t0;

    let mut picks = Vec::with_capacity(target);
    for i in 0..target {
        let goal = if target == 1 {
            t0
        } else {
            t0 + span * i as f64 / (target - 1) as f64
        };
        let mut best = 0usize;
        let mut best_delta = f64::MAX;
        for (idx, frame) in frames.iter().enumerate() {
            let delta = (frame.relative_secs - goal).abs();
            // Strict comparison keeps the earlier frame on ties.
            if delta < best_delta {
                best_delta = delta;
                best = idx;
            }
        }
        picks.push(frames[best].clone());
    }
    picks
}

/// Turns the live frame stream into analyzable media artifacts on a fixed
/// cadence: single resized JPEGs in image mode, sampled MP4 clips otherwise.
pub struct MediaPackager {
    config: MonitorConfig,
    session: Arc<Session>,
    distributor: Arc<FrameDistributor>,
    stats: Arc<PipelineStats>,
    ready_tx: mpsc::Sender<MediaArtifact>,
    queue: Arc<FrameQueue>,
}

impl MediaPackager {
    pub fn new(
        config: MonitorConfig,
        session: Arc<Session>,
        distributor: Arc<FrameDistributor>,
        stats: Arc<PipelineStats>,
        ready_tx: mpsc::Sender<MediaArtifact>,
    ) -> Self {
        let queue = Arc::new(FrameQueue::new(config.video.frame_queue_capacity));
        Self {
            config,
            session,
            distributor,
            stats,
            ready_tx,
            queue,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.is_image_mode() {
            info!("Packager running in image mode");
            self.run_image_mode(cancel).await;
        } else {
            info!(
                batch = self.config.frames_to_collect(),
                samples = self.config.target_frames_per_video(),
                "Packager running in video mode"
            );
            self.run_video_mode(cancel).await;
        }
    }

    /// Image mode: each cadence tick packages the newest frame in the
    /// distributor slot.
    async fn run_image_mode(&self, cancel: CancellationToken) {
        let cadence = Duration::from_secs_f64(self.config.video.target_duration_secs);
        let mut tick = tokio::time::interval(cadence);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seq = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let Some(frame) = self.distributor.latest() else {
                continue;
            };
            if frame.seq == last_seq {
                continue;
            }
            last_seq = frame.seq;
            match self.package_image(&frame).await {
                Ok(artifact) => {
                    if self.ready_tx.send(artifact).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Dropping frame {}: {e}", frame.seq),
            }
        }
    }

    /// Video mode: pump frames into the intake queue and close a batch every
    /// ceil(duration x upstream fps) frames.
    async fn run_video_mode(self: &Arc<Self>, cancel: CancellationToken) {
        let pump = {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut sub = this.distributor.subscribe();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        frame = sub.next(Duration::from_secs(1)) => {
                            if let Some(frame) = frame {
                                if this.queue.push(frame) {
                                    debug!("Frame intake queue full, dropped oldest");
                                }
                            }
                        }
                    }
                }
            })
        };

        let batch_size = self.config.frames_to_collect();
        let mut buffer: Vec<Frame> = Vec::with_capacity(batch_size);

        while let Some(frame) = self.queue.pop(&cancel).await {
            buffer.push(frame);
            if buffer.len() < batch_size {
                continue;
            }
            let batch: Vec<Frame> = buffer.drain(..).collect();
            match self.package_video(&batch).await {
                Ok(artifact) => {
                    self.stats.videos_created.fetch_add(1, Ordering::Relaxed);
                    // A full ready queue pauses batching here.
                    if self.ready_tx.send(artifact).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(
                    "Discarding batch [{}..{}]: {e}",
                    batch.first().map(|f| f.seq).unwrap_or(0),
                    batch.last().map(|f| f.seq).unwrap_or(0)
                ),
            }
        }

        pump.abort();
    }

    fn apply_resize(&self, frame: &Frame) -> Result<encoder::EncodedFrame> {
        let video = &self.config.video;
        if !video.enable_resize {
            return Ok(encoder::EncodedFrame {
                data: frame.data.to_vec(),
                width: frame.width,
                height: frame.height,
                was_resized: false,
            });
        }
        let encoded = encoder::resize_jpeg(
            &frame.data,
            video.target_width,
            video.target_height,
            video.jpeg_quality,
        )?;
        if encoded.was_resized {
            self.stats.frames_resized.fetch_add(1, Ordering::Relaxed);
        }
        Ok(encoded)
    }

    pub async fn package_image(&self, frame: &Frame) -> Result<MediaArtifact> {
        let encoded = self.apply_resize(frame)?;

        let id = self.session.next_artifact_id();
        let dir = self.session.image_artifact_dir(frame.seq, Local::now());
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = format!("{id:04}.jpg");
        let media_path = dir.join(&file_name);
        tokio::fs::write(&media_path, &encoded.data).await?;

        let created_at = Utc::now();
        let sampled = vec![SampledFrame {
            index: 0,
            original_frame_number: frame.seq,
            timestamp: frame.epoch_secs(),
            timestamp_iso: frame.timestamp.to_rfc3339(),
            relative_timestamp: frame.relative_secs,
            file_name: file_name.clone(),
        }];

        let artifact = MediaArtifact {
            id: format!("{id:04}"),
            kind: MediaKind::Image,
            dir: dir.clone(),
            media_path,
            original_frame_range: [frame.seq, frame.seq],
            sampled_frames: sampled.clone(),
            target_duration: self.config.video.target_duration_secs,
            output_fps: self.config.video.frames_per_second,
            start_relative_timestamp: frame.relative_secs,
            end_relative_timestamp: frame.relative_secs,
            created_at,
            image_dimensions: Some(ImageDimensions {
                model_width: encoded.width,
                model_height: encoded.height,
            }),
        };

        self.write_details(&artifact, &sampled, 1).await?;
        debug!(seq = frame.seq, id = %artifact.id, "Image artifact ready");
        Ok(artifact)
    }

    pub async fn package_video(&self, batch: &[Frame]) -> Result<MediaArtifact> {
        let target = self.config.target_frames_per_video();
        let sampled_src = sample_by_time(batch, target);

        let mut encoded_frames = Vec::with_capacity(sampled_src.len());
        for frame in &sampled_src {
            encoded_frames.push(self.apply_resize(frame)?);
        }
        let dims = encoded_frames.first().map(|f| ImageDimensions {
            model_width: f.width,
            model_height: f.height,
        });

        let id = Utc::now().timestamp_millis().to_string();
        let dir = self.session.video_artifact_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut sampled = Vec::with_capacity(sampled_src.len());
        for (i, (frame, encoded)) in sampled_src.iter().zip(&encoded_frames).enumerate() {
            let file_name = format!("frame_{i:02}_orig_{:04}.jpg", frame.seq);
            tokio::fs::write(dir.join(&file_name), &encoded.data).await?;
            sampled.push(SampledFrame {
                index: i,
                original_frame_number: frame.seq,
                timestamp: frame.epoch_secs(),
                timestamp_iso: frame.timestamp.to_rfc3339(),
                relative_timestamp: frame.relative_secs,
                file_name,
            });
        }

        let media_path = dir.join(format!("sampled_video_{id}.mp4"));
        let jpegs: Vec<Vec<u8>> = encoded_frames.into_iter().map(|f| f.data).collect();
        encoder::encode_mp4(
            &jpegs,
            self.config.video.frames_per_second,
            &media_path,
            self.config.video.max_video_size_mb,
        )
        .await?;

        let artifact = MediaArtifact {
            id,
            kind: MediaKind::Video,
            dir,
            media_path,
            original_frame_range: [batch[0].seq, batch[batch.len() - 1].seq],
            sampled_frames: sampled.clone(),
            target_duration: self.config.video.target_duration_secs,
            output_fps: self.config.video.frames_per_second,
            start_relative_timestamp: sampled_src[0].relative_secs,
            end_relative_timestamp: sampled_src[sampled_src.len() - 1].relative_secs,
            created_at: Utc::now(),
            image_dimensions: dims,
        };

        self.write_details(&artifact, &sampled, batch.len()).await?;
        info!(
            id = %artifact.id,
            range = ?artifact.original_frame_range,
            frames = sampled.len(),
            "Video artifact ready"
        );
        Ok(artifact)
    }

    async fn write_details(
        &self,
        artifact: &MediaArtifact,
        sampled: &[SampledFrame],
        source_frames: usize,
    ) -> Result<()> {
        let created = artifact.created_at.timestamp_micros() as f64 / 1_000_000.0;
        let details = VideoDetails {
            video_path: artifact.media_path.to_string_lossy().into_owned(),
            frame_count: sampled.len(),
            start_timestamp: sampled.first().map(|f| f.timestamp).unwrap_or(0.0),
            end_timestamp: sampled.last().map(|f| f.timestamp).unwrap_or(0.0),
            start_relative_timestamp: artifact.start_relative_timestamp,
            end_relative_timestamp: artifact.end_relative_timestamp,
            original_frame_range: artifact.original_frame_range,
            sampling_info: SamplingInfo {
                target_duration: artifact.target_duration,
                frames_per_second: artifact.output_fps,
                target_frames: self.config.target_frames_per_video(),
                source_frames,
            },
            creation_time: created,
            creation_timestamp: iso_from_epoch(created),
            sampled_frames: sampled.to_vec(),
        };
        write_json_atomic(&artifact.dir.join("video_details.json"), &details).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(seq: u64, relative_secs: f64) -> Frame {
        Frame {
            seq,
            timestamp: Utc::now(),
            relative_secs,
            width: 4,
            height: 4,
            resized: None,
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
        }
    }

    #[test]
    fn sampling_even_grid() {
        // 75 frames at 25fps over 3s, sampled down to 3.
        let frames: Vec<Frame> = (1..=75).map(|i| frame(i, (i - 1) as f64 / 25.0)).collect();
        let picks = sample_by_time(&frames, 3);
        let seqs: Vec<u64> = picks.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 38, 75]);
    }

    #[test]
    fn sampling_single_target_picks_first() {
        let frames: Vec<Frame> = (1..=75).map(|i| frame(i, (i - 1) as f64 / 25.0)).collect();
        let picks = sample_by_time(&frames, 1);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].seq, 1);
    }

    #[test]
    fn sampling_tie_breaks_earlier() {
        // Two frames share a timestamp; the grid midpoint must pick the
        // earlier one.
        let frames = vec![frame(1, 0.0), frame(2, 0.5), frame(3, 0.5), frame(4, 1.0)];
        let picks = sample_by_time(&frames, 3);
        assert_eq!(picks[1].seq, 2);
    }

    #[test]
    fn sampling_short_batch_returns_all() {
        let frames = vec![frame(1, 0.0), frame(2, 0.1)];
        assert_eq!(sample_by_time(&frames, 5).len(), 2);
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let queue = FrameQueue::new(3);
        assert!(!queue.push(frame(1, 0.0)));
        assert!(!queue.push(frame(2, 0.1)));
        assert!(!queue.push(frame(3, 0.2)));
        assert!(queue.push(frame(4, 0.3)));
        assert_eq!(queue.len(), 3);

        let cancel = CancellationToken::new();
        let seqs: Vec<u64> = futures_executor(async {
            let mut out = Vec::new();
            while !queue.is_empty() {
                out.push(queue.pop(&cancel).await.unwrap().seq);
            }
            out
        });
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn queue_pop_returns_none_on_cancel() {
        let queue = FrameQueue::new(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(futures_executor(queue.pop(&cancel)).is_none());
    }

    fn futures_executor<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
