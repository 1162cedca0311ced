use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_common::{Frame, ReaderStatus};

use crate::config::StreamConfig;
use crate::error::{MonitorError, Result};
use crate::stats::PipelineStats;
use crate::stream::{FrameDistributor, FrameSource};

const HEADER_MAGIC: &[u8; 4] = b"FRAM";
const PROTOCOL_VERSION: u8 = 1;
const SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Reconnect backoff: 500ms doubling, capped at 10s.
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(1 << attempt.min(5));
    Duration::from_millis(millis.min(10_000))
}

/// Sole owner of the upstream TCP connection and the session frame counter.
///
/// Decodes the length-prefixed JPEG stream into timestamped frames and offers
/// each one to the distributor.
pub struct TcpFrameReader {
    config: StreamConfig,
    distributor: Arc<FrameDistributor>,
    stats: Arc<PipelineStats>,
    session_start: DateTime<Utc>,
    seq: AtomicU64,
}

impl TcpFrameReader {
    pub fn new(
        config: StreamConfig,
        distributor: Arc<FrameDistributor>,
        stats: Arc<PipelineStats>,
        session_start: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            distributor,
            stats,
            session_start,
            seq: AtomicU64::new(0),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(MonitorError::ConnectError(format!("{addr}: {e}"))),
            Err(_) => Err(MonitorError::ConnectError(format!(
                "{addr}: connect timed out after {}s",
                self.config.connect_timeout_secs
            ))),
        }
    }

    /// Read frames off one live connection until it drops or we are
    /// cancelled. Returns Ok on cancellation, Err on a broken stream.
    async fn read_stream(&self, stream: TcpStream, cancel: &CancellationToken) -> Result<()> {
        let mut framed = FrameStream::new(stream, self.config.max_frame_bytes);
        framed.read_header().await?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            "Frame stream header accepted"
        );

        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                record = framed.next_record(&self.stats) => record?,
            };

            let (width, height) = match probe_jpeg_dimensions(&data) {
                Ok(dims) => dims,
                Err(e) => {
                    self.stats.frames_invalid.fetch_add(1, Ordering::Relaxed);
                    debug!("Skipping undecodable frame: {e}");
                    continue;
                }
            };

            let now = Utc::now();
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let frame = Frame {
                seq,
                timestamp: now,
                relative_secs: (now - self.session_start).num_microseconds().unwrap_or(0) as f64
                    / 1_000_000.0,
                width,
                height,
                resized: None,
                data,
            };

            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
            if seq % 50 == 0 {
                debug!(seq, "Frames received");
            }
            self.distributor.publish(frame);
        }
    }
}

#[async_trait]
impl FrameSource for TcpFrameReader {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            self.distributor.set_status(if attempt == 0 {
                ReaderStatus::Connecting
            } else {
                ReaderStatus::Reconnecting
            });

            match self.connect().await {
                Ok(stream) => {
                    attempt = 0;
                    self.distributor.set_status(ReaderStatus::Up);
                    info!("Frame reader up");
                    match self.read_stream(stream, &cancel).await {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!("Frame stream dropped: {e}"),
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        self.distributor.set_status(ReaderStatus::Down);
                        error!(
                            retries = self.config.max_retries,
                            "Frame reader down, retry budget exhausted: {e}"
                        );
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt - 1);
                    warn!(
                        attempt,
                        max = self.config.max_retries,
                        "Connect failed ({e}), retrying in {delay:?}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Buffered decoder for the upstream framing: an 8-byte header, then
/// records of a big-endian u32 length followed by that many JPEG bytes.
///
/// Any parse deviation triggers a resync: bytes are discarded until the next
/// plausible length prefix whose body starts with the JPEG SOI marker.
pub struct FrameStream<R> {
    reader: R,
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame_bytes,
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let n = self.reader.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(MonitorError::ConnectError(
                "upstream closed the connection".to_string(),
            ));
        }
        Ok(())
    }

    async fn ensure(&mut self, len: usize) -> Result<()> {
        while self.buf.len() < len {
            self.fill().await?;
        }
        Ok(())
    }

    /// Validate the stream prelude: magic, version, reserved bytes.
    pub async fn read_header(&mut self) -> Result<()> {
        self.ensure(8).await?;
        if &self.buf[..4] != HEADER_MAGIC {
            return Err(MonitorError::ProtocolError(format!(
                "bad stream magic {:02x?}",
                &self.buf[..4]
            )));
        }
        if self.buf[4] != PROTOCOL_VERSION {
            return Err(MonitorError::ProtocolError(format!(
                "unsupported protocol version {}",
                self.buf[4]
            )));
        }
        self.buf.advance(8);
        Ok(())
    }

    fn plausible_length(&self, len: usize) -> bool {
        len > 0 && len <= self.max_frame_bytes
    }

    /// Next JPEG record, resyncing past any corruption.
    pub async fn next_record(&mut self, stats: &PipelineStats) -> Result<Bytes> {
        loop {
            self.ensure(4).await?;
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;

            if !self.plausible_length(len) {
                stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(len, "Implausible record length, resyncing");
                self.resync().await?;
                continue;
            }

            self.ensure(4 + len).await?;
            if self.buf[4..7] != SOI {
                stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Record body is not a JPEG, resyncing");
                self.resync().await?;
                continue;
            }

            self.buf.advance(4);
            return Ok(self.buf.split_to(len).freeze());
        }
    }

    /// Discard bytes until a plausible length prefix immediately followed by
    /// a JPEG SOI marker.
    async fn resync(&mut self) -> Result<()> {
        self.buf.advance(1.min(self.buf.len()));
        loop {
            // A candidate needs 4 length bytes plus the 3-byte SOI.
            if self.buf.len() < 7 {
                self.fill().await?;
                continue;
            }

            let mut candidate = None;
            for pos in 4..self.buf.len().saturating_sub(2) {
                if self.buf[pos..pos + 3] == SOI {
                    let len = u32::from_be_bytes([
                        self.buf[pos - 4],
                        self.buf[pos - 3],
                        self.buf[pos - 2],
                        self.buf[pos - 1],
                    ]) as usize;
                    if self.plausible_length(len) {
                        candidate = Some(pos - 4);
                        break;
                    }
                }
            }

            match candidate {
                Some(start) => {
                    debug!(discarded = start, "Resynced to next record");
                    self.buf.advance(start);
                    return Ok(());
                }
                None => {
                    // Keep a tail that could be the start of a record.
                    let keep = 6.min(self.buf.len());
                    let drop = self.buf.len() - keep;
                    self.buf.advance(drop);
                    self.fill().await?;
                }
            }
        }
    }
}

fn probe_jpeg_dimensions(data: &Bytes) -> Result<(u32, u32)> {
    let dims = image::ImageReader::new(Cursor::new(data.as_ref()))
        .with_guessed_format()
        .map_err(|e| MonitorError::EncodeError(e.to_string()))?
        .into_dimensions()?;
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Tiny but decodable JPEG (1x1), enough for the SOI checks and the
    /// dimension probe.
    fn tiny_jpeg() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(1, 1, image::Rgb([10, 20, 30]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&image::DynamicImage::ImageRgb8(img))
            .unwrap();
        out
    }

    fn record(jpeg: &[u8]) -> Vec<u8> {
        let mut out = (jpeg.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(jpeg);
        out
    }

    fn header() -> Vec<u8> {
        let mut out = HEADER_MAGIC.to_vec();
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&[0, 0, 0]);
        out
    }

    #[tokio::test]
    async fn decodes_clean_stream() {
        let jpeg = tiny_jpeg();
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut wire = header();
        wire.extend(record(&jpeg));
        wire.extend(record(&jpeg));
        server.write_all(&wire).await.unwrap();

        let stats = PipelineStats::new(Utc::now());
        let mut stream = FrameStream::new(client, 50 * 1024 * 1024);
        stream.read_header().await.unwrap();
        let a = stream.next_record(&stats).await.unwrap();
        let b = stream.next_record(&stats).await.unwrap();
        assert_eq!(a, jpeg);
        assert_eq!(b, jpeg);
        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"NOPE\x01\x00\x00\x00").await.unwrap();
        let mut stream = FrameStream::new(client, 1024);
        assert!(matches!(
            stream.read_header().await,
            Err(MonitorError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn resyncs_past_corrupted_length() {
        let jpeg = tiny_jpeg();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let mut wire = header();
        wire.extend(record(&jpeg));
        // Corruption: a length prefix far beyond the cap plus garbage.
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        wire.extend_from_slice(&[0xAB; 16]);
        wire.extend(record(&jpeg));
        server.write_all(&wire).await.unwrap();

        let stats = PipelineStats::new(Utc::now());
        let mut stream = FrameStream::new(client, 50 * 1024 * 1024);
        stream.read_header().await.unwrap();

        let a = stream.next_record(&stats).await.unwrap();
        let b = stream.next_record(&stats).await.unwrap();
        assert_eq!(a, jpeg);
        assert_eq!(b, jpeg);
        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn resyncs_when_body_is_not_jpeg() {
        let jpeg = tiny_jpeg();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let mut wire = header();
        // Plausible length but a non-JPEG body.
        wire.extend_from_slice(&8u32.to_be_bytes());
        wire.extend_from_slice(&[0u8; 8]);
        wire.extend(record(&jpeg));
        server.write_all(&wire).await.unwrap();

        let stats = PipelineStats::new(Utc::now());
        let mut stream = FrameStream::new(client, 50 * 1024 * 1024);
        stream.read_header().await.unwrap();

        let a = stream.next_record(&stats).await.unwrap();
        assert_eq!(a, jpeg);
        assert_eq!(stats.protocol_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn backoff_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn probe_reads_dimensions() {
        let jpeg = Bytes::from(tiny_jpeg());
        assert_eq!(probe_jpeg_dimensions(&jpeg).unwrap(), (1, 1));
    }
}
