use std::io::Cursor;
use std::path::Path;
use std::process::Stdio;

use image::imageops::FilterType;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};

/// Result of pushing a frame through the resize policy.
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub was_resized: bool,
}

/// Shrink a JPEG to fit within `max_width` x `max_height`, preserving aspect
/// ratio. Frames already within bounds are passed through untouched.
pub fn resize_jpeg(
    data: &[u8],
    max_width: u32,
    max_height: u32,
    quality: u8,
) -> Result<EncodedFrame> {
    let img = image::load_from_memory(data)?;
    let (w, h) = (img.width(), img.height());

    if w <= max_width && h <= max_height {
        return Ok(EncodedFrame {
            data: data.to_vec(),
            width: w,
            height: h,
            was_resized: false,
        });
    }

    let scale = f64::min(max_width as f64 / w as f64, max_height as f64 / h as f64);
    let new_w = ((w as f64 * scale).round() as u32).max(1);
    let new_h = ((h as f64 * scale).round() as u32).max(1);

    let resized = img.resize_exact(new_w, new_h, FilterType::Triangle);
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut Cursor::new(&mut out), quality)
        .encode_image(&resized)?;

    debug!(from = ?(w, h), to = ?(new_w, new_h), "Frame resized");
    Ok(EncodedFrame {
        data: out,
        width: new_w,
        height: new_h,
        was_resized: true,
    })
}

/// Mux a sequence of JPEG frames into an H.264 MP4 at exactly `fps` output
/// frames per second by piping them through an ffmpeg child process.
pub async fn encode_mp4(
    frames: &[Vec<u8>],
    fps: u32,
    out_path: &Path,
    max_size_mb: f64,
) -> Result<()> {
    if frames.is_empty() {
        return Err(MonitorError::EncodeError("no frames to encode".to_string()));
    }

    let mut child = Command::new("ffmpeg")
        .args([
            "-y",
            "-loglevel",
            "error",
            "-f",
            "image2pipe",
            "-framerate",
            &fps.to_string(),
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
        ])
        .arg(out_path)
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .map_err(|e| MonitorError::EncodeError(format!("failed to spawn ffmpeg: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| MonitorError::EncodeError("ffmpeg stdin unavailable".to_string()))?;
    for frame in frames {
        stdin.write_all(frame).await?;
    }
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| MonitorError::EncodeError(format!("ffmpeg wait failed: {e}")))?;
    if !output.status.success() {
        return Err(MonitorError::EncodeError(format!(
            "ffmpeg exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let size_mb = tokio::fs::metadata(out_path).await?.len() as f64 / (1024.0 * 1024.0);
    if size_mb > max_size_mb {
        warn!(size_mb, "Encoded video over the size cap, discarding");
        let _ = tokio::fs::remove_file(out_path).await;
        return Err(MonitorError::EncodeError(format!(
            "video too large: {size_mb:.2}MB > {max_size_mb:.2}MB"
        )));
    }

    debug!(path = %out_path.display(), size_mb, fps, "Video encoded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(w, h, |x, y| image::Rgb([x as u8, y as u8, 128]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut Cursor::new(&mut out), 90)
            .encode_image(&image::DynamicImage::ImageRgb8(img))
            .unwrap();
        out
    }

    #[test]
    fn small_frames_pass_through() {
        let data = jpeg(320, 180);
        let encoded = resize_jpeg(&data, 640, 360, 80).unwrap();
        assert!(!encoded.was_resized);
        assert_eq!((encoded.width, encoded.height), (320, 180));
        assert_eq!(encoded.data, data);
    }

    #[test]
    fn large_frames_shrink_preserving_aspect() {
        let data = jpeg(1280, 720);
        let encoded = resize_jpeg(&data, 640, 360, 80).unwrap();
        assert!(encoded.was_resized);
        assert_eq!((encoded.width, encoded.height), (640, 360));

        let roundtrip = image::load_from_memory(&encoded.data).unwrap();
        assert_eq!((roundtrip.width(), roundtrip.height()), (640, 360));
    }

    #[test]
    fn portrait_frames_fit_height() {
        let data = jpeg(720, 1280);
        let encoded = resize_jpeg(&data, 640, 360, 80).unwrap();
        // Height is the binding constraint: 1280 -> 360 scales width to 203.
        assert_eq!(encoded.height, 360);
        assert_eq!(encoded.width, 203);
    }

    #[test]
    fn garbage_input_is_an_encode_error() {
        assert!(matches!(
            resize_jpeg(&[0u8; 16], 640, 360, 80),
            Err(MonitorError::EncodeError(_))
        ));
    }
}
