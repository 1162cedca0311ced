//! TCP video stream simulator.
//!
//! Serves the monitor's upstream framing (8-byte "FRAM" header, then
//! length-prefixed JPEGs) with synthetic frames, for demos and end-to-end
//! testing without a camera.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(short, long, default_value_t = 9999)]
    port: u16,

    /// Frames per second
    #[arg(short, long, default_value_t = 25.0)]
    fps: f64,

    /// Frame width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Frame height
    #[arg(long, default_value_t = 360)]
    height: u32,

    /// Frames to send per connection (0 = endless)
    #[arg(short = 'n', long, default_value_t = 0)]
    count: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("bind {}:{}", args.host, args.port))?;
    info!(
        host = %args.host,
        port = args.port,
        fps = args.fps,
        "Stream simulator listening"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "Client connected");
        let args = args.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_client(stream, &args).await {
                warn!(%peer, "Client dropped: {e}");
            }
        });
    }
}

async fn serve_client(mut stream: TcpStream, args: &Args) -> Result<()> {
    // Header: magic, protocol version 1, three reserved bytes.
    stream.write_all(b"FRAM\x01\x00\x00\x00").await?;

    let interval = Duration::from_secs_f64(1.0 / args.fps.max(0.1));
    let mut tick = tokio::time::interval(interval);
    let mut index: u64 = 0;

    loop {
        tick.tick().await;
        let jpeg = synthetic_frame(args.width, args.height, index)?;
        stream
            .write_all(&(jpeg.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&jpeg).await?;

        index += 1;
        if args.count > 0 && index >= args.count {
            info!(frames = index, "Finished stream");
            return Ok(());
        }
        if index % 100 == 0 {
            info!(frames = index, "Streaming");
        }
    }
}

/// Deterministic moving-gradient frame, so tests can assert on content
/// across runs.
fn synthetic_frame(width: u32, height: u32, index: u64) -> Result<Vec<u8>> {
    let shift = (index * 8 % 256) as u8;
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x % 256) as u8 ^ shift,
            (y % 256) as u8,
            shift,
        ])
    });
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut Cursor::new(&mut out), 80)
        .encode_image(&image::DynamicImage::ImageRgb8(img))?;
    Ok(out)
}
