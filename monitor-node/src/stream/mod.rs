use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub mod distributor;
pub mod tcp;

pub use distributor::{FrameDistributor, Subscription};
pub use tcp::TcpFrameReader;

/// A source of decoded frames feeding the distributor.
///
/// The TCP reader is the production implementation; the trait keeps the seam
/// open for alternate stream decoders (raw MJPEG, vendor TLV) without
/// touching the distributor or anything downstream.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Read frames until cancelled or terminally failed.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}
