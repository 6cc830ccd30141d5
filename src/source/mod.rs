use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::packet::RawPacket;

pub mod rtsp;

pub use rtsp::{FfmpegSource, RtspOptions};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),
}

/// Pull side of a packet feed. `Ok(None)` marks the end of the stream.
///
/// Implementations must be cancel safe: the pipeline drops a pending
/// `next_packet` future when the session deadline fires.
pub trait PacketSource {
    fn next_packet(&mut self) -> impl Future<Output = Result<Option<RawPacket>, SourceError>> + Send;
}

impl PacketSource for mpsc::Receiver<RawPacket> {
    async fn next_packet(&mut self) -> Result<Option<RawPacket>, SourceError> {
        Ok(self.recv().await)
    }
}
