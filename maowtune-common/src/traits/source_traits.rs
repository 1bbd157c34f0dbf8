use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Error;
use crate::models::video::{AudioFormat, VideoMetadata};

/// Raw (still encoded by the host) audio bytes of one format.
pub type AudioStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Resolve free text, a URL or a video id to a single video.
    async fn resolve_video(&self, query: &str) -> Result<VideoMetadata, Error>;

    async fn list_formats(&self, video: &VideoMetadata) -> Result<Vec<AudioFormat>, Error>;

    async fn open_stream(
        &self,
        video: &VideoMetadata,
        format: &AudioFormat,
    ) -> Result<AudioStream, Error>;
}
