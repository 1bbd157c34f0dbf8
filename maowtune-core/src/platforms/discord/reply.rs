use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;
use twilight_http::Client as HttpClient;

use maowtune_common::models::ChannelId;
use maowtune_common::traits::CommandReply;

use crate::Error;

/// Posts command results to a text channel.
#[derive(Clone)]
pub struct DiscordMessenger {
    http: Arc<HttpClient>,
}

impl DiscordMessenger {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl CommandReply for DiscordMessenger {
    async fn reply(&self, channel_id: ChannelId, text: &str) -> Result<(), Error> {
        trace!("reply to {channel_id}: {text}");
        self.http
            .create_message(channel_id.to_twilight()?)
            .content(text)
            .await
            .map_err(|e| Error::Platform(format!("Error sending Discord message: {e:?}")))?;
        Ok(())
    }
}
