use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::models::ids::{ChannelId, GuildId, UserId};

/// Outbound half of a joined voice connection.
///
/// Implementations do not pace writes themselves; the frame sink in front
/// of them owns the cadence.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Configure RTP timing for frames of `frame_duration` carrying
    /// `samples_per_frame` samples.
    fn reset_frequency(&self, frame_duration: Duration, samples_per_frame: u32);

    async fn set_speaking(&self, speaking: bool) -> Result<(), Error>;

    /// Send one encoded Opus frame.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), Error>;
}

/// Chat-platform side of voice: session creation, voice-state lookup and the
/// join/leave handshakes. Only the session controller calls into this.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Prepare a voice session on top of the gateway connection.
    async fn open_session(&self) -> Result<(), Error>;

    /// Voice channel `user_id` currently sits in inside `guild_id`.
    async fn voice_channel_of(&self, guild_id: GuildId, user_id: UserId) -> Result<ChannelId, Error>;

    async fn join_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<Arc<dyn VoiceTransport>, Error>;

    async fn leave_channel(&self, guild_id: GuildId) -> Result<(), Error>;
}
