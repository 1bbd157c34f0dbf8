use std::fmt;
use std::sync::Arc;

use crate::models::ids::{ChannelId, GuildId, UserId};
use crate::traits::voice_traits::VoiceTransport;

/// Everything the voice websocket needs, gathered from the
/// `VOICE_STATE_UPDATE` + `VOICE_SERVER_UPDATE` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceConnectionInfo {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub endpoint: String,
    pub token: String,
}

/// Read-only view of the process-wide voice session.
#[derive(Clone, Default)]
pub struct SessionStatus {
    pub initialized: bool,
    pub guild_id: Option<GuildId>,
    pub channel_id: Option<ChannelId>,
    pub transport: Option<Arc<dyn VoiceTransport>>,
}

impl SessionStatus {
    /// True when the session holds a live transport for `guild_id`.
    pub fn is_connected_to(&self, guild_id: GuildId) -> bool {
        self.guild_id == Some(guild_id) && self.transport.is_some()
    }
}

impl fmt::Debug for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStatus")
            .field("initialized", &self.initialized)
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}
