pub mod ids;
pub mod video;
pub mod voice;

pub use ids::{ChannelId, GuildId, UserId};
pub use video::{AudioFormat, VideoMetadata};
pub use voice::{SessionStatus, VoiceConnectionInfo};
