pub mod platform_traits;
pub mod source_traits;
pub mod voice_traits;

pub use platform_traits::{CommandReply, ConnectionStatus, PlatformIntegration};
pub use source_traits::{AudioStream, VideoSource};
pub use voice_traits::{VoiceGateway, VoiceTransport};
