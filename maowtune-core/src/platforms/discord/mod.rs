pub mod reply;
pub mod runtime;
pub mod voice;

pub use reply::DiscordMessenger;
pub use runtime::{DiscordMessageEvent, DiscordRuntime};
pub use voice::{TwilightVoiceGateway, VoiceEvent, VoiceEventHub};
