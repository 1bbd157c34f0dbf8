pub mod connection;
pub mod rtp;
pub mod session;

pub use connection::DiscordVoiceConnection;
pub use rtp::RtpSealer;
pub use session::{SessionController, SessionControllerConfig, SessionRequest};
