// ================================================================
// File: maowtune-common/src/error.rs
// ================================================================

use thiserror::Error;

/// Crate-wide error. The first group of variants names the playback phase
/// that failed; the rest are ambient failures converted with `?`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Stream open error: {0}")]
    StreamOpen(String),

    #[error("Transcoder start error: {0}")]
    TranscodeStart(String),

    #[error("Transcoder exit error: {0}")]
    TranscodeExit(String),

    #[error("Session init error: {0}")]
    SessionInit(String),

    #[error("Voice state lookup error: {0}")]
    VoiceStateLookup(String),

    #[error("Join error: {0}")]
    Join(String),

    #[error("Demux error: {0}")]
    Demux(String),

    #[error("Session leave error: {0}")]
    SessionLeave(String),

    #[error("No voice session: {0}")]
    NoSession(String),

    #[error("Speaking error: {0}")]
    Speaking(String),

    #[error("Voice transport error: {0}")]
    Transport(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Session controller is not running")]
    ControllerGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Parse(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Parse(s.to_string())
    }
}
