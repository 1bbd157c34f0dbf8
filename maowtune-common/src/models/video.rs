use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A resolved video on the hosting service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub webpage_url: Option<String>,
    pub duration: Option<Duration>,
    /// Formats reported during resolution. Sources that list formats lazily
    /// leave this empty.
    #[serde(default)]
    pub formats: Vec<AudioFormat>,
}

/// One downloadable rendition of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub format_id: String,
    pub url: String,
    /// True for audio-tagged (audio-only) renditions.
    pub has_audio: bool,
    pub audio_channels: u32,
    /// Higher is better. Only meaningful relative to other formats of the
    /// same video.
    pub quality_rank: i64,
    pub codec: Option<String>,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl AudioFormat {
    pub fn is_playable(&self) -> bool {
        self.has_audio && self.audio_channels > 0
    }
}
