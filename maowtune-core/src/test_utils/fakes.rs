// File: maowtune-core/src/test_utils/fakes.rs

//! In-memory collaborators for pipeline tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use maowtune_common::models::{AudioFormat, ChannelId, GuildId, UserId, VideoMetadata};
use maowtune_common::traits::{AudioStream, CommandReply, VideoSource, VoiceGateway, VoiceTransport};

use crate::playback::sink::FrameSink;
use crate::Error;

/// Voice transport that records everything written to it.
#[derive(Default)]
pub struct RecordingTransport {
    writes: Mutex<Vec<(Instant, Vec<u8>)>>,
    speaking: Mutex<Vec<bool>>,
    frequency: Mutex<Vec<(Duration, u32)>>,
    fail_writes: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.writes.lock().iter().map(|(_, f)| f.clone()).collect()
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.writes.lock().iter().map(|(t, _)| *t).collect()
    }

    pub fn speaking(&self) -> Vec<bool> {
        self.speaking.lock().clone()
    }

    pub fn frequency(&self) -> Vec<(Duration, u32)> {
        self.frequency.lock().clone()
    }
}

#[async_trait]
impl VoiceTransport for RecordingTransport {
    fn reset_frequency(&self, frame_duration: Duration, samples_per_frame: u32) {
        self.frequency.lock().push((frame_duration, samples_per_frame));
    }

    async fn set_speaking(&self, speaking: bool) -> Result<(), Error> {
        self.speaking.lock().push(speaking);
        Ok(())
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), Error> {
        if self.fail_writes {
            return Err(Error::Transport("udp socket closed".into()));
        }
        self.writes.lock().push((Instant::now(), frame.to_vec()));
        Ok(())
    }
}

/// Unpaced sink collecting frames.
#[derive(Default)]
pub struct VecSink {
    pub frames: Vec<Vec<u8>>,
}

#[async_trait]
impl FrameSink for VecSink {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.frames.push(frame.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    OpenSession,
    Lookup(GuildId, UserId),
    Join {
        guild_id: GuildId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    },
    Leave(GuildId),
}

/// Voice gateway that records calls and tracks how many overlap.
pub struct RecordingGateway {
    calls: Mutex<Vec<GatewayCall>>,
    voice_states: Mutex<HashMap<(GuildId, UserId), ChannelId>>,
    transport: Arc<RecordingTransport>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            voice_states: Mutex::new(HashMap::new()),
            transport: Arc::new(RecordingTransport::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call takes `delay` to complete.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_user_in(self, guild_id: GuildId, user_id: UserId, channel_id: ChannelId) -> Self {
        self.voice_states.lock().insert((guild_id, user_id), channel_id);
        self
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> Arc<RecordingTransport> {
        self.transport.clone()
    }

    async fn record(&self, call: GatewayCall) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push(call);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VoiceGateway for RecordingGateway {
    async fn open_session(&self) -> Result<(), Error> {
        self.record(GatewayCall::OpenSession).await;
        Ok(())
    }

    async fn voice_channel_of(&self, guild_id: GuildId, user_id: UserId) -> Result<ChannelId, Error> {
        self.record(GatewayCall::Lookup(guild_id, user_id)).await;
        self.voice_states
            .lock()
            .get(&(guild_id, user_id))
            .copied()
            .ok_or_else(|| Error::VoiceStateLookup(format!("user {user_id} is not in a voice channel")))
    }

    async fn join_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<Arc<dyn VoiceTransport>, Error> {
        self.record(GatewayCall::Join {
            guild_id,
            channel_id,
            self_mute,
            self_deaf,
        })
        .await;
        Ok(self.transport.clone())
    }

    async fn leave_channel(&self, guild_id: GuildId) -> Result<(), Error> {
        self.record(GatewayCall::Leave(guild_id)).await;
        Ok(())
    }
}

/// Video source serving one fixed video and payload.
pub struct StaticSource {
    pub video: VideoMetadata,
    pub formats: Vec<AudioFormat>,
    pub payload: Vec<u8>,
    opened: Mutex<Vec<String>>,
}

impl StaticSource {
    pub fn new(title: &str, formats: Vec<AudioFormat>, payload: Vec<u8>) -> Self {
        Self {
            video: VideoMetadata {
                id: "dQw4w9WgXcQ".to_string(),
                title: title.to_string(),
                webpage_url: None,
                duration: None,
                formats: Vec::new(),
            },
            formats,
            payload,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Format ids passed to `open_stream`, in call order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl VideoSource for StaticSource {
    async fn resolve_video(&self, query: &str) -> Result<VideoMetadata, Error> {
        if query.trim().is_empty() {
            return Err(Error::Resolution("empty query".into()));
        }
        Ok(self.video.clone())
    }

    async fn list_formats(&self, _video: &VideoMetadata) -> Result<Vec<AudioFormat>, Error> {
        Ok(self.formats.clone())
    }

    async fn open_stream(&self, _video: &VideoMetadata, format: &AudioFormat) -> Result<AudioStream, Error> {
        self.opened.lock().push(format.format_id.clone());
        Ok(Box::new(Cursor::new(self.payload.clone())))
    }
}

/// Collects replies instead of posting them.
#[derive(Default)]
pub struct RecordingReply {
    messages: Mutex<Vec<(ChannelId, String)>>,
}

impl RecordingReply {
    pub fn messages(&self) -> Vec<(ChannelId, String)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl CommandReply for RecordingReply {
    async fn reply(&self, channel_id: ChannelId, text: &str) -> Result<(), Error> {
        self.messages.lock().push((channel_id, text.to_string()));
        Ok(())
    }
}

pub fn audio_format(format_id: &str, has_audio: bool, audio_channels: u32, quality_rank: i64) -> AudioFormat {
    AudioFormat {
        format_id: format_id.to_string(),
        url: format!("https://media.example/{format_id}"),
        has_audio,
        audio_channels,
        quality_rank,
        codec: has_audio.then(|| "opus".to_string()),
        http_headers: HashMap::new(),
    }
}
