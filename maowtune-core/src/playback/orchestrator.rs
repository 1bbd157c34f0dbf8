//! playback/orchestrator.rs
//!
//! Composes one playback invocation:
//! resolve -> transcode -> session ready -> speaking -> pump -> report.
//!
//! Every failure after the transcoder starts kills it before returning, and
//! the gate is retired from the registry whichever way the pump ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tracing::{debug, info, warn};

use maowtune_common::models::{AudioFormat, ChannelId, GuildId, UserId};
use maowtune_common::traits::{CommandReply, VideoSource, VoiceTransport};

use crate::playback::gate::gate;
use crate::playback::ogg::OggOpusDemuxer;
use crate::playback::pump::{pump, PumpOutcome};
use crate::playback::registry::{GateRegistry, PlaybackHandle};
use crate::playback::sink::{PacedSink, FRAME_DURATION, SAMPLES_PER_FRAME};
use crate::playback::transcode::{Transcoder, TranscoderConfig};
use crate::voice::SessionController;
use crate::Error;

/// How long a failed pump waits for the encoder's exit status.
const ENCODER_EXIT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub transcoder: TranscoderConfig,
    /// Must match the encoder's frame duration.
    pub frame_duration: Duration,
    pub samples_per_frame: u32,
    pub read_buffer: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            transcoder: TranscoderConfig::default(),
            frame_duration: FRAME_DURATION,
            samples_per_frame: SAMPLES_PER_FRAME,
            read_buffer: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub guild_id: GuildId,
    pub author_id: UserId,
    /// Text channel the command came from; replies go here.
    pub channel_id: ChannelId,
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The stream played to its end.
    Finished,
    /// A stop command (or a newer playback in the same guild) cut it short.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub title: String,
    pub frames: u64,
    pub outcome: PlaybackOutcome,
}

/// Best audio-only format: audio-capable with at least one channel, highest
/// `quality_rank` first, ties resolved by original order.
pub fn select_format(formats: &[AudioFormat]) -> Option<&AudioFormat> {
    let mut candidates: Vec<&AudioFormat> = formats.iter().filter(|f| f.is_playable()).collect();
    candidates.sort_by(|a, b| b.quality_rank.cmp(&a.quality_rank));
    candidates.into_iter().next()
}

#[derive(Clone)]
pub struct PlaybackOrchestrator {
    source: Arc<dyn VideoSource>,
    sessions: SessionController,
    registry: GateRegistry,
    config: PlaybackConfig,
}

impl PlaybackOrchestrator {
    pub fn new(
        source: Arc<dyn VideoSource>,
        sessions: SessionController,
        registry: GateRegistry,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            source,
            sessions,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &GateRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionController {
        &self.sessions
    }

    pub async fn play(&self, request: PlayRequest, reply: &dyn CommandReply) -> Result<PlaybackReport, Error> {
        let guild_id = request.guild_id;

        // Resolving
        info!("guild {guild_id}: resolving '{}'", request.query);
        let video = self.source.resolve_video(&request.query).await?;
        let formats = self.source.list_formats(&video).await?;
        let format = select_format(&formats)
            .cloned()
            .ok_or_else(|| Error::Resolution(format!("no compatible audio format for '{}'", video.title)))?;
        debug!(
            "guild {guild_id}: format {} (rank {}, {} ch)",
            format.format_id, format.quality_rank, format.audio_channels
        );
        let stream = self
            .source
            .open_stream(&video, &format)
            .await
            .map_err(|e| match e {
                Error::StreamOpen(_) => e,
                other => Error::StreamOpen(other.to_string()),
            })?;

        // Transcoding
        let mut transcoder = Transcoder::start(&self.config.transcoder, stream)?;
        let output = transcoder.take_output()?;
        info!("guild {guild_id}: transcoding '{}'", video.title);

        // SessionReady / Joining
        let transport = match self.ensure_session(guild_id, request.author_id).await {
            Ok(t) => t,
            Err(e) => {
                transcoder.kill().await;
                return Err(e);
            }
        };

        // Speaking
        transport.reset_frequency(self.config.frame_duration, self.config.samples_per_frame);
        if let Err(e) = transport.set_speaking(true).await {
            transcoder.kill().await;
            return Err(match e {
                Error::Speaking(_) => e,
                other => Error::Speaking(other.to_string()),
            });
        }

        if let Err(e) = reply
            .reply(request.channel_id, &format!("Now playing **{}**", video.title))
            .await
        {
            warn!("guild {guild_id}: could not post now-playing message: {e}");
        }

        // Pumping
        let (gate_handle, reader) = gate(BufReader::with_capacity(self.config.read_buffer, output));
        let handle = PlaybackHandle::new(gate_handle.clone());
        let (invocation, cancel) = (handle.id, handle.cancel.clone());
        self.registry.register(guild_id, handle);
        info!("guild {guild_id}: playback {invocation} started");

        let mut demuxer = OggOpusDemuxer::new(reader);
        let mut sink = PacedSink::with_period(transport.clone(), self.config.frame_duration);
        let pumped = pump(&mut demuxer, &mut sink, &gate_handle, &cancel).await;
        gate_handle.close();

        // Leave the flag alone if a newer playback in this guild took over.
        let owned = self.registry.remove_if_current(guild_id, invocation);
        if owned || self.registry.get(guild_id).is_none() {
            if let Err(e) = transport.set_speaking(false).await {
                warn!("guild {guild_id}: failed to clear speaking flag: {e}");
            }
        } else {
            debug!("guild {guild_id}: playback {invocation} replaced, leaving speaking flag set");
        }

        let (outcome, frames) = match pumped {
            Ok(PumpOutcome::Finished { frames }) if !cancel.is_cancelled() => {
                transcoder.wait().await?;
                (PlaybackOutcome::Finished, frames)
            }
            Ok(other) => {
                transcoder.kill().await;
                (PlaybackOutcome::Stopped, other.frames())
            }
            Err(_) if cancel.is_cancelled() => {
                transcoder.kill().await;
                (PlaybackOutcome::Stopped, sink.frames_written())
            }
            Err(e) => {
                // An encoder crash usually surfaces as bad output first.
                let exited = transcoder.wait_timeout(ENCODER_EXIT_GRACE).await;
                transcoder.kill().await;
                return Err(match exited {
                    Some(Err(exit)) => exit,
                    _ => e,
                });
            }
        };

        info!("guild {guild_id}: playback {invocation} {:?} after {frames} frames", outcome);
        Ok(PlaybackReport {
            title: video.title,
            frames,
            outcome,
        })
    }

    /// Initialize the session if needed and make sure it is joined to the
    /// author's channel in `guild_id`.
    async fn ensure_session(&self, guild_id: GuildId, author_id: UserId) -> Result<Arc<dyn VoiceTransport>, Error> {
        let status = self.sessions.status().await?;
        if status.is_connected_to(guild_id) {
            if let Some(transport) = status.transport {
                return Ok(transport);
            }
        }
        if !status.initialized {
            self.sessions.initialize().await?;
        }
        self.sessions.join(guild_id, author_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::audio_format;

    #[test]
    fn test_select_format_prefers_highest_ranked_audio() {
        let formats = vec![
            audio_format("a2", true, 2, 2),
            audio_format("v5", false, 2, 5),
            audio_format("a1", true, 2, 1),
        ];
        assert_eq!(select_format(&formats).unwrap().format_id, "a2");
    }

    #[test]
    fn test_select_format_never_picks_unplayable_formats() {
        // Every ordering of the same set selects the same format.
        let base = [
            audio_format("video", false, 2, 99),
            audio_format("silent", true, 0, 50),
            audio_format("good", true, 2, 10),
            audio_format("worse", true, 1, 3),
        ];
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
        for order in orders {
            let formats: Vec<_> = order.iter().map(|&i| base[i].clone()).collect();
            assert_eq!(select_format(&formats).unwrap().format_id, "good");
        }
    }

    #[test]
    fn test_select_format_ties_keep_first() {
        let formats = vec![audio_format("first", true, 2, 7), audio_format("second", true, 2, 7)];
        assert_eq!(select_format(&formats).unwrap().format_id, "first");
    }

    #[test]
    fn test_select_format_without_audio_is_none() {
        let formats = vec![audio_format("v", false, 0, 1)];
        assert!(select_format(&formats).is_none());
        assert!(select_format(&[]).is_none());
    }
}
