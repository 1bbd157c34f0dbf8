// File: maowtune-core/src/services/command_service.rs
//
// Prefix commands from guild text channels: play, pause, resume, stop,
// disconnect (alias dc). Every command runs in its own task.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use maowtune_common::models::{ChannelId, GuildId, UserId};
use maowtune_common::traits::CommandReply;

use crate::playback::{GateState, PlayRequest, PlaybackOrchestrator, PlaybackOutcome};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MusicCommand {
    Play(String),
    /// Toggles between paused and playing.
    Pause,
    Resume,
    Stop,
    Disconnect,
}

impl MusicCommand {
    pub fn parse(prefix: &str, text: &str) -> Option<Self> {
        let body = text.trim_start().strip_prefix(prefix)?;
        let (command, rest) = match body.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (body, ""),
        };

        match command.to_ascii_lowercase().as_str() {
            "play" => Some(MusicCommand::Play(rest.to_string())),
            "pause" => Some(MusicCommand::Pause),
            "resume" => Some(MusicCommand::Resume),
            "stop" => Some(MusicCommand::Stop),
            "disconnect" | "dc" => Some(MusicCommand::Disconnect),
            _ => None,
        }
    }
}

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
}

/// Short user-facing explanation of a failed command.
pub fn describe_failure(err: &Error) -> String {
    match err {
        Error::Resolution(msg) => format!("Couldn't find anything playable: {msg}"),
        Error::StreamOpen(_) => "Couldn't open the audio stream.".into(),
        Error::TranscodeStart(_) | Error::TranscodeExit(_) => "The audio encoder failed.".into(),
        Error::SessionInit(_) | Error::NoSession(_) => "Couldn't start a voice session.".into(),
        Error::VoiceStateLookup(_) => "Join a voice channel first.".into(),
        Error::Join(_) => "Couldn't join your voice channel.".into(),
        Error::Demux(_) => "The audio stream was malformed.".into(),
        Error::SessionLeave(_) => "Couldn't leave the voice channel.".into(),
        Error::Speaking(_) | Error::Transport(_) => "Lost the voice connection.".into(),
        _ => "Something went wrong.".into(),
    }
}

#[derive(Clone)]
pub struct CommandService {
    prefix: String,
    orchestrator: PlaybackOrchestrator,
    reply: Arc<dyn CommandReply>,
}

impl CommandService {
    pub fn new(prefix: &str, orchestrator: PlaybackOrchestrator, reply: Arc<dyn CommandReply>) -> Self {
        Self {
            prefix: prefix.to_string(),
            orchestrator,
            reply,
        }
    }

    /// Parse `text` and, if it is a command, run it in its own task.
    pub fn dispatch(&self, ctx: CommandContext, text: &str) -> Option<JoinHandle<()>> {
        let command = MusicCommand::parse(&self.prefix, text)?;
        debug!("guild {}: command {:?} from {}", ctx.guild_id, command, ctx.author_id);

        let service = self.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = service.handle(ctx, command).await {
                warn!("guild {}: command failed => {e}", ctx.guild_id);
                service.say(ctx.channel_id, &describe_failure(&e)).await;
            }
        }))
    }

    pub async fn handle(&self, ctx: CommandContext, command: MusicCommand) -> Result<(), Error> {
        let registry = self.orchestrator.registry();
        match command {
            MusicCommand::Play(query) => {
                let request = PlayRequest {
                    guild_id: ctx.guild_id,
                    author_id: ctx.author_id,
                    channel_id: ctx.channel_id,
                    query,
                };
                let report = self.orchestrator.play(request, self.reply.as_ref()).await?;
                if report.outcome == PlaybackOutcome::Finished {
                    self.say(ctx.channel_id, &format!("Finished **{}**", report.title)).await;
                }
            }
            MusicCommand::Pause => match registry.toggle_pause(ctx.guild_id) {
                Some(GateState::Paused) => self.say(ctx.channel_id, "Paused.").await,
                Some(GateState::Playing) => self.say(ctx.channel_id, "Resumed.").await,
                Some(GateState::Closed) | None => debug!("guild {}: nothing to pause", ctx.guild_id),
            },
            MusicCommand::Resume => {
                if registry.resume(ctx.guild_id) {
                    self.say(ctx.channel_id, "Resumed.").await;
                }
            }
            MusicCommand::Stop => {
                if registry.stop(ctx.guild_id) {
                    self.say(ctx.channel_id, "Stopped.").await;
                }
            }
            MusicCommand::Disconnect => {
                let sessions = self.orchestrator.sessions();
                let status = sessions.status().await?;
                if status.guild_id.is_some_and(|g| g != ctx.guild_id) {
                    debug!("guild {}: voice session belongs to another guild", ctx.guild_id);
                    return Ok(());
                }
                registry.stop(ctx.guild_id);
                sessions.leave().await?;
                info!("guild {}: disconnected on request of {}", ctx.guild_id, ctx.author_id);
                self.say(ctx.channel_id, "Disconnected.").await;
            }
        }
        Ok(())
    }

    async fn say(&self, channel_id: ChannelId, text: &str) {
        if let Err(e) = self.reply.reply(channel_id, text).await {
            warn!("could not reply in {channel_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{gate, GateRegistry, PlaybackConfig, PlaybackHandle};
    use crate::test_utils::fakes::{RecordingGateway, RecordingReply, StaticSource};
    use crate::voice::{SessionController, SessionControllerConfig};
    use std::io::Cursor;
    use std::time::Duration;

    const CTX: CommandContext = CommandContext {
        guild_id: GuildId(1),
        channel_id: ChannelId(2),
        author_id: UserId(3),
    };

    fn service(gateway: Arc<RecordingGateway>) -> (CommandService, Arc<RecordingReply>) {
        let (sessions, _task) = SessionController::spawn(
            gateway,
            SessionControllerConfig {
                cooldown: Duration::ZERO,
                ..Default::default()
            },
        );
        let source = Arc::new(StaticSource::new("song", Vec::new(), Vec::new()));
        let orchestrator = PlaybackOrchestrator::new(source, sessions, GateRegistry::new(), PlaybackConfig::default());
        let reply = Arc::new(RecordingReply::default());
        (CommandService::new("!", orchestrator, reply.clone()), reply)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            MusicCommand::parse("!", "!play never gonna give you up"),
            Some(MusicCommand::Play("never gonna give you up".into()))
        );
        assert_eq!(MusicCommand::parse("!", "!PAUSE"), Some(MusicCommand::Pause));
        assert_eq!(MusicCommand::parse("!", "!resume"), Some(MusicCommand::Resume));
        assert_eq!(MusicCommand::parse("!", "!stop"), Some(MusicCommand::Stop));
        assert_eq!(MusicCommand::parse("!", "!dc"), Some(MusicCommand::Disconnect));
        assert_eq!(MusicCommand::parse("!", "!disconnect"), Some(MusicCommand::Disconnect));
        assert_eq!(MusicCommand::parse("!", "!play"), Some(MusicCommand::Play(String::new())));
        assert_eq!(MusicCommand::parse("!", "play something"), None);
        assert_eq!(MusicCommand::parse("!", "!dance"), None);
        assert_eq!(MusicCommand::parse("m!", "m!stop"), Some(MusicCommand::Stop));
    }

    #[test]
    fn test_session_failures_are_described_distinctly() {
        let a = describe_failure(&Error::SessionInit("x".into()));
        let b = describe_failure(&Error::VoiceStateLookup("x".into()));
        let c = describe_failure(&Error::Join("x".into()));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_pause_without_playback_is_a_silent_noop() {
        let (svc, reply) = service(Arc::new(RecordingGateway::new()));
        svc.handle(CTX, MusicCommand::Pause).await.unwrap();
        svc.handle(CTX, MusicCommand::Resume).await.unwrap();
        svc.handle(CTX, MusicCommand::Stop).await.unwrap();
        assert!(reply.messages().is_empty());
    }

    #[tokio::test]
    async fn test_pause_toggles_the_registered_gate() {
        let (svc, reply) = service(Arc::new(RecordingGateway::new()));
        let (g, _reader) = gate(Cursor::new(Vec::<u8>::new()));
        let handle = PlaybackHandle::new(g.clone());
        svc.orchestrator.registry().register(CTX.guild_id, handle.clone());

        svc.handle(CTX, MusicCommand::Pause).await.unwrap();
        assert_eq!(g.state(), GateState::Paused);
        svc.handle(CTX, MusicCommand::Pause).await.unwrap();
        assert_eq!(g.state(), GateState::Playing);
        svc.handle(CTX, MusicCommand::Stop).await.unwrap();
        assert!(handle.cancel.is_cancelled());

        let texts: Vec<String> = reply.messages().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["Paused.", "Resumed.", "Stopped."]);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_reports_leave_failure() {
        let (svc, reply) = service(Arc::new(RecordingGateway::new()));
        svc.dispatch(CTX, "!dc").unwrap().await.unwrap();
        let messages = reply.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, describe_failure(&Error::SessionLeave(String::new())));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_the_session() {
        let gateway = Arc::new(RecordingGateway::new());
        let (svc, reply) = service(gateway.clone());
        let sessions = svc.orchestrator.sessions();
        sessions.initialize().await.unwrap();
        sessions.join_channel(CTX.guild_id, ChannelId(9)).await.unwrap();

        svc.handle(CTX, MusicCommand::Disconnect).await.unwrap();
        assert!(!sessions.status().await.unwrap().initialized);
        assert_eq!(reply.messages().last().unwrap().1, "Disconnected.");
    }

    #[tokio::test]
    async fn test_play_with_nothing_playable_is_a_resolution_error() {
        let (svc, _reply) = service(Arc::new(RecordingGateway::new()));
        let err = svc
            .handle(CTX, MusicCommand::Play("some song".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Resolution(_)));
    }
}
