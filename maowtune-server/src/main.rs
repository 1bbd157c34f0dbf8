use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use maowtune_common::traits::{CommandReply, PlatformIntegration};
use maowtune_core::platforms::discord::DiscordRuntime;
use maowtune_core::playback::transcode::DEFAULT_FRAME_DURATION_MS;
use maowtune_core::playback::{GateRegistry, PlaybackConfig, PlaybackOrchestrator, TranscoderConfig};
use maowtune_core::services::{CommandContext, CommandService};
use maowtune_core::sources::{YtDlpConfig, YtDlpSource};
use maowtune_core::tasks::stats::{spawn_stats_task, DEFAULT_STATS_INTERVAL};
use maowtune_core::voice::{SessionController, SessionControllerConfig};
use maowtune_core::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "maowtune")]
#[command(author, version, about = "maowtune - Discord voice music bot")]
struct Args {
    /// Discord bot token.
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: String,

    /// Command prefix in text channels.
    #[arg(long, default_value = "!")]
    prefix: String,

    /// Encoder executable.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// yt-dlp executable.
    #[arg(long = "yt-dlp", default_value = "yt-dlp")]
    yt_dlp: String,

    #[arg(long, default_value_t = 96)]
    bitrate_kbps: u32,

    /// How long to wait for Discord's voice handshake, in seconds.
    #[arg(long, default_value_t = 10)]
    voice_timeout_secs: u64,

    /// Pause after each voice session request, in milliseconds.
    #[arg(long, default_value_t = 250)]
    session_cooldown_ms: u64,

    /// Log playback and session stats every minute.
    #[arg(long, env = "PROFILE", default_value = "false")]
    profile: bool,
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;
    let filter = EnvFilter::from_default_env().add_directive("maowtune=info".parse()?);
    let sub = fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(sub)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Before parsing, so DISCORD_TOKEN may come from .env.
    let dotenv_result = dotenv::dotenv();
    init_tracing()?;
    match dotenv_result {
        Ok(path) => debug!("loaded environment from {}", path.display()),
        Err(e) => info!("no .env file loaded ({e}); using process environment"),
    }

    let args = Args::parse();
    info!(
        "maowtune starting. prefix='{}', encoder={}, extractor={}, profile={}",
        args.prefix, args.ffmpeg, args.yt_dlp, args.profile
    );

    if let Err(e) = run(args).await {
        error!("fatal: {e}");
        return Err(e.into());
    }
    info!("Main finished. Goodbye!");
    Ok(())
}

async fn run(args: Args) -> Result<(), Error> {
    let mut runtime = DiscordRuntime::new(args.token.clone());
    runtime.connect().await?;

    let gateway = Arc::new(
        runtime
            .voice_gateway()?
            .with_handshake_timeout(Duration::from_secs(args.voice_timeout_secs)),
    );
    let (sessions, session_task) = SessionController::spawn(
        gateway,
        SessionControllerConfig {
            cooldown: Duration::from_millis(args.session_cooldown_ms),
            ..Default::default()
        },
    );

    let source = Arc::new(YtDlpSource::new(YtDlpConfig::new(args.yt_dlp.clone())));
    let registry = GateRegistry::new();
    let config = PlaybackConfig {
        transcoder: TranscoderConfig::ffmpeg(args.ffmpeg.clone(), args.bitrate_kbps, DEFAULT_FRAME_DURATION_MS),
        ..Default::default()
    };
    let orchestrator = PlaybackOrchestrator::new(source, sessions.clone(), registry.clone(), config);

    let reply: Arc<dyn CommandReply> = Arc::new(runtime.messenger()?);
    let commands = CommandService::new(&args.prefix, orchestrator, reply);

    let shutdown = CancellationToken::new();
    let stats_handle = args
        .profile
        .then(|| spawn_stats_task(registry.clone(), sessions.clone(), DEFAULT_STATS_INTERVAL, shutdown.clone()));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {e:?}");
                }
                info!("Ctrl-C detected; shutting down...");
                break;
            }
            event = runtime.next_message_event() => {
                let Some(event) = event else {
                    warn!("Discord event stream ended; shutting down.");
                    break;
                };
                let Some(guild_id) = event.guild_id else {
                    continue;
                };
                let ctx = CommandContext {
                    guild_id,
                    channel_id: event.channel_id,
                    author_id: event.author_id,
                };
                if commands.dispatch(ctx, &event.text).is_some() {
                    debug!("dispatched command from {} in guild {guild_id}", event.author_name);
                }
            }
        }
    }

    registry.stop_all();
    shutdown.cancel();
    if let Some(handle) = stats_handle {
        let _ = handle.await;
    }

    if let Ok(status) = sessions.status().await {
        if status.initialized {
            if let Err(e) = sessions.leave().await {
                warn!("leaving voice on shutdown: {e}");
            }
        }
    }
    if let Err(e) = sessions.shutdown().await {
        debug!("session controller already gone: {e}");
    }
    let _ = session_task.await;

    runtime.disconnect().await?;
    Ok(())
}
