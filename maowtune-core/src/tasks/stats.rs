// src/tasks/stats.rs

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::playback::GateRegistry;
use crate::voice::SessionController;
use crate::Error;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns a background task that logs playback and session stats every
/// `every` until `shutdown` fires.
pub fn spawn_stats_task(
    registry: GateRegistry,
    sessions: SessionController,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stats task shutting down.");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = log_stats(&registry, &sessions).await {
                        error!("stats: {:?}", e);
                    }
                }
            }
        }
    })
}

pub async fn log_stats(registry: &GateRegistry, sessions: &SessionController) -> Result<(), Error> {
    let status = sessions.status().await?;
    info!(
        "stats: active_playbacks={} session_initialized={} guild={:?} channel={:?}",
        registry.len(),
        status.initialized,
        status.guild_id,
        status.channel_id
    );
    Ok(())
}
