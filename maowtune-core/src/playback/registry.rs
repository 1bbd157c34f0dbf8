//! playback/registry.rs
//!
//! Owned table of active playbacks keyed by guild. Command handlers look a
//! guild up here to pause, resume or stop; the orchestrator registers and
//! retires entries. Absent guilds are a silent no-op everywhere.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use maowtune_common::models::GuildId;

use crate::playback::gate::{GateHandle, GateState};

/// Control surface of one playback invocation.
#[derive(Clone)]
pub struct PlaybackHandle {
    pub id: Uuid,
    pub gate: GateHandle,
    pub cancel: CancellationToken,
}

impl PlaybackHandle {
    pub fn new(gate: GateHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            gate,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel first, then close: the pump must observe the cancellation
    /// before it sees the closed gate as end-of-stream.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.gate.close();
    }
}

#[derive(Clone, Default)]
pub struct GateRegistry {
    entries: Arc<DashMap<GuildId, PlaybackHandle>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` for `guild_id`. A playback already registered for
    /// the guild is stopped and returned.
    pub fn register(&self, guild_id: GuildId, handle: PlaybackHandle) -> Option<PlaybackHandle> {
        let previous = self.entries.insert(guild_id, handle);
        if let Some(prev) = &previous {
            info!("guild {guild_id}: replacing playback {} => stopping it", prev.id);
            prev.stop();
        }
        previous
    }

    pub fn get(&self, guild_id: GuildId) -> Option<PlaybackHandle> {
        self.entries.get(&guild_id).map(|e| e.value().clone())
    }

    /// Remove the entry only if it still belongs to invocation `id`.
    pub fn remove_if_current(&self, guild_id: GuildId, id: Uuid) -> bool {
        let removed = self.entries.remove_if(&guild_id, |_, h| h.id == id).is_some();
        if removed {
            debug!("guild {guild_id}: playback {id} retired from registry");
        }
        removed
    }

    /// Flip pause state. `None` when nothing plays in the guild.
    pub fn toggle_pause(&self, guild_id: GuildId) -> Option<GateState> {
        self.get(guild_id).map(|h| h.gate.toggle())
    }

    pub fn pause(&self, guild_id: GuildId) -> bool {
        self.get(guild_id).map(|h| h.gate.pause()).unwrap_or(false)
    }

    pub fn resume(&self, guild_id: GuildId) -> bool {
        self.get(guild_id).map(|h| h.gate.resume()).unwrap_or(false)
    }

    /// Cancel the guild's playback. Returns false if none was running.
    pub fn stop(&self, guild_id: GuildId) -> bool {
        match self.entries.remove(&guild_id) {
            Some((_, handle)) => {
                info!("guild {guild_id}: stopping playback {}", handle.id);
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every playback, used on shutdown.
    pub fn stop_all(&self) {
        let guilds: Vec<GuildId> = self.entries.iter().map(|e| *e.key()).collect();
        for guild_id in guilds {
            self.stop(guild_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
