// File: maowtune-core/src/platforms/discord/voice.rs
//
// Discord side of joining voice: the main gateway carries the voice state
// and voice server updates, which are fanned out here so a join can wait
// for both halves of its connection info.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use twilight_cache_inmemory::InMemoryCache;
use twilight_gateway::{Event, MessageSender};
use twilight_model::gateway::payload::outgoing::UpdateVoiceState;
use twilight_model::id::marker::ChannelMarker;
use twilight_model::id::Id;

use maowtune_common::models::{ChannelId, GuildId, UserId, VoiceConnectionInfo};
use maowtune_common::traits::{VoiceGateway, VoiceTransport};

use crate::voice::DiscordVoiceConnection;
use crate::Error;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    StateUpdate {
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
        session_id: String,
    },
    ServerUpdate {
        guild_id: GuildId,
        endpoint: Option<String>,
        token: String,
    },
}

/// Fan-out of voice-related gateway events plus the bot's own user id.
pub struct VoiceEventHub {
    events: broadcast::Sender<VoiceEvent>,
    bot_user: watch::Sender<Option<UserId>>,
}

impl VoiceEventHub {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (bot_user, _) = watch::channel(None);
        Self { events, bot_user }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: VoiceEvent) {
        // No subscribers simply means nobody is joining right now.
        let _ = self.events.send(event);
    }

    pub fn set_bot_user(&self, user_id: UserId) {
        self.bot_user.send_replace(Some(user_id));
    }

    pub fn bot_user(&self) -> Option<UserId> {
        *self.bot_user.borrow()
    }

    /// Wait until READY has told us who we are.
    pub async fn wait_for_bot_user(&self, timeout: Duration) -> Result<UserId, Error> {
        let mut rx = self.bot_user.subscribe();
        let user = tokio::time::timeout(timeout, rx.wait_for(|u| u.is_some()))
            .await?
            .map(|u| *u)
            .map_err(|_| Error::Platform("voice event hub dropped".into()))?;
        user.ok_or_else(|| Error::Platform("bot user missing after READY".into()))
    }

    /// Feed one gateway event through the hub.
    pub fn observe(&self, event: &Event) {
        match event {
            Event::Ready(ready) => {
                self.set_bot_user(UserId::from(ready.user.id));
            }
            Event::VoiceStateUpdate(update) => {
                let state = &update.0;
                let Some(guild_id) = state.guild_id else {
                    return;
                };
                self.publish(VoiceEvent::StateUpdate {
                    guild_id: guild_id.into(),
                    user_id: state.user_id.into(),
                    channel_id: state.channel_id.map(ChannelId::from),
                    session_id: state.session_id.clone(),
                });
            }
            Event::VoiceServerUpdate(update) => {
                self.publish(VoiceEvent::ServerUpdate {
                    guild_id: update.guild_id.into(),
                    endpoint: update.endpoint.clone(),
                    token: update.token.clone(),
                });
            }
            _ => {}
        }
    }
}

impl Default for VoiceEventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Collect the bot's session id and the guild's voice server from `rx`.
pub async fn await_connection_info(
    mut rx: broadcast::Receiver<VoiceEvent>,
    guild_id: GuildId,
    bot_user: UserId,
    timeout: Duration,
) -> Result<VoiceConnectionInfo, Error> {
    let collect = async {
        let mut session_id: Option<String> = None;
        let mut server: Option<(String, String)> = None;
        loop {
            match rx.recv().await {
                Ok(VoiceEvent::StateUpdate {
                    guild_id: g,
                    user_id,
                    channel_id: Some(_),
                    session_id: sid,
                }) if g == guild_id && user_id == bot_user => {
                    session_id = Some(sid);
                }
                Ok(VoiceEvent::ServerUpdate {
                    guild_id: g,
                    endpoint: Some(endpoint),
                    token,
                }) if g == guild_id => {
                    server = Some((endpoint, token));
                }
                Ok(other) => trace!("ignoring voice event {other:?}"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("voice event hub lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Join("voice event hub closed".into()));
                }
            }

            if let (Some(sid), Some((endpoint, token))) = (&session_id, &server) {
                return Ok(VoiceConnectionInfo {
                    guild_id,
                    user_id: bot_user,
                    session_id: sid.clone(),
                    endpoint: endpoint.clone(),
                    token: token.clone(),
                });
            }
        }
    };

    tokio::time::timeout(timeout, collect)
        .await
        .map_err(|_| Error::Join(format!("guild {guild_id}: no voice server within {timeout:?}")))?
}

/// `VoiceGateway` backed by twilight shards and the in-memory cache.
pub struct TwilightVoiceGateway {
    hub: Arc<VoiceEventHub>,
    cache: Arc<InMemoryCache>,
    senders: Vec<MessageSender>,
    connections: DashMap<GuildId, Arc<DiscordVoiceConnection>>,
    handshake_timeout: Duration,
}

impl TwilightVoiceGateway {
    pub fn new(hub: Arc<VoiceEventHub>, cache: Arc<InMemoryCache>, senders: Vec<MessageSender>) -> Self {
        Self {
            hub,
            cache,
            senders,
            connections: DashMap::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Voice state updates must go out on the shard owning the guild.
    fn sender_for(&self, guild_id: GuildId) -> Result<&MessageSender, Error> {
        if self.senders.is_empty() {
            return Err(Error::Platform("no gateway shards are running".into()));
        }
        let shard = shard_for(guild_id, self.senders.len() as u64);
        Ok(&self.senders[shard])
    }
}

pub fn shard_for(guild_id: GuildId, total: u64) -> usize {
    ((guild_id.get() >> 22) % total.max(1)) as usize
}

#[async_trait]
impl VoiceGateway for TwilightVoiceGateway {
    async fn open_session(&self) -> Result<(), Error> {
        if self.senders.is_empty() {
            return Err(Error::SessionInit("gateway is not connected".into()));
        }
        let user = self
            .hub
            .wait_for_bot_user(self.handshake_timeout)
            .await
            .map_err(|e| Error::SessionInit(format!("gateway never became ready: {e}")))?;
        info!("voice session ready for bot user {user}");
        Ok(())
    }

    async fn voice_channel_of(&self, guild_id: GuildId, user_id: UserId) -> Result<ChannelId, Error> {
        let state = self
            .cache
            .voice_state(user_id.to_twilight()?, guild_id.to_twilight()?)
            .ok_or_else(|| {
                Error::VoiceStateLookup(format!("user {user_id} is not in a voice channel in guild {guild_id}"))
            })?;
        Ok(state.channel_id().into())
    }

    async fn join_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<Arc<dyn VoiceTransport>, Error> {
        let bot_user = self
            .hub
            .bot_user()
            .ok_or_else(|| Error::Join("bot user is not known yet".into()))?;

        // Subscribe before asking so neither update can slip past.
        let rx = self.hub.subscribe();
        let update = UpdateVoiceState::new(guild_id.to_twilight()?, Some(channel_id.to_twilight()?), self_deaf, self_mute);
        self.sender_for(guild_id)?
            .command(&update)
            .map_err(|e| Error::Join(format!("voice state update not sent: {e}")))?;
        debug!("guild {guild_id}: requested voice channel {channel_id}");

        let info = await_connection_info(rx, guild_id, bot_user, self.handshake_timeout).await?;
        if let Some((_, old)) = self.connections.remove(&guild_id) {
            old.close();
        }
        let connection = DiscordVoiceConnection::connect(info)
            .await
            .map_err(|e| Error::Join(e.to_string()))?;
        let connection = Arc::new(connection);
        self.connections.insert(guild_id, connection.clone());
        Ok(connection)
    }

    async fn leave_channel(&self, guild_id: GuildId) -> Result<(), Error> {
        if let Some((_, connection)) = self.connections.remove(&guild_id) {
            connection.close();
        }
        let update = UpdateVoiceState::new(guild_id.to_twilight()?, None::<Id<ChannelMarker>>, false, false);
        self.sender_for(guild_id)?
            .command(&update)
            .map_err(|e| Error::SessionLeave(format!("voice state update not sent: {e}")))?;
        info!("guild {guild_id}: left voice");
        Ok(())
    }
}
