use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use twilight_cache_inmemory::{InMemoryCache, ResourceType};
use twilight_gateway::{
    self as gateway, CloseFrame, Config, Event, EventTypeFlags, Intents, MessageSender, Shard, StreamExt,
};
use twilight_http::client::ClientBuilder;
use twilight_http::Client as HttpClient;

use maowtune_common::models::{ChannelId, GuildId, UserId};
use maowtune_common::traits::{ConnectionStatus, PlatformIntegration};

use crate::platforms::discord::reply::DiscordMessenger;
use crate::platforms::discord::voice::{TwilightVoiceGateway, VoiceEventHub};
use crate::Error;

/// One inbound guild text message, as handed to the command layer.
#[derive(Debug, Clone)]
pub struct DiscordMessageEvent {
    pub guild_id: Option<GuildId>,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_name: String,
    pub text: String,
}

/// Per-shard event loop: keeps the cache and the voice hub current and
/// forwards human-authored messages to `tx`.
async fn shard_runner(
    mut shard: Shard,
    tx: UnboundedSender<DiscordMessageEvent>,
    cache: Arc<InMemoryCache>,
    hub: Arc<VoiceEventHub>,
) {
    let shard_id = shard.id().number();
    info!("(ShardRunner) Shard {shard_id} started. Listening for events.");

    while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                error!("Shard {shard_id} => error receiving event: {err:?}");
                continue;
            }
        };

        cache.update(&event);
        hub.observe(&event);

        match &event {
            Event::Ready(ready) => {
                info!("Shard {shard_id} => READY as {} (ID={})", ready.user.name, ready.user.id);
            }
            Event::MessageCreate(msg) => {
                if msg.author.bot {
                    debug!("Ignoring bot message from {}", msg.author.name);
                    continue;
                }
                let _ = tx.send(DiscordMessageEvent {
                    guild_id: msg.guild_id.map(GuildId::from),
                    channel_id: msg.channel_id.into(),
                    author_id: msg.author.id.into(),
                    author_name: msg.author.name.clone(),
                    text: msg.content.clone(),
                });
            }
            _ => {
                trace!("Shard {shard_id} => unhandled event: {:?}", event.kind());
            }
        }
    }

    warn!("(ShardRunner) Shard {shard_id} event loop ended.");
}

pub struct DiscordRuntime {
    token: String,
    connection_status: ConnectionStatus,
    rx: Mutex<Option<UnboundedReceiver<DiscordMessageEvent>>>,
    shard_tasks: Vec<JoinHandle<()>>,
    shard_senders: Vec<MessageSender>,
    http: Option<Arc<HttpClient>>,
    cache: Option<Arc<InMemoryCache>>,
    hub: Arc<VoiceEventHub>,
}

impl DiscordRuntime {
    pub fn new(token: String) -> Self {
        Self {
            token,
            connection_status: ConnectionStatus::Disconnected,
            rx: Mutex::new(None),
            shard_tasks: Vec::new(),
            shard_senders: Vec::new(),
            http: None,
            cache: None,
            hub: Arc::new(VoiceEventHub::default()),
        }
    }

    /// Next inbound message; `None` once disconnected.
    pub async fn next_message_event(&self) -> Option<DiscordMessageEvent> {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(r) => r.recv().await,
            None => None,
        }
    }

    /// Voice gateway bound to this runtime's shards. Requires `connect()`.
    pub fn voice_gateway(&self) -> Result<TwilightVoiceGateway, Error> {
        let cache = self
            .cache
            .clone()
            .ok_or_else(|| Error::Platform("Discord runtime is not connected".into()))?;
        Ok(TwilightVoiceGateway::new(
            self.hub.clone(),
            cache,
            self.shard_senders.clone(),
        ))
    }

    /// Reply path for command results. Requires `connect()`.
    pub fn messenger(&self) -> Result<DiscordMessenger, Error> {
        let http = self
            .http
            .clone()
            .ok_or_else(|| Error::Platform("Discord runtime is not connected".into()))?;
        Ok(DiscordMessenger::new(http))
    }
}

#[async_trait]
impl PlatformIntegration for DiscordRuntime {
    async fn connect(&mut self) -> Result<(), Error> {
        if matches!(self.connection_status, ConnectionStatus::Connected) {
            info!("(DiscordRuntime) Already connected => skipping");
            return Ok(());
        }
        if self.token.is_empty() {
            return Err(Error::Config("Discord token is empty".into()));
        }

        let (tx, rx) = unbounded_channel::<DiscordMessageEvent>();
        *self.rx.lock().await = Some(rx);

        let http_client = Arc::new(
            ClientBuilder::new()
                .token(self.token.clone())
                .timeout(Duration::from_secs(30))
                .build(),
        );
        self.http = Some(http_client.clone());

        // Voice states are what the "play" lookup reads.
        let cache = Arc::new(
            InMemoryCache::builder()
                .resource_types(ResourceType::GUILD | ResourceType::CHANNEL | ResourceType::VOICE_STATE)
                .build(),
        );
        self.cache = Some(cache.clone());

        let config = Config::new(
            self.token.clone(),
            Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT | Intents::GUILD_VOICE_STATES,
        );

        let shards = gateway::create_recommended(&http_client, config, |_, b| b.build())
            .await
            .map_err(|e| Error::Platform(format!("create_recommended error: {e}")))?;

        for shard in shards {
            self.shard_senders.push(shard.sender());
            let handle = tokio::spawn(shard_runner(shard, tx.clone(), cache.clone(), self.hub.clone()));
            self.shard_tasks.push(handle);
        }
        info!("(DiscordRuntime) {} shard(s) started", self.shard_tasks.len());

        self.connection_status = ConnectionStatus::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        self.connection_status = ConnectionStatus::Disconnected;

        for sender in &self.shard_senders {
            let _ = sender.close(CloseFrame::NORMAL);
        }
        for task in &mut self.shard_tasks {
            let _ = task.await;
        }

        self.shard_senders.clear();
        self.shard_tasks.clear();
        *self.rx.lock().await = None;

        Ok(())
    }

    async fn get_connection_status(&self) -> Result<ConnectionStatus, Error> {
        Ok(self.connection_status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconnected_runtime() {
        let mut runtime = DiscordRuntime::new(String::new());
        assert_eq!(
            runtime.get_connection_status().await.unwrap(),
            ConnectionStatus::Disconnected
        );
        assert!(runtime.voice_gateway().is_err());
        assert!(runtime.messenger().is_err());
        assert!(runtime.next_message_event().await.is_none());
        assert!(matches!(runtime.connect().await, Err(Error::Config(_))));
    }
}
