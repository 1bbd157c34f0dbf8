// File: maowtune-core/src/voice/session.rs
//
// Actor owning the process-wide voice session. Command handlers never touch
// session state directly; they send a request and wait for the reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use maowtune_common::models::{ChannelId, GuildId, SessionStatus, UserId};
use maowtune_common::traits::{VoiceGateway, VoiceTransport};

use crate::Error;

type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// Requests handled by the session actor, one at a time.
pub enum SessionRequest {
    Initialize(Reply<()>),
    /// Join whatever voice channel `user_id` is in.
    Join {
        guild_id: GuildId,
        user_id: UserId,
        reply: Reply<Arc<dyn VoiceTransport>>,
    },
    JoinChannel {
        guild_id: GuildId,
        channel_id: ChannelId,
        reply: Reply<Arc<dyn VoiceTransport>>,
    },
    Leave(Reply<()>),
    Status(oneshot::Sender<SessionStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct SessionControllerConfig {
    /// Pause after every mutating request before the next is accepted.
    pub cooldown: Duration,
    pub queue_size: usize,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl Default for SessionControllerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(250),
            queue_size: 32,
            self_mute: false,
            self_deaf: true,
        }
    }
}

#[derive(Default)]
struct Session {
    guild_id: Option<GuildId>,
    channel_id: Option<ChannelId>,
    transport: Option<Arc<dyn VoiceTransport>>,
}

struct SessionActor {
    gateway: Arc<dyn VoiceGateway>,
    config: SessionControllerConfig,
    session: Option<Session>,
}

/// Cloneable handle to the session actor.
#[derive(Clone)]
pub struct SessionController {
    cmd_tx: mpsc::Sender<SessionRequest>,
}

impl SessionController {
    /// Start the actor. It stops once every handle is dropped or on
    /// [`SessionController::shutdown`].
    pub fn spawn(
        gateway: Arc<dyn VoiceGateway>,
        config: SessionControllerConfig,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.queue_size.max(1));
        let actor = SessionActor {
            gateway,
            config,
            session: None,
        };
        let handle = tokio::spawn(actor.run(cmd_rx));
        (Self { cmd_tx }, handle)
    }

    pub async fn initialize(&self) -> Result<(), Error> {
        self.request(SessionRequest::Initialize).await
    }

    pub async fn join(&self, guild_id: GuildId, user_id: UserId) -> Result<Arc<dyn VoiceTransport>, Error> {
        self.request(|reply| SessionRequest::Join {
            guild_id,
            user_id,
            reply,
        })
        .await
    }

    pub async fn join_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceTransport>, Error> {
        self.request(|reply| SessionRequest::JoinChannel {
            guild_id,
            channel_id,
            reply,
        })
        .await
    }

    pub async fn leave(&self) -> Result<(), Error> {
        self.request(SessionRequest::Leave).await
    }

    pub async fn status(&self) -> Result<SessionStatus, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionRequest::Status(reply_tx)).await?;
        reply_rx.await.map_err(|_| Error::ControllerGone)
    }

    /// Transport of the current voice connection, if any.
    pub async fn transport(&self) -> Result<Option<Arc<dyn VoiceTransport>>, Error> {
        Ok(self.status().await?.transport)
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionRequest::Shutdown(reply_tx)).await?;
        reply_rx.await.map_err(|_| Error::ControllerGone)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionRequest) -> Result<T, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        match reply_rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::ControllerGone),
        }
    }

    async fn send(&self, request: SessionRequest) -> Result<(), Error> {
        self.cmd_tx
            .send(request)
            .await
            .map_err(|_| Error::ControllerGone)
    }
}

impl SessionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionRequest>) {
        info!("session controller started (cooldown={:?})", self.config.cooldown);

        while let Some(request) = cmd_rx.recv().await {
            match request {
                SessionRequest::Initialize(reply) => {
                    let res = self.initialize().await;
                    let _ = reply.send(res);
                }
                SessionRequest::Join {
                    guild_id,
                    user_id,
                    reply,
                } => {
                    let res = self.join(guild_id, user_id).await;
                    let _ = reply.send(res);
                }
                SessionRequest::JoinChannel {
                    guild_id,
                    channel_id,
                    reply,
                } => {
                    let res = self.join_channel(guild_id, channel_id).await;
                    let _ = reply.send(res);
                }
                SessionRequest::Leave(reply) => {
                    let res = self.leave().await;
                    let _ = reply.send(res);
                }
                SessionRequest::Status(reply) => {
                    let _ = reply.send(self.status());
                    continue;
                }
                SessionRequest::Shutdown(reply) => {
                    info!("session controller shutting down.");
                    let _ = reply.send(());
                    return;
                }
            }

            trace!("session controller cooling down for {:?}", self.config.cooldown);
            sleep(self.config.cooldown).await;
        }

        info!("session controller: all handles dropped => exiting.");
    }

    async fn initialize(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            debug!("initialize: session already exists");
            return Ok(());
        }
        self.gateway.open_session().await.map_err(|e| match e {
            Error::SessionInit(_) => e,
            other => Error::SessionInit(other.to_string()),
        })?;
        self.session = Some(Session::default());
        info!("voice session initialized");
        Ok(())
    }

    async fn join(&mut self, guild_id: GuildId, user_id: UserId) -> Result<Arc<dyn VoiceTransport>, Error> {
        if self.session.is_none() {
            return Err(Error::NoSession("join requested before initialize".into()));
        }
        let channel_id = self
            .gateway
            .voice_channel_of(guild_id, user_id)
            .await
            .map_err(|e| match e {
                Error::VoiceStateLookup(_) => e,
                other => Error::VoiceStateLookup(other.to_string()),
            })?;
        debug!("guild {guild_id}: user {user_id} is in channel {channel_id}");
        self.join_channel(guild_id, channel_id).await
    }

    async fn join_channel(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceTransport>, Error> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::NoSession("join requested before initialize".into()));
        };

        if session.guild_id == Some(guild_id) && session.channel_id == Some(channel_id) {
            if let Some(transport) = &session.transport {
                debug!("guild {guild_id}: already joined to channel {channel_id}");
                return Ok(transport.clone());
            }
        }

        // One session, one voice connection: leave the old guild first.
        if let Some(old_guild) = session.guild_id.filter(|g| *g != guild_id) {
            info!("moving voice session from guild {old_guild} to {guild_id}");
            if let Err(e) = self.gateway.leave_channel(old_guild).await {
                warn!("guild {old_guild}: leave before move failed: {e}");
            }
            session.guild_id = None;
            session.channel_id = None;
            session.transport = None;
        }

        let transport = self
            .gateway
            .join_channel(guild_id, channel_id, self.config.self_mute, self.config.self_deaf)
            .await
            .map_err(|e| match e {
                Error::Join(_) => e,
                other => Error::Join(other.to_string()),
            })?;

        session.guild_id = Some(guild_id);
        session.channel_id = Some(channel_id);
        session.transport = Some(transport.clone());
        info!("guild {guild_id}: joined voice channel {channel_id}");
        Ok(transport)
    }

    async fn leave(&mut self) -> Result<(), Error> {
        let Some(session) = self.session.as_ref() else {
            return Err(Error::SessionLeave("no voice session exists".into()));
        };
        let Some(guild_id) = session.guild_id else {
            debug!("leave: session is not in a voice channel");
            return Ok(());
        };

        self.gateway.leave_channel(guild_id).await.map_err(|e| match e {
            Error::SessionLeave(_) => e,
            other => Error::SessionLeave(other.to_string()),
        })?;
        self.session = None;
        info!("guild {guild_id}: left voice channel");
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        match &self.session {
            None => SessionStatus::default(),
            Some(s) => SessionStatus {
                initialized: true,
                guild_id: s.guild_id,
                channel_id: s.channel_id,
                transport: s.transport.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fakes::{GatewayCall, RecordingGateway};
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use mockall::mock;
    use tokio::time::Instant;

    mock! {
        pub Gateway {}

        #[async_trait]
        impl VoiceGateway for Gateway {
            async fn open_session(&self) -> Result<(), Error>;
            async fn voice_channel_of(&self, guild_id: GuildId, user_id: UserId) -> Result<ChannelId, Error>;
            async fn join_channel(
                &self,
                guild_id: GuildId,
                channel_id: ChannelId,
                self_mute: bool,
                self_deaf: bool,
            ) -> Result<Arc<dyn VoiceTransport>, Error>;
            async fn leave_channel(&self, guild_id: GuildId) -> Result<(), Error>;
        }
    }

    fn quick() -> SessionControllerConfig {
        SessionControllerConfig {
            cooldown: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_user_not_in_channel_is_a_lookup_error() {
        let mut gw = MockGateway::new();
        gw.expect_open_session().times(1).returning(|| Ok(()));
        gw.expect_voice_channel_of()
            .times(1)
            .returning(|_, _| Err(Error::Platform("no voice state cached".into())));
        gw.expect_join_channel().never();

        let (ctl, _task) = SessionController::spawn(Arc::new(gw), quick());
        ctl.initialize().await.unwrap();
        let err = ctl.join(GuildId(1), UserId(2)).await.err().unwrap();
        assert!(matches!(err, Error::VoiceStateLookup(_)));
        assert!(!ctl.status().await.unwrap().is_connected_to(GuildId(1)));
    }

    #[tokio::test]
    async fn test_leave_without_session_fails() {
        let mut gw = MockGateway::new();
        gw.expect_leave_channel().never();

        let (ctl, _task) = SessionController::spawn(Arc::new(gw), quick());
        let err = ctl.leave().await.err().unwrap();
        assert!(matches!(err, Error::SessionLeave(_)));
    }

    #[tokio::test]
    async fn test_initialize_failure_is_wrapped() {
        let mut gw = MockGateway::new();
        gw.expect_open_session()
            .times(1)
            .returning(|| Err(Error::Platform("shard not ready".into())));

        let (ctl, _task) = SessionController::spawn(Arc::new(gw), quick());
        let err = ctl.initialize().await.err().unwrap();
        assert!(matches!(err, Error::SessionInit(_)));
        assert!(!ctl.status().await.unwrap().initialized);
    }

    #[tokio::test]
    async fn test_join_before_initialize_reports_no_session() {
        let gw = Arc::new(RecordingGateway::new());
        let (ctl, _task) = SessionController::spawn(gw.clone(), quick());
        let err = ctl.join_channel(GuildId(1), ChannelId(2)).await.err().unwrap();
        assert!(matches!(err, Error::NoSession(_)));
        assert!(gw.calls().is_empty());
    }

    #[tokio::test]
    async fn test_join_uses_the_users_channel_and_deafens() {
        let gw = Arc::new(RecordingGateway::new().with_user_in(GuildId(10), UserId(20), ChannelId(30)));
        let (ctl, _task) = SessionController::spawn(gw.clone(), quick());

        ctl.initialize().await.unwrap();
        ctl.join(GuildId(10), UserId(20)).await.unwrap();

        let status = ctl.status().await.unwrap();
        assert!(status.is_connected_to(GuildId(10)));
        assert_eq!(status.channel_id, Some(ChannelId(30)));
        assert_eq!(
            gw.calls(),
            vec![
                GatewayCall::OpenSession,
                GatewayCall::Lookup(GuildId(10), UserId(20)),
                GatewayCall::Join {
                    guild_id: GuildId(10),
                    channel_id: ChannelId(30),
                    self_mute: false,
                    self_deaf: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialized_in_submission_order() {
        let gw = Arc::new(RecordingGateway::new().with_delay(Duration::from_millis(5)));
        let (ctl, _task) = SessionController::spawn(gw.clone(), quick());
        ctl.initialize().await.unwrap();

        const N: u64 = 8;
        let joins = (1..=N).map(|i| {
            let ctl = ctl.clone();
            async move { ctl.join_channel(GuildId(1), ChannelId(i)).await }
        });
        for res in join_all(joins).await {
            res.unwrap();
        }

        assert_eq!(gw.max_in_flight(), 1);
        let channels: Vec<u64> = gw
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Join { channel_id, .. } => Some(channel_id.get()),
                _ => None,
            })
            .collect();
        assert_eq!(channels, (1..=N).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_moving_guilds_leaves_the_old_one_first() {
        let gw = Arc::new(RecordingGateway::new());
        let (ctl, _task) = SessionController::spawn(gw.clone(), quick());
        ctl.initialize().await.unwrap();
        ctl.join_channel(GuildId(1), ChannelId(11)).await.unwrap();
        ctl.join_channel(GuildId(2), ChannelId(22)).await.unwrap();

        let calls = gw.calls();
        assert_eq!(calls[2], GatewayCall::Leave(GuildId(1)));
        assert!(ctl.status().await.unwrap().is_connected_to(GuildId(2)));
    }

    #[tokio::test]
    async fn test_leave_destroys_the_session() {
        let gw = Arc::new(RecordingGateway::new());
        let (ctl, _task) = SessionController::spawn(gw.clone(), quick());
        ctl.initialize().await.unwrap();
        ctl.join_channel(GuildId(5), ChannelId(6)).await.unwrap();

        ctl.leave().await.unwrap();
        assert!(!ctl.status().await.unwrap().initialized);
        assert!(matches!(ctl.leave().await, Err(Error::SessionLeave(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_follows_each_request() {
        let gw = Arc::new(RecordingGateway::new());
        let (ctl, _task) = SessionController::spawn(gw, SessionControllerConfig::default());

        let start = Instant::now();
        ctl.initialize().await.unwrap();
        ctl.initialize().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_actor() {
        let gw = Arc::new(RecordingGateway::new());
        let (ctl, task) = SessionController::spawn(gw, quick());
        ctl.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(ctl.initialize().await, Err(Error::ControllerGone)));
    }
}
