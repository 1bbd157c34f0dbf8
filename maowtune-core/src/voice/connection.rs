// File: maowtune-core/src/voice/connection.rs
//
// Discord voice gateway (v8) client: websocket handshake, heartbeats, UDP IP
// discovery and the encrypted RTP send path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use maowtune_common::models::{GuildId, VoiceConnectionInfo};
use maowtune_common::traits::VoiceTransport;

use crate::voice::rtp::{RtpSealer, ENCRYPTION_MODE};
use crate::Error;

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

mod op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const HELLO: u8 = 8;
}

#[derive(Serialize, Deserialize, Debug)]
struct VoiceGatewayMessage {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<i64>,
}

impl VoiceGatewayMessage {
    fn new(op: u8, d: Value) -> Self {
        Self { op, d, seq: None }
    }

    fn into_ws(self) -> Result<Message, Error> {
        Ok(Message::Text(serde_json::to_string(&self)?.into()))
    }
}

fn transport_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Transport(format!("{context}: {e}"))
}

/// Websocket URL for an endpoint as reported by `VOICE_SERVER_UPDATE`.
pub fn gateway_url(endpoint: &str) -> String {
    let host = endpoint
        .trim_start_matches("wss://")
        .trim_end_matches('/');
    format!("wss://{host}/?v=8")
}

/// Parse the 74-byte IP discovery response into (address, port).
pub fn parse_discovery_response(buf: &[u8]) -> Result<(String, u16), Error> {
    if buf.len() < 74 {
        return Err(Error::Transport(format!(
            "IP discovery response too short ({} bytes)",
            buf.len()
        )));
    }
    let address = std::str::from_utf8(&buf[8..72])
        .map_err(transport_err("IP discovery address"))?
        .trim_matches('\0')
        .to_string();
    let port = u16::from_be_bytes([buf[72], buf[73]]);
    Ok((address, port))
}

struct Ready {
    ssrc: u32,
    addr: SocketAddr,
}

/// One joined voice connection. Dropping it stops the background tasks.
pub struct DiscordVoiceConnection {
    guild_id: GuildId,
    ssrc: u32,
    socket: UdpSocket,
    sealer: Mutex<RtpSealer>,
    ws_tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscordVoiceConnection {
    pub async fn connect(info: VoiceConnectionInfo) -> Result<Self, Error> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::handshake(info))
            .await
            .map_err(|_| Error::Transport("voice handshake timed out".into()))?
    }

    async fn handshake(info: VoiceConnectionInfo) -> Result<Self, Error> {
        let url = gateway_url(&info.endpoint);
        debug!("guild {}: connecting to voice gateway {url}", info.guild_id);

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(transport_err("voice websocket connect"))?;
        let (mut write, mut read) = ws_stream.split();

        let cancel = CancellationToken::new();
        let seq_ack = Arc::new(AtomicI64::new(-1));
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!("voice websocket write error: {e}");
                    break;
                }
            }
        }));

        let identify = VoiceGatewayMessage::new(
            op::IDENTIFY,
            json!({
                "server_id": info.guild_id.to_string(),
                "user_id": info.user_id.to_string(),
                "session_id": info.session_id,
                "token": info.token,
                "max_dave_protocol_version": 0,
            }),
        );
        send(&ws_tx, identify)?;

        let mut ready: Option<Ready> = None;
        let mut socket: Option<UdpSocket> = None;

        let secret_key = loop {
            let msg = next_message(&mut read, &seq_ack).await?;
            match msg.op {
                op::HELLO => {
                    let interval = msg.d["heartbeat_interval"]
                        .as_f64()
                        .map(|ms| Duration::from_millis(ms as u64))
                        .unwrap_or(Duration::from_secs(30));
                    trace!("voice hello, heartbeat every {interval:?}");
                    tasks.push(spawn_heartbeat(
                        ws_tx.clone(),
                        seq_ack.clone(),
                        interval,
                        cancel.clone(),
                    ));
                }
                op::READY => {
                    let r = parse_ready(&msg.d)?;
                    let udp = UdpSocket::bind("0.0.0.0:0")
                        .await
                        .map_err(transport_err("udp bind"))?;
                    udp.connect(r.addr).await.map_err(transport_err("udp connect"))?;
                    let (address, port) = discover_ip(&udp, r.ssrc).await?;
                    debug!("voice ready: ssrc={} server={} local={address}:{port}", r.ssrc, r.addr);

                    let select = VoiceGatewayMessage::new(
                        op::SELECT_PROTOCOL,
                        json!({
                            "protocol": "udp",
                            "data": { "address": address, "port": port, "mode": ENCRYPTION_MODE },
                        }),
                    );
                    send(&ws_tx, select)?;
                    ready = Some(r);
                    socket = Some(udp);
                }
                op::SESSION_DESCRIPTION => {
                    let key: Vec<u8> = msg.d["secret_key"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|b| b as u8).collect())
                        .unwrap_or_default();
                    break key;
                }
                other => trace!("voice op {other} during handshake"),
            }
        };

        let (Some(ready), Some(socket)) = (ready, socket) else {
            return Err(Error::Transport("session description arrived before ready".into()));
        };
        let sealer = RtpSealer::new(&secret_key, ready.ssrc)?;

        tasks.push(spawn_reader(read, seq_ack, info.guild_id, cancel.clone()));
        info!("guild {}: voice connection established (ssrc={})", info.guild_id, ready.ssrc);

        Ok(Self {
            guild_id: info.guild_id,
            ssrc: ready.ssrc,
            socket,
            sealer: Mutex::new(sealer),
            ws_tx,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Stop heartbeats and close the websocket.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let _ = self.ws_tx.send(Message::Close(None));
        for task in self.tasks.lock().drain(..) {
            // The writer gets a moment to flush the close frame.
            tokio::spawn(async move {
                let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
            });
        }
        debug!("guild {}: voice connection closed", self.guild_id);
    }
}

impl Drop for DiscordVoiceConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl VoiceTransport for DiscordVoiceConnection {
    fn reset_frequency(&self, frame_duration: Duration, samples_per_frame: u32) {
        debug!(
            "guild {}: frame duration {frame_duration:?}, {samples_per_frame} samples per frame",
            self.guild_id
        );
        self.sealer.lock().set_samples_per_frame(samples_per_frame);
    }

    async fn set_speaking(&self, speaking: bool) -> Result<(), Error> {
        let msg = VoiceGatewayMessage::new(
            op::SPEAKING,
            json!({ "speaking": if speaking { 1 } else { 0 }, "delay": 0, "ssrc": self.ssrc }),
        );
        send(&self.ws_tx, msg).map_err(|e| Error::Speaking(e.to_string()))
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Transport("voice connection is closed".into()));
        }
        let packet = self.sealer.lock().seal(frame)?;
        self.socket
            .send(&packet)
            .await
            .map_err(transport_err("udp send"))?;
        Ok(())
    }
}

fn send(ws_tx: &mpsc::UnboundedSender<Message>, msg: VoiceGatewayMessage) -> Result<(), Error> {
    ws_tx
        .send(msg.into_ws()?)
        .map_err(|_| Error::Transport("voice websocket writer has stopped".into()))
}

async fn next_message(read: &mut WsRead, seq_ack: &AtomicI64) -> Result<VoiceGatewayMessage, Error> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let msg: VoiceGatewayMessage = match serde_json::from_str(text.as_str()) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("unparseable voice gateway message: {e}");
                        continue;
                    }
                };
                if let Some(seq) = msg.seq {
                    seq_ack.store(seq, Ordering::Relaxed);
                }
                return Ok(msg);
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(Error::Transport(format!("voice gateway closed: {frame:?}")));
            }
            // Binary frames carry DAVE opcodes, which are not negotiated.
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Error::Transport(format!("voice websocket read: {e}"))),
            None => return Err(Error::Transport("voice websocket ended".into())),
        }
    }
}

fn parse_ready(d: &Value) -> Result<Ready, Error> {
    let ssrc = d["ssrc"]
        .as_u64()
        .ok_or_else(|| Error::Transport("ready without ssrc".into()))? as u32;
    let ip = d["ip"].as_str().unwrap_or_default();
    let port = d["port"].as_u64().unwrap_or_default() as u16;
    let addr: SocketAddr = format!("{ip}:{port}")
        .parse()
        .map_err(transport_err("voice server address"))?;

    let supported = d["modes"]
        .as_array()
        .map(|modes| modes.iter().any(|m| m.as_str() == Some(ENCRYPTION_MODE)))
        .unwrap_or(false);
    if !supported {
        return Err(Error::Transport(format!(
            "voice server does not offer {ENCRYPTION_MODE}"
        )));
    }
    Ok(Ready { ssrc, addr })
}

async fn discover_ip(socket: &UdpSocket, ssrc: u32) -> Result<(String, u16), Error> {
    let mut packet = [0u8; 74];
    packet[0..2].copy_from_slice(&1u16.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    socket.send(&packet).await.map_err(transport_err("IP discovery send"))?;

    let mut buf = [0u8; 74];
    let n = tokio::time::timeout(DISCOVERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Transport("IP discovery timed out".into()))?
        .map_err(transport_err("IP discovery recv"))?;
    parse_discovery_response(&buf[..n])
}

fn spawn_heartbeat(
    ws_tx: mpsc::UnboundedSender<Message>,
    seq_ack: Arc<AtomicI64>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default();
                    let hb = VoiceGatewayMessage::new(
                        op::HEARTBEAT,
                        json!({ "t": now, "seq_ack": seq_ack.load(Ordering::Relaxed) }),
                    );
                    if send(&ws_tx, hb).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_reader(
    mut read: WsRead,
    seq_ack: Arc<AtomicI64>,
    guild_id: GuildId,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = next_message(&mut read, &seq_ack) => msg,
            };
            match msg {
                Ok(m) if m.op == op::HEARTBEAT_ACK => trace!("guild {guild_id}: voice heartbeat ack"),
                Ok(m) => trace!("guild {guild_id}: voice op {}", m.op),
                Err(e) => {
                    warn!("guild {guild_id}: voice gateway lost => {e}");
                    cancel.cancel();
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_normalizes_endpoint() {
        assert_eq!(gateway_url("us-east123.discord.media:443"), "wss://us-east123.discord.media:443/?v=8");
        assert_eq!(gateway_url("wss://c-ams.discord.media/"), "wss://c-ams.discord.media/?v=8");
    }

    #[test]
    fn test_discovery_response_parsing() {
        let mut buf = [0u8; 74];
        buf[0..2].copy_from_slice(&2u16.to_be_bytes());
        buf[8..8 + 11].copy_from_slice(b"203.0.113.9");
        buf[72..74].copy_from_slice(&50004u16.to_be_bytes());

        let (address, port) = parse_discovery_response(&buf).unwrap();
        assert_eq!(address, "203.0.113.9");
        assert_eq!(port, 50004);
        assert!(parse_discovery_response(&buf[..40]).is_err());
    }

    #[test]
    fn test_ready_requires_rtpsize_gcm() {
        let ok = json!({"ssrc": 42, "ip": "127.0.0.1", "port": 5000, "modes": ["aead_aes256_gcm_rtpsize"]});
        let r = parse_ready(&ok).unwrap();
        assert_eq!(r.ssrc, 42);
        assert_eq!(r.addr.port(), 5000);

        let legacy = json!({"ssrc": 42, "ip": "127.0.0.1", "port": 5000, "modes": ["xsalsa20_poly1305"]});
        assert!(matches!(parse_ready(&legacy), Err(Error::Transport(_))));
    }

    #[test]
    fn test_outbound_messages_omit_seq() {
        let msg = VoiceGatewayMessage::new(op::SPEAKING, json!({"speaking": 1}));
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"op":5,"d":{"speaking":1}}"#);
    }
}
