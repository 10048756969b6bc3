//! Gateway voice-state cache
//!
//! REST answers voice state one member at a time and only for members we
//! already know about. Channel occupancy has to include everyone, so a
//! gateway session subscribed to voice-state events keeps a per-guild view of
//! who sits where.
//!
//! The view is only trusted while the session is synced: from the guild's
//! `GUILD_CREATE` (which carries the full voice-state list) until the
//! connection drops. Outside that window [`VoiceStateCache::occupancy`]
//! returns `None` and callers must treat occupancy as unknown.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::types::{ChannelId, GuildId, MemberId};

/// GUILDS | GUILD_VOICE_STATES
pub const GATEWAY_INTENTS: u64 = (1 << 0) | (1 << 7);

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

const HELLO_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Close codes after which reconnecting cannot help
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    pub intents: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    Socket(String),

    #[error("Gateway closed the connection (code {0:?})")]
    Closed(Option<u16>),

    #[error("Gateway refused the session (code {code}): {reason}")]
    Fatal { code: u16, reason: String },

    #[error("Gateway protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Socket(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GatewayFrame {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoiceStateData {
    #[serde(default)]
    guild_id: Option<GuildId>,
    user_id: MemberId,
    #[serde(default)]
    channel_id: Option<ChannelId>,
}

#[derive(Debug, Deserialize)]
struct GuildData {
    id: GuildId,
    #[serde(default)]
    unavailable: bool,
    #[serde(default)]
    voice_states: Vec<VoiceStateData>,
}

/// Who is connected to which voice channel in one guild
pub struct VoiceStateCache {
    guild: GuildId,
    states: DashMap<MemberId, ChannelId>,
    synced: AtomicBool,
}

impl VoiceStateCache {
    pub fn new(guild: GuildId) -> Self {
        Self {
            guild,
            states: DashMap::new(),
            synced: AtomicBool::new(false),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Channel of `member`, or `None` while the cache is not synced.
    pub fn channel_of(&self, member: MemberId) -> Option<Option<ChannelId>> {
        if !self.is_synced() {
            return None;
        }
        Some(self.states.get(&member).map(|entry| *entry))
    }

    /// Connected members per channel, or `None` while the cache is not synced.
    pub fn occupancy(&self) -> Option<HashMap<ChannelId, usize>> {
        if !self.is_synced() {
            return None;
        }
        let mut counts = HashMap::new();
        for entry in self.states.iter() {
            *counts.entry(*entry.value()).or_insert(0) += 1;
        }
        Some(counts)
    }

    /// Forget everything until the next full guild snapshot.
    pub fn desync(&self) {
        self.synced.store(false, Ordering::Release);
        self.states.clear();
    }

    /// Apply one dispatch event.
    pub fn apply(&self, event: &str, data: &Value) {
        match event {
            "GUILD_CREATE" => {
                let Ok(guild) = GuildData::deserialize(data) else {
                    warn!("Unreadable GUILD_CREATE payload");
                    return;
                };
                if guild.id != self.guild || guild.unavailable {
                    return;
                }
                self.states.clear();
                for state in guild.voice_states {
                    if let Some(channel) = state.channel_id {
                        self.states.insert(state.user_id, channel);
                    }
                }
                self.synced.store(true, Ordering::Release);
                info!(guild = %self.guild, connected = self.states.len(), "Voice states synced");
            }
            "GUILD_DELETE" => {
                if GuildData::deserialize(data).is_ok_and(|guild| guild.id == self.guild) {
                    warn!(guild = %self.guild, "Guild became unavailable");
                    self.desync();
                }
            }
            "VOICE_STATE_UPDATE" => {
                let Ok(state) = VoiceStateData::deserialize(data) else {
                    warn!("Unreadable VOICE_STATE_UPDATE payload");
                    return;
                };
                if state.guild_id != Some(self.guild) {
                    return;
                }
                match state.channel_id {
                    Some(channel) => {
                        self.states.insert(state.user_id, channel);
                    }
                    None => {
                        self.states.remove(&state.user_id);
                    }
                }
            }
            _ => {}
        }
    }
}

/// What the connection loop should do after a frame
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Heartbeat,
    Reconnect,
}

/// Per-connection protocol state
struct Session {
    sequence: Option<u64>,
    acked: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            sequence: None,
            acked: true,
        }
    }

    fn heartbeat(&self) -> Message {
        Message::Text(json!({ "op": OP_HEARTBEAT, "d": self.sequence }).to_string())
    }

    fn handle(&mut self, frame: GatewayFrame, cache: &VoiceStateCache) -> Step {
        if let Some(sequence) = frame.s {
            self.sequence = Some(sequence);
        }
        match frame.op {
            OP_DISPATCH => {
                if let Some(event) = frame.t.as_deref() {
                    cache.apply(event, &frame.d);
                }
                Step::Continue
            }
            OP_HEARTBEAT => Step::Heartbeat,
            OP_HEARTBEAT_ACK => {
                self.acked = true;
                Step::Continue
            }
            OP_RECONNECT | OP_INVALID_SESSION => Step::Reconnect,
            other => {
                debug!(op = other, "Ignoring gateway frame");
                Step::Continue
            }
        }
    }
}

fn identify(config: &GatewayConfig) -> Message {
    Message::Text(
        json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": config.token,
                "intents": config.intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "proximity-bridge",
                    "device": "proximity-bridge",
                },
            },
        })
        .to_string(),
    )
}

/// Keep a gateway session open for as long as the process runs.
pub fn spawn_gateway(config: GatewayConfig, cache: Arc<VoiceStateCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        connection_loop(config, cache).await;
    })
}

async fn connection_loop(config: GatewayConfig, cache: Arc<VoiceStateCache>) {
    let mut reconnect_delay = Duration::from_secs(1);

    loop {
        info!("Connecting to gateway at {}", config.url);

        match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                let result = run_session(socket, &config, &cache).await;
                let was_synced = cache.is_synced();
                cache.desync();
                match result {
                    Err(GatewayError::Fatal { code, reason }) => {
                        error!(code, reason = %reason, "Gateway refused the session, occupancy stays unknown");
                        return;
                    }
                    Err(e) => warn!(error = %e, "Gateway session ended"),
                    Ok(()) => info!("Gateway asked for a reconnect"),
                }
                if was_synced {
                    reconnect_delay = Duration::from_secs(1);
                }
            }
            Err(e) => {
                error!("Failed to connect to gateway: {}", e);
            }
        }

        warn!("Reconnecting to gateway in {:?}...", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn run_session<S>(socket: S, config: &GatewayConfig, cache: &VoiceStateCache) -> Result<(), GatewayError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    let period = tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream))
        .await
        .map_err(|_| GatewayError::Protocol("no hello within timeout".to_string()))??;
    sink.send(identify(config)).await?;

    let mut session = Session::new();
    let jitter = period.mul_f64(rand::random::<f64>());
    let mut heartbeat = tokio::time::interval_at(Instant::now() + jitter, period);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if !session.acked {
                    return Err(GatewayError::Protocol("heartbeat not acknowledged".to_string()));
                }
                session.acked = false;
                sink.send(session.heartbeat()).await?;
            }
            message = stream.next() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<GatewayFrame>(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Unreadable gateway frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        return Err(match code {
                            Some(code) if FATAL_CLOSE_CODES.contains(&code) => GatewayError::Fatal {
                                code,
                                reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                            },
                            _ => GatewayError::Closed(code),
                        });
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(GatewayError::Closed(None)),
                };

                match session.handle(frame, cache) {
                    Step::Continue => {}
                    Step::Heartbeat => sink.send(session.heartbeat()).await?,
                    Step::Reconnect => return Ok(()),
                }
            }
        }
    }
}

async fn read_hello<S>(stream: &mut S) -> Result<Duration, GatewayError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let Message::Text(text) = message? else {
            continue;
        };
        let frame: GatewayFrame =
            serde_json::from_str(&text).map_err(|e| GatewayError::Protocol(e.to_string()))?;
        if frame.op != OP_HELLO {
            return Err(GatewayError::Protocol(format!("expected hello, got op {}", frame.op)));
        }
        let interval = frame
            .d
            .get("heartbeat_interval")
            .and_then(Value::as_u64)
            .filter(|&ms| ms > 0)
            .ok_or_else(|| GatewayError::Protocol("hello without heartbeat_interval".to_string()))?;
        return Ok(Duration::from_millis(interval));
    }
    Err(GatewayError::Closed(None))
}
