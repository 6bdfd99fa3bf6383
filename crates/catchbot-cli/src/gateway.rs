//! Discord glue: REST transport for outbound text and a blocking gateway
//! client that feeds `MESSAGE_CREATE` dispatches to the router.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use catchbot_contracts::messages::InboundMessage;
use catchbot_engine::{ChatTransport, EventRouter};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
pub const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const REST_TIMEOUT_SECONDS: u64 = 15;
const SOCKET_READ_TIMEOUT_MS: u64 = 500;
const RECONNECT_BACKOFF_MS: u64 = 1_000;
const RECONNECT_BACKOFF_MAX_MS: u64 = 30_000;
const RECONNECT_ATTEMPTS_MAX: usize = 10;

const INTENT_GUILDS: u64 = 1 << 0;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;
pub const GATEWAY_INTENTS: u64 =
    INTENT_GUILDS | INTENT_GUILD_MESSAGES | INTENT_DIRECT_MESSAGES | INTENT_MESSAGE_CONTENT;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Close codes after which reconnecting cannot help.
const FATAL_CLOSE_CODES: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

pub struct DiscordRest {
    client: HttpClient,
    api_base: String,
    token: String,
}

impl DiscordRest {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(REST_TIMEOUT_SECONDS))
            .build()
            .context("failed to build discord http client")?;
        Ok(Self {
            client,
            api_base: DISCORD_API_BASE.to_string(),
            token: token.into(),
        })
    }
}

impl ChatTransport for DiscordRest {
    fn send_message(&self, channel_id: &str, content: &str) -> Result<()> {
        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, &self.token)
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "content": content }))
            .send()
            .with_context(|| format!("discord request for channel {channel_id} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "discord rejected message for channel {channel_id} ({}): {}",
                status.as_u16(),
                body.trim()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway closed the connection ({code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("gateway stopped acknowledging heartbeats")]
    ZombieConnection,
    #[error("expected hello, got opcode {0}")]
    MissingHello(u8),
}

impl GatewayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed { code, .. } if FATAL_CLOSE_CODES.contains(code))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, PartialEq)]
enum GatewayEvent {
    Hello { heartbeat_interval: Duration },
    HeartbeatAck,
    HeartbeatRequest,
    Dispatch { kind: String, data: Value },
    Reconnect,
    InvalidSession,
    Other(u8),
}

fn decode_frame(raw: &str) -> Result<(GatewayEvent, Option<u64>)> {
    let payload: GatewayPayload =
        serde_json::from_str(raw).context("failed to parse gateway payload")?;
    let event = match payload.op {
        OP_HELLO => {
            let interval = payload
                .d
                .get("heartbeat_interval")
                .and_then(Value::as_u64)
                .context("hello without heartbeat_interval")?;
            GatewayEvent::Hello {
                heartbeat_interval: Duration::from_millis(interval),
            }
        }
        OP_HEARTBEAT_ACK => GatewayEvent::HeartbeatAck,
        OP_HEARTBEAT => GatewayEvent::HeartbeatRequest,
        OP_DISPATCH => GatewayEvent::Dispatch {
            kind: payload.t.unwrap_or_default(),
            data: payload.d,
        },
        OP_RECONNECT => GatewayEvent::Reconnect,
        OP_INVALID_SESSION => GatewayEvent::InvalidSession,
        other => GatewayEvent::Other(other),
    };
    Ok((event, payload.s))
}

fn identify_payload(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "catchbot",
                "device": "catchbot",
            },
        },
    })
}

fn heartbeat_payload(sequence: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": sequence })
}

fn reconnect_backoff(attempt: usize) -> Duration {
    let multiplier = u64::try_from(attempt.max(1)).unwrap_or(u64::MAX);
    Duration::from_millis(
        RECONNECT_BACKOFF_MS
            .saturating_mul(multiplier)
            .min(RECONNECT_BACKOFF_MAX_MS),
    )
}

/// Per-connection bookkeeping.
#[derive(Debug, Default)]
struct Session {
    sequence: Option<u64>,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
    acknowledged: bool,
    ready: bool,
}

impl Session {
    fn heartbeat_due(&self, now: Instant) -> bool {
        match self.last_heartbeat {
            Some(sent) => now.duration_since(sent) >= self.heartbeat_interval,
            None => true,
        }
    }
}

enum SessionEnd {
    Reconnect,
}

pub struct DiscordGateway {
    url: String,
    token: String,
}

impl DiscordGateway {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            url: DISCORD_GATEWAY_URL.to_string(),
            token: token.into(),
        }
    }

    /// Keep a gateway connection alive until a fatal close or the retry
    /// budget is spent.
    pub fn run(&self, router: &mut EventRouter) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            let mut session = Session::default();
            let outcome = self.run_session(router, &mut session);
            if session.ready {
                attempt = 0;
            }
            match outcome {
                Ok(SessionEnd::Reconnect) => {
                    info!("gateway requested a reconnect");
                }
                Err(err) => {
                    let fatal = err
                        .downcast_ref::<GatewayError>()
                        .map(GatewayError::is_fatal)
                        .unwrap_or(false);
                    if fatal {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt > RECONNECT_ATTEMPTS_MAX {
                        return Err(err.context(format!(
                            "gateway unavailable after {RECONNECT_ATTEMPTS_MAX} reconnect attempts"
                        )));
                    }
                    let delay = reconnect_backoff(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "gateway connection lost: {err:#}");
                    thread::sleep(delay);
                }
            }
        }
    }

    fn run_session(&self, router: &mut EventRouter, session: &mut Session) -> Result<SessionEnd> {
        let (mut ws, _) =
            websocket_connect(self.url.as_str()).context("failed to connect discord gateway")?;
        set_socket_read_timeout(&mut ws, Some(Duration::from_millis(SOCKET_READ_TIMEOUT_MS)));

        loop {
            let now = Instant::now();
            if session.heartbeat_interval > Duration::ZERO && session.heartbeat_due(now) {
                if session.last_heartbeat.is_some() && !session.acknowledged {
                    return Err(GatewayError::ZombieConnection.into());
                }
                websocket_send_json(&mut ws, &heartbeat_payload(session.sequence))?;
                session.last_heartbeat = Some(now);
                session.acknowledged = false;
            }

            let message = match ws.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(err) => return Err(err).context("gateway read failed"),
            };
            let raw = match message {
                WsMessage::Text(text) => text.as_str().to_string(),
                WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                WsMessage::Close(frame) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.as_str().to_string()))
                        .unwrap_or((1000, String::new()));
                    return Err(GatewayError::Closed { code, reason }.into());
                }
                _ => continue,
            };

            let (event, sequence) = match decode_frame(&raw) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!("dropping gateway frame: {err:#}");
                    continue;
                }
            };
            if sequence.is_some() {
                session.sequence = sequence;
            }

            match event {
                GatewayEvent::Hello { heartbeat_interval } => {
                    debug!(interval_ms = heartbeat_interval.as_millis() as u64, "gateway hello");
                    session.heartbeat_interval = heartbeat_interval;
                    session.acknowledged = true;
                    websocket_send_json(&mut ws, &identify_payload(&self.token))?;
                }
                GatewayEvent::HeartbeatAck => session.acknowledged = true,
                GatewayEvent::HeartbeatRequest => {
                    websocket_send_json(&mut ws, &heartbeat_payload(session.sequence))?;
                }
                GatewayEvent::Dispatch { kind, data } => {
                    if session.heartbeat_interval == Duration::ZERO {
                        return Err(GatewayError::MissingHello(OP_DISPATCH).into());
                    }
                    self.handle_dispatch(router, session, &kind, data);
                }
                GatewayEvent::Reconnect | GatewayEvent::InvalidSession => {
                    let _ = ws.close(None);
                    return Ok(SessionEnd::Reconnect);
                }
                GatewayEvent::Other(op) => debug!(op, "ignoring gateway opcode"),
            }
        }
    }

    fn handle_dispatch(&self, router: &mut EventRouter, session: &mut Session, kind: &str, data: Value) {
        match kind {
            "READY" => {
                session.ready = true;
                let user = data
                    .pointer("/user/username")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                info!(user, "gateway session ready");
            }
            "MESSAGE_CREATE" => match serde_json::from_value::<InboundMessage>(data) {
                Ok(message) => {
                    let route = router.route(message);
                    debug!(?route, "routed message");
                }
                Err(err) => warn!("failed to decode MESSAGE_CREATE: {err}"),
            },
            _ => {}
        }
    }
}

fn websocket_send_json(ws: &mut Socket, value: &Value) -> Result<()> {
    let raw = serde_json::to_string(value).context("failed to serialize gateway payload")?;
    ws.send(WsMessage::Text(raw.into()))
        .context("failed to send gateway payload")
}

fn set_socket_read_timeout(ws: &mut Socket, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_cover_message_content() {
        assert_eq!(GATEWAY_INTENTS, 37_377);
    }

    #[test]
    fn decodes_hello_and_dispatch_frames() -> anyhow::Result<()> {
        let (hello, seq) = decode_frame(r#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#)?;
        assert_eq!(
            hello,
            GatewayEvent::Hello {
                heartbeat_interval: Duration::from_millis(41_250)
            }
        );
        assert_eq!(seq, None);

        let (dispatch, seq) = decode_frame(
            r#"{"op":0,"s":42,"t":"MESSAGE_CREATE","d":{"channel_id":"c1","content":"hi","author":{"id":"7","username":"Pokécord","bot":true},"embeds":[]}}"#,
        )?;
        assert_eq!(seq, Some(42));
        let GatewayEvent::Dispatch { kind, data } = dispatch else {
            anyhow::bail!("expected dispatch");
        };
        assert_eq!(kind, "MESSAGE_CREATE");
        let message: InboundMessage = serde_json::from_value(data)?;
        assert_eq!(message.channel_id, "c1");
        assert_eq!(message.author.username, "Pokécord");
        assert!(message.author.bot);
        Ok(())
    }

    #[test]
    fn hello_without_interval_is_rejected() {
        assert!(decode_frame(r#"{"op":10,"d":{}}"#).is_err());
    }

    #[test]
    fn identify_carries_token_and_intents() {
        let payload = identify_payload("secret");
        assert_eq!(payload["op"], 2);
        assert_eq!(payload["d"]["token"], "secret");
        assert_eq!(payload["d"]["intents"], GATEWAY_INTENTS);
    }

    #[test]
    fn heartbeat_echoes_last_sequence() {
        assert_eq!(heartbeat_payload(None), json!({"op": 1, "d": null}));
        assert_eq!(heartbeat_payload(Some(9)), json!({"op": 1, "d": 9}));
    }

    #[test]
    fn reconnect_backoff_is_linear_and_capped() {
        assert_eq!(reconnect_backoff(0), Duration::from_millis(1_000));
        assert_eq!(reconnect_backoff(3), Duration::from_millis(3_000));
        assert_eq!(reconnect_backoff(500), Duration::from_millis(30_000));
    }

    #[test]
    fn authentication_failures_are_fatal() {
        assert!(GatewayError::Closed {
            code: 4004,
            reason: "Authentication failed.".to_string()
        }
        .is_fatal());
        assert!(!GatewayError::Closed {
            code: 4000,
            reason: String::new()
        }
        .is_fatal());
        assert!(!GatewayError::ZombieConnection.is_fatal());
    }

    #[test]
    fn heartbeat_due_after_interval() {
        let now = Instant::now();
        let mut session = Session {
            heartbeat_interval: Duration::from_secs(40),
            ..Session::default()
        };
        assert!(session.heartbeat_due(now));
        session.last_heartbeat = Some(now);
        assert!(!session.heartbeat_due(now + Duration::from_secs(10)));
        assert!(session.heartbeat_due(now + Duration::from_secs(40)));
    }
}
