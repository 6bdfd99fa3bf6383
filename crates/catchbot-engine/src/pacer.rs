//! Outbound command grammar and human-like pacing.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use catchbot_contracts::config::PacerConfig;
use rand::Rng;
use tracing::debug;

/// Sends plain text to a chat channel.
pub trait ChatTransport: Send + Sync {
    fn send_message(&self, channel_id: &str, content: &str) -> Result<()>;
}

/// Commands understood by the game bot. `Display` renders the exact,
/// case-sensitive grammar without the command prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum GameCommand {
    Catch { identity: String },
    InfoLatest,
    MarketSearch { identity: String, min_iv: f64 },
    MarketList { id: u64, price: u64 },
    ConfirmList,
}

impl fmt::Display for GameCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Catch { identity } => write!(f, "catch {identity}"),
            Self::InfoLatest => f.write_str("info latest"),
            Self::MarketSearch { identity, min_iv } => write!(
                f,
                "market search --name {identity} --iv > {min_iv:.6} --order price a"
            ),
            Self::MarketList { id, price } => write!(f, "market list {id} {price}"),
            Self::ConfirmList => f.write_str("confirmlist"),
        }
    }
}

/// Uniform random delay in `[min, max]` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    min_ms: u64,
    max_ms: u64,
}

impl Pacer {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn from_config(config: &PacerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn immediate() -> Self {
        Self {
            min_ms: 0,
            max_ms: 0,
        }
    }

    pub fn sample(&self) -> Duration {
        if self.min_ms == self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }

    /// Block the calling thread for one sampled delay.
    pub fn pause(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Paces and prefixes every game command before handing it to the transport.
#[derive(Clone)]
pub struct PacedSender {
    transport: Arc<dyn ChatTransport>,
    pacer: Pacer,
    prefix: String,
}

impl PacedSender {
    pub fn new(transport: Arc<dyn ChatTransport>, pacer: Pacer, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            pacer,
            prefix: prefix.into(),
        }
    }

    pub fn pacer(&self) -> Pacer {
        self.pacer
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    pub fn render(&self, command: &GameCommand) -> String {
        format!("{}{}", self.prefix, command)
    }

    pub fn send(&self, channel_id: &str, command: &GameCommand) -> Result<()> {
        self.pacer.pause();
        let text = self.render(command);
        debug!(channel_id, command = %text, "sending game command");
        self.transport
            .send_message(channel_id, &text)
            .with_context(|| format!("failed to send `{text}` to channel {channel_id}"))
    }
}
