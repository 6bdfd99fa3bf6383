//! Catch → quality check → list → confirm, reconstructed from independent
//! game bot messages.
//!
//! Each correlation context (one chat channel) owns a [`WorkflowState`].
//! The shared [`CatchSellWorkflow`] holds only immutable collaborators, so a
//! single instance drives every channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use catchbot_contracts::config::{AgentConfig, WhiteList};
use catchbot_contracts::events::{TransactionEvent, TransactionLog};
use catchbot_contracts::messages::{Embed, InboundMessage};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identify::{Identification, Identifier, ImageSource};
use crate::pacer::{GameCommand, PacedSender};

pub const SPAWN_MARKER: &str = "Guess";
pub const INFO_FOOTER_MARKER: &str = "Displaying";
pub const INFO_INDEX_PREFIX: &str = "Displaying Pokémon: ";
pub const IV_MARKER: &str = "Total IV %:** ";
pub const MARKET_TITLE_MARKER: &str = "Pokécord Market";
pub const MARKET_SEGMENT_DELIMITER: &str = "\n**";
pub const PRICE_PREFIX: &str = "Price: ";
pub const PRICE_SUFFIX: &str = " Credits";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing marker {0:?}")]
    MissingMarker(&'static str),
    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("no listing segment carries a price")]
    MissingPrice,
}

fn parse_digits(field: &'static str, raw: &str) -> Result<u64, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(ParseError::InvalidNumber {
            field,
            value: trimmed.to_string(),
        });
    }
    trimmed.parse::<u64>().map_err(|_| ParseError::InvalidNumber {
        field,
        value: trimmed.to_string(),
    })
}

/// Position of the caught creature from `Displaying Pokémon: <index>/<total> - ...`.
pub fn parse_footer_index(footer: &str) -> Result<u64, ParseError> {
    let (_, tail) = footer
        .split_once(INFO_INDEX_PREFIX)
        .ok_or(ParseError::MissingMarker(INFO_INDEX_PREFIX))?;
    let (index, _) = tail.split_once('/').ok_or(ParseError::MissingMarker("/"))?;
    parse_digits("index", index)
}

/// Quality percentage following `Total IV %:** `, read up to the first
/// character that is neither a digit nor a decimal point.
pub fn parse_iv(description: &str) -> Result<f64, ParseError> {
    let (_, tail) = description
        .split_once(IV_MARKER)
        .ok_or(ParseError::MissingMarker(IV_MARKER))?;
    let number: String = tail
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    let invalid = || ParseError::InvalidNumber {
        field: "iv",
        value: number.clone(),
    };
    let value = number.parse::<f64>().map_err(|_| invalid())?;
    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(value)
}

/// Cheapest listing price from a market search result. The first segment
/// is the header; the first later segment with a `Price: <n> Credits`
/// clause wins. Thousands separators are dropped.
pub fn parse_price(description: &str) -> Result<u64, ParseError> {
    let raw = description
        .split(MARKET_SEGMENT_DELIMITER)
        .skip(1)
        .find_map(|segment| {
            let (_, tail) = segment.split_once(PRICE_PREFIX)?;
            let (price, _) = tail.split_once(PRICE_SUFFIX)?;
            Some(price)
        })
        .ok_or(ParseError::MissingPrice)?;
    let cleaned: String = raw.chars().filter(|ch| *ch != ',').collect();
    parse_digits("price", &cleaned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Catch sent, waiting for the `info latest` report.
    AwaitingQuality { identity: String },
    /// Market search sent, waiting for the search results.
    AwaitingListing { identity: String, id: u64 },
}

impl Phase {
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::AwaitingQuality { identity } | Self::AwaitingListing { identity, .. } => {
                Some(identity.as_str())
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingQuality { .. } => "awaiting_quality",
            Self::AwaitingListing { .. } => "awaiting_listing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    phase: Phase,
    entered_at: Instant,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            entered_at: Instant::now(),
        }
    }
}

impl WorkflowState {
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    fn enter(&mut self, phase: Phase, now: Instant) {
        self.phase = phase;
        self.entered_at = now;
    }

    fn reset(&mut self, now: Instant) {
        self.enter(Phase::Idle, now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedListing {
    pub identity: String,
    pub id: u64,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// No marker for the current phase.
    Ignored,
    /// A marker matched but the text around it did not parse.
    Malformed(ParseError),
    /// Spawn seen but no identity resolved.
    Unidentified,
    /// Spawn seen while another transaction is pending.
    SpawnSkipped { pending: String },
    Caught { identity: String, protected: bool },
    /// Quality at or above the threshold; the transaction ends here.
    Kept { identity: String, iv: f64 },
    Searching { identity: String, id: u64, iv: f64 },
    Listed(CompletedListing),
}

impl Transition {
    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub limit_iv: f64,
    pub white_list: WhiteList,
    pub transaction_timeout: Option<Duration>,
}

impl WorkflowSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            limit_iv: config.limit_iv,
            white_list: config.white_list.clone(),
            transaction_timeout: config.transaction_timeout_secs.map(Duration::from_secs),
        }
    }
}

pub struct CatchSellWorkflow {
    identifier: Arc<Identifier>,
    images: Arc<dyn ImageSource>,
    sender: PacedSender,
    settings: WorkflowSettings,
    events: Option<TransactionLog>,
}

impl CatchSellWorkflow {
    pub fn new(
        identifier: Arc<Identifier>,
        images: Arc<dyn ImageSource>,
        sender: PacedSender,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            identifier,
            images,
            sender,
            settings,
            events: None,
        }
    }

    pub fn with_events(mut self, events: TransactionLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Feed every embed of `message` until one advances the workflow.
    pub fn handle_message(
        &self,
        state: &mut WorkflowState,
        message: &InboundMessage,
    ) -> Result<Transition> {
        for embed in &message.embeds {
            let transition = self.step(state, &message.channel_id, embed)?;
            if transition.is_handled() {
                return Ok(transition);
            }
        }
        Ok(Transition::Ignored)
    }

    pub fn step(
        &self,
        state: &mut WorkflowState,
        channel_id: &str,
        embed: &Embed,
    ) -> Result<Transition> {
        self.step_at(state, channel_id, embed, Instant::now())
    }

    pub fn step_at(
        &self,
        state: &mut WorkflowState,
        channel_id: &str,
        embed: &Embed,
        now: Instant,
    ) -> Result<Transition> {
        self.expire_stale(state, channel_id, now);

        if embed.description.contains(SPAWN_MARKER) {
            return self.on_spawn(state, channel_id, embed, now);
        }

        match state.phase.clone() {
            Phase::Idle => {}
            Phase::AwaitingQuality { identity } => {
                if let Some(footer) = embed
                    .footer_text()
                    .filter(|footer| footer.contains(INFO_FOOTER_MARKER))
                {
                    return self.on_quality_report(
                        state,
                        channel_id,
                        identity,
                        footer,
                        &embed.description,
                        now,
                    );
                }
            }
            Phase::AwaitingListing { identity, id } => {
                let is_market = embed
                    .title_text()
                    .map(|title| title.contains(MARKET_TITLE_MARKER))
                    .unwrap_or(false);
                if is_market {
                    return self.on_market_results(
                        state,
                        channel_id,
                        identity,
                        id,
                        &embed.description,
                        now,
                    );
                }
            }
        }
        Ok(Transition::Ignored)
    }

    fn expire_stale(&self, state: &mut WorkflowState, channel_id: &str, now: Instant) {
        let Some(timeout) = self.settings.transaction_timeout else {
            return;
        };
        if state.is_idle() || now.saturating_duration_since(state.entered_at) < timeout {
            return;
        }
        let phase = state.phase.label();
        let identity = state.phase.identity().unwrap_or_default().to_string();
        warn!(channel_id, phase, identity = %identity, "pending transaction expired");
        self.record(TransactionEvent::TransactionExpired {
            channel_id: channel_id.to_string(),
            phase: phase.to_string(),
            identity,
        });
        state.reset(now);
    }

    fn on_spawn(
        &self,
        state: &mut WorkflowState,
        channel_id: &str,
        embed: &Embed,
        now: Instant,
    ) -> Result<Transition> {
        if let Some(pending) = state.phase.identity() {
            info!(channel_id, pending, "spawn ignored while a transaction is pending");
            return Ok(Transition::SpawnSkipped {
                pending: pending.to_string(),
            });
        }
        let Some(url) = embed.image_ref() else {
            warn!(channel_id, "spawn embed carries no image");
            return Ok(Transition::Unidentified);
        };

        let identification = match self
            .images
            .fetch(url)
            .and_then(|bytes| self.identifier.identify(&bytes))
        {
            Ok(identification) => identification,
            Err(err) => {
                warn!(channel_id, url, "identification failed: {err}");
                self.record(TransactionEvent::IdentificationFailed {
                    channel_id: channel_id.to_string(),
                    url: url.to_string(),
                    error: err.to_string(),
                });
                return Ok(Transition::Unidentified);
            }
        };
        let Identification::Known(identity) = identification else {
            info!(channel_id, url, "spawn did not match any reference image");
            return Ok(Transition::Unidentified);
        };

        self.sender.send(
            channel_id,
            &GameCommand::Catch {
                identity: identity.clone(),
            },
        )?;
        let protected = self.settings.white_list.contains(&identity);
        self.record(TransactionEvent::CatchSent {
            channel_id: channel_id.to_string(),
            identity: identity.clone(),
            protected,
        });
        if protected {
            info!(channel_id, identity = %identity, "caught whitelisted creature; not selling");
            return Ok(Transition::Caught {
                identity,
                protected,
            });
        }

        self.sender.send(channel_id, &GameCommand::InfoLatest)?;
        state.enter(
            Phase::AwaitingQuality {
                identity: identity.clone(),
            },
            now,
        );
        info!(channel_id, identity = %identity, "caught; awaiting quality report");
        Ok(Transition::Caught {
            identity,
            protected,
        })
    }

    fn on_quality_report(
        &self,
        state: &mut WorkflowState,
        channel_id: &str,
        identity: String,
        footer: &str,
        description: &str,
        now: Instant,
    ) -> Result<Transition> {
        let parsed = parse_footer_index(footer).and_then(|id| Ok((id, parse_iv(description)?)));
        let (id, iv) = match parsed {
            Ok(values) => values,
            Err(err) => {
                warn!(channel_id, footer, "ignoring malformed quality report: {err}");
                return Ok(Transition::Malformed(err));
            }
        };
        let floored = iv.floor();

        if floored >= self.settings.limit_iv {
            info!(
                channel_id,
                identity = %identity,
                iv = floored,
                limit = self.settings.limit_iv,
                "quality meets threshold; keeping"
            );
            state.reset(now);
            self.record(TransactionEvent::TransactionKept {
                channel_id: channel_id.to_string(),
                identity: identity.clone(),
                id,
                iv: floored,
            });
            return Ok(Transition::Kept {
                identity,
                iv: floored,
            });
        }

        self.sender.send(
            channel_id,
            &GameCommand::MarketSearch {
                identity: identity.clone(),
                min_iv: floored,
            },
        )?;
        state.enter(
            Phase::AwaitingListing {
                identity: identity.clone(),
                id,
            },
            now,
        );
        self.record(TransactionEvent::MarketSearchSent {
            channel_id: channel_id.to_string(),
            identity: identity.clone(),
            id,
            iv: floored,
        });
        debug!(channel_id, identity = %identity, id, "awaiting market results");
        Ok(Transition::Searching {
            identity,
            id,
            iv: floored,
        })
    }

    fn on_market_results(
        &self,
        state: &mut WorkflowState,
        channel_id: &str,
        identity: String,
        id: u64,
        description: &str,
        now: Instant,
    ) -> Result<Transition> {
        let price = match parse_price(description) {
            Ok(price) => price,
            Err(err) => {
                warn!(channel_id, "ignoring malformed market results: {err}");
                return Ok(Transition::Malformed(err));
            }
        };

        state.reset(now);
        self.sender
            .send(channel_id, &GameCommand::MarketList { id, price })?;
        self.sender.send(channel_id, &GameCommand::ConfirmList)?;
        info!(channel_id, identity = %identity, id, price, "listing confirmed");
        self.record(TransactionEvent::ListingConfirmed {
            channel_id: channel_id.to_string(),
            identity: identity.clone(),
            id,
            price,
        });
        Ok(Transition::Listed(CompletedListing {
            identity,
            id,
            price,
        }))
    }

    fn record(&self, event: TransactionEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.record(&event) {
            warn!(kind = event.kind(), "failed to record transaction event: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;

    use super::*;
    use crate::hash::{CollisionPolicy, HashIndex};
    use crate::pacer::Pacer;
    use crate::test_support::{
        diagonal, png_bytes, solid, split_horizontal, split_vertical, MapImageSource,
        RecordingTransport,
    };

    const CHANNEL: &str = "42";
    const PIKACHU_URL: &str = "https://cdn.example/pikachu.png";
    const EEVEE_URL: &str = "https://cdn.example/eevee.png";
    const NOISE_URL: &str = "https://cdn.example/noise.png";
    const GARBAGE_URL: &str = "https://cdn.example/garbage.png";

    struct Harness {
        workflow: CatchSellWorkflow,
        transport: Arc<RecordingTransport>,
        state: WorkflowState,
    }

    fn harness_with(limit_iv: f64, timeout: Option<Duration>) -> anyhow::Result<Harness> {
        let index = HashIndex::build(
            vec![
                ("Pikachu", png_bytes(&split_vertical())),
                ("Eevee", png_bytes(&split_horizontal())),
                ("Squirtle", png_bytes(&diagonal())),
            ],
            CollisionPolicy::Reject,
        )?;
        let images = MapImageSource::default()
            .with(PIKACHU_URL, png_bytes(&split_vertical()))
            .with(EEVEE_URL, png_bytes(&split_horizontal()))
            .with(NOISE_URL, png_bytes(&solid(90)))
            .with(GARBAGE_URL, b"not a png".to_vec());
        let transport = RecordingTransport::new();
        let sender = PacedSender::new(transport.clone(), Pacer::immediate(), "p!");
        let workflow = CatchSellWorkflow::new(
            Arc::new(Identifier::new(index)),
            Arc::new(images),
            sender,
            WorkflowSettings {
                limit_iv,
                white_list: WhiteList::new(["Eevee"]),
                transaction_timeout: timeout,
            },
        );
        Ok(Harness {
            workflow,
            transport,
            state: WorkflowState::default(),
        })
    }

    fn harness(limit_iv: f64) -> anyhow::Result<Harness> {
        harness_with(limit_iv, None)
    }

    fn spawn(url: &str) -> Embed {
        Embed::with_description("Guess the pokémon and type p!catch <pokémon> to catch it!")
            .title("A wild pokémon has appeared!")
            .image_url(url)
    }

    fn quality_report(footer: &str, iv: &str) -> Embed {
        Embed::with_description(format!(
            "**Level 12**\n**HP:** 31/31 - IV: 20/31\n**Total IV %:** {iv}"
        ))
        .title("Level 12 Pikachu")
        .footer(footer)
    }

    fn market_results(description: &str) -> Embed {
        Embed::with_description(description).title("Pokécord Market")
    }

    impl Harness {
        fn step(&mut self, embed: Embed) -> anyhow::Result<Transition> {
            self.workflow.step(&mut self.state, CHANNEL, &embed)
        }
    }

    #[test]
    fn spawn_catches_and_requests_quality() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        let transition = h.step(spawn(PIKACHU_URL))?;
        assert_eq!(
            transition,
            Transition::Caught {
                identity: "Pikachu".to_string(),
                protected: false
            }
        );
        assert_eq!(h.transport.texts(), vec!["p!catch Pikachu", "p!info latest"]);
        assert_eq!(
            h.state.phase(),
            &Phase::AwaitingQuality {
                identity: "Pikachu".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn whitelisted_spawn_stops_after_catch() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        let transition = h.step(spawn(EEVEE_URL))?;
        assert_eq!(
            transition,
            Transition::Caught {
                identity: "Eevee".to_string(),
                protected: true
            }
        );
        assert!(h.state.is_idle());

        // A stray quality report must not trigger a search for Eevee.
        h.step(quality_report("Displaying Pokémon: 3/10 - Use p!back", "12.5%"))?;
        assert_eq!(h.transport.texts(), vec!["p!catch Eevee"]);
        Ok(())
    }

    #[test]
    fn unknown_or_undecodable_spawn_sends_nothing() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        assert_eq!(h.step(spawn(NOISE_URL))?, Transition::Unidentified);
        assert_eq!(h.step(spawn(GARBAGE_URL))?, Transition::Unidentified);
        assert_eq!(
            h.step(spawn("https://cdn.example/missing.png"))?,
            Transition::Unidentified
        );
        assert_eq!(
            h.step(Embed::with_description("Guess the pokémon"))?,
            Transition::Unidentified
        );
        assert_eq!(h.transport.count(), 0);
        assert!(h.state.is_idle());
        Ok(())
    }

    #[test]
    fn low_quality_triggers_market_search() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        h.step(spawn(PIKACHU_URL))?;
        let transition = h.step(quality_report(
            "Displaying Pokémon: 3/10 - Use p!back and p!next to cycle through your pokémon!",
            "42.7%",
        ))?;
        assert_eq!(
            transition,
            Transition::Searching {
                identity: "Pikachu".to_string(),
                id: 3,
                iv: 42.0
            }
        );
        assert_eq!(
            h.transport.texts().last().map(String::as_str),
            Some("p!market search --name Pikachu --iv > 42.000000 --order price a")
        );
        assert_eq!(
            h.state.phase(),
            &Phase::AwaitingListing {
                identity: "Pikachu".to_string(),
                id: 3
            }
        );
        Ok(())
    }

    #[test]
    fn high_quality_aborts_without_search() -> anyhow::Result<()> {
        let mut h = harness(40.0)?;
        h.step(spawn(PIKACHU_URL))?;
        let transition = h.step(quality_report("Displaying Pokémon: 3/10 - ...", "42.7%"))?;
        assert_eq!(
            transition,
            Transition::Kept {
                identity: "Pikachu".to_string(),
                iv: 42.0
            }
        );
        assert!(h.state.is_idle());
        assert_eq!(h.transport.texts(), vec!["p!catch Pikachu", "p!info latest"]);
        Ok(())
    }

    #[test]
    fn floored_quality_equal_to_threshold_is_kept() -> anyhow::Result<()> {
        let mut h = harness(42.0)?;
        h.step(spawn(PIKACHU_URL))?;
        let transition = h.step(quality_report("Displaying Pokémon: 3/10 - ...", "42.99%"))?;
        assert!(matches!(transition, Transition::Kept { .. }));
        Ok(())
    }

    #[test]
    fn market_results_list_and_confirm() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        h.step(spawn(PIKACHU_URL))?;
        h.step(quality_report("Displaying Pokémon: 3/10 - ...", "42.7%"))?;
        let transition = h.step(market_results("\n**Header\n**Price: 1500 Credits..."))?;
        assert_eq!(
            transition,
            Transition::Listed(CompletedListing {
                identity: "Pikachu".to_string(),
                id: 3,
                price: 1500
            })
        );
        let texts = h.transport.texts();
        assert_eq!(
            &texts[texts.len() - 2..],
            &["p!market list 3 1500".to_string(), "p!confirmlist".to_string()]
        );
        assert!(h.state.is_idle());
        Ok(())
    }

    #[test]
    fn unrelated_chatter_is_ignored_in_every_phase() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        let chatter = Embed::with_description("Daily reward claimed!").title("Rewards");
        assert_eq!(h.step(chatter.clone())?, Transition::Ignored);

        h.step(spawn(PIKACHU_URL))?;
        assert_eq!(h.step(chatter.clone())?, Transition::Ignored);
        // Market results before the quality report are out of phase.
        assert_eq!(
            h.step(market_results("\n**Header\n**Price: 10 Credits"))?,
            Transition::Ignored
        );

        h.step(quality_report("Displaying Pokémon: 3/10 - ...", "10%"))?;
        assert_eq!(h.step(chatter)?, Transition::Ignored);
        assert_eq!(
            h.step(quality_report("Displaying Pokémon: 4/10 - ...", "5%"))?,
            Transition::Ignored
        );
        assert_eq!(
            h.state.phase(),
            &Phase::AwaitingListing {
                identity: "Pikachu".to_string(),
                id: 3
            }
        );
        Ok(())
    }

    #[test]
    fn malformed_messages_leave_state_untouched() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        h.step(spawn(PIKACHU_URL))?;
        let sent_before = h.transport.count();

        let missing_index = h.step(quality_report("Displaying your pokémon", "10%"))?;
        assert!(matches!(missing_index, Transition::Malformed(_)));
        let missing_iv = h.step(
            Embed::with_description("**Level 12**").footer("Displaying Pokémon: 3/10 - ..."),
        )?;
        assert_eq!(
            missing_iv,
            Transition::Malformed(ParseError::MissingMarker(IV_MARKER))
        );
        assert!(matches!(
            h.state.phase(),
            Phase::AwaitingQuality { .. }
        ));

        h.step(quality_report("Displaying Pokémon: 3/10 - ...", "10%"))?;
        let no_price = h.step(market_results("\n**Header\n**No listings found"))?;
        assert_eq!(no_price, Transition::Malformed(ParseError::MissingPrice));
        assert!(matches!(h.state.phase(), Phase::AwaitingListing { .. }));
        assert_eq!(h.transport.count(), sent_before + 1);
        Ok(())
    }

    #[test]
    fn second_spawn_does_not_replace_pending_transaction() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        h.step(spawn(PIKACHU_URL))?;
        let transition = h.step(spawn(EEVEE_URL))?;
        assert_eq!(
            transition,
            Transition::SpawnSkipped {
                pending: "Pikachu".to_string()
            }
        );
        assert_eq!(
            h.state.phase(),
            &Phase::AwaitingQuality {
                identity: "Pikachu".to_string()
            }
        );
        assert_eq!(h.transport.texts(), vec!["p!catch Pikachu", "p!info latest"]);
        Ok(())
    }

    #[test]
    fn pending_transaction_expires_when_timeout_configured() -> anyhow::Result<()> {
        let mut h = harness_with(50.0, Some(Duration::from_secs(60)))?;
        h.step(spawn(PIKACHU_URL))?;

        let later = Instant::now() + Duration::from_secs(61);
        let transition = h.workflow.step_at(
            &mut h.state,
            CHANNEL,
            &quality_report("Displaying Pokémon: 3/10 - ...", "10%"),
            later,
        )?;
        assert_eq!(transition, Transition::Ignored);
        assert!(h.state.is_idle());
        Ok(())
    }

    #[test]
    fn without_timeout_transactions_wait_indefinitely() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        h.step(spawn(PIKACHU_URL))?;
        let much_later = Instant::now() + Duration::from_secs(86_400);
        let transition = h.workflow.step_at(
            &mut h.state,
            CHANNEL,
            &quality_report("Displaying Pokémon: 3/10 - ...", "10%"),
            much_later,
        )?;
        assert!(matches!(transition, Transition::Searching { id: 3, .. }));
        Ok(())
    }

    #[test]
    fn handle_message_stops_at_first_handled_embed() -> anyhow::Result<()> {
        let mut h = harness(50.0)?;
        let message = InboundMessage::new(CHANNEL, "Pokécord")
            .embed(Embed::with_description("unrelated"))
            .embed(spawn(PIKACHU_URL))
            .embed(spawn(EEVEE_URL));
        let transition = h.workflow.handle_message(&mut h.state, &message)?;
        assert!(matches!(transition, Transition::Caught { ref identity, .. } if identity == "Pikachu"));
        assert_eq!(h.transport.count(), 2);
        Ok(())
    }

    #[test]
    fn transport_failure_keeps_workflow_idle() -> anyhow::Result<()> {
        let h = harness(50.0)?;
        let workflow = CatchSellWorkflow::new(
            Arc::clone(&h.workflow.identifier),
            Arc::clone(&h.workflow.images),
            PacedSender::new(RecordingTransport::failing(), Pacer::immediate(), "p!"),
            h.workflow.settings.clone(),
        );
        let mut state = WorkflowState::default();
        assert!(workflow.step(&mut state, CHANNEL, &spawn(PIKACHU_URL)).is_err());
        assert!(state.is_idle());
        Ok(())
    }

    #[test]
    fn transactions_are_recorded_to_event_log() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let Harness {
            workflow,
            transport,
            mut state,
        } = harness(50.0)?;
        let workflow = workflow.with_events(TransactionLog::new(&path, "session-1"));

        for embed in [
            spawn(PIKACHU_URL),
            quality_report("Displaying Pokémon: 3/10 - ...", "42.7%"),
            market_results("\n**Header\n**Price: 1,500 Credits"),
        ] {
            workflow.step(&mut state, CHANNEL, &embed)?;
        }

        let types: Vec<String> = fs::read_to_string(&path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec!["catch_sent", "market_search_sent", "listing_confirmed"]
        );
        assert_eq!(transport.texts()[3], "p!market list 3 1500");
        Ok(())
    }

    #[test]
    fn parses_footer_index() {
        assert_eq!(
            parse_footer_index("Displaying Pokémon: 3/10 - Use p!back"),
            Ok(3)
        );
        assert_eq!(
            parse_footer_index("Displaying Pokémon: 120/4000"),
            Ok(120)
        );
        assert_eq!(
            parse_footer_index("Displaying Pokémon 3/10"),
            Err(ParseError::MissingMarker(INFO_INDEX_PREFIX))
        );
        assert_eq!(
            parse_footer_index("Displaying Pokémon: 3 of 10"),
            Err(ParseError::MissingMarker("/"))
        );
        assert!(parse_footer_index("Displaying Pokémon: +3/10").is_err());
    }

    #[test]
    fn parses_iv_up_to_first_non_numeric() {
        assert_eq!(parse_iv("**Total IV %:** 42.7%"), Ok(42.7));
        assert_eq!(parse_iv("**Total IV %:** 100%\n**Nature:** Bold"), Ok(100.0));
        assert_eq!(parse_iv("Total IV %:** 7"), Ok(7.0));
        assert_eq!(
            parse_iv("**Total IV %:** n/a"),
            Err(ParseError::InvalidNumber {
                field: "iv",
                value: String::new()
            })
        );
        assert!(parse_iv("**Total IV %:** 4.2.1%").is_err());
        assert_eq!(
            parse_iv("no quality here"),
            Err(ParseError::MissingMarker(IV_MARKER))
        );
    }

    #[test]
    fn parses_price_from_listing_segments() {
        assert_eq!(parse_price("\n**Header\n**Price: 1500 Credits..."), Ok(1500));
        assert_eq!(
            parse_price("**Pikachu**\n**Level 5 | IV 40% | Price: 2,750 Credits**\n**Price: 9 Credits"),
            Ok(2750)
        );
        assert_eq!(
            parse_price("Price: 10 Credits\n**nothing else"),
            Err(ParseError::MissingPrice)
        );
        assert_eq!(parse_price(""), Err(ParseError::MissingPrice));
        assert!(parse_price("\n**Header\n**Price: free Credits").is_err());
    }
}
