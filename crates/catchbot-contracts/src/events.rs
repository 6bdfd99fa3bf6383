//! Transaction log: one JSON object per line, one line per workflow step.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Everything the catch-sell workflow records. Serialized with a `type`
/// tag in snake case, e.g. `{"type":"catch_sent","channel_id":..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionEvent {
    CatchSent {
        channel_id: String,
        identity: String,
        protected: bool,
    },
    IdentificationFailed {
        channel_id: String,
        url: String,
        error: String,
    },
    TransactionKept {
        channel_id: String,
        identity: String,
        id: u64,
        iv: f64,
    },
    MarketSearchSent {
        channel_id: String,
        identity: String,
        id: u64,
        iv: f64,
    },
    ListingConfirmed {
        channel_id: String,
        identity: String,
        id: u64,
        price: u64,
    },
    TransactionExpired {
        channel_id: String,
        phase: String,
        identity: String,
    },
}

impl TransactionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CatchSent { .. } => "catch_sent",
            Self::IdentificationFailed { .. } => "identification_failed",
            Self::TransactionKept { .. } => "transaction_kept",
            Self::MarketSearchSent { .. } => "market_search_sent",
            Self::ListingConfirmed { .. } => "listing_confirmed",
            Self::TransactionExpired { .. } => "transaction_expired",
        }
    }
}

#[derive(Serialize)]
struct StampedEvent<'a> {
    session_id: &'a str,
    ts: String,
    #[serde(flatten)]
    event: &'a TransactionEvent,
}

/// Append-only log shared by every channel worker. The file is opened on
/// the first record and kept open; clones share the handle.
#[derive(Debug, Clone)]
pub struct TransactionLog {
    inner: Arc<LogInner>,
}

#[derive(Debug)]
struct LogInner {
    path: PathBuf,
    session_id: String,
    file: Mutex<Option<File>>,
}

impl TransactionLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LogInner {
                path: path.into(),
                session_id: session_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    /// Log stamped with a fresh random session id.
    pub fn with_new_session(path: impl Into<PathBuf>) -> Self {
        Self::new(path, uuid::Uuid::new_v4().to_string())
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, event: &TransactionEvent) -> Result<()> {
        let stamped = StampedEvent {
            session_id: &self.inner.session_id,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            event,
        };
        let mut line = serde_json::to_string(&stamped)
            .with_context(|| format!("failed to serialize {} event", event.kind()))?;
        line.push('\n');

        let mut file = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow!("transaction log lock poisoned"))?;
        if file.is_none() {
            *file = Some(self.open()?);
        }
        if let Some(handle) = file.as_mut() {
            handle.write_all(line.as_bytes()).with_context(|| {
                format!("failed to append to {}", self.inner.path.display())
            })?;
        }
        Ok(())
    }

    fn open(&self) -> Result<File> {
        let path = &self.inner.path;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open transaction log {}", path.display()))
    }
}
