//! Agent configuration, read once from a JSON file at startup.

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COMMAND_PREFIX: &str = "p!";
pub const DEFAULT_GAME_BOT_NAME: &str = "Pokécord";
pub const DEFAULT_ART_BASE_URL: &str = "https://www.serebii.net/pokemon/art/";
pub const DEFAULT_CHANNEL_IDLE_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sorted, deduplicated set of identities that are never sold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct WhiteList {
    names: IndexSet<String>,
}

impl WhiteList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sorted: Vec<String> = names
            .into_iter()
            .map(Into::into)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        sorted.sort();
        Self {
            names: sorted.into_iter().collect(),
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.names.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for WhiteList {
    fn from(names: Vec<String>) -> Self {
        Self::new(names)
    }
}

impl From<WhiteList> for Vec<String> {
    fn from(list: WhiteList) -> Self {
        list.names.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 6_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub interval_ms: u64,
    pub message: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            message: "spam".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub name_map: PathBuf,
    pub sprite_dir: PathBuf,
    pub art_base_url: String,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            name_map: PathBuf::from("pokemon.txt"),
            sprite_dir: PathBuf::from("sprite"),
            art_base_url: DEFAULT_ART_BASE_URL.to_string(),
        }
    }
}

impl AssetConfig {
    /// Resolve relative paths against the directory holding the config file.
    fn anchor(&mut self, base: &Path) {
        if self.name_map.is_relative() {
            self.name_map = base.join(&self.name_map);
        }
        if self.sprite_dir.is_relative() {
            self.sprite_dir = base.join(&self.sprite_dir);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub token: String,
    #[serde(default)]
    pub white_list: WhiteList,
    pub limit_iv: f64,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_game_bot_name")]
    pub game_bot_name: String,
    #[serde(default)]
    pub operator_ids: Vec<String>,
    #[serde(default)]
    pub pacer: PacerConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub assets: AssetConfig,
    #[serde(default)]
    pub max_hash_distance: u32,
    #[serde(default)]
    pub reject_hash_collisions: bool,
    #[serde(default)]
    pub transaction_timeout_secs: Option<u64>,
    #[serde(default)]
    pub events_path: Option<PathBuf>,
    /// Seconds an idle channel keeps its worker thread.
    #[serde(default = "default_channel_idle_secs")]
    pub channel_idle_secs: u64,
}

fn default_command_prefix() -> String {
    DEFAULT_COMMAND_PREFIX.to_string()
}

fn default_game_bot_name() -> String {
    DEFAULT_GAME_BOT_NAME.to_string()
}

fn default_channel_idle_secs() -> u64 {
    DEFAULT_CHANNEL_IDLE_SECS
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        if let Some(base) = path.parent() {
            config.assets.anchor(base);
            if let Some(events) = config.events_path.as_mut() {
                if events.is_relative() {
                    *events = base.join(&*events);
                }
            }
        }
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid("token must not be empty".to_string()));
        }
        if !self.limit_iv.is_finite() || !(0.0..=100.0).contains(&self.limit_iv) {
            return Err(ConfigError::Invalid(format!(
                "limit_iv must be within [0, 100], got {}",
                self.limit_iv
            )));
        }
        if self.pacer.min_delay_ms > self.pacer.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "pacer.min_delay_ms ({}) exceeds pacer.max_delay_ms ({})",
                self.pacer.min_delay_ms, self.pacer.max_delay_ms
            )));
        }
        if self.broadcast.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.interval_ms must be positive".to_string(),
            ));
        }
        if self.game_bot_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "game_bot_name must not be empty".to_string(),
            ));
        }
        if self.max_hash_distance > 64 {
            return Err(ConfigError::Invalid(format!(
                "max_hash_distance must be at most 64, got {}",
                self.max_hash_distance
            )));
        }
        if self.transaction_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "transaction_timeout_secs must be positive when set".to_string(),
            ));
        }
        if self.channel_idle_secs == 0 {
            return Err(ConfigError::Invalid(
                "channel_idle_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config = AgentConfig::from_json(
            r#"{"token": "abc", "white_list": ["Pikachu", "Eevee", "Pikachu"], "limit_iv": 80}"#,
        )?;
        assert_eq!(config.token, "abc");
        assert_eq!(
            config.white_list.iter().collect::<Vec<_>>(),
            vec!["Eevee", "Pikachu"]
        );
        assert_eq!(config.limit_iv, 80.0);
        assert_eq!(config.command_prefix, "p!");
        assert_eq!(config.game_bot_name, "Pokécord");
        assert_eq!(config.pacer, PacerConfig::default());
        assert_eq!(config.broadcast.interval_ms, 2_000);
        assert_eq!(config.max_hash_distance, 0);
        assert_eq!(config.transaction_timeout_secs, None);
        assert_eq!(config.channel_idle_secs, DEFAULT_CHANNEL_IDLE_SECS);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = AgentConfig::from_json(r#"{"token": "abc", "limit_iv": 120.5}"#)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("limit_iv must be within [0, 100]"));
    }

    #[test]
    fn rejects_empty_token_and_inverted_pacer() {
        assert!(matches!(
            AgentConfig::from_json(r#"{"token": " ", "limit_iv": 50}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AgentConfig::from_json(
                r#"{"token": "t", "limit_iv": 50, "pacer": {"min_delay_ms": 10, "max_delay_ms": 1}}"#
            ),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_channel_idle() {
        assert!(matches!(
            AgentConfig::from_json(r#"{"token": "t", "limit_iv": 50, "channel_idle_secs": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_threshold_is_a_parse_error() {
        assert!(matches!(
            AgentConfig::from_json(r#"{"token": "abc"}"#),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_anchors_asset_paths_to_config_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        fs::write(
            &path,
            r#"{"token": "abc", "limit_iv": 50, "events_path": "events.jsonl"}"#,
        )?;
        let config = AgentConfig::load(&path)?;
        assert_eq!(config.assets.name_map, temp.path().join("pokemon.txt"));
        assert_eq!(config.assets.sprite_dir, temp.path().join("sprite"));
        assert_eq!(config.events_path, Some(temp.path().join("events.jsonl")));
        Ok(())
    }

    #[test]
    fn operator_ids_default_to_empty() -> anyhow::Result<()> {
        let config =
            AgentConfig::from_json(r#"{"token": "t", "limit_iv": 50, "operator_ids": ["1"]}"#)?;
        assert_eq!(config.operator_ids, vec!["1".to_string()]);
        let open = AgentConfig::from_json(r#"{"token": "t", "limit_iv": 50}"#)?;
        assert!(open.operator_ids.is_empty());
        Ok(())
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AgentConfig::load(Path::new("/nonexistent/catchbot/config.json"));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }
}
