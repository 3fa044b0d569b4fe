use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::platform::Destination;

/// Telegram caps a media group at ten items
pub const TELEGRAM_MEDIA_GROUP_MAX: usize = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    pub telegram: TelegramConfig,
    pub mirror: MirrorConfig,
    #[serde(default = "default_ledger_config")]
    pub ledger: LedgerConfig,
    #[serde(default = "default_schedule_config")]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    #[serde(default = "default_discord_api_base_url")]
    pub api_base_url: String,
    /// Messages requested per channel and run (Discord allows 1-100)
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_media_group_limit")]
    pub media_group_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    #[serde(default)]
    pub filter_words: Vec<String>,
    #[serde(default = "default_message_window_hours")]
    pub message_window_hours: u64,
    /// Pause between two posts, keeps us under Telegram's rate limits
    #[serde(default = "default_request_delay_secs")]
    pub request_delay_secs: u64,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// One `[[mirror.channels]]` entry
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    pub source_channel_id: String,
    pub chat_id: i64,
    #[serde(default)]
    pub thread_id: Option<i32>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Json,
    Sqlite,
}

impl std::fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerBackend::Json => write!(f, "json"),
            LedgerBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Six-field cron expression (with seconds) used by `serve`
    #[serde(default = "default_cron")]
    pub cron: String,
}

fn default_discord_api_base_url() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_fetch_limit() -> u32 {
    50
}

fn default_media_group_limit() -> usize {
    TELEGRAM_MEDIA_GROUP_MAX
}

fn default_message_window_hours() -> u64 {
    1
}

fn default_request_delay_secs() -> u64 {
    3
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("upload_history.json")
}

fn default_cron() -> String {
    "0 */10 * * * *".to_string()
}

fn default_ledger_config() -> LedgerConfig {
    LedgerConfig {
        backend: LedgerBackend::default(),
        path: default_ledger_path(),
    }
}

fn default_schedule_config() -> ScheduleConfig {
    ScheduleConfig {
        cron: default_cron(),
    }
}

/// The flat `config.json` layout of the earlier script-based mirror
#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct LegacyConfig {
    #[serde(default)]
    discord_bot_token: String,
    #[serde(default)]
    telegram_bot_token: String,
    /// source channel -> [chat_id, thread_id]
    #[serde(default)]
    channel_mapping: BTreeMap<String, (i64, Option<i32>)>,
    #[serde(default)]
    filter_words: Vec<String>,
    #[serde(default = "default_message_window_hours")]
    message_window_hours: u64,
}

impl From<LegacyConfig> for Config {
    fn from(legacy: LegacyConfig) -> Self {
        Config {
            discord: DiscordConfig {
                bot_token: legacy.discord_bot_token,
                api_base_url: default_discord_api_base_url(),
                fetch_limit: default_fetch_limit(),
            },
            telegram: TelegramConfig {
                bot_token: legacy.telegram_bot_token,
                media_group_limit: default_media_group_limit(),
            },
            mirror: MirrorConfig {
                filter_words: legacy.filter_words,
                message_window_hours: legacy.message_window_hours,
                request_delay_secs: default_request_delay_secs(),
                channels: legacy
                    .channel_mapping
                    .into_iter()
                    .map(|(source, (chat_id, thread_id))| ChannelConfig {
                        source_channel_id: source,
                        chat_id,
                        thread_id,
                    })
                    .collect(),
            },
            ledger: default_ledger_config(),
            schedule: default_schedule_config(),
        }
    }
}

impl Config {
    /// Load a TOML config, or the legacy flat JSON layout when the path ends in `.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_legacy = path.extension().and_then(|e| e.to_str()) == Some("json");
        let config = if is_legacy {
            Self::from_legacy_json(&content)?
        } else {
            Self::from_toml(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn from_legacy_json(content: &str) -> Result<Self> {
        let legacy: LegacyConfig =
            serde_json::from_str(content).context("config.json is not valid JSON")?;
        Ok(legacy.into())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discord.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "discord.bot_token".to_string(),
                hint: "Set the Discord bot token.".to_string(),
            });
        }
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "telegram.bot_token".to_string(),
                hint: "Set the Telegram bot token.".to_string(),
            });
        }
        if self.mirror.channels.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "mirror.channels".to_string(),
                hint: "Add at least one [[mirror.channels]] entry.".to_string(),
            });
        }
        if self.mirror.message_window_hours == 0 {
            return Err(ConfigError::InvalidValue {
                key: "mirror.message_window_hours".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        self.message_window()?;
        if !(1..=TELEGRAM_MEDIA_GROUP_MAX).contains(&self.telegram.media_group_limit) {
            return Err(ConfigError::InvalidValue {
                key: "telegram.media_group_limit".to_string(),
                message: format!("must be between 1 and {}", TELEGRAM_MEDIA_GROUP_MAX),
            });
        }
        if !(1..=100).contains(&self.discord.fetch_limit) {
            return Err(ConfigError::InvalidValue {
                key: "discord.fetch_limit".to_string(),
                message: "must be between 1 and 100".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for channel in &self.mirror.channels {
            if !seen.insert(channel.source_channel_id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "mirror.channels".to_string(),
                    message: format!(
                        "source channel {} is mapped twice",
                        channel.source_channel_id
                    ),
                });
            }
        }
        Ok(())
    }

    /// Source channel -> destination lookup table
    pub fn channel_mapping(&self) -> HashMap<String, Destination> {
        self.mirror
            .channels
            .iter()
            .map(|c| {
                (
                    c.source_channel_id.clone(),
                    Destination {
                        chat_id: c.chat_id,
                        thread_id: c.thread_id,
                    },
                )
            })
            .collect()
    }

    /// Lookback window. Errors when the cutoff it implies can't be represented.
    pub fn message_window(&self) -> Result<chrono::Duration, ConfigError> {
        let hours = self.mirror.message_window_hours;
        i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .filter(|window| chrono::Utc::now().checked_sub_signed(*window).is_some())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "mirror.message_window_hours".to_string(),
                message: format!("{} hours reaches past the earliest representable date", hours),
            })
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_secs(self.mirror.request_delay_secs)
    }
}
