use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::DiscordConfig;
use crate::error::{FetchError, NormalizeError};
use crate::platform::{Embed, MediaRef, MessageSource, RawMessage};

/// First second of 2015, the epoch Discord snowflakes count from (ms)
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// Smallest snowflake that could have been created at `time`
pub fn snowflake_at(time: DateTime<Utc>) -> u64 {
    let ms = (time.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    ms << 22
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    author: DiscordUser,
    #[serde(default)]
    embeds: Vec<DiscordEmbed>,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    username: String,
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordEmbed {
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    fields: Vec<DiscordEmbedField>,
    image: Option<DiscordEmbedImage>,
}

#[derive(Debug, Deserialize)]
struct DiscordEmbedField {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct DiscordEmbedImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
    url: String,
    content_type: Option<String>,
}

impl DiscordAttachment {
    fn into_media(self) -> Option<MediaRef> {
        let content_type = self.content_type.as_deref().unwrap_or_default();
        if content_type.starts_with("image/") {
            Some(MediaRef::photo(self.url))
        } else if content_type.starts_with("video/") {
            Some(MediaRef::video(self.url))
        } else {
            debug!("Skipping attachment {} ({})", self.url, content_type);
            None
        }
    }
}

impl DiscordMessage {
    fn into_raw(self, channel_id: &str) -> RawMessage {
        RawMessage {
            source_channel_id: channel_id.to_string(),
            message_id: self.id,
            author: self.author.global_name.unwrap_or(self.author.username),
            text: self.content,
            embeds: self
                .embeds
                .into_iter()
                .map(|e| Embed {
                    title: e.title,
                    description: e.description,
                    fields: e.fields.into_iter().map(|f| (f.name, f.value)).collect(),
                    image_url: e.image.map(|i| i.url),
                })
                .collect(),
            attachments: self
                .attachments
                .into_iter()
                .filter_map(DiscordAttachment::into_media)
                .collect(),
            timestamp: self.timestamp,
        }
    }
}

/// Parse a channel's message list. Malformed entries are logged and skipped
/// so one bad payload doesn't hide the rest of the channel.
pub fn parse_messages(channel_id: &str, payload: Vec<serde_json::Value>) -> Vec<RawMessage> {
    let mut messages: Vec<RawMessage> = payload
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<DiscordMessage>(value) {
            Ok(msg) => Some(msg.into_raw(channel_id)),
            Err(e) => {
                let err = NormalizeError::MalformedMessage {
                    channel_id: channel_id.to_string(),
                    reason: e.to_string(),
                };
                warn!("{}", err);
                None
            }
        })
        .collect();

    // The API returns newest first
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    messages
}

/// Reads channel history through the Discord bot REST API
pub struct DiscordSource {
    client: reqwest::Client,
    config: DiscordConfig,
}

impl DiscordSource {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl MessageSource for DiscordSource {
    async fn fetch_recent(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, FetchError> {
        let url = format!(
            "{}/channels/{}/messages",
            self.config.api_base_url.trim_end_matches('/'),
            channel_id
        );

        debug!("Fetching Discord messages: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bot {}", self.config.bot_token))
            .query(&[
                ("limit", self.config.fetch_limit.to_string()),
                ("after", snowflake_at(since).to_string()),
            ])
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Api {
                channel_id: channel_id.to_string(),
                status,
                body,
            });
        }

        let payload: Vec<serde_json::Value> =
            response.json().await.map_err(|e| FetchError::Decode {
                channel_id: channel_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(parse_messages(channel_id, payload))
    }
}
