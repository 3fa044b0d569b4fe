pub mod discord;
pub mod telegram;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DeliveryError, FetchError};

/// Kind of a media item, decides how the destination sends it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

/// A media item referenced by URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
}

impl MediaRef {
    pub fn photo(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::Photo,
        }
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::Video,
        }
    }
}

/// A rich embed attached to a source message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Embed {
    pub title: Option<String>,
    pub description: Option<String>,
    /// (name, value) pairs in display order
    pub fields: Vec<(String, String)>,
    pub image_url: Option<String>,
}

/// A message fetched from a source channel, already parsed into typed form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub source_channel_id: String,
    pub message_id: String,
    pub author: String,
    pub text: String,
    pub embeds: Vec<Embed>,
    pub attachments: Vec<MediaRef>,
    pub timestamp: DateTime<Utc>,
}

/// Where a source channel gets mirrored to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub chat_id: i64,
    /// Forum topic; `None` posts to the chat's general thread
    pub thread_id: Option<i32>,
}

/// Length in UTF-16 code units, the unit Telegram measures text and entities in
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// A run of post text rendered bold, offsets in UTF-16 code units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoldSpan {
    pub offset: usize,
    pub length: usize,
}

/// A destination-ready unit of content derived from one source message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPost {
    pub destination: Destination,
    pub text: String,
    /// Embed headings inside `text`
    pub bold: Vec<BoldSpan>,
    pub media: Vec<MediaRef>,
}

/// Result of a successful post
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// ID of the first message created at the destination
    pub external_message_id: Option<i32>,
    /// Some or all media was refused by the destination and left out
    pub downgraded: bool,
}

/// Capability to read recent messages from a source channel
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_recent(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, FetchError>;
}

/// Capability to publish a normalized post at its destination
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn post(&self, post: &NormalizedPost) -> Result<Delivery, DeliveryError>;
}
