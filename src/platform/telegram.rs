use async_trait::async_trait;
use teloxide::payloads::{
    SendMediaGroupSetters, SendMessageSetters, SendPhotoSetters, SendVideoSetters,
};
use teloxide::prelude::*;
use teloxide::types::{
    InputFile, InputMedia, InputMediaPhoto, InputMediaVideo, MessageEntity, MessageId, ThreadId,
};
use tracing::{info, warn};

use crate::error::DeliveryError;
use crate::platform::{
    utf16_len, BoldSpan, Delivery, Destination, MediaKind, MediaRef, MessageSink, NormalizedPost,
};

/// Telegram's limit for a text message
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
/// Telegram's limit for a media caption
pub const TELEGRAM_MAX_CAPTION_LEN: usize = 1024;

/// Split long messages for Telegram's 4096 char limit
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// How the text of a media post travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptionPlan {
    None,
    Inline,
    /// Too long for a caption, goes out as its own message first
    Separate,
}

fn plan_caption(text: &str) -> CaptionPlan {
    if text.is_empty() {
        CaptionPlan::None
    } else if utf16_len(text) <= TELEGRAM_MAX_CAPTION_LEN {
        CaptionPlan::Inline
    } else {
        CaptionPlan::Separate
    }
}

fn parse_media_url(media: &MediaRef) -> Result<reqwest::Url, DeliveryError> {
    reqwest::Url::parse(&media.url).map_err(|e| DeliveryError::InvalidMedia {
        url: media.url.clone(),
        reason: e.to_string(),
    })
}

/// Bold entities for the part of the text in `start..end` (UTF-16 units),
/// shifted so they're relative to `start`
fn bold_entities(spans: &[BoldSpan], start: usize, end: usize) -> Vec<MessageEntity> {
    spans
        .iter()
        .filter_map(|span| {
            let from = span.offset.max(start);
            let to = (span.offset + span.length).min(end);
            (from < to).then(|| MessageEntity::bold(from - start, to - from))
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Caption<'a> {
    text: &'a str,
    bold: &'a [BoldSpan],
}

impl Caption<'_> {
    fn entities(&self) -> Vec<MessageEntity> {
        bold_entities(self.bold, 0, utf16_len(self.text))
    }
}

/// What made it out of one media send
#[derive(Debug, Default)]
struct MediaSent {
    first_id: Option<i32>,
    dropped: usize,
}

/// Posts normalized content through the Telegram Bot API
pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot: Bot::new(bot_token),
        }
    }

    async fn send_text(
        &self,
        dest: Destination,
        text: &str,
        bold: &[BoldSpan],
    ) -> Result<Option<i32>, DeliveryError> {
        let mut first_id = None;
        let mut offset = 0;
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LEN) {
            let len = utf16_len(&chunk);
            let entities = bold_entities(bold, offset, offset + len);
            offset += len;

            let mut req = self.bot.send_message(ChatId(dest.chat_id), chunk);
            if !entities.is_empty() {
                req = req.entities(entities);
            }
            if let Some(thread) = dest.thread_id {
                req = req.message_thread_id(ThreadId(MessageId(thread)));
            }
            let sent = req.await?;
            first_id.get_or_insert(sent.id.0);
        }
        Ok(first_id)
    }

    async fn send_one(
        &self,
        dest: Destination,
        media: &MediaRef,
        caption: Option<Caption<'_>>,
    ) -> Result<i32, DeliveryError> {
        let chat_id = ChatId(dest.chat_id);
        let input = InputFile::url(parse_media_url(media)?);
        let sent = match media.kind {
            MediaKind::Photo => {
                let mut req = self.bot.send_photo(chat_id, input);
                if let Some(caption) = caption {
                    req = req
                        .caption(caption.text)
                        .caption_entities(caption.entities());
                }
                if let Some(thread) = dest.thread_id {
                    req = req.message_thread_id(ThreadId(MessageId(thread)));
                }
                req.await?
            }
            MediaKind::Video => {
                let mut req = self.bot.send_video(chat_id, input);
                if let Some(caption) = caption {
                    req = req
                        .caption(caption.text)
                        .caption_entities(caption.entities());
                }
                if let Some(thread) = dest.thread_id {
                    req = req.message_thread_id(ThreadId(MessageId(thread)));
                }
                req.await?
            }
        };
        Ok(sent.id.0)
    }

    async fn send_group(
        &self,
        dest: Destination,
        media: &[MediaRef],
        caption: Option<Caption<'_>>,
    ) -> Result<Option<i32>, DeliveryError> {
        let mut group = Vec::with_capacity(media.len());
        for (i, item) in media.iter().enumerate() {
            let input = InputFile::url(parse_media_url(item)?);
            let caption = if i == 0 { caption } else { None };
            let entry = match item.kind {
                MediaKind::Photo => {
                    let mut photo = InputMediaPhoto::new(input);
                    if let Some(caption) = caption {
                        photo = photo
                            .caption(caption.text)
                            .caption_entities(caption.entities());
                    }
                    InputMedia::Photo(photo)
                }
                MediaKind::Video => {
                    let mut video = InputMediaVideo::new(input);
                    if let Some(caption) = caption {
                        video = video
                            .caption(caption.text)
                            .caption_entities(caption.entities());
                    }
                    InputMedia::Video(video)
                }
            };
            group.push(entry);
        }

        let mut req = self.bot.send_media_group(ChatId(dest.chat_id), group);
        if let Some(thread) = dest.thread_id {
            req = req.message_thread_id(ThreadId(MessageId(thread)));
        }
        let sent = req.await?;
        info!(
            "Sent media group with {} items to chat {}",
            media.len(),
            dest.chat_id
        );
        Ok(sent.first().map(|m| m.id.0))
    }

    /// Send items one by one, leaving out the ones Telegram refuses. The
    /// caption rides on the first item that goes through.
    async fn send_each(
        &self,
        dest: Destination,
        media: &[MediaRef],
        mut caption: Option<Caption<'_>>,
    ) -> Result<MediaSent, DeliveryError> {
        let mut sent = MediaSent::default();
        for item in media {
            match self.send_one(dest, item, caption).await {
                Ok(id) => {
                    info!("Sent single {:?} to chat {}", item.kind, dest.chat_id);
                    sent.first_id.get_or_insert(id);
                    caption = None;
                }
                Err(e) if e.is_permanent() => {
                    warn!("Leaving out media {}: {}", item.url, e);
                    sent.dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    async fn send_media(
        &self,
        dest: Destination,
        media: &[MediaRef],
        caption: Option<Caption<'_>>,
    ) -> Result<MediaSent, DeliveryError> {
        if media.len() > 1 {
            match self.send_group(dest, media, caption).await {
                Ok(first_id) => {
                    return Ok(MediaSent {
                        first_id,
                        dropped: 0,
                    });
                }
                Err(e) if e.is_permanent() => {
                    warn!("Media group refused ({}), sending items one at a time", e);
                }
                Err(e) => return Err(e),
            }
        }
        self.send_each(dest, media, caption).await
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    /// Media Telegram refuses is left out and the post counts as downgraded.
    /// Only transient failures (network, rate limit) are errors, so a
    /// permanently bad URL can't keep a message from being committed.
    async fn post(&self, post: &NormalizedPost) -> Result<Delivery, DeliveryError> {
        let dest = post.destination;

        if post.media.is_empty() {
            if post.text.is_empty() {
                return Err(DeliveryError::Empty);
            }
            let id = self.send_text(dest, &post.text, &post.bold).await?;
            info!("Sent text-only message to chat {}", dest.chat_id);
            return Ok(Delivery {
                external_message_id: id,
                downgraded: false,
            });
        }

        let plan = plan_caption(&post.text);
        let text_id = if plan == CaptionPlan::Separate {
            self.send_text(dest, &post.text, &post.bold).await?
        } else {
            None
        };
        let caption = (plan == CaptionPlan::Inline).then_some(Caption {
            text: &post.text,
            bold: &post.bold,
        });

        let sent = self.send_media(dest, &post.media, caption).await?;
        let mut external_message_id = text_id.or(sent.first_id);
        if sent.first_id.is_none() && plan == CaptionPlan::Inline {
            warn!("No media could be sent, falling back to text-only");
            external_message_id = self.send_text(dest, &post.text, &post.bold).await?;
        }

        Ok(Delivery {
            external_message_id,
            downgraded: sent.dropped > 0,
        })
    }
}
