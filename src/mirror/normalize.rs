//! Turns one Discord message into Telegram-ready posts.
//!
//! Text comes from the message body and its embeds, with Discord markup and
//! configured filter words removed. Embed titles and field names are marked
//! bold through spans, the text itself stays plain. Media comes from
//! image/video attachments and embed images. Posts with more media than a
//! Telegram media group can hold are split, and only the first part carries
//! the text.

use regex::{Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::platform::{utf16_len, BoldSpan, Destination, MediaRef, NormalizedPost, RawMessage};

static CUSTOM_EMOJI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<a?:\w+:\d+>").unwrap());
static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?\d+>|<@&\d+>|<#\d+>").unwrap());
static FORMATTING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_~`|]").unwrap());

/// Remove Discord custom emoji, mentions and formatting characters
pub fn strip_markup(text: &str) -> String {
    let text = CUSTOM_EMOJI.replace_all(text, "");
    let text = MENTION.replace_all(&text, "");
    FORMATTING.replace_all(&text, "").into_owned()
}

/// Only absolute http(s) URLs can be handed to Telegram
pub fn is_valid_media_url(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Case-insensitive removal of configured words and phrases
#[derive(Debug, Clone, Default)]
pub struct WordFilter {
    pattern: Option<Regex>,
}

impl WordFilter {
    pub fn new(words: &[String]) -> Result<Self, regex::Error> {
        let mut words: Vec<&String> = words.iter().filter(|w| !w.is_empty()).collect();
        if words.is_empty() {
            return Ok(Self::default());
        }
        // Longest first, so "spam bot" wins over "spam"
        words.sort_by(|a, b| b.len().cmp(&a.len()));
        let alternation = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    /// Remove every occurrence. Repeats until stable, since a removal can
    /// join the pieces of a new occurrence ("spspamam").
    pub fn redact(&self, text: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return text.to_string();
        };
        let mut current = text.to_string();
        loop {
            let next = pattern.replace_all(&current, "");
            if next == current {
                return current;
            }
            current = next.into_owned();
        }
    }
}

pub struct Normalizer {
    filter: WordFilter,
    media_group_limit: usize,
}

impl Normalizer {
    pub fn new(filter: WordFilter, media_group_limit: usize) -> Self {
        Self {
            filter,
            media_group_limit: media_group_limit.max(1),
        }
    }

    /// Zero posts if the channel is unmapped or nothing survives filtering.
    pub fn normalize(
        &self,
        message: &RawMessage,
        mapping: &HashMap<String, Destination>,
    ) -> Vec<NormalizedPost> {
        let Some(destination) = mapping.get(&message.source_channel_id) else {
            debug!(
                "No mapping for channel {}, skipping message {}",
                message.source_channel_id, message.message_id
            );
            return Vec::new();
        };

        let (text, bold) = self.build_text(message);
        let media = self.collect_media(message);

        if text.is_empty() && media.is_empty() {
            debug!(
                "Message {} by {} has no content after filtering",
                message.message_id, message.author
            );
            return Vec::new();
        }

        if media.is_empty() {
            return vec![NormalizedPost {
                destination: *destination,
                text,
                bold,
                media,
            }];
        }

        media
            .chunks(self.media_group_limit)
            .enumerate()
            .map(|(i, chunk)| NormalizedPost {
                destination: *destination,
                text: if i == 0 { text.clone() } else { String::new() },
                bold: if i == 0 { bold.clone() } else { Vec::new() },
                media: chunk.to_vec(),
            })
            .collect()
    }

    /// Filter words go first so ones containing markup characters still match,
    /// and again after so stripping can't reassemble one.
    fn clean(&self, text: &str) -> String {
        let text = strip_markup(&self.filter.redact(text));
        self.filter.redact(&text).trim().to_string()
    }

    fn clean_heading(&self, text: &str) -> String {
        self.filter.redact(text).trim().to_string()
    }

    /// Body text plus the embed titles and field names to show in bold.
    fn build_text(&self, message: &RawMessage) -> (String, Vec<BoldSpan>) {
        // (heading, body) pairs
        let mut parts = vec![(String::new(), self.clean(&message.text))];

        for embed in &message.embeds {
            if let Some(title) = &embed.title {
                parts.push((self.clean_heading(title), String::new()));
            }
            if let Some(description) = &embed.description {
                parts.push((String::new(), self.clean(description)));
            }
            for (name, value) in &embed.fields {
                let name = self.clean_heading(name);
                let value = self.clean(value);
                if !name.is_empty() && !value.is_empty() {
                    parts.push((name, value));
                }
            }
        }

        let mut text = String::new();
        let mut bold = Vec::new();
        for (heading, body) in parts {
            if heading.is_empty() && body.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            if !heading.is_empty() {
                bold.push(BoldSpan {
                    offset: utf16_len(&text),
                    length: utf16_len(&heading),
                });
                text.push_str(&heading);
                if !body.is_empty() {
                    text.push('\n');
                }
            }
            text.push_str(&body);
        }

        // Parts are clean on their own; a word spanning two of them is not
        let redacted = self.filter.redact(&text).trim().to_string();
        if redacted != text {
            bold.clear();
        }
        (redacted, bold)
    }

    fn collect_media(&self, message: &RawMessage) -> Vec<MediaRef> {
        let embed_images = message
            .embeds
            .iter()
            .filter_map(|e| e.image_url.as_deref())
            .map(MediaRef::photo);

        let mut seen = HashSet::new();
        let mut media = Vec::new();
        for item in message.attachments.iter().cloned().chain(embed_images) {
            if !seen.insert(item.url.clone()) {
                continue;
            }
            if !is_valid_media_url(&item.url) {
                warn!(
                    "Dropping malformed media URL {:?} from message {}",
                    item.url, message.message_id
                );
                continue;
            }
            media.push(item);
        }
        media
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Embed;
    use chrono::Utc;

    fn mapping() -> HashMap<String, Destination> {
        HashMap::from([(
            "chan".to_string(),
            Destination {
                chat_id: -100,
                thread_id: Some(3),
            },
        )])
    }

    fn message(text: &str) -> RawMessage {
        RawMessage {
            source_channel_id: "chan".to_string(),
            message_id: "1".to_string(),
            author: "alice".to_string(),
            text: text.to_string(),
            embeds: Vec::new(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn images(count: usize) -> Vec<MediaRef> {
        (0..count)
            .map(|i| MediaRef::photo(format!("https://cdn.example.com/{}.png", i)))
            .collect()
    }

    fn normalizer(words: &[&str], limit: usize) -> Normalizer {
        let words: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        Normalizer::new(WordFilter::new(&words).unwrap(), limit)
    }

    #[test]
    fn test_filter_word_removed_from_text() {
        let n = normalizer(&["word_to_remove_1"], 10);
        let posts = n.normalize(&message("Hello word_to_remove_1 world"), &mapping());
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, "Hello  world");
        assert!(posts[0].media.is_empty());
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let n = normalizer(&["secret"], 10);
        let posts = n.normalize(&message("a SeCrEt b secret c SECRET"), &mapping());
        assert_eq!(posts[0].text, "a  b  c");
    }

    #[test]
    fn test_filter_words_never_survive() {
        let words = ["spam", "buy now", "x_y"];
        let n = normalizer(&words, 10);
        let inputs = [
            "spspamam",
            "BUY NOW buy now Buy Now",
            "x_y and x*_y and x__y",
            "sp*am hidden by markup",
            "clean text",
        ];
        for input in inputs {
            let mut msg = message(input);
            msg.embeds.push(Embed {
                title: Some(format!("title {}", input)),
                description: Some(input.to_string()),
                fields: vec![("SPAM field".to_string(), input.to_string())],
                image_url: None,
            });
            for post in n.normalize(&msg, &mapping()) {
                let lower = post.text.to_lowercase();
                for word in words {
                    assert!(
                        !lower.contains(word),
                        "{:?} still contains {:?}",
                        post.text,
                        word
                    );
                }
            }
        }
    }

    #[test]
    fn test_unmapped_channel_produces_nothing() {
        let n = normalizer(&[], 10);
        let mut msg = message("hello");
        msg.source_channel_id = "other".to_string();
        assert!(n.normalize(&msg, &mapping()).is_empty());
    }

    #[test]
    fn test_empty_after_filtering_produces_nothing() {
        let n = normalizer(&["gone"], 10);
        for text in ["", "   ", "gone", "GONE gone", "<@123> **~~||", "<:pepe:1234>"] {
            assert!(
                n.normalize(&message(text), &mapping()).is_empty(),
                "{:?} should reduce to nothing",
                text
            );
        }
    }

    #[test]
    fn test_discord_markup_stripped() {
        let n = normalizer(&[], 10);
        let posts = n.normalize(
            &message("**Hey** <@!42> see <#99> <a:dance:777> and `code` ~~old~~"),
            &mapping(),
        );
        assert_eq!(posts[0].text, "Hey  see   and code old");
    }

    #[test]
    fn test_embed_text_layout() {
        let n = normalizer(&[], 10);
        let mut msg = message("intro");
        msg.embeds.push(Embed {
            title: Some("Patch 1.2".to_string()),
            description: Some("*Big* update".to_string()),
            fields: vec![
                ("Added".to_string(), "maps".to_string()),
                ("Empty".to_string(), "".to_string()),
                ("Fixed".to_string(), "crash".to_string()),
            ],
            image_url: None,
        });
        let posts = n.normalize(&msg, &mapping());
        assert_eq!(
            posts[0].text,
            "intro\n\nPatch 1.2\n\nBig update\n\nAdded\nmaps\n\nFixed\ncrash"
        );
        assert_eq!(
            posts[0].bold,
            vec![
                BoldSpan {
                    offset: 7,
                    length: 9
                },
                BoldSpan {
                    offset: 30,
                    length: 5
                },
                BoldSpan {
                    offset: 42,
                    length: 5
                },
            ]
        );
    }

    #[test]
    fn test_bold_offsets_count_utf16_units() {
        let n = normalizer(&[], 10);
        let mut msg = message("🎉 news");
        msg.embeds.push(Embed {
            title: Some("Héllo".to_string()),
            ..Default::default()
        });
        let posts = n.normalize(&msg, &mapping());
        assert_eq!(posts[0].text, "🎉 news\n\nHéllo");
        // the emoji is a surrogate pair
        assert_eq!(
            posts[0].bold,
            vec![BoldSpan {
                offset: 9,
                length: 5
            }]
        );
    }

    #[test]
    fn test_plain_message_has_no_bold() {
        let n = normalizer(&[], 10);
        let mut msg = message("caption");
        msg.attachments = images(12);
        let posts = n.normalize(&msg, &mapping());
        assert!(posts.iter().all(|p| p.bold.is_empty()));
    }

    #[test]
    fn test_twelve_images_split_into_ten_and_two() {
        let n = normalizer(&[], 10);
        let mut msg = message("caption");
        msg.attachments = images(12);
        let posts = n.normalize(&msg, &mapping());

        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].media.len(), 10);
        assert_eq!(posts[0].text, "caption");
        assert_eq!(posts[1].media.len(), 2);
        assert_eq!(posts[1].text, "");
        assert_eq!(posts[1].media[1].url, "https://cdn.example.com/11.png");
    }

    #[test]
    fn test_unit_count_is_ceil_of_media_over_limit() {
        for limit in [1, 3, 10] {
            let n = normalizer(&[], limit);
            for count in 1..=25 {
                let mut msg = message("text");
                msg.attachments = images(count);
                let posts = n.normalize(&msg, &mapping());
                assert_eq!(posts.len(), count.div_ceil(limit));
                assert!(posts.iter().all(|p| p.media.len() <= limit));
                assert!(posts.iter().skip(1).all(|p| p.text.is_empty()));
                assert_eq!(posts[0].text, "text");
                let total: usize = posts.iter().map(|p| p.media.len()).sum();
                assert_eq!(total, count);
            }
        }
    }

    #[test]
    fn test_media_union_dedup_and_order() {
        let n = normalizer(&[], 10);
        let mut msg = message("");
        msg.attachments = vec![
            MediaRef::photo("https://cdn.example.com/a.png"),
            MediaRef::video("https://cdn.example.com/b.mp4"),
        ];
        msg.embeds.push(Embed {
            image_url: Some("https://cdn.example.com/a.png".to_string()),
            ..Default::default()
        });
        msg.embeds.push(Embed {
            image_url: Some("https://cdn.example.com/c.png".to_string()),
            ..Default::default()
        });

        let posts = n.normalize(&msg, &mapping());
        let urls: Vec<&str> = posts[0].media.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example.com/a.png",
                "https://cdn.example.com/b.mp4",
                "https://cdn.example.com/c.png",
            ]
        );
        assert_eq!(posts[0].destination.thread_id, Some(3));
    }

    #[test]
    fn test_malformed_media_downgrades_to_text() {
        let n = normalizer(&[], 10);
        let mut msg = message("still here");
        msg.attachments = vec![
            MediaRef::photo("not a url"),
            MediaRef::photo("ftp://cdn.example.com/a.png"),
        ];
        let posts = n.normalize(&msg, &mapping());
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].text, "still here");
        assert!(posts[0].media.is_empty());
    }

    #[test]
    fn test_media_only_message_kept() {
        let n = normalizer(&[], 10);
        let mut msg = message("");
        msg.attachments = images(1);
        let posts = n.normalize(&msg, &mapping());
        assert_eq!(posts.len(), 1);
        assert!(posts[0].text.is_empty());
    }

    #[test]
    fn test_empty_filter_list_is_noop() {
        let filter = WordFilter::new(&["".to_string()]).unwrap();
        assert_eq!(filter.redact("anything"), "anything");
    }
}
