use std::time::Duration;

use crate::ledger::LedgerKey;
use crate::platform::NormalizedPost;

/// All posts derived from one source message, committed to the ledger together
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub key: LedgerKey,
    pub posts: Vec<NormalizedPost>,
}

/// Sequences posts for delivery: enforces the media-group limit and spaces
/// sends out by a fixed delay.
pub struct Batcher {
    media_group_limit: usize,
    delay: Duration,
}

impl Batcher {
    pub fn new(media_group_limit: usize, delay: Duration) -> Self {
        Self {
            media_group_limit: media_group_limit.max(1),
            delay,
        }
    }

    /// Re-chunk any post over the limit, keeping message and post order.
    /// Messages without posts are dropped.
    pub fn plan(&self, messages: Vec<OutgoingMessage>) -> Vec<OutgoingMessage> {
        messages
            .into_iter()
            .filter(|m| !m.posts.is_empty())
            .map(|m| OutgoingMessage {
                key: m.key,
                posts: m
                    .posts
                    .into_iter()
                    .flat_map(|p| self.enforce_limit(p))
                    .collect(),
            })
            .collect()
    }

    fn enforce_limit(&self, post: NormalizedPost) -> Vec<NormalizedPost> {
        if post.media.len() <= self.media_group_limit {
            return vec![post];
        }
        post.media
            .chunks(self.media_group_limit)
            .enumerate()
            .map(|(i, chunk)| NormalizedPost {
                destination: post.destination,
                text: if i == 0 {
                    post.text.clone()
                } else {
                    String::new()
                },
                bold: if i == 0 {
                    post.bold.clone()
                } else {
                    Vec::new()
                },
                media: chunk.to_vec(),
            })
            .collect()
    }

    /// Wait between two consecutive sends
    pub async fn pace(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Destination, MediaRef};

    fn post(text: &str, media: usize) -> NormalizedPost {
        NormalizedPost {
            destination: Destination {
                chat_id: 1,
                thread_id: None,
            },
            text: text.to_string(),
            bold: Vec::new(),
            media: (0..media)
                .map(|i| MediaRef::photo(format!("https://cdn.example.com/{}.png", i)))
                .collect(),
        }
    }

    #[test]
    fn test_plan_keeps_order_and_small_posts() {
        let batcher = Batcher::new(10, Duration::ZERO);
        let plan = batcher.plan(vec![
            OutgoingMessage {
                key: LedgerKey::new("c", "1"),
                posts: vec![post("a", 0), post("", 3)],
            },
            OutgoingMessage {
                key: LedgerKey::new("c", "2"),
                posts: vec![post("b", 10)],
            },
        ]);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].key, LedgerKey::new("c", "1"));
        assert_eq!(plan[0].posts.len(), 2);
        assert_eq!(plan[0].posts[0].text, "a");
        assert_eq!(plan[1].posts.len(), 1);
    }

    #[test]
    fn test_plan_rechunks_oversized_media() {
        let batcher = Batcher::new(4, Duration::ZERO);
        let plan = batcher.plan(vec![OutgoingMessage {
            key: LedgerKey::new("c", "1"),
            posts: vec![post("caption", 10), post("next", 1)],
        }]);

        let sizes: Vec<usize> = plan[0].posts.iter().map(|p| p.media.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2, 1]);
        let texts: Vec<&str> = plan[0].posts.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["caption", "", "", "next"]);
        assert_eq!(
            plan[0].posts[1].media[0].url,
            "https://cdn.example.com/4.png"
        );
    }

    #[test]
    fn test_plan_drops_empty_messages() {
        let batcher = Batcher::new(10, Duration::ZERO);
        let plan = batcher.plan(vec![OutgoingMessage {
            key: LedgerKey::new("c", "1"),
            posts: Vec::new(),
        }]);
        assert!(plan.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_waits_for_delay() {
        let batcher = Batcher::new(10, Duration::from_secs(3));
        let start = tokio::time::Instant::now();
        batcher.pace().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
