pub mod batch;
pub mod normalize;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::ledger::{Ledger, LedgerKey};
use crate::platform::{Destination, MessageSink, MessageSource, RawMessage};
use batch::{Batcher, OutgoingMessage};
use normalize::{Normalizer, WordFilter};

/// Counters for one run, logged when it finishes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub channels: usize,
    pub failed_channels: usize,
    pub fetched: usize,
    pub out_of_window: usize,
    pub already_mirrored: usize,
    pub duplicates: usize,
    pub dropped_empty: usize,
    pub posts_delivered: usize,
    pub posts_downgraded: usize,
    pub posts_failed: usize,
    pub messages_committed: usize,
}

impl RunSummary {
    fn log(&self) {
        info!(
            channels = self.channels,
            failed_channels = self.failed_channels,
            fetched = self.fetched,
            out_of_window = self.out_of_window,
            already_mirrored = self.already_mirrored,
            duplicates = self.duplicates,
            dropped_empty = self.dropped_empty,
            posts_delivered = self.posts_delivered,
            posts_downgraded = self.posts_downgraded,
            posts_failed = self.posts_failed,
            messages_committed = self.messages_committed,
            "Mirror run finished"
        );
    }
}

/// Numeric order for decimal snowflakes of any length ("9" before "10")
fn snowflake_order(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// One pass of fetch, filter, normalize, deliver and commit across every
/// mapped channel.
pub struct MirrorPipeline {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn MessageSink>,
    mapping: HashMap<String, Destination>,
    window: chrono::Duration,
    normalizer: Normalizer,
    batcher: Batcher,
}

impl MirrorPipeline {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn MessageSink>,
        mapping: HashMap<String, Destination>,
        window: chrono::Duration,
        normalizer: Normalizer,
        batcher: Batcher,
    ) -> Self {
        Self {
            source,
            sink,
            mapping,
            window,
            normalizer,
            batcher,
        }
    }

    pub fn from_config(
        config: &Config,
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self> {
        let filter =
            WordFilter::new(&config.mirror.filter_words).context("Invalid filter words")?;
        let limit = config.telegram.media_group_limit;
        Ok(Self::new(
            source,
            sink,
            config.channel_mapping(),
            config.message_window()?,
            Normalizer::new(filter, limit),
            Batcher::new(limit, config.request_delay()),
        ))
    }

    pub async fn run(&self, ledger: &mut Ledger) -> RunSummary {
        self.run_at(ledger, Utc::now()).await
    }

    /// Run with an explicit clock. The ledger is flushed before returning.
    pub async fn run_at(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> RunSummary {
        let span = info_span!("mirror_run", run_id = %Uuid::new_v4());
        self.run_inner(ledger, now).instrument(span).await
    }

    async fn run_inner(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::default();
        let cutoff = now
            .checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        info!(
            "Starting mirror run for messages after {} ({} already mirrored)",
            cutoff,
            ledger.len()
        );

        let fetched = self.fetch_all(cutoff, &mut summary).await;
        let fresh = self.filter_new(fetched, cutoff, ledger, &mut summary);

        let outgoing: Vec<OutgoingMessage> = fresh
            .iter()
            .filter_map(|message| {
                let posts = self.normalizer.normalize(message, &self.mapping);
                if posts.is_empty() {
                    summary.dropped_empty += 1;
                    return None;
                }
                Some(OutgoingMessage {
                    key: LedgerKey::new(&message.source_channel_id, &message.message_id),
                    posts,
                })
            })
            .collect();

        self.deliver(self.batcher.plan(outgoing), ledger, &mut summary)
            .await;

        if let Err(e) = ledger.flush() {
            error!(
                "Ledger flush failed, {} entries will be retried: {}",
                ledger.pending(),
                e
            );
        }

        summary.log();
        summary
    }

    async fn fetch_all(&self, cutoff: DateTime<Utc>, summary: &mut RunSummary) -> Vec<RawMessage> {
        let mut channels: Vec<&String> = self.mapping.keys().collect();
        channels.sort();

        let mut messages = Vec::new();
        for channel_id in channels {
            summary.channels += 1;
            match self.source.fetch_recent(channel_id, cutoff).await {
                Ok(batch) => {
                    debug!("Fetched {} messages from channel {}", batch.len(), channel_id);
                    summary.fetched += batch.len();
                    messages.extend(batch);
                }
                Err(e) => {
                    summary.failed_channels += 1;
                    error!("Skipping channel {}: {}", channel_id, e);
                }
            }
        }
        messages
    }

    /// Window and ledger filtering, then a total order across channels:
    /// (timestamp, channel, message id).
    fn filter_new(
        &self,
        messages: Vec<RawMessage>,
        cutoff: DateTime<Utc>,
        ledger: &Ledger,
        summary: &mut RunSummary,
    ) -> Vec<RawMessage> {
        let mut seen = HashSet::new();
        let mut fresh: Vec<RawMessage> = messages
            .into_iter()
            .filter(|m| {
                if m.timestamp <= cutoff {
                    summary.out_of_window += 1;
                    return false;
                }
                let key = LedgerKey::new(&m.source_channel_id, &m.message_id);
                if ledger.contains(&key) {
                    summary.already_mirrored += 1;
                    return false;
                }
                if !seen.insert(key) {
                    summary.duplicates += 1;
                    return false;
                }
                true
            })
            .collect();

        fresh.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| snowflake_order(&a.source_channel_id, &b.source_channel_id))
                .then_with(|| snowflake_order(&a.message_id, &b.message_id))
        });
        fresh
    }

    async fn deliver(
        &self,
        plan: Vec<OutgoingMessage>,
        ledger: &mut Ledger,
        summary: &mut RunSummary,
    ) {
        let mut first = true;
        for message in plan {
            let mut complete = true;
            for (i, post) in message.posts.iter().enumerate() {
                if !first {
                    self.batcher.pace().await;
                }
                first = false;

                match self.sink.post(post).await {
                    Ok(delivery) => {
                        summary.posts_delivered += 1;
                        if delivery.downgraded {
                            summary.posts_downgraded += 1;
                        }
                        debug!(
                            "Delivered part {}/{} of {} as {:?}",
                            i + 1,
                            message.posts.len(),
                            message.key,
                            delivery.external_message_id
                        );
                    }
                    Err(e) => {
                        summary.posts_failed += 1;
                        complete = false;
                        warn!(
                            "Delivery of part {}/{} of {} failed, will retry next run: {}",
                            i + 1,
                            message.posts.len(),
                            message.key,
                            e
                        );
                    }
                }
            }

            if complete {
                ledger.record(message.key);
                summary.messages_committed += 1;
            }
        }
    }
}
