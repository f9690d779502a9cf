use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{Database, Feed, Post, StoreError};
use crate::fetcher::{FeedItem, Fetcher, DEFAULT_TIMEOUT};

/// Per-cycle tallies of what happened to each item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// No feeds are registered.
    Idle,
    MarkFailed { feed: Feed },
    FetchFailed { feed: Feed },
    Completed { feed: Feed, stats: IngestStats },
}

/// Accepts RFC 3339 first, then RFC 1123 with a numeric zone.
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Empty descriptions are stored as absent.
pub fn normalize_description(description: &str) -> Option<String> {
    if description.is_empty() {
        None
    } else {
        Some(description.to_string())
    }
}

pub struct Ingestor {
    db: Arc<Database>,
    fetcher: Fetcher,
    timeout: Duration,
}

impl Ingestor {
    pub fn new(db: Arc<Database>, fetcher: Fetcher) -> Self {
        Self {
            db,
            fetcher,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Claim the most overdue feed, mark it, fetch it, and store its new items.
    ///
    /// Never returns an error: every failure is logged and ends the cycle early.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        let feed = match self.db.claim_next_feed_to_fetch().await {
            Ok(feed) => feed,
            Err(StoreError::NotFound(_)) => {
                info!("No feeds to fetch");
                return CycleOutcome::Idle;
            }
            Err(e) => {
                error!("Failed to claim next feed: {}", e);
                return CycleOutcome::Idle;
            }
        };

        // Mark precedes fetch, so a failing feed still moves to the back of the queue.
        if let Err(e) = self.db.mark_feed_fetched(feed.id, Utc::now()).await {
            error!("Failed to mark feed '{}' as fetched: {}", feed.name, e);
            return CycleOutcome::MarkFailed { feed };
        }

        info!("Fetching feed: {} ({})", feed.name, feed.url);

        let document = match self.fetcher.fetch(&feed.url, self.timeout, cancel).await {
            Ok(document) => document,
            Err(e) => {
                error!("Failed to fetch feed '{}': {}", feed.name, e);
                return CycleOutcome::FetchFailed { feed };
            }
        };

        let mut stats = IngestStats::default();
        for item in &document.channel.items {
            self.store_item(&feed, item, &mut stats).await;
        }

        info!(
            "Feed '{}': {} new, {} already stored, {} skipped, {} failed",
            feed.name, stats.inserted, stats.duplicates, stats.skipped, stats.failed
        );
        CycleOutcome::Completed { feed, stats }
    }

    async fn store_item(&self, feed: &Feed, item: &FeedItem, stats: &mut IngestStats) {
        let Some(published_at) = parse_published_at(&item.pub_date) else {
            warn!(
                "Skipping '{}' in feed '{}': unparseable publish date {:?}",
                item.title, feed.name, item.pub_date
            );
            stats.skipped += 1;
            return;
        };

        let now = Utc::now();
        let post = Post {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            title: item.title.clone(),
            url: item.link.clone(),
            description: normalize_description(&item.description),
            published_at,
            feed_id: feed.id,
        };

        match self.db.insert_post(&post).await {
            Ok(_) => stats.inserted += 1,
            Err(StoreError::DuplicateKey) => stats.duplicates += 1,
            Err(e) => {
                error!("Failed to store post '{}' from '{}': {}", item.link, feed.name, e);
                stats.failed += 1;
            }
        }
    }
}
