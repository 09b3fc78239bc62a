//! Evidence feeds: where scan jobs get their raw items from.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Error;
use crate::movements::FeedItem;

/// Source of raw evidence for the scanner.
#[async_trait]
pub trait EvidenceFeed: Send + Sync {
    async fn fetch_all_signals(&self) -> Result<Vec<FeedItem>, Error>;
}

/// Reads a JSON array of feed items from a file that an external
/// collector keeps up to date.
pub struct JsonFileFeed {
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EvidenceFeed for JsonFileFeed {
    async fn fetch_all_signals(&self) -> Result<Vec<FeedItem>, Error> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Feed(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let items: Vec<FeedItem> = serde_json::from_str(&raw).map_err(|e| {
            Error::Feed(format!("invalid feed file {}: {e}", self.path.display()))
        })?;

        let total = items.len();
        let items: Vec<FeedItem> = items
            .into_iter()
            .filter(|item| {
                let keep = !item.source.trim().is_empty() && !item.source_id.trim().is_empty();
                if !keep {
                    warn!(title = %item.title, "Dropping feed item without source identity");
                }
                keep
            })
            .collect();

        debug!(path = %self.path.display(), total, kept = items.len(), "Feed file read");
        Ok(items)
    }
}

/// A fixed list of items. Used when no feed is configured, and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    items: Vec<FeedItem>,
}

impl StaticFeed {
    pub fn new(items: Vec<FeedItem>) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvidenceFeed for StaticFeed {
    async fn fetch_all_signals(&self) -> Result<Vec<FeedItem>, Error> {
        Ok(self.items.clone())
    }
}
