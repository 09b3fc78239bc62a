//! Tracked movements and the signals that evidence them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle stage of a movement. `Dormant` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detected,
    Verified,
    Growing,
    Trending,
    Peaked,
    Declining,
    Dormant,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detected => "detected",
            Stage::Verified => "verified",
            Stage::Growing => "growing",
            Stage::Trending => "trending",
            Stage::Peaked => "peaked",
            Stage::Declining => "declining",
            Stage::Dormant => "dormant",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Dormant)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(Stage::Detected),
            "verified" => Ok(Stage::Verified),
            "growing" => Ok(Stage::Growing),
            "trending" => Ok(Stage::Trending),
            "peaked" => Ok(Stage::Peaked),
            "declining" => Ok(Stage::Declining),
            "dormant" => Ok(Stage::Dormant),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// A tracked movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub id: Uuid,
    pub name: String,
    pub summary: String,
    pub stage: Stage,
    /// 0–100.
    pub momentum_score: u8,
    pub peak_momentum_score: u8,
    pub peak_at: Option<DateTime<Utc>>,
    pub last_signal_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Movement {
    /// A freshly detected movement.
    pub fn detected(
        name: impl Into<String>,
        summary: impl Into<String>,
        momentum_score: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            summary: summary.into(),
            stage: Stage::Detected,
            momentum_score: momentum_score.min(100),
            peak_momentum_score: 0,
            peak_at: None,
            last_signal_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whole and fractional hours since the last linked signal.
    pub fn hours_idle(&self, now: DateTime<Utc>) -> f64 {
        let secs = now.signed_duration_since(self.last_signal_at).num_seconds();
        secs.max(0) as f64 / 3600.0
    }
}

/// A raw item as delivered by an evidence feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub source: String,
    pub source_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A persisted signal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub url: Option<String>,
    pub metadata: serde_json::Value,
    /// `None` for the unlinked copy written at ingest.
    pub movement_id: Option<Uuid>,
    pub ingested_at: DateTime<Utc>,
}

impl Signal {
    pub fn from_feed(item: FeedItem, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: item.source,
            source_id: item.source_id,
            title: item.title,
            content: item.content,
            url: item.url,
            metadata: item.metadata,
            movement_id: None,
            ingested_at: now,
        }
    }
}
