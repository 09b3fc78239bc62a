//! Movement detection: evidence feeds, dedup, and the decay-driven lifecycle.

pub mod cycle;
pub mod dedup;
pub mod feed;
pub mod lifecycle;
pub mod model;

pub use cycle::{CycleReport, MovementCycle, TransitionRecord};
pub use dedup::{DedupResult, Deduplicator, MatchProposal, MovementProfile, normalize_name};
pub use feed::{EvidenceFeed, JsonFileFeed, StaticFeed};
pub use lifecycle::{Guard, Lifecycle, Observation, StageChange, Step, Transition};
pub use model::{FeedItem, Movement, Signal, Stage};
