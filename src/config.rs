//! Configuration types.
//!
//! Everything is read from environment variables with sensible defaults;
//! `from_env()` only fails when a variable is set to something unparseable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::jobs::JobType;

/// Read and parse an optional env var, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Sleep between poll rounds that found no work.
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each idle sleep, so workers
    /// started together drift apart.
    pub poll_jitter: Duration,
    /// Job types this worker claims, in visiting order.
    pub job_types: Vec<JobType>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/boardroom.db"),
            poll_interval: Duration::from_secs(10),
            poll_jitter: Duration::from_millis(500),
            job_types: JobType::ALL.to_vec(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("BOARDROOM_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let poll_secs: u64 = env_or(
            "BOARDROOM_POLL_INTERVAL_SECS",
            defaults.poll_interval.as_secs(),
        )?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BOARDROOM_POLL_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let jitter_ms: u64 = env_or(
            "BOARDROOM_POLL_JITTER_MS",
            defaults.poll_jitter.as_millis() as u64,
        )?;

        let job_types = match std::env::var("BOARDROOM_JOB_TYPES") {
            Ok(raw) if !raw.trim().is_empty() => parse_job_types(&raw)?,
            _ => defaults.job_types,
        };

        Ok(Self {
            db_path,
            poll_interval: Duration::from_secs(poll_secs),
            poll_jitter: Duration::from_millis(jitter_ms),
            job_types,
        })
    }
}

/// Parse a comma-separated job type list, dropping duplicates.
pub fn parse_job_types(raw: &str) -> Result<Vec<JobType>, ConfigError> {
    let mut types = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let job_type: JobType = part.parse().map_err(|e| ConfigError::InvalidValue {
            key: "BOARDROOM_JOB_TYPES".to_string(),
            message: e,
        })?;
        if !types.contains(&job_type) {
            types.push(job_type);
        }
    }
    Ok(types)
}

/// Thresholds of the movement lifecycle transition table.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    /// detected → verified needs at least this many distinct sources.
    pub min_distinct_sources: usize,
    /// verified → growing when momentum is strictly above this.
    pub growing_momentum: u8,
    /// growing → trending when momentum is strictly above this.
    pub trending_momentum: u8,
    /// trending/growing → peaked after this much silence.
    pub peak_after_hours: f64,
    /// peaked → declining after this much silence.
    pub decline_after_hours: f64,
    /// declining/detected/verified → dormant after this much silence.
    pub dormant_after_hours: f64,
    /// Per-hour multiplier applied to idle momentum.
    pub decay_per_hour: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_distinct_sources: 2,
            growing_momentum: 30,
            trending_momentum: 60,
            peak_after_hours: 24.0,
            decline_after_hours: 72.0,
            dormant_after_hours: 168.0,
            decay_per_hour: 0.997,
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            min_distinct_sources: env_or("LIFECYCLE_MIN_SOURCES", d.min_distinct_sources)?,
            growing_momentum: env_or("LIFECYCLE_GROWING_MOMENTUM", d.growing_momentum)?,
            trending_momentum: env_or("LIFECYCLE_TRENDING_MOMENTUM", d.trending_momentum)?,
            peak_after_hours: env_or("LIFECYCLE_PEAK_AFTER_HOURS", d.peak_after_hours)?,
            decline_after_hours: env_or("LIFECYCLE_DECLINE_AFTER_HOURS", d.decline_after_hours)?,
            dormant_after_hours: env_or("LIFECYCLE_DORMANT_AFTER_HOURS", d.dormant_after_hours)?,
            decay_per_hour: env_or("LIFECYCLE_DECAY_PER_HOUR", d.decay_per_hour)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.decay_per_hour) {
            return Err(ConfigError::InvalidValue {
                key: "LIFECYCLE_DECAY_PER_HOUR".to_string(),
                message: format!("{} is outside 0.0..=1.0", self.decay_per_hour),
            });
        }
        if self.growing_momentum > 100 || self.trending_momentum > 100 {
            return Err(ConfigError::InvalidValue {
                key: "LIFECYCLE_*_MOMENTUM".to_string(),
                message: "momentum thresholds must be within 0..=100".to_string(),
            });
        }
        Ok(())
    }
}

/// Deduplication policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Proposed matches below this confidence are rejected.
    pub min_confidence: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let min_confidence: f64 = env_or("DEDUP_MIN_CONFIDENCE", Self::default().min_confidence)?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(ConfigError::InvalidValue {
                key: "DEDUP_MIN_CONFIDENCE".to_string(),
                message: format!("{min_confidence} is outside 0.0..=1.0"),
            });
        }
        Ok(Self { min_confidence })
    }
}

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Cron expression (with seconds field) for enqueueing scans.
    /// `None` disables the scheduler.
    pub schedule: Option<String>,
    /// Owner charged for scheduled scans.
    pub owner_ref: String,
    /// Signals per classification call.
    pub classify_chunk_size: usize,
    /// JSON file the evidence feed reads from.
    pub feed_path: Option<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            schedule: Some("0 0 */6 * * *".to_string()),
            owner_ref: "default".to_string(),
            classify_chunk_size: 25,
            feed_path: None,
        }
    }
}

impl ScanConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let schedule = match std::env::var("BOARDROOM_SCAN_CRON") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("off") => None,
            Ok(raw) if !raw.trim().is_empty() => {
                let raw = raw.trim().to_string();
                cron::Schedule::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: "BOARDROOM_SCAN_CRON".to_string(),
                    message: e.to_string(),
                })?;
                Some(raw)
            }
            _ => d.schedule,
        };

        let classify_chunk_size: usize =
            env_or("BOARDROOM_SCAN_CHUNK_SIZE", d.classify_chunk_size)?;
        if classify_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BOARDROOM_SCAN_CHUNK_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            schedule,
            owner_ref: std::env::var("BOARDROOM_SCAN_OWNER").unwrap_or(d.owner_ref),
            classify_chunk_size,
            feed_path: std::env::var("BOARDROOM_FEED_PATH").ok().map(PathBuf::from),
        })
    }
}
