//! Configuration for the sync engine.

use crate::error::SyncError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default prefix of the metadata tables.
pub const DEFAULT_METADATA_SCHEMA: &str = "electric";

/// Default capacity of a subscription's batch channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Prefix of the metadata tables (`<schema>_subscriptions_metadata`).
    pub metadata_schema: String,
    /// Number of stream batches buffered per subscription before the
    /// stream is back-pressured.
    pub channel_capacity: usize,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            metadata_schema: DEFAULT_METADATA_SCHEMA.to_owned(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Sets the metadata table prefix.
    pub fn with_metadata_schema(mut self, schema: impl Into<String>) -> Self {
        self.metadata_schema = schema.into();
        self
    }

    /// Sets the per-subscription channel capacity (at least 1).
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// When accumulated change messages are flushed to the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitGranularity {
    /// Flush when every shape of the group reports `up-to-date`.
    #[default]
    UpToDate,
    /// Flush after every change message.
    Operation,
    /// Flush once this many messages are buffered.
    Batch(usize),
}

impl CommitGranularity {
    /// Returns the flush threshold, if message count triggers flushes.
    pub fn threshold(&self) -> Option<usize> {
        match self {
            CommitGranularity::UpToDate => None,
            CommitGranularity::Operation => Some(1),
            CommitGranularity::Batch(n) => Some(*n),
        }
    }
}

impl fmt::Display for CommitGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitGranularity::UpToDate => f.write_str("up-to-date"),
            CommitGranularity::Operation => f.write_str("operation"),
            CommitGranularity::Batch(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for CommitGranularity {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "up-to-date" => Ok(CommitGranularity::UpToDate),
            "operation" => Ok(CommitGranularity::Operation),
            other => match other.parse::<usize>() {
                Ok(n) if n > 0 => Ok(CommitGranularity::Batch(n)),
                _ => Err(SyncError::InvalidOptions(format!(
                    "invalid commit granularity {other:?}"
                ))),
            },
        }
    }
}

/// Flush policy of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitPolicy {
    /// Flush trigger.
    pub granularity: CommitGranularity,
    /// Minimum time between two non-forced flushes.
    pub throttle: Option<Duration>,
}

impl CommitPolicy {
    /// Creates a policy with the given granularity and no throttle.
    pub fn new(granularity: CommitGranularity) -> Self {
        Self {
            granularity,
            throttle: None,
        }
    }

    /// Sets the throttle window.
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SyncError> {
        if self.granularity == CommitGranularity::Batch(0) {
            return Err(SyncError::InvalidOptions(
                "commit granularity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
