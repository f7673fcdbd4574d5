//! Sinker configuration and its fluent builder.
//!
//! # Example
//!
//! ```rust
//! use chainsink_core::config::SinkerBuilder;
//!
//! let config = SinkerBuilder::new()
//!     .batch_block_flush_interval(500)
//!     .batch_row_flush_interval(50_000)
//!     .live_block_flush_interval(1)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.catch_up_block_interval(), 500);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cursor::ModuleMismatchPolicy;
use crate::error::{Result, SinkError};

/// Behavior of an update whose row does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMissingRow {
    /// The flush fails: the stream and the store disagree.
    #[default]
    Fail,
    /// Insert the row with the key and updated columns.
    Upsert,
}

/// Configuration for a [`Sinker`](crate::sinker::Sinker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkerConfig {
    /// Catch-up mode: flush every N blocks. 0 disables the block trigger.
    pub batch_block_flush_interval: u64,
    /// Catch-up mode: flush once N rows are pending. 0 disables the row trigger.
    pub batch_row_flush_interval: u64,
    /// Live mode: flush every N blocks.
    pub live_block_flush_interval: u64,
    /// Deprecated single flush interval. When non-zero it replaces
    /// `batch_block_flush_interval`.
    pub flush_interval: u64,
    /// When non-zero, reorg handling is disabled: blocks are held until
    /// confirmed by this many later blocks and then written as final.
    pub undo_buffer_size: u64,
    /// What to do when the stored cursor belongs to another module.
    pub on_module_mismatch: ModuleMismatchPolicy,
    /// What to do when an update targets a missing row.
    pub update_missing_row: UpdateMissingRow,
    /// Stats reporting period in seconds. `None` picks 15 s (5 s at debug level).
    pub stats_interval_secs: Option<u64>,
}

impl Default for SinkerConfig {
    fn default() -> Self {
        Self {
            batch_block_flush_interval: 1_000,
            batch_row_flush_interval: 100_000,
            live_block_flush_interval: 1,
            flush_interval: 0,
            undo_buffer_size: 0,
            on_module_mismatch: ModuleMismatchPolicy::Restart,
            update_missing_row: UpdateMissingRow::Fail,
            stats_interval_secs: None,
        }
    }
}

impl SinkerConfig {
    /// Block interval used in catch-up mode, the legacy value winning when set.
    pub fn catch_up_block_interval(&self) -> u64 {
        if self.flush_interval != 0 {
            self.flush_interval
        } else {
            self.batch_block_flush_interval
        }
    }

    /// Reorgs are handled in the store unless the undo buffer is active.
    pub fn handles_reorgs(&self) -> bool {
        self.undo_buffer_size == 0
    }

    pub fn stats_interval(&self) -> Duration {
        let default = if tracing::enabled!(tracing::Level::DEBUG) {
            5
        } else {
            15
        };
        Duration::from_secs(self.stats_interval_secs.unwrap_or(default))
    }

    /// With every flush trigger at 0 rows are only written on shutdown.
    pub fn validate(&self) -> Result<()> {
        if self.stats_interval_secs == Some(0) {
            return Err(SinkError::Config(
                "stats interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`SinkerConfig`].
#[derive(Default)]
pub struct SinkerBuilder {
    config: SinkerConfig,
}

impl SinkerBuilder {
    pub fn new() -> Self {
        Self {
            config: SinkerConfig::default(),
        }
    }

    pub fn batch_block_flush_interval(mut self, n: u64) -> Self {
        self.config.batch_block_flush_interval = n;
        self
    }

    pub fn batch_row_flush_interval(mut self, n: u64) -> Self {
        self.config.batch_row_flush_interval = n;
        self
    }

    pub fn live_block_flush_interval(mut self, n: u64) -> Self {
        self.config.live_block_flush_interval = n;
        self
    }

    /// Deprecated: prefer [`batch_block_flush_interval`](Self::batch_block_flush_interval).
    pub fn flush_interval(mut self, n: u64) -> Self {
        self.config.flush_interval = n;
        self
    }

    pub fn undo_buffer_size(mut self, n: u64) -> Self {
        self.config.undo_buffer_size = n;
        self
    }

    pub fn on_module_mismatch(mut self, policy: ModuleMismatchPolicy) -> Self {
        self.config.on_module_mismatch = policy;
        self
    }

    pub fn update_missing_row(mut self, policy: UpdateMissingRow) -> Self {
        self.config.update_missing_row = policy;
        self
    }

    pub fn stats_interval_secs(mut self, secs: u64) -> Self {
        self.config.stats_interval_secs = Some(secs);
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SinkerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
