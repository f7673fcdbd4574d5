//! Flush scheduling — decides when buffered rows are committed.
//!
//! A flush is triggered by whichever comes first: the block number reaching a
//! multiple of the active block interval, or the pending row count reaching
//! the row interval. The block interval depends on whether the stream is live.

use std::time::Duration;

use crate::config::SinkerConfig;

/// Flushes slower than this are logged at `info`.
pub const SLOW_FLUSH_INFO: Duration = Duration::from_secs(5);
/// Flushes slower than this are logged at `warn`.
pub const SLOW_FLUSH_WARN: Duration = Duration::from_secs(30);

/// Block-interval trigger derived from [`SinkerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    catch_up_interval: u64,
    live_interval: u64,
}

impl FlushPolicy {
    pub fn new(config: &SinkerConfig) -> Self {
        Self {
            catch_up_interval: config.catch_up_block_interval(),
            live_interval: config.live_block_flush_interval,
        }
    }

    /// Active block interval. 0 means the block trigger is disabled.
    pub fn block_interval(&self, is_live: bool) -> u64 {
        if is_live {
            self.live_interval
        } else {
            self.catch_up_interval
        }
    }

    /// Whether `block` hits the block trigger.
    fn block_trigger(&self, block: u64, is_live: bool) -> bool {
        let interval = self.block_interval(is_live);
        interval > 0 && block % interval == 0
    }

    /// Whether a flush is due after `block`. `flush_needed` is the loader's row
    /// trigger.
    pub fn should_flush(&self, block: u64, is_live: bool, flush_needed: bool) -> bool {
        self.block_trigger(block, is_live) || flush_needed
    }
}

/// Severity a flush of this duration should be reported with, if any.
pub fn slow_flush_level(took: Duration) -> Option<tracing::Level> {
    if took > SLOW_FLUSH_WARN {
        Some(tracing::Level::WARN)
    } else if took > SLOW_FLUSH_INFO {
        Some(tracing::Level::INFO)
    } else {
        None
    }
}
