//! The sinker — drives a [`Loader`] from a stream of block events.
//!
//! # Event flow
//! ```text
//! BlockScopedData ─► check module ─► decode ─► apply (buffer) ─► flush?
//!                                                                  │
//!                              Store::commit(rows + history + cursor)
//!
//! BlockUndoSignal ─► Store::revert(pending + unwind history + cursor)
//! ```
//!
//! One lock guards the loader together with the last seen cursor and finality
//! height, so a flush always observes fully applied blocks and the cursor that
//! goes with them.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::apply::apply_database_changes;
use crate::config::SinkerConfig;
use crate::cursor::{Cursor, CursorState, ModuleMismatchPolicy, StreamIdentity};
use crate::error::{Result, SinkError};
use crate::flush::{slow_flush_level, FlushPolicy};
use crate::loader::{Loader, Store};
use crate::stats::{Stats, StatsReporter};
use crate::stream::BlockSource;
use crate::types::{BlockScopedData, BlockUndoSignal, SinkEvent};
use crate::undo_buffer::UndoBuffer;

struct SinkState<S: Store> {
    loader: Loader<S>,
    last_seen_cursor: Option<Cursor>,
    last_seen_final_block: u64,
}

/// Writes the change-sets of one output module into a [`Store`].
pub struct Sinker<S: Store> {
    state: Mutex<SinkState<S>>,
    undo_buffer: Option<Mutex<UndoBuffer>>,
    identity: StreamIdentity,
    output_module_name: String,
    config: SinkerConfig,
    policy: FlushPolicy,
    stats: Arc<Stats>,
}

impl<S: Store> Sinker<S> {
    pub fn new(
        store: S,
        config: SinkerConfig,
        output_module_name: impl Into<String>,
        identity: StreamIdentity,
    ) -> Result<Self> {
        config.validate()?;
        let loader = Loader::new(
            store,
            config.batch_row_flush_interval,
            config.update_missing_row,
        );
        let undo_buffer = (!config.handles_reorgs())
            .then(|| Mutex::new(UndoBuffer::new(config.undo_buffer_size as usize)));

        Ok(Self {
            state: Mutex::new(SinkState {
                loader,
                last_seen_cursor: None,
                last_seen_final_block: 0,
            }),
            undo_buffer,
            identity,
            output_module_name: output_module_name.into(),
            policy: FlushPolicy::new(&config),
            config,
            stats: Arc::new(Stats::new()),
        })
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    pub fn output_module_name(&self) -> &str {
        &self.output_module_name
    }

    pub fn config(&self) -> &SinkerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Cursor of the last block applied or undone to, flushed or not.
    pub async fn last_seen_cursor(&self) -> Option<Cursor> {
        self.state.lock().await.last_seen_cursor.clone()
    }

    pub async fn pending_rows(&self) -> usize {
        self.state.lock().await.loader.pending_rows()
    }

    // ─── Startup ─────────────────────────────────────────────────────────────

    /// Resolve the cursor to resume from, making sure a cursor row exists for
    /// this identity before anything is flushed.
    pub async fn prepare(&self) -> Result<Cursor> {
        let state = self.state.lock().await;
        let loader = &state.loader;

        let cursor = match loader.load_cursor(&self.identity).await? {
            CursorState::Found(cursor) => cursor,
            CursorState::NotFound => {
                info!(module_hash = %self.identity, "no cursor found, starting from the beginning");
                loader.write_cursor(&self.identity, &Cursor::blank()).await?;
                Cursor::blank()
            }
            CursorState::Mismatch {
                stored_identity,
                cursor,
            } => match self.config.on_module_mismatch {
                ModuleMismatchPolicy::Restart => {
                    warn!(
                        stored_module_hash = %stored_identity,
                        module_hash = %self.identity,
                        discarded_cursor = %cursor,
                        "stored cursor belongs to another module, restarting from a blank cursor"
                    );
                    loader.write_cursor(&self.identity, &Cursor::blank()).await?;
                    Cursor::blank()
                }
                ModuleMismatchPolicy::Error => {
                    return Err(SinkError::Cursor(format!(
                        "stored cursor at {cursor} belongs to module {stored_identity}, \
                         refusing to resume module {}",
                        self.identity
                    )))
                }
            },
        };

        info!(
            restarting_at = %cursor,
            database = loader.database(),
            schema = loader.schema(),
            output_module = %self.output_module_name,
            "starting sql sink"
        );
        Ok(cursor)
    }

    // ─── Event handling ──────────────────────────────────────────────────────

    /// Handle one stream event, routing through the undo buffer when active.
    pub async fn handle_event(&self, event: SinkEvent) -> Result<()> {
        match (&self.undo_buffer, event) {
            (None, SinkEvent::Data(data)) => self.handle_block_scoped_data(data).await,
            (None, SinkEvent::Undo(signal)) => self.handle_block_undo_signal(signal).await,
            (Some(buffer), SinkEvent::Data(data)) => {
                let released = buffer.lock().await.push(data);
                for data in released {
                    self.handle_block_scoped_data(data).await?;
                }
                Ok(())
            }
            (Some(buffer), SinkEvent::Undo(signal)) => {
                let last_valid = signal.last_valid_block.number;
                let dropped = buffer.lock().await.undo(last_valid)?;
                self.stats.record_undo();
                debug!(last_valid_block = last_valid, dropped, "undo absorbed by undo buffer");
                Ok(())
            }
        }
    }

    /// Apply one block's change-set and flush if a trigger is reached.
    pub async fn handle_block_scoped_data(&self, data: BlockScopedData) -> Result<()> {
        if data.output.name != self.output_module_name {
            return Err(SinkError::Decode(format!(
                "received data from wrong output module, expected to receive from {:?} but got module's output for {:?}",
                self.output_module_name, data.output.name
            )));
        }

        let changes = data.output.database_changes()?;
        let block = data.clock.number;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(changes) = &changes {
            apply_database_changes(&mut state.loader, changes, block, data.final_block_height)?;
        }
        state.last_seen_cursor = Some(data.cursor());
        state.last_seen_final_block = data.final_block_height;
        self.stats.record_block();

        let row_trigger = state.loader.flush_needed();
        if self.policy.should_flush(block, data.is_live, row_trigger) {
            debug!(
                block = %data.clock.block_ref(),
                is_live = data.is_live,
                row_flush_interval_reached = row_trigger,
                "flushing to database"
            );
            self.flush_locked(state).await?;
        }
        Ok(())
    }

    /// Revert everything above the signal's last valid block.
    pub async fn handle_block_undo_signal(&self, signal: BlockUndoSignal) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let last_valid = signal.last_valid_block.number;

        if last_valid < state.last_seen_final_block {
            return Err(SinkError::Undo {
                last_valid_block: last_valid,
                reason: format!(
                    "block #{} is already final, refusing to undo below it",
                    state.last_seen_final_block
                ),
            });
        }

        let cursor = signal.cursor();
        state.loader.revert(&self.identity, &cursor, last_valid).await?;
        info!(last_valid_block = %signal.last_valid_block, "reverted reversible changes");

        state.last_seen_cursor = Some(cursor);
        self.stats.record_revert(last_valid);
        Ok(())
    }

    // ─── Flush ───────────────────────────────────────────────────────────────

    /// Commit buffered rows with the last seen cursor. No-op before the first
    /// block.
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        self.flush_locked(&mut guard).await
    }

    async fn flush_locked(&self, state: &mut SinkState<S>) -> Result<()> {
        let Some(cursor) = state.last_seen_cursor.clone() else {
            return Ok(());
        };
        let final_block = state.last_seen_final_block;

        let start = Instant::now();
        let rows = state.loader.flush(&self.identity, &cursor, final_block).await?;
        let took = start.elapsed();

        if let Some(level) = slow_flush_level(took) {
            let took_ms = took.as_millis() as u64;
            if level == tracing::Level::WARN {
                warn!(took_ms, "flush to database took a long time to complete, could cause long sync time along the road");
            } else {
                info!(took_ms, "flush to database took a long time to complete, could cause long sync time along the road");
            }
        }

        self.stats.record_flush(rows, took, cursor.block_number());
        debug!(block = %cursor, rows, took_ms = took.as_millis() as u64, "flushed");
        Ok(())
    }

    // ─── Run loop ────────────────────────────────────────────────────────────

    /// Prepare, then consume `source` until it ends or `shutdown` resolves.
    ///
    /// A clean stop flushes whatever is buffered. After an event error nothing
    /// more is written and the error is returned.
    pub async fn run<F>(&self, source: &dyn BlockSource, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let from = self.prepare().await?;
        let reporter = StatsReporter::spawn(Arc::clone(&self.stats), self.config.stats_interval());
        let outcome = self.consume(source, &from, shutdown).await;

        let result = match outcome {
            Ok(()) => {
                info!("sql sinker terminating, flushing remaining rows");
                self.flush().await
            }
            Err(e) => Err(e),
        };

        reporter.close();
        self.stats.log_now();
        let last_block_written = self.stats.snapshot().last_block;
        match &result {
            Ok(()) => info!(last_block_written, "sql sinker terminated"),
            Err(e) => error!(last_block_written, error = %e, "sql sinker terminated"),
        }
        result
    }

    async fn consume<F>(&self, source: &dyn BlockSource, from: &Cursor, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut events = source.open(from).await?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle_event(event).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        info!("block stream ended");
                        return Ok(());
                    }
                },
            }
        }
    }
}
