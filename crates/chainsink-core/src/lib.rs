//! chainsink-core — reorg-aware sinking of blockchain change-sets into SQL
//! stores.
//!
//! # Architecture
//!
//! ```text
//! BlockSource → Sinker
//!                 ├── apply_database_changes (table changes → typed row mutations)
//!                 ├── Loader                 (pending buffer, row flush trigger)
//!                 ├── FlushPolicy            (block flush trigger, live / catch-up)
//!                 ├── UndoBuffer             (optional confirmation delay)
//!                 ├── Stats                  (counters + periodic reporter)
//!                 └── Store backend (memory / SQLite / Postgres)
//! ```

pub mod apply;
pub mod buffer;
pub mod config;
pub mod convert;
pub mod cursor;
pub mod error;
pub mod flush;
pub mod loader;
pub mod schema;
pub mod sinker;
pub mod stats;
pub mod stream;
pub mod types;
pub mod undo_buffer;

#[cfg(test)]
pub(crate) mod testing;

pub use apply::apply_database_changes;
pub use buffer::{OpKind, PendingOp};
pub use config::{SinkerBuilder, SinkerConfig, UpdateMissingRow};
pub use convert::{ColumnType, Dialect, Value, ValueConverter};
pub use cursor::{Cursor, CursorState, ModuleMismatchPolicy, StoredCursor, StreamIdentity};
pub use error::{Result, SinkError};
pub use flush::FlushPolicy;
pub use loader::{Loader, Store, StoreDescriptor};
pub use schema::{ColumnInfo, TableInfo, TableRegistry};
pub use sinker::Sinker;
pub use stats::{Stats, StatsSnapshot};
pub use stream::{BlockSource, MemorySource};
pub use types::{
    BlockRef, BlockScopedData, BlockUndoSignal, DatabaseChanges, Operation, PrimaryKey,
    SinkEvent, TableChange,
};
