//! chainsink-storage — store backends for ChainSink.
//!
//! Backends:
//! - [`memory`] — in-memory (tests and dry runs, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//! - [`postgres`] — PostgreSQL via `sqlx` (feature `postgres`)
//!
//! Every backend applies a flush batch, prunes finalized history and moves
//! the cursor in one transaction.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod sql;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStore};

/// Canonical JSON object for a converted primary key, independent of how the
/// raw key strings were formatted.
#[cfg(any(feature = "memory", feature = "sqlite"))]
pub(crate) fn key_json<'a>(
    key: impl Iterator<Item = (&'a str, &'a chainsink_core::convert::Value)>,
) -> String {
    let obj: serde_json::Map<String, serde_json::Value> =
        key.map(|(c, v)| (c.to_string(), v.to_json())).collect();
    serde_json::Value::Object(obj).to_string()
}
