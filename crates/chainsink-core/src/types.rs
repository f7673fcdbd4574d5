//! Shared types for the sink pipeline: block references, change-sets and the
//! events delivered by the upstream stream.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::cursor::Cursor;
use crate::error::{Result, SinkError};

/// Type URL of the database change-set payload.
pub const DATABASE_CHANGES_TYPE_URL: &str =
    "type.googleapis.com/sf.substreams.sink.database.v1.DatabaseChanges";

/// Type URL emitted by older modules; decoded the same way.
pub const LEGACY_DATABASE_CHANGES_TYPE_URL: &str =
    "type.googleapis.com/sf.substreams.database.v1.DatabaseChanges";

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// A block number plus its identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    #[serde(default)]
    pub id: String,
}

impl BlockRef {
    pub fn new(number: u64, id: impl Into<String>) -> Self {
        Self {
            number,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.id.is_empty() {
            write!(f, "#{}", self.number)
        } else {
            write!(f, "#{} ({})", self.number, self.id)
        }
    }
}

// ─── Change-set ──────────────────────────────────────────────────────────────

/// Primary key of a row mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrimaryKey {
    /// Opaque key, expanded against the table's single declared key column.
    Pk(String),
    /// Explicit key column → value mapping.
    CompositePk(BTreeMap<String, String>),
}

/// Kind of row mutation.
///
/// Unknown operation names decode as [`Operation::Unset`] and are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Operation {
    #[default]
    Unset,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "OPERATION_UNSET",
            Self::Create => "OPERATION_CREATE",
            Self::Update => "OPERATION_UPDATE",
            Self::Delete => "OPERATION_DELETE",
        }
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "OPERATION_CREATE" | "CREATE" => Self::Create,
            "OPERATION_UPDATE" | "UPDATE" => Self::Update,
            "OPERATION_DELETE" | "DELETE" => Self::Delete,
            _ => Self::Unset,
        })
    }
}

/// A single column mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub new_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, new_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            new_value: new_value.into(),
            old_value: None,
        }
    }
}

/// One row-level mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChange {
    pub table: String,
    #[serde(default)]
    pub primary_key: Option<PrimaryKey>,
    #[serde(default)]
    pub ordinal: u64,
    #[serde(default)]
    pub operation: Operation,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl TableChange {
    pub fn new(table: impl Into<String>, primary_key: PrimaryKey, operation: Operation) -> Self {
        Self {
            table: table.into(),
            primary_key: Some(primary_key),
            ordinal: 0,
            operation,
            fields: Vec::new(),
        }
    }

    /// Append a field mutation.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(Field::new(name, value));
        self
    }
}

/// The ordered change-set produced for one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseChanges {
    #[serde(default)]
    pub table_changes: Vec<TableChange>,
}

// ─── Stream events ───────────────────────────────────────────────────────────

/// Block clock carried by block-scoped data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    pub number: u64,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Clock {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.number, self.id.clone())
    }
}

/// Encoded module output payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapOutput {
    pub type_url: String,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
}

impl MapOutput {
    /// Encode a change-set as a map output payload.
    pub fn from_changes(changes: &DatabaseChanges) -> Result<Self> {
        let value = serde_json::to_vec(changes)
            .map_err(|e| SinkError::Decode(format!("encode database changes: {e}")))?;
        Ok(Self {
            type_url: DATABASE_CHANGES_TYPE_URL.to_string(),
            value,
        })
    }
}

/// Output of the module the sink consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleOutput {
    pub name: String,
    #[serde(default)]
    pub map_output: Option<MapOutput>,
}

impl ModuleOutput {
    /// Decode the embedded change-set.
    ///
    /// Returns `Ok(None)` when the module produced no output for the block.
    pub fn database_changes(&self) -> Result<Option<DatabaseChanges>> {
        let output = match &self.map_output {
            Some(o) if !o.value.is_empty() => o,
            _ => return Ok(None),
        };

        if output.type_url != DATABASE_CHANGES_TYPE_URL
            && output.type_url != LEGACY_DATABASE_CHANGES_TYPE_URL
        {
            return Err(SinkError::Decode(format!(
                "mismatched message type: trying to unmarshal unknown type {:?}",
                output.type_url
            )));
        }

        serde_json::from_slice(&output.value)
            .map(Some)
            .map_err(|e| SinkError::Decode(format!("unmarshal database changes: {e}")))
    }
}

/// Data for one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockScopedData {
    pub clock: Clock,
    #[serde(default)]
    pub final_block_height: u64,
    #[serde(default)]
    pub is_live: bool,
    /// Opaque resumption token for the position right after this block.
    #[serde(default)]
    pub cursor: String,
    pub output: ModuleOutput,
}

impl BlockScopedData {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.cursor.clone(), self.clock.block_ref())
    }
}

/// Instruction to roll back everything above `last_valid_block`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockUndoSignal {
    pub last_valid_block: BlockRef,
    #[serde(default)]
    pub last_valid_cursor: String,
}

impl BlockUndoSignal {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.last_valid_cursor.clone(), self.last_valid_block.clone())
    }
}

/// One event delivered by the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkEvent {
    Data(BlockScopedData),
    Undo(BlockUndoSignal),
}

// ─── Tests ────────────────────────────────────────────────────────────────────
