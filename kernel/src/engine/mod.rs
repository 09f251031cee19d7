// Storage Engine Abstraction
//
// Interfaces consumed from the surrounding server: named-object locks,
// schema-object primitives and row-level access to an open table.
//
// The protocol code only ever talks to these traits. `memory` provides a
// reference implementation used by the CLI and the tests.

pub mod key;
pub mod lock;
pub mod memory;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::record::{ObjectName, VtmdRecord};
use crate::session::{SessionId, SessionOptions};

/// Storage engine a table lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Memory,
    Innodb,
    Aria,
}

/// What the schema catalog knows about an existing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// `None` when the catalog entry has no usable engine (orphaned entry).
    pub engine: Option<EngineType>,
}

/// Marker properties applied when cloning a table definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableTag {
    Vtmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    Read,
    Write,
}

/// Secondary indexes of a catalog table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexId {
    End,
    ArchiveName,
}

/// Which duplicate an exact-key read positions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    /// First row with the key.
    Forward,
    /// Last row with the key.
    Reverse,
}

/// Engine-internal row identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub u64);

/// A row read from (or just written to) a table, with its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRow {
    pub row_id: RowId,
    pub record: VtmdRecord,
}

/// Errors reported by the storage engine.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("table {0} doesn't exist")]
    NoSuchTable(ObjectName),

    #[error("table {0} already exists")]
    TableExists(ObjectName),

    #[error("can't find record")]
    KeyNotFound,

    #[error("record was deleted")]
    RecordDeleted,

    #[error("end of index")]
    EndOfFile,

    #[error("no active index cursor")]
    NoCursor,

    #[error("lock wait timeout exceeded on {0}")]
    LockWaitTimeout(ObjectName),

    #[error("table {0} is opened read-only")]
    ReadOnly(ObjectName),

    #[error("row {0:?} not found")]
    RowNotFound(RowId),

    #[error("storage engine error: {0}")]
    Internal(String),
}

/// Exclusive named-object locks.
///
/// Locks are re-entrant for the same owner and released once per
/// successful acquire.
pub trait LockManager: Send + Sync {
    fn acquire_exclusive(
        &self,
        name: &ObjectName,
        owner: SessionId,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    fn release(&self, name: &ObjectName, owner: SessionId);
}

/// Schema-object operations.
pub trait Catalog: Send + Sync {
    type Table: RowStore;

    /// `None` if no object with this name exists.
    fn lookup(&self, name: &ObjectName) -> Result<Option<ObjectInfo>, EngineError>;

    fn open(
        &self,
        name: &ObjectName,
        intent: OpenIntent,
        options: SessionOptions,
    ) -> Result<Self::Table, EngineError>;

    /// Clone the definition of `template` under `target`.
    fn create_like(
        &self,
        target: &ObjectName,
        template: &ObjectName,
        tag: TableTag,
    ) -> Result<(), EngineError>;

    fn rename(&self, from: &ObjectName, to: &ObjectName) -> Result<(), EngineError>;

    /// Drop cached table handles for `name`.
    fn invalidate_handles(&self, name: &ObjectName);

    /// Drop cached query results referencing `name`.
    fn invalidate_query_cache(&self, name: &ObjectName);
}

/// Row access to one open table. Dropping the handle releases it.
///
/// Insert and update return the row as stored, with system fields
/// filled in by the engine. While versioning is enabled an update closes
/// the old row's epoch and opens a successor row; a delete closes the
/// epoch. With versioning suspended both act on the row in place.
pub trait RowStore {
    fn name(&self) -> &ObjectName;

    fn field_count(&self) -> usize;

    /// Whether the table definition is system-versioned.
    fn is_versioned(&self) -> bool;

    fn set_versioning(&mut self, enabled: bool);

    fn max_key_length(&self, index: IndexId) -> usize;

    /// Exact-key read. `KeyNotFound` if nothing matches.
    fn index_read(
        &mut self,
        index: IndexId,
        key: &[u8],
        direction: ReadDirection,
    ) -> Result<StagedRow, EngineError>;

    /// `EndOfFile` on an empty index.
    fn index_first(&mut self, index: IndexId) -> Result<StagedRow, EngineError>;

    /// Advance the cursor opened by `index_first`/`index_read`.
    fn index_next(&mut self) -> Result<StagedRow, EngineError>;

    fn index_end(&mut self);

    fn insert(&mut self, record: &VtmdRecord) -> Result<StagedRow, EngineError>;

    fn update(&mut self, old: &StagedRow, new: &VtmdRecord) -> Result<StagedRow, EngineError>;

    fn delete(&mut self, row: &StagedRow) -> Result<(), EngineError>;
}

/// Everything the VTMD protocol needs from the server.
pub trait Engine: Catalog + LockManager {}

impl<T: Catalog + LockManager> Engine for T {}
