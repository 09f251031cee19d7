// Catalog Record Model
//
// Row layout of a VTMD catalog table and the identifiers shared by the
// rest of the kernel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Epoch boundary marker: a monotonically increasing transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrxId(pub u64);

impl TrxId {
    pub const MIN: TrxId = TrxId(0);

    /// `end` value of the alive record.
    pub const MAX: TrxId = TrxId(u64::MAX);

    pub fn is_max(self) -> bool {
        self == Self::MAX
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            f.write_str("MAX")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Schema-qualified object name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectName {
    pub schema: String,
    pub table: String,
}

impl ObjectName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`", self.schema, self.table)
    }
}

/// DDL statement kind driving a catalog write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlOp {
    Create,
    Rename,
    Alter,
    Drop,
}

/// Fields per catalog row: start, end, name, archive_name, col_renames.
pub const FIELD_COUNT: usize = 5;

/// One epoch of a logical table's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VtmdRecord {
    pub start: TrxId,
    pub end: TrxId,
    pub name: String,
    pub archive_name: Option<String>,
    pub col_renames: Option<Vec<u8>>,
}

impl VtmdRecord {
    /// Write buffer for a table living under `name`. System fields are
    /// assigned by the engine on insert/update.
    pub fn live(name: impl Into<String>) -> Self {
        Self {
            start: TrxId::MIN,
            end: TrxId::MAX,
            name: name.into(),
            archive_name: None,
            col_renames: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.end.is_max()
    }

    pub fn with_archive_name(&self, archive_name: &str) -> Self {
        Self {
            archive_name: Some(archive_name.to_string()),
            ..self.clone()
        }
    }
}
