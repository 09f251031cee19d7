use crate::diagnostics::ErrorCode;
use crate::engine::{EngineError, IndexId};
use crate::record::{ObjectName, TrxId};

/// Errors raised by catalog operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VtmdError {
    #[error("failed to acquire exclusive lock on {object}: {source}")]
    Lock {
        object: ObjectName,
        source: EngineError,
    },

    #[error("{table}: {source}")]
    Storage {
        table: ObjectName,
        source: EngineError,
    },

    #[error("failed to allocate key buffer for {index:?} index")]
    KeyAlloc { index: IndexId },

    #[error("key of {len} bytes exceeds {index:?} index limit of {max}")]
    KeyTooLong { index: IndexId, len: usize, max: usize },

    #[error("table name `{name}` is too long for a VTMD table (limit {max})")]
    NameTooLong { name: String, max: usize },

    #[error("{table}: unexpected fields count: {found} (expected {expected})")]
    MalformedSchema {
        table: ObjectName,
        expected: usize,
        found: usize,
    },

    #[error("{table} is not system-versioned")]
    NotVersioned { table: ObjectName },

    #[error("{table} exists and not empty!")]
    NotEmpty { table: ObjectName },

    #[error("{table} table already exists!")]
    DestinationExists { table: ObjectName },

    #[error("{table} archive already exists!")]
    ArchiveExists { table: ObjectName },

    #[error("{table} is orphaned: no storage engine found")]
    Orphaned { table: ObjectName },

    #[error("{table}: no closed epoch ending at {end}")]
    MissingEpoch { table: ObjectName, end: TrxId },
}

impl VtmdError {
    pub fn storage(table: &ObjectName, source: EngineError) -> Self {
        Self::Storage {
            table: table.clone(),
            source,
        }
    }

    pub fn lock(object: &ObjectName, source: EngineError) -> Self {
        Self::Lock {
            object: object.clone(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Lock { source, .. } | Self::Storage { source, .. } => ErrorCode::from(source),
            _ => ErrorCode::Vtmd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_keep_engine_code() {
        let name = ObjectName::new("s1", "t1_vtmd");
        let err = VtmdError::storage(&name, EngineError::NoSuchTable(name.clone()));
        assert_eq!(err.code(), ErrorCode::NoSuchTable);
        assert_eq!(
            err.to_string(),
            "`s1`.`t1_vtmd`: table `s1`.`t1_vtmd` doesn't exist"
        );

        let err = VtmdError::NotEmpty { table: name };
        assert_eq!(err.code(), ErrorCode::Vtmd);
    }
}
