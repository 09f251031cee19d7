// Catalog existence
//
// Looks up the schema catalog entry for a logical table's catalog table and
// remembers which engine stores it.

use super::Vtmd;
use crate::diagnostics::LocalDiagnostics;
use crate::engine::{Engine, ObjectInfo};
use crate::error::VtmdError;

impl<'a, E: Engine> Vtmd<'a, E> {
    /// Whether the catalog table exists. Remembers its engine when it does.
    ///
    /// A catalog entry without a storage engine is reported as an error.
    pub fn check_exists(&mut self) -> Result<bool, VtmdError> {
        let diag = LocalDiagnostics::install(self.session);
        let name = self.catalog_name().map_err(|err| diag.raise(err))?;
        let info = self
            .engine
            .lookup(&name)
            .map_err(|source| diag.raise(VtmdError::storage(&name, source)))?;

        match info {
            None => {
                self.engine_type = None;
                Ok(false)
            }
            Some(ObjectInfo { engine: Some(engine) }) => {
                self.engine_type = Some(engine);
                Ok(true)
            }
            Some(ObjectInfo { engine: None }) => {
                Err(diag.raise(VtmdError::Orphaned { table: name }))
            }
        }
    }
}
