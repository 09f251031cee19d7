// Catalog rename
//
// Moves a catalog table along with the logical table it describes. A move
// across schemas first relocates every archive the catalog refers to, so
// an interrupted move can be resumed: archives already moved are skipped
// with a warning.

use tracing::{debug, info, instrument};

use super::Vtmd;
use crate::diagnostics::{ErrorCode, LocalDiagnostics};
use crate::engine::{Engine, ObjectInfo, OpenIntent};
use crate::error::VtmdError;
use crate::record::ObjectName;

impl<'a, E: Engine> Vtmd<'a, E> {
    /// Follow a rename of the logical table to `new_schema.new_name`.
    #[instrument(level = "debug", skip(self), fields(table = %self.about))]
    pub fn try_rename(&mut self, new_schema: &str, new_name: &str) -> Result<(), VtmdError> {
        self.try_rename_archiving(new_schema, new_name, None)
    }

    /// Like `try_rename`, but the epoch closed by the rename is archived
    /// under `archive`.
    pub fn try_rename_archiving(
        &mut self,
        new_schema: &str,
        new_name: &str,
        archive: Option<&str>,
    ) -> Result<(), VtmdError> {
        let source_exists = self.check_exists()?;

        let diag = LocalDiagnostics::install(self.session);
        let source = self.catalog_name().map_err(|err| diag.raise(err))?;
        let dest_about = ObjectName::new(new_schema, new_name);
        let dest = self
            .config
            .catalog_name_for(&dest_about)
            .map_err(|err| diag.raise(err))?;

        let dest_occupied = self
            .engine
            .lookup(&dest)
            .map_err(|source| diag.raise(VtmdError::storage(&dest, source)))?
            .is_some();
        if dest_occupied {
            if source_exists {
                return Err(diag.raise(VtmdError::DestinationExists { table: dest }));
            }
            diag.warn(ErrorCode::Vtmd, format!("{dest} table already exists!"));
            return Ok(());
        }
        if !source_exists {
            debug!(table = %source, "no VTMD table to rename");
            return Ok(());
        }

        if new_schema != self.about.schema {
            self.move_archives(&diag, &source, new_schema)?;
        }

        {
            let _source_lock = self.lock(&diag, &source)?;
            let _dest_lock = self.lock(&diag, &dest)?;
            self.engine.invalidate_handles(&source);
            self.engine
                .rename(&source, &dest)
                .map_err(|err| diag.raise(VtmdError::storage(&source, err)))?;
            self.engine.invalidate_query_cache(&source);
        }
        info!(from = %source, to = %dest, "renamed VTMD table");

        self.renamed_to = Some(dest);
        self.relocated(dest_about).upsert(archive)
    }

    /// Move the catalog table back after a failed DDL statement.
    ///
    /// Archives moved to `new_schema` stay there.
    #[instrument(level = "debug", skip(self), fields(table = %self.about))]
    pub fn revert_rename(&mut self, new_schema: &str) -> Result<(), VtmdError> {
        let Some(renamed) = self.renamed_to.clone() else {
            return Ok(());
        };

        let diag = LocalDiagnostics::install(self.session);
        let source = self.catalog_name().map_err(|err| diag.raise(err))?;
        let moved = ObjectName::new(new_schema, &renamed.table);
        {
            let _moved_lock = self.lock(&diag, &moved)?;
            let _source_lock = self.lock(&diag, &source)?;
            self.engine.invalidate_handles(&moved);
            self.engine
                .rename(&moved, &source)
                .map_err(|err| diag.raise(VtmdError::storage(&moved, err)))?;
            self.engine.invalidate_query_cache(&moved);
        }
        info!(from = %moved, to = %source, "reverted VTMD table rename");

        self.renamed_to = None;
        Ok(())
    }

    fn move_archives(
        &self,
        diag: &LocalDiagnostics<'_>,
        catalog: &ObjectName,
        new_schema: &str,
    ) -> Result<(), VtmdError> {
        let archives = self
            .open_catalog(diag, catalog, OpenIntent::Read)?
            .archive_names(diag)?;

        for archive in archives {
            let from = ObjectName::new(&self.about.schema, &archive);
            let to = ObjectName::new(new_schema, &archive);
            self.move_archive(diag, &from, &to)?;
        }
        Ok(())
    }

    fn move_archive(
        &self,
        diag: &LocalDiagnostics<'_>,
        from: &ObjectName,
        to: &ObjectName,
    ) -> Result<(), VtmdError> {
        let found = self
            .engine
            .lookup(from)
            .map_err(|source| diag.raise(VtmdError::storage(from, source)))?;
        if !matches!(found, Some(ObjectInfo { engine: Some(_) })) {
            diag.warn(ErrorCode::Vtmd, format!("{from} archive doesn't exist"));
            return Ok(());
        }

        let occupied = self
            .engine
            .lookup(to)
            .map_err(|source| diag.raise(VtmdError::storage(to, source)))?;
        if occupied.is_some() {
            return Err(diag.raise(VtmdError::ArchiveExists { table: to.clone() }));
        }

        let _lock = self.lock(diag, from)?;
        self.engine.invalidate_handles(from);
        self.engine
            .rename(from, to)
            .map_err(|source| diag.raise(VtmdError::storage(from, source)))?;
        self.engine.invalidate_query_cache(from);
        info!(from = %from, to = %to, "moved archive");
        Ok(())
    }
}
