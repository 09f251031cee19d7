// Catalog table access: create on first use, record lookup and the
// upsert run for every DDL statement on a versioned table.

use std::ops::{Deref, DerefMut};

use tracing::{debug, info};

use super::{Unversioned, Vtmd};
use crate::diagnostics::{ErrorCode, LocalDiagnostics};
use crate::engine::key::KeyBuffer;
use crate::engine::{
    Engine, EngineError, IndexId, OpenIntent, ReadDirection, RowStore, StagedRow, TableTag,
};
use crate::error::VtmdError;
use crate::record::{DdlOp, ObjectName, TrxId, VtmdRecord};

/// Ends the table's index cursor when dropped.
struct IndexScan<'h, T: RowStore> {
    table: &'h mut T,
}

impl<'h, T: RowStore> IndexScan<'h, T> {
    fn new(table: &'h mut T) -> Self {
        Self { table }
    }
}

impl<T: RowStore> Deref for IndexScan<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.table
    }
}

impl<T: RowStore> DerefMut for IndexScan<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.table
    }
}

impl<T: RowStore> Drop for IndexScan<'_, T> {
    fn drop(&mut self) {
        self.table.index_end();
    }
}

/// An open catalog table. The handle is released when this is dropped.
pub struct CatalogHandle<T: RowStore> {
    table: T,
    name: ObjectName,
}

impl<T: RowStore> CatalogHandle<T> {
    pub(crate) fn new(table: T) -> Self {
        let name = table.name().clone();
        Self { table, name }
    }

    pub fn name(&self) -> &ObjectName {
        &self.name
    }

    /// Locate the record whose epoch ends at `end`. Pass `TrxId::MAX` for
    /// the alive record.
    pub fn find_record(
        &mut self,
        diag: &LocalDiagnostics<'_>,
        end: TrxId,
    ) -> Result<Option<StagedRow>, VtmdError> {
        let mut buffer =
            KeyBuffer::for_index(&self.table, IndexId::End).map_err(|err| diag.raise(err))?;
        let key = buffer.stage_end(end).map_err(|err| diag.raise(err))?;

        let mut scan = IndexScan::new(&mut self.table);
        match scan.index_read(IndexId::End, key, ReadDirection::Forward) {
            Ok(row) => Ok(Some(row)),
            Err(EngineError::KeyNotFound | EngineError::RecordDeleted) => Ok(None),
            Err(source) => Err(diag.raise(VtmdError::storage(&self.name, source))),
        }
    }

    /// Every row, in `index` order.
    pub fn scan(
        &mut self,
        diag: &LocalDiagnostics<'_>,
        index: IndexId,
    ) -> Result<Vec<StagedRow>, VtmdError> {
        let mut scan = IndexScan::new(&mut self.table);
        let mut rows = Vec::new();
        let mut next = scan.index_first(index);
        loop {
            match next {
                Ok(row) => rows.push(row),
                Err(EngineError::EndOfFile) => return Ok(rows),
                Err(source) => return Err(diag.raise(VtmdError::storage(&self.name, source))),
            }
            next = scan.index_next();
        }
    }

    /// Distinct archive names, in index order.
    pub(crate) fn archive_names(
        &mut self,
        diag: &LocalDiagnostics<'_>,
    ) -> Result<Vec<String>, VtmdError> {
        let mut buffer = KeyBuffer::for_index(&self.table, IndexId::ArchiveName)
            .map_err(|err| diag.raise(err))?;
        let mut scan = IndexScan::new(&mut self.table);
        let mut names = Vec::new();
        let mut next = scan.index_first(IndexId::ArchiveName);
        loop {
            let row = match next {
                Ok(row) => row,
                Err(EngineError::EndOfFile) => return Ok(names),
                Err(source) => return Err(diag.raise(VtmdError::storage(&self.name, source))),
            };
            if let Some(archive) = row.record.archive_name {
                let key = buffer
                    .stage_archive_name(Some(&archive))
                    .map_err(|err| diag.raise(err))?;
                // Chained epochs share an archive name; jump past the duplicates.
                scan.index_read(IndexId::ArchiveName, key, ReadDirection::Reverse)
                    .map_err(|source| diag.raise(VtmdError::storage(&self.name, source)))?;
                names.push(archive);
            }
            next = scan.index_next();
        }
    }

    pub fn insert(
        &mut self,
        diag: &LocalDiagnostics<'_>,
        record: &VtmdRecord,
    ) -> Result<StagedRow, VtmdError> {
        self.table
            .insert(record)
            .map_err(|source| diag.raise(VtmdError::storage(&self.name, source)))
    }

    pub fn update(
        &mut self,
        diag: &LocalDiagnostics<'_>,
        old: &StagedRow,
        new: &VtmdRecord,
    ) -> Result<StagedRow, VtmdError> {
        self.table
            .update(old, new)
            .map_err(|source| diag.raise(VtmdError::storage(&self.name, source)))
    }

    /// Fail unless `archive` fits the archive-name index.
    fn check_archive_name(
        &self,
        diag: &LocalDiagnostics<'_>,
        archive: &str,
    ) -> Result<(), VtmdError> {
        let mut buffer = KeyBuffer::for_index(&self.table, IndexId::ArchiveName)
            .map_err(|err| diag.raise(err))?;
        buffer
            .stage_archive_name(Some(archive))
            .map_err(|err| diag.raise(err))?;
        Ok(())
    }

    /// Set the archive name of a closed epoch without opening a new one.
    fn stamp_archive(
        &mut self,
        diag: &LocalDiagnostics<'_>,
        row: &StagedRow,
        archive: &str,
    ) -> Result<(), VtmdError> {
        let mut table = Unversioned::new(&mut self.table);
        table
            .update(row, &row.record.with_archive_name(archive))
            .map_err(|source| diag.raise(VtmdError::storage(&self.name, source)))?;
        Ok(())
    }

    fn delete_outright(
        &mut self,
        diag: &LocalDiagnostics<'_>,
        row: &StagedRow,
    ) -> Result<(), VtmdError> {
        let mut table = Unversioned::new(&mut self.table);
        table
            .delete(row)
            .map_err(|source| diag.raise(VtmdError::storage(&self.name, source)))
    }

    /// Walk back from the epoch starting at `boundary`, stamping `archive`
    /// on each earlier epoch still living under the logical name.
    fn propagate_archive(
        &mut self,
        diag: &LocalDiagnostics<'_>,
        mut boundary: TrxId,
        archive: &str,
    ) -> Result<(), VtmdError> {
        while let Some(row) = self.find_record(diag, boundary)? {
            if row.record.archive_name.is_some() || row.record.start >= boundary {
                break;
            }
            self.stamp_archive(diag, &row, archive)?;
            debug!(table = %self.name, archive, end = %boundary, "propagated archive name");
            boundary = row.record.start;
        }
        Ok(())
    }
}

impl<'a, E: Engine> Vtmd<'a, E> {
    /// Create catalog table `target` as a copy of the template.
    pub fn create(&self, target: &ObjectName) -> Result<(), VtmdError> {
        let diag = LocalDiagnostics::install(self.session);
        let _lock = self.lock(&diag, target)?;

        let template = self.config.template();
        self.engine
            .create_like(target, &template, TableTag::Vtmd)
            .map_err(|source| diag.raise(VtmdError::storage(target, source)))?;

        info!(table = %target, template = %template, "created VTMD table");
        Ok(())
    }

    /// Catalog record whose epoch ends at `end`.
    pub fn find_record(&self, end: TrxId) -> Result<Option<VtmdRecord>, VtmdError> {
        let diag = LocalDiagnostics::install(self.session);
        let name = self.catalog_name().map_err(|err| diag.raise(err))?;
        let mut catalog = self.open_catalog(&diag, &name, OpenIntent::Read)?;
        Ok(catalog.find_record(&diag, end)?.map(|row| row.record))
    }

    /// Every catalog record in epoch-end order. Empty if there is no
    /// catalog table.
    pub fn history(&mut self) -> Result<Vec<VtmdRecord>, VtmdError> {
        if !self.check_exists()? {
            return Ok(Vec::new());
        }
        let diag = LocalDiagnostics::install(self.session);
        let name = self.catalog_name().map_err(|err| diag.raise(err))?;
        let mut catalog = self.open_catalog(&diag, &name, OpenIntent::Read)?;
        Ok(catalog
            .scan(&diag, IndexId::End)?
            .into_iter()
            .map(|row| row.record)
            .collect())
    }

    /// Record the logical table's current identity in its catalog,
    /// creating the catalog table on first use.
    ///
    /// With an archive name the current epoch is closed and stamped with
    /// it; a drop then leaves no alive record and an alter propagates the
    /// name to the earlier epochs chained to it.
    #[tracing::instrument(level = "debug", skip(self), fields(table = %self.about, op = ?self.op))]
    pub fn upsert(&self, archive_name: Option<&str>) -> Result<(), VtmdError> {
        let diag = LocalDiagnostics::install(self.session);
        let _options = self.session.suppress_binlog();
        let name = self.catalog_name().map_err(|err| diag.raise(err))?;
        let _lock = self.lock(&diag, &name)?;

        let (mut catalog, created) = self.open_or_create(&diag, &name)?;
        if let Some(archive) = archive_name {
            catalog.check_archive_name(&diag, archive)?;
        }
        let alive = if created {
            None
        } else {
            catalog.find_record(&diag, TrxId::MAX)?
        };
        let record = VtmdRecord::live(&self.about.table);

        match alive {
            None if self.op == DdlOp::Drop => {
                diag.warn(
                    ErrorCode::Vtmd,
                    format!("{name} has no alive record to archive"),
                );
            }
            None => {
                catalog.insert(&diag, &record)?;
                debug!(table = %name, "inserted first epoch");
            }
            Some(_) if self.op == DdlOp::Create => {
                return Err(diag.raise(VtmdError::NotEmpty { table: name }));
            }
            Some(alive) => {
                let successor = catalog.update(&diag, &alive, &record)?;
                if let Some(archive) = archive_name {
                    self.close_epoch(&diag, &mut catalog, &successor, archive)?;
                }
            }
        }
        Ok(())
    }

    fn open_or_create(
        &self,
        diag: &LocalDiagnostics<'_>,
        name: &ObjectName,
    ) -> Result<(CatalogHandle<E::Table>, bool), VtmdError> {
        match self.open_catalog(diag, name, OpenIntent::Write) {
            Ok(catalog) => return Ok((catalog, false)),
            Err(_) if diag.error_code() == Some(ErrorCode::NoSuchTable) => diag.clear(),
            Err(err) => return Err(err),
        }

        let created = match self.create(name) {
            Ok(()) => true,
            Err(_) if diag.error_code() == Some(ErrorCode::TableExists) => {
                diag.clear();
                debug!(table = %name, "VTMD table created concurrently");
                false
            }
            Err(err) => return Err(err),
        };
        let catalog = self.open_catalog(diag, name, OpenIntent::Write)?;
        Ok((catalog, created))
    }

    fn close_epoch(
        &self,
        diag: &LocalDiagnostics<'_>,
        catalog: &mut CatalogHandle<E::Table>,
        successor: &StagedRow,
        archive: &str,
    ) -> Result<(), VtmdError> {
        let boundary = successor.record.start;
        let closed = catalog.find_record(diag, boundary)?.ok_or_else(|| {
            diag.raise(VtmdError::MissingEpoch {
                table: catalog.name().clone(),
                end: boundary,
            })
        })?;
        catalog.stamp_archive(diag, &closed, archive)?;
        info!(table = %catalog.name(), archive, end = %boundary, "archived epoch");

        match self.op {
            DdlOp::Drop => catalog.delete_outright(diag, successor),
            DdlOp::Alter => catalog.propagate_archive(diag, closed.record.start, archive),
            DdlOp::Create | DdlOp::Rename => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::super::testing::{t, Fixture};
    use super::*;
    use crate::diagnostics::Level;
    use crate::engine::lock::ScopedMetadataLock;
    use crate::engine::memory::{MemoryEngine, MemoryTable, TableDefinition};
    use crate::engine::{Catalog, EngineType, LockManager, ObjectInfo};
    use crate::session::{Session, SessionId, SessionOptions};
    use std::time::Duration;

    /// Lets another session create and fill the catalog table just before
    /// our own create, which then reports `TableExists`.
    struct RivalCreates {
        inner: MemoryEngine,
    }

    impl LockManager for RivalCreates {
        fn acquire_exclusive(
            &self,
            name: &ObjectName,
            owner: SessionId,
            timeout: Duration,
        ) -> Result<(), EngineError> {
            self.inner.acquire_exclusive(name, owner, timeout)
        }

        fn release(&self, name: &ObjectName, owner: SessionId) {
            self.inner.release(name, owner)
        }
    }

    impl Catalog for RivalCreates {
        type Table = MemoryTable;

        fn lookup(&self, name: &ObjectName) -> Result<Option<ObjectInfo>, EngineError> {
            self.inner.lookup(name)
        }

        fn open(
            &self,
            name: &ObjectName,
            intent: OpenIntent,
            options: SessionOptions,
        ) -> Result<MemoryTable, EngineError> {
            self.inner.open(name, intent, options)
        }

        fn create_like(
            &self,
            target: &ObjectName,
            template: &ObjectName,
            tag: TableTag,
        ) -> Result<(), EngineError> {
            self.inner.create_like(target, template, tag)?;
            self.inner
                .open(target, OpenIntent::Write, SessionOptions { binlog: false })?
                .insert(&VtmdRecord::live("t0"))?;
            self.inner.create_like(target, template, tag)
        }

        fn rename(&self, from: &ObjectName, to: &ObjectName) -> Result<(), EngineError> {
            self.inner.rename(from, to)
        }

        fn invalidate_handles(&self, name: &ObjectName) {
            self.inner.invalidate_handles(name)
        }

        fn invalidate_query_cache(&self, name: &ObjectName) {
            self.inner.invalidate_query_cache(name)
        }
    }

    fn vtmd<'a>(
        fx: &'a Fixture,
        session: &'a Session,
        about: ObjectName,
        op: DdlOp,
    ) -> Vtmd<'a, MemoryEngine> {
        Vtmd::new(&fx.engine, session, &fx.config, about, op)
    }

    /// Catalog for `s1.t1` holding a single alive row.
    fn scenario_a(fx: &Fixture) {
        let session = fx.session();
        vtmd(fx, &session, t("s1", "t1"), DdlOp::Create)
            .upsert(None)
            .unwrap();
    }

    #[test]
    fn first_upsert_creates_catalog_with_alive_row() {
        let fx = Fixture::new();
        scenario_a(&fx);

        let rows = fx.rows("s1", "t1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "t1");
        assert_eq!(rows[0].archive_name, None);
        assert_eq!(rows[0].col_renames, None);
        assert_eq!(rows[0].end, TrxId::MAX);
        assert_eq!(fx.engine.vtmd_tables(), vec![t("s1", "t1_vtmd")]);
    }

    #[test]
    fn create_over_existing_history_fails() {
        let fx = Fixture::new();
        scenario_a(&fx);

        let session = fx.session();
        let err = vtmd(&fx, &session, t("s1", "t1"), DdlOp::Create)
            .upsert(None)
            .unwrap_err();
        assert_eq!(
            err,
            VtmdError::NotEmpty {
                table: t("s1", "t1_vtmd")
            }
        );

        let conditions = session.conditions();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].level, Level::Error);
        assert!(conditions[0].message.contains("`s1`.`t1_vtmd` exists and not empty"));
        assert_eq!(fx.rows("s1", "t1").len(), 1);
    }

    #[test]
    fn drop_closes_and_archives_the_alive_row() {
        let fx = Fixture::new();
        scenario_a(&fx);
        let first = fx.rows("s1", "t1")[0].clone();

        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t1"), DdlOp::Drop)
            .upsert(Some("t1_20240101_120000_000000"))
            .unwrap();

        let rows = fx.rows("s1", "t1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start, first.start);
        assert_ne!(rows[0].end, TrxId::MAX);
        assert_eq!(
            rows[0].archive_name.as_deref(),
            Some("t1_20240101_120000_000000")
        );
        assert!(fx.alive("s1", "t1").is_empty());
        assert!(session.conditions().is_empty());
    }

    #[test]
    fn alter_archives_and_opens_a_new_epoch() {
        let fx = Fixture::new();
        scenario_a(&fx);

        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t1"), DdlOp::Alter)
            .upsert(Some("t1_arch1"))
            .unwrap();

        let rows = fx.rows("s1", "t1");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].archive_name.as_deref(), Some("t1_arch1"));
        assert_eq!(rows[0].end, rows[1].start);

        let alive = fx.alive("s1", "t1");
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].name, "t1");
        assert_eq!(alive[0].archive_name, None);
    }

    #[test]
    fn plain_rename_keeps_history_unarchived() {
        let fx = Fixture::new();
        scenario_a(&fx);

        // The catalog follows the logical name, so move it first.
        fx.engine
            .rename(&t("s1", "t1_vtmd"), &t("s1", "t2_vtmd"))
            .unwrap();
        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t2"), DdlOp::Rename)
            .upsert(None)
            .unwrap();

        let rows = fx.rows("s1", "t2");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "t1");
        assert_eq!(rows[1].name, "t2");
        assert!(rows.iter().all(|r| r.archive_name.is_none()));
    }

    #[test]
    fn repeated_upsert_keeps_one_catalog_and_one_alive_row() {
        let fx = Fixture::new();
        for _ in 0..2 {
            let session = fx.session();
            vtmd(&fx, &session, t("s1", "t1"), DdlOp::Rename)
                .upsert(None)
                .unwrap();
            assert!(session.conditions().is_empty());
        }

        assert_eq!(fx.engine.vtmd_tables().len(), 1);
        assert_eq!(fx.alive("s1", "t1").len(), 1);
    }

    #[test]
    fn alter_propagates_archive_through_unarchived_epochs() {
        let fx = Fixture::new();
        scenario_a(&fx);
        fx.engine
            .rename(&t("s1", "t1_vtmd"), &t("s1", "t2_vtmd"))
            .unwrap();

        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t2"), DdlOp::Rename)
            .upsert(None)
            .unwrap();
        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t2"), DdlOp::Alter)
            .upsert(Some("t2_arch"))
            .unwrap();

        let rows = fx.rows("s1", "t2");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].archive_name.as_deref(), Some("t2_arch"));
        assert_eq!(rows[1].archive_name.as_deref(), Some("t2_arch"));
        assert!(rows[2].is_alive());
        assert_eq!(rows[2].archive_name, None);
    }

    #[test]
    fn propagation_stops_at_first_archived_epoch() {
        let fx = Fixture::new();
        scenario_a(&fx);

        for archive in ["t1_a1", "t1_a2"] {
            let session = fx.session();
            vtmd(&fx, &session, t("s1", "t1"), DdlOp::Alter)
                .upsert(Some(archive))
                .unwrap();
        }

        let rows = fx.rows("s1", "t1");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].archive_name.as_deref(), Some("t1_a1"));
        assert_eq!(rows[1].archive_name.as_deref(), Some("t1_a2"));
        assert_eq!(rows[0].end, rows[1].start);
        assert_eq!(fx.alive("s1", "t1").len(), 1);
    }

    #[test]
    fn drop_without_alive_record_only_warns() {
        let fx = Fixture::new();
        scenario_a(&fx);
        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t1"), DdlOp::Drop)
            .upsert(Some("t1_x"))
            .unwrap();

        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t1"), DdlOp::Drop)
            .upsert(Some("t1_y"))
            .unwrap();

        let conditions = session.conditions();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].level, Level::Warning);
        assert_eq!(fx.rows("s1", "t1").len(), 1);
    }

    #[test]
    fn recreate_after_drop_opens_a_new_epoch() {
        let fx = Fixture::new();
        scenario_a(&fx);
        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t1"), DdlOp::Drop)
            .upsert(Some("t1_x"))
            .unwrap();

        scenario_a(&fx);
        let rows = fx.rows("s1", "t1");
        assert_eq!(rows.len(), 2);
        assert_eq!(fx.alive("s1", "t1").len(), 1);
    }

    #[test]
    fn malformed_catalog_is_rejected() {
        let fx = Fixture::new();
        fx.engine
            .create_table(&t("s1", "t1_vtmd"), TableDefinition::data(3), EngineType::Innodb)
            .unwrap();

        let session = fx.session();
        let err = vtmd(&fx, &session, t("s1", "t1"), DdlOp::Create)
            .upsert(None)
            .unwrap_err();
        assert_eq!(
            err,
            VtmdError::MalformedSchema {
                table: t("s1", "t1_vtmd"),
                expected: 5,
                found: 3,
            }
        );
    }

    #[test]
    fn unversioned_catalog_is_rejected() {
        let fx = Fixture::new();
        fx.engine
            .create_table(
                &t("s1", "t1_vtmd"),
                TableDefinition {
                    fields: 5,
                    versioned: false,
                },
                EngineType::Innodb,
            )
            .unwrap();

        let session = fx.session();
        let err = vtmd(&fx, &session, t("s1", "t1"), DdlOp::Create)
            .upsert(None)
            .unwrap_err();
        assert!(matches!(err, VtmdError::NotVersioned { .. }));
    }

    #[test]
    fn lock_timeout_fails_without_creating_anything() {
        let fx = Fixture::new();
        let holder = SessionId::new();
        let _held = ScopedMetadataLock::acquire(
            &fx.engine,
            &t("s1", "t1_vtmd"),
            holder,
            fx.config.lock_wait_timeout(),
        )
        .unwrap();

        let session = fx.session();
        let err = vtmd(&fx, &session, t("s1", "t1"), DdlOp::Create)
            .upsert(None)
            .unwrap_err();
        assert!(matches!(err, VtmdError::Lock { .. }));
        assert_eq!(err.code(), ErrorCode::LockWaitTimeout);
        assert!(fx.engine.vtmd_tables().is_empty());
        assert_eq!(session.conditions().len(), 1);
        assert!(session.options().binlog);
    }

    #[test]
    fn catalog_writes_bypass_the_binlog() {
        let fx = Fixture::new();
        scenario_a(&fx);
        assert!(fx.engine.binlog().is_empty());
    }

    #[test]
    fn explicit_create_reports_duplicates() {
        let fx = Fixture::new();
        scenario_a(&fx);

        let session = fx.session();
        let err = vtmd(&fx, &session, t("s1", "t1"), DdlOp::Create)
            .create(&t("s1", "t1_vtmd"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TableExists);
        assert!(fx.engine.lock_holder(&t("s1", "t1_vtmd")).is_none());
    }

    #[test]
    fn find_record_distinguishes_alive_and_closed_epochs() {
        let fx = Fixture::new();
        scenario_a(&fx);
        let session = fx.session();
        vtmd(&fx, &session, t("s1", "t1"), DdlOp::Alter)
            .upsert(Some("t1_arch1"))
            .unwrap();

        let session = fx.session();
        let reader = vtmd(&fx, &session, t("s1", "t1"), DdlOp::Alter);
        let alive = reader.find_record(TrxId::MAX).unwrap().unwrap();
        let closed = reader.find_record(alive.start).unwrap().unwrap();
        assert_eq!(closed.archive_name.as_deref(), Some("t1_arch1"));
        assert_eq!(reader.find_record(TrxId(424_242)).unwrap(), None);
        assert!(session.conditions().is_empty());
    }

    #[test]
    fn concurrent_first_writes_leave_one_alive_row() {
        let fx = Arc::new(Fixture::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let fx = Arc::clone(&fx);
                thread::spawn(move || {
                    let session = Session::new(std::time::Duration::from_secs(5));
                    vtmd(&fx, &session, t("s1", "t1"), DdlOp::Rename).upsert(None)
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        assert_eq!(fx.engine.vtmd_tables(), vec![t("s1", "t1_vtmd")]);
        assert_eq!(fx.alive("s1", "t1").len(), 1);
    }

    #[test]
    fn lost_create_race_reuses_the_rivals_catalog() {
        let fx = Fixture::new();
        let racing = RivalCreates {
            inner: fx.engine.clone(),
        };

        let session = fx.session();
        Vtmd::new(&racing, &session, &fx.config, t("s1", "t1"), DdlOp::Rename)
            .upsert(None)
            .unwrap();

        assert!(session.conditions().is_empty());
        assert_eq!(fx.engine.vtmd_tables(), vec![t("s1", "t1_vtmd")]);
        let rows = fx.rows("s1", "t1");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "t0");
        let alive = fx.alive("s1", "t1");
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].name, "t1");
    }

    #[test]
    fn oversized_archive_name_is_rejected_before_any_write() {
        let fx = Fixture::new();
        scenario_a(&fx);
        let before = fx.rows("s1", "t1");

        let archive = "a".repeat(fx.config.max_archive_name_len() + 1);
        let session = fx.session();
        let err = vtmd(&fx, &session, t("s1", "t1"), DdlOp::Alter)
            .upsert(Some(&archive))
            .unwrap_err();

        assert!(matches!(
            err,
            VtmdError::KeyTooLong {
                index: IndexId::ArchiveName,
                ..
            }
        ));
        assert_eq!(fx.rows("s1", "t1"), before);
        assert_eq!(session.conditions().len(), 1);
    }
}
