// Versioned-Table Metadata Directory
//
// Every system-versioned table has a companion catalog table recording its
// identity over time: the name it lived under in each epoch and, once an
// epoch's rows have been moved away by a drop or an archiving alter, the
// archive name they now live under.
//
// `Vtmd` is the single entry point for DDL callers. The statement kind is
// passed in as a `DdlOp` and selects the create/rename/alter/drop
// behaviour of `upsert`.

mod archive;
mod exists;
mod rename;
mod table;

use std::ops::{Deref, DerefMut};

pub use archive::archive_name;
pub use table::CatalogHandle;

use crate::config::VtmdConfig;
use crate::diagnostics::LocalDiagnostics;
use crate::engine::lock::ScopedMetadataLock;
use crate::engine::{Engine, EngineType, OpenIntent, RowStore};
use crate::error::VtmdError;
use crate::record::{DdlOp, ObjectName, FIELD_COUNT};
use crate::session::Session;

/// Catalog operations on behalf of one logical table.
pub struct Vtmd<'a, E: Engine> {
    engine: &'a E,
    session: &'a Session,
    config: &'a VtmdConfig,
    about: ObjectName,
    op: DdlOp,
    engine_type: Option<EngineType>,
    renamed_to: Option<ObjectName>,
}

impl<'a, E: Engine> Vtmd<'a, E> {
    pub fn new(
        engine: &'a E,
        session: &'a Session,
        config: &'a VtmdConfig,
        about: ObjectName,
        op: DdlOp,
    ) -> Self {
        Self {
            engine,
            session,
            config,
            about,
            op,
            engine_type: None,
            renamed_to: None,
        }
    }

    /// The logical table this instance describes.
    pub fn about(&self) -> &ObjectName {
        &self.about
    }

    pub fn op(&self) -> DdlOp {
        self.op
    }

    /// Engine of the catalog table, once `check_exists` has found it.
    pub fn engine_type(&self) -> Option<EngineType> {
        self.engine_type
    }

    pub fn catalog_name(&self) -> Result<ObjectName, VtmdError> {
        self.config.catalog_name_for(&self.about)
    }

    fn relocated(&self, about: ObjectName) -> Vtmd<'a, E> {
        Vtmd::new(self.engine, self.session, self.config, about, self.op)
    }

    fn lock(
        &self,
        diag: &LocalDiagnostics<'_>,
        name: &ObjectName,
    ) -> Result<ScopedMetadataLock<'a, E>, VtmdError> {
        ScopedMetadataLock::acquire(
            self.engine,
            name,
            self.session.id(),
            self.session.lock_wait_timeout(),
        )
        .map_err(|source| diag.raise(VtmdError::lock(name, source)))
    }

    fn open_catalog(
        &self,
        diag: &LocalDiagnostics<'_>,
        name: &ObjectName,
        intent: OpenIntent,
    ) -> Result<CatalogHandle<E::Table>, VtmdError> {
        let table = self
            .engine
            .open(name, intent, self.session.options())
            .map_err(|source| diag.raise(VtmdError::storage(name, source)))?;

        if table.field_count() != FIELD_COUNT {
            return Err(diag.raise(VtmdError::MalformedSchema {
                table: name.clone(),
                expected: FIELD_COUNT,
                found: table.field_count(),
            }));
        }
        if !table.is_versioned() {
            return Err(diag.raise(VtmdError::NotVersioned {
                table: name.clone(),
            }));
        }
        Ok(CatalogHandle::new(table))
    }
}

/// Suspends system versioning on a table until dropped.
pub(crate) struct Unversioned<'h, T: RowStore> {
    table: &'h mut T,
}

impl<'h, T: RowStore> Unversioned<'h, T> {
    pub(crate) fn new(table: &'h mut T) -> Self {
        table.set_versioning(false);
        Self { table }
    }
}

impl<T: RowStore> Deref for Unversioned<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.table
    }
}

impl<T: RowStore> DerefMut for Unversioned<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.table
    }
}

impl<T: RowStore> Drop for Unversioned<'_, T> {
    fn drop(&mut self) {
        self.table.set_versioning(true);
    }
}
