// Drop archiving
//
// A dropped table's rows live on under an archive name derived from the
// statement start; its alive epoch is closed and stamped with that name.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::Vtmd;
use crate::engine::Engine;
use crate::error::VtmdError;
use crate::record::DdlOp;

/// Name of the archive holding `table`'s rows after a statement started
/// at `ts`, e.g. `t1_20240101_120000_000000`.
pub fn archive_name(table: &str, ts: DateTime<Utc>) -> String {
    format!("{}_{}", table, ts.format("%Y%m%d_%H%M%S_%6f"))
}

impl<'a, E: Engine> Vtmd<'a, E> {
    /// Close the alive epoch of a dropped table and archive it under a
    /// name derived from the statement start.
    ///
    /// Returns the archive name, or `None` if the table has no catalog.
    #[instrument(level = "debug", skip(self), fields(table = %self.about))]
    pub fn drop_archive(&mut self) -> Result<Option<String>, VtmdError> {
        if !self.check_exists()? {
            debug!("no VTMD table, nothing to archive");
            return Ok(None);
        }
        let archive = archive_name(&self.about.table, self.session.query_start());
        Vtmd::new(
            self.engine,
            self.session,
            self.config,
            self.about.clone(),
            DdlOp::Drop,
        )
        .upsert(Some(&archive))?;
        Ok(Some(archive))
    }
}
