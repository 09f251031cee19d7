// Scoped exclusive metadata lock.

use std::time::Duration;

use tracing::debug;

use crate::engine::{EngineError, LockManager};
use crate::record::ObjectName;
use crate::session::SessionId;

/// Holds an exclusive lock on a named object until dropped.
///
/// A failed acquire produces no guard, so nothing is released for it.
pub struct ScopedMetadataLock<'a, L: LockManager + ?Sized> {
    locks: &'a L,
    name: ObjectName,
    owner: SessionId,
}

impl<'a, L: LockManager + ?Sized> ScopedMetadataLock<'a, L> {
    pub fn acquire(
        locks: &'a L,
        name: &ObjectName,
        owner: SessionId,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        locks.acquire_exclusive(name, owner, timeout)?;
        debug!(object = %name, session = %owner, "acquired exclusive metadata lock");
        Ok(Self {
            locks,
            name: name.clone(),
            owner,
        })
    }

    pub fn name(&self) -> &ObjectName {
        &self.name
    }
}

impl<L: LockManager + ?Sized> Drop for ScopedMetadataLock<'_, L> {
    fn drop(&mut self) {
        self.locks.release(&self.name, self.owner);
        debug!(object = %self.name, session = %self.owner, "released exclusive metadata lock");
    }
}
