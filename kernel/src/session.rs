// Session Context
//
// Per-caller state the protocol reads from the enclosing executor: who is
// asking (lock owner), how long to wait for locks, the statement start
// time, session options and the diagnostics stack.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diagnostics::{Condition, DiagnosticsArea};

/// Stable identifier for a session. Used as the metadata lock owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Whether row writes are written to the binary log.
    pub binlog: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { binlog: true }
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    lock_wait_timeout: Duration,
    query_start: DateTime<Utc>,
    options: Cell<SessionOptions>,
    pub(crate) diagnostics: RefCell<Vec<DiagnosticsArea>>,
}

impl Session {
    pub fn new(lock_wait_timeout: Duration) -> Self {
        Self {
            id: SessionId::new(),
            lock_wait_timeout,
            query_start: Utc::now(),
            options: Cell::new(SessionOptions::default()),
            diagnostics: RefCell::new(vec![DiagnosticsArea::default()]),
        }
    }

    /// Pin the statement start time (archive names are derived from it).
    pub fn with_query_start(mut self, query_start: DateTime<Utc>) -> Self {
        self.query_start = query_start;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        self.lock_wait_timeout
    }

    pub fn query_start(&self) -> DateTime<Utc> {
        self.query_start
    }

    pub fn options(&self) -> SessionOptions {
        self.options.get()
    }

    /// Conditions of the currently active diagnostics area.
    pub fn conditions(&self) -> Vec<Condition> {
        self.diagnostics
            .borrow()
            .last()
            .map(|area| area.conditions().to_vec())
            .unwrap_or_default()
    }

    /// Take and clear the conditions of the currently active area.
    pub fn take_conditions(&self) -> Vec<Condition> {
        self.diagnostics
            .borrow_mut()
            .last_mut()
            .map(DiagnosticsArea::take)
            .unwrap_or_default()
    }

    /// Disable binary logging until the guard is dropped.
    pub fn suppress_binlog(&self) -> SessionOptionsGuard<'_> {
        let saved = self.options.get();
        self.options.set(SessionOptions { binlog: false });
        SessionOptionsGuard {
            session: self,
            saved,
        }
    }
}

/// Restores the saved session options on drop.
pub struct SessionOptionsGuard<'s> {
    session: &'s Session,
    saved: SessionOptions,
}

impl Drop for SessionOptionsGuard<'_> {
    fn drop(&mut self) {
        self.session.options.set(self.saved);
    }
}
