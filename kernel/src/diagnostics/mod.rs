// Diagnostics
//
// Errors and warnings raised by catalog operations are collected in a
// diagnostics area owned by the session. `LocalDiagnostics` substitutes a
// fresh area for the duration of one operation, so that expected
// conditions (a catalog table that does not exist yet, a lost create race)
// can be inspected and cleared before anything reaches the caller.

use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::EngineError;
use crate::error::VtmdError;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Note,
    Warning,
    Error,
}

/// Classification used to recognise expected conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoSuchTable,
    TableExists,
    KeyNotFound,
    RecordDeleted,
    EndOfFile,
    LockWaitTimeout,
    ReadOnly,
    Storage,
    Vtmd,
}

impl From<&EngineError> for ErrorCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::NoSuchTable(_) => ErrorCode::NoSuchTable,
            EngineError::TableExists(_) => ErrorCode::TableExists,
            EngineError::KeyNotFound => ErrorCode::KeyNotFound,
            EngineError::RecordDeleted => ErrorCode::RecordDeleted,
            EngineError::EndOfFile => ErrorCode::EndOfFile,
            EngineError::LockWaitTimeout(_) => ErrorCode::LockWaitTimeout,
            EngineError::ReadOnly(_) => ErrorCode::ReadOnly,
            EngineError::NoCursor | EngineError::RowNotFound(_) | EngineError::Internal(_) => {
                ErrorCode::Storage
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub level: Level,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct DiagnosticsArea {
    conditions: Vec<Condition>,
}

impl DiagnosticsArea {
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn push(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    /// First error raised into this area.
    pub fn error(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.level == Level::Error)
    }

    pub fn clear_errors(&mut self) {
        self.conditions.retain(|c| c.level != Level::Error);
    }

    pub fn take(&mut self) -> Vec<Condition> {
        std::mem::take(&mut self.conditions)
    }
}

/// Scoped substitution of the session's diagnostics area.
///
/// On drop the substituted area is removed and whatever it still holds
/// is forwarded to the area that was active before.
pub struct LocalDiagnostics<'s> {
    session: &'s Session,
    depth: usize,
}

impl<'s> LocalDiagnostics<'s> {
    pub fn install(session: &'s Session) -> Self {
        let mut stack = session.diagnostics.borrow_mut();
        stack.push(DiagnosticsArea::default());
        let depth = stack.len();
        Self { session, depth }
    }

    /// Record `err` and hand it back for propagation.
    pub fn raise(&self, err: VtmdError) -> VtmdError {
        debug!(code = ?err.code(), "{err}");
        self.with_area(|area| {
            area.push(Condition {
                level: Level::Error,
                code: err.code(),
                message: err.to_string(),
            })
        });
        err
    }

    pub fn warn(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        warn!(code = ?code, "{message}");
        self.with_area(|area| {
            area.push(Condition {
                level: Level::Warning,
                code,
                message,
            })
        });
    }

    /// Code of the first error captured so far.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.with_area(|area| area.error().map(|c| c.code))
    }

    /// Forget captured errors. Warnings are kept.
    pub fn clear(&self) {
        self.with_area(DiagnosticsArea::clear_errors);
    }

    fn with_area<R>(&self, f: impl FnOnce(&mut DiagnosticsArea) -> R) -> R {
        let mut stack = self.session.diagnostics.borrow_mut();
        let at = (self.depth - 1).min(stack.len() - 1);
        f(&mut stack[at])
    }
}

impl Drop for LocalDiagnostics<'_> {
    fn drop(&mut self) {
        let mut stack = self.session.diagnostics.borrow_mut();
        let at = (self.depth - 1).min(stack.len());
        let captured: Vec<Condition> = stack
            .split_off(at)
            .into_iter()
            .flat_map(|mut area| area.take())
            .collect();
        if stack.is_empty() {
            stack.push(DiagnosticsArea::default());
        }
        if let Some(previous) = stack.last_mut() {
            previous.conditions.extend(captured);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ObjectName;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(Duration::from_millis(10))
    }

    #[test]
    fn cleared_errors_are_not_forwarded() {
        let session = session();
        {
            let diag = LocalDiagnostics::install(&session);
            diag.raise(VtmdError::storage(
                &ObjectName::new("s1", "t1_vtmd"),
                EngineError::NoSuchTable(ObjectName::new("s1", "t1_vtmd")),
            ));
            assert_eq!(diag.error_code(), Some(ErrorCode::NoSuchTable));
            diag.clear();
            assert_eq!(diag.error_code(), None);
            assert!(session.conditions().is_empty());
        }
        assert!(session.conditions().is_empty());
    }

    #[test]
    fn genuine_errors_and_warnings_reach_the_caller() {
        let session = session();
        {
            let diag = LocalDiagnostics::install(&session);
            diag.warn(ErrorCode::Vtmd, "archive doesn't exist");
            diag.raise(VtmdError::NotEmpty {
                table: ObjectName::new("s1", "t1_vtmd"),
            });
        }
        let conditions = session.take_conditions();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].level, Level::Warning);
        assert_eq!(conditions[1].level, Level::Error);
        assert!(conditions[1].message.contains("exists and not empty"));
        assert!(session.conditions().is_empty());
    }

    #[test]
    fn nested_areas_forward_to_their_parent() {
        let session = session();
        let outer = LocalDiagnostics::install(&session);
        {
            let inner = LocalDiagnostics::install(&session);
            inner.raise(VtmdError::storage(
                &ObjectName::new("s1", "t1_vtmd"),
                EngineError::TableExists(ObjectName::new("s1", "t1_vtmd")),
            ));
            assert_eq!(outer.error_code(), None);
        }
        assert_eq!(outer.error_code(), Some(ErrorCode::TableExists));
        outer.clear();
        drop(outer);
        assert!(session.conditions().is_empty());
        assert_eq!(session.diagnostics.borrow().len(), 1);
    }
}
