// Deterministic Replay Engine
//
// Applies a script of DDL statements to an engine, running the catalog
// protocol for each one and checking the catalog rows against the
// invariants after every statement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::VtmdConfig;
use crate::diagnostics::Condition;
use crate::engine::Engine;
use crate::error::VtmdError;
use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::record::{DdlOp, ObjectName, VtmdRecord};
use crate::session::Session;
use crate::vtmd::Vtmd;

/// One DDL statement on a versioned table.
///
/// `at` pins the statement's start time, which names archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    Create {
        schema: String,
        table: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Rename {
        schema: String,
        table: String,
        new_schema: String,
        new_table: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Alter {
        schema: String,
        table: String,
        #[serde(default)]
        archive: Option<String>,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Drop {
        schema: String,
        table: String,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
}

impl Statement {
    pub fn op(&self) -> DdlOp {
        match self {
            Statement::Create { .. } => DdlOp::Create,
            Statement::Rename { .. } => DdlOp::Rename,
            Statement::Alter { .. } => DdlOp::Alter,
            Statement::Drop { .. } => DdlOp::Drop,
        }
    }

    /// The logical table the statement acts on.
    pub fn about(&self) -> ObjectName {
        match self {
            Statement::Create { schema, table, .. }
            | Statement::Rename { schema, table, .. }
            | Statement::Alter { schema, table, .. }
            | Statement::Drop { schema, table, .. } => ObjectName::new(schema, table),
        }
    }

    /// The logical table after the statement succeeds.
    pub fn target(&self) -> ObjectName {
        match self {
            Statement::Rename {
                new_schema,
                new_table,
                ..
            } => ObjectName::new(new_schema, new_table),
            _ => self.about(),
        }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            Statement::Create { at, .. }
            | Statement::Rename { at, .. }
            | Statement::Alter { at, .. }
            | Statement::Drop { at, .. } => *at,
        }
    }
}

/// Errors that stop a replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("step {step}: invariant violation: {source}")]
    Invariant {
        step: usize,
        #[source]
        source: InvariantViolation,
    },

    #[error("step {step}: failed to read catalog: {source}")]
    Snapshot {
        step: usize,
        #[source]
        source: VtmdError,
    },
}

/// What happened to one statement.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: usize,
    pub statement: Statement,
    /// Archive name chosen for a drop.
    pub archive: Option<String>,
    pub error: Option<String>,
    pub conditions: Vec<Condition>,
    pub rows: Vec<VtmdRecord>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub steps: Vec<StepOutcome>,
}

/// Apply `statements` in order.
///
/// A failing statement is recorded with its diagnostics and the replay
/// continues. An invariant violation stops the replay.
pub fn replay_script<E: Engine>(
    engine: &E,
    config: &VtmdConfig,
    statements: &[Statement],
    invariants: &InvariantEngine,
) -> Result<ReplayReport, ReplayError> {
    let mut report = ReplayReport::default();

    for (step, statement) in statements.iter().enumerate() {
        let op = statement.op();
        let previous = snapshot(engine, config, statement.about(), op)
            .map_err(|source| ReplayError::Snapshot { step, source })?;

        let session = match statement.at() {
            Some(at) => Session::new(config.lock_wait_timeout()).with_query_start(at),
            None => Session::new(config.lock_wait_timeout()),
        };
        let result = apply(engine, config, &session, statement);
        let conditions = session.take_conditions();

        let observed = match &result {
            Ok(_) => statement.target(),
            Err(_) => statement.about(),
        };
        let next = snapshot(engine, config, observed, op)
            .map_err(|source| ReplayError::Snapshot { step, source })?;
        invariants
            .evaluate(&previous, op, &next)
            .map_err(|source| ReplayError::Invariant { step, source })?;

        let (archive, error) = match result {
            Ok(archive) => (archive, None),
            Err(err) => {
                debug!(step, "statement failed: {err}");
                (None, Some(err.to_string()))
            }
        };
        report.steps.push(StepOutcome {
            step,
            statement: statement.clone(),
            archive,
            error,
            conditions,
            rows: next,
        });
    }

    info!(
        steps = report.steps.len(),
        failed = report.steps.iter().filter(|s| !s.succeeded()).count(),
        "replay finished"
    );
    Ok(report)
}

fn apply<E: Engine>(
    engine: &E,
    config: &VtmdConfig,
    session: &Session,
    statement: &Statement,
) -> Result<Option<String>, VtmdError> {
    let mut vtmd = Vtmd::new(engine, session, config, statement.about(), statement.op());
    match statement {
        Statement::Create { .. } => vtmd.upsert(None).map(|()| None),
        Statement::Rename {
            new_schema,
            new_table,
            ..
        } => vtmd.try_rename(new_schema, new_table).map(|()| None),
        Statement::Alter { archive, .. } => vtmd.upsert(archive.as_deref()).map(|()| None),
        Statement::Drop { .. } => vtmd.drop_archive(),
    }
}

fn snapshot<E: Engine>(
    engine: &E,
    config: &VtmdConfig,
    about: ObjectName,
    op: DdlOp,
) -> Result<Vec<VtmdRecord>, VtmdError> {
    let session = Session::new(config.lock_wait_timeout());
    Vtmd::new(engine, &session, config, about, op).history()
}
