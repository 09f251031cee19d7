// Transaction Registry
//
// Records when each transaction began and committed, so that epoch
// boundaries stored as transaction ids can be resolved to timestamps and
// compared for visibility.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::record::TrxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrxRecord {
    pub trx_id: TrxId,
    pub begin_ts: DateTime<Utc>,
    pub commit_id: Option<TrxId>,
    pub commit_ts: Option<DateTime<Utc>>,
    pub iso_level: IsolationLevel,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrxError {
    #[error("unknown transaction {0}")]
    Unknown(TrxId),

    #[error("transaction {0} is already committed")]
    AlreadyCommitted(TrxId),
}

#[derive(Debug)]
struct RegistryState {
    next: u64,
    records: BTreeMap<TrxId, TrxRecord>,
}

/// Transaction ids and commit ids are drawn from one counter, so a commit
/// id is always greater than the id of any transaction begun before it.
#[derive(Debug)]
pub struct TrxRegistry {
    state: Mutex<RegistryState>,
}

impl Default for TrxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrxRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next: 1,
                records: BTreeMap::new(),
            }),
        }
    }

    pub fn begin(&self, iso_level: IsolationLevel) -> TrxId {
        self.begin_at(iso_level, Utc::now())
    }

    pub fn begin_at(&self, iso_level: IsolationLevel, ts: DateTime<Utc>) -> TrxId {
        let mut state = self.state.lock();
        let trx_id = TrxId(state.next);
        state.next += 1;
        state.records.insert(
            trx_id,
            TrxRecord {
                trx_id,
                begin_ts: ts,
                commit_id: None,
                commit_ts: None,
                iso_level,
            },
        );
        trx_id
    }

    pub fn commit(&self, trx_id: TrxId) -> Result<TrxId, TrxError> {
        self.commit_at(trx_id, Utc::now())
    }

    pub fn commit_at(&self, trx_id: TrxId, ts: DateTime<Utc>) -> Result<TrxId, TrxError> {
        let mut state = self.state.lock();
        let commit_id = TrxId(state.next);
        let record = state
            .records
            .get_mut(&trx_id)
            .ok_or(TrxError::Unknown(trx_id))?;
        if record.commit_id.is_some() {
            return Err(TrxError::AlreadyCommitted(trx_id));
        }
        record.commit_id = Some(commit_id);
        record.commit_ts = Some(ts);
        state.next += 1;
        Ok(commit_id)
    }

    pub fn get(&self, trx_id: TrxId) -> Option<TrxRecord> {
        self.state.lock().records.get(&trx_id).cloned()
    }

    pub fn begin_ts(&self, trx_id: TrxId) -> Option<DateTime<Utc>> {
        self.get(trx_id).map(|r| r.begin_ts)
    }

    pub fn commit_ts(&self, trx_id: TrxId) -> Option<DateTime<Utc>> {
        self.get(trx_id).and_then(|r| r.commit_ts)
    }

    pub fn commit_id(&self, trx_id: TrxId) -> Option<TrxId> {
        self.get(trx_id).and_then(|r| r.commit_id)
    }

    /// Transaction that committed closest to `ts`: the last one at or
    /// before it, or with `backwards == false` the first one at or after it.
    pub fn trx_id_at(&self, ts: DateTime<Utc>, backwards: bool) -> Option<TrxId> {
        let state = self.state.lock();
        let committed = state
            .records
            .values()
            .filter_map(|r| r.commit_ts.map(|commit_ts| (commit_ts, r.commit_id, r.trx_id)));
        if backwards {
            committed
                .filter(|(commit_ts, _, _)| *commit_ts <= ts)
                .max_by_key(|(commit_ts, commit_id, _)| (*commit_ts, *commit_id))
                .map(|(_, _, trx_id)| trx_id)
        } else {
            committed
                .filter(|(commit_ts, _, _)| *commit_ts >= ts)
                .min_by_key(|(commit_ts, commit_id, _)| (*commit_ts, *commit_id))
                .map(|(_, _, trx_id)| trx_id)
        }
    }

    /// Whether `reader` sees the changes of `writer`: `writer` committed
    /// before `reader` began.
    pub fn sees(&self, reader: TrxId, writer: TrxId) -> Result<bool, TrxError> {
        let state = self.state.lock();
        if !state.records.contains_key(&reader) {
            return Err(TrxError::Unknown(reader));
        }
        let writer = state
            .records
            .get(&writer)
            .ok_or(TrxError::Unknown(writer))?;
        Ok(writer.commit_id.map_or(false, |commit_id| commit_id < reader))
    }

    /// Like `sees`, but a transaction also sees itself.
    pub fn sees_eq(&self, reader: TrxId, writer: TrxId) -> Result<bool, TrxError> {
        if reader == writer {
            return Ok(true);
        }
        self.sees(reader, writer)
    }

    /// Whether the epoch `[start, end)` is current in `reader`'s snapshot.
    pub fn epoch_visible(
        &self,
        reader: TrxId,
        start: TrxId,
        end: TrxId,
    ) -> Result<bool, TrxError> {
        if !self.sees_eq(reader, start)? {
            return Ok(false);
        }
        Ok(end.is_max() || !self.sees_eq(reader, end)?)
    }
}
