// In-Memory Reference Engine
//
// A single-process implementation of the engine traits: a schema catalog
// of system-versioned row tables, exclusive named-object locks with wait
// timeouts, and a transaction registry supplying epoch markers.
//
// Every handle opened on a table runs as its own transaction; the
// transaction commits when the handle is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::VtmdConfig;
use crate::engine::key::{archive_key, end_key, END_KEY_LEN};
use crate::engine::{
    Catalog, EngineError, EngineType, IndexId, LockManager, ObjectInfo, OpenIntent,
    ReadDirection, RowId, RowStore, StagedRow, TableTag,
};
use crate::record::{ObjectName, TrxId, VtmdRecord, FIELD_COUNT};
use crate::session::{SessionId, SessionOptions};
use crate::trx::{IsolationLevel, TrxRegistry};

/// Shape of a table created through `MemoryEngine::create_table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDefinition {
    pub fields: usize,
    pub versioned: bool,
}

impl TableDefinition {
    pub fn vtmd() -> Self {
        Self {
            fields: FIELD_COUNT,
            versioned: true,
        }
    }

    pub fn data(fields: usize) -> Self {
        Self {
            fields,
            versioned: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    Created { name: ObjectName, like: ObjectName },
    Renamed { from: ObjectName, to: ObjectName },
    HandlesInvalidated(ObjectName),
    QueryCacheInvalidated(ObjectName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEventKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEntry {
    pub table: ObjectName,
    pub trx_id: TrxId,
    pub kind: RowEventKind,
}

#[derive(Debug)]
struct MemTable {
    definition: TableDefinition,
    engine: EngineType,
    is_vtmd: bool,
    rows: BTreeMap<RowId, VtmdRecord>,
    next_row: u64,
}

impl MemTable {
    fn new(definition: TableDefinition, engine: EngineType, is_vtmd: bool) -> Self {
        Self {
            definition,
            engine,
            is_vtmd,
            rows: BTreeMap::new(),
            next_row: 1,
        }
    }

    fn store(&mut self, record: VtmdRecord) -> RowId {
        let row_id = RowId(self.next_row);
        self.next_row += 1;
        self.rows.insert(row_id, record);
        row_id
    }

    fn index_entries(&self, index: IndexId) -> Vec<(Vec<u8>, RowId)> {
        let mut entries: Vec<_> = self
            .rows
            .iter()
            .map(|(row_id, record)| {
                let key = match index {
                    IndexId::End => end_key(record.end).to_vec(),
                    IndexId::ArchiveName => archive_key(record.archive_name.as_deref()),
                };
                (key, *row_id)
            })
            .collect();
        entries.sort();
        entries
    }
}

#[derive(Debug)]
enum MemObject {
    Table(MemTable),
    /// Catalog entry without a usable engine.
    Orphan,
}

#[derive(Debug, Default)]
struct CatalogState {
    objects: BTreeMap<ObjectName, MemObject>,
    events: Vec<CatalogEvent>,
    binlog: Vec<BinlogEntry>,
}

impl CatalogState {
    fn table_mut(&mut self, name: &ObjectName) -> Result<&mut MemTable, EngineError> {
        match self.objects.get_mut(name) {
            Some(MemObject::Table(table)) => Ok(table),
            Some(MemObject::Orphan) => Err(EngineError::Internal(format!(
                "{name} has no storage engine"
            ))),
            None => Err(EngineError::NoSuchTable(name.clone())),
        }
    }
}

#[derive(Debug)]
struct LockHolder {
    owner: SessionId,
    count: usize,
}

#[derive(Debug)]
struct Shared {
    max_archive_name_len: usize,
    state: Mutex<CatalogState>,
    locks: Mutex<HashMap<ObjectName, LockHolder>>,
    released: Condvar,
    registry: TrxRegistry,
}

/// Cheap to clone; clones share the same catalog.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    /// Create an engine whose system schema holds the catalog template.
    pub fn new(config: &VtmdConfig) -> Self {
        let mut state = CatalogState::default();
        state.objects.insert(
            config.template(),
            MemObject::Table(MemTable::new(
                TableDefinition::vtmd(),
                EngineType::Aria,
                false,
            )),
        );
        Self {
            shared: Arc::new(Shared {
                max_archive_name_len: config.max_archive_name_len(),
                state: Mutex::new(state),
                locks: Mutex::new(HashMap::new()),
                released: Condvar::new(),
                registry: TrxRegistry::new(),
            }),
        }
    }

    pub fn registry(&self) -> &TrxRegistry {
        &self.shared.registry
    }

    /// Create a plain table, such as an archive holding historical rows.
    pub fn create_table(
        &self,
        name: &ObjectName,
        definition: TableDefinition,
        engine: EngineType,
    ) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        if state.objects.contains_key(name) {
            return Err(EngineError::TableExists(name.clone()));
        }
        state.objects.insert(
            name.clone(),
            MemObject::Table(MemTable::new(definition, engine, false)),
        );
        Ok(())
    }

    /// Register a catalog entry with no storage engine behind it.
    pub fn register_orphan(&self, name: &ObjectName) {
        self.shared
            .state
            .lock()
            .objects
            .insert(name.clone(), MemObject::Orphan);
    }

    pub fn exists(&self, name: &ObjectName) -> bool {
        self.shared.state.lock().objects.contains_key(name)
    }

    /// Rows of `name` in insertion order.
    pub fn rows(&self, name: &ObjectName) -> Option<Vec<VtmdRecord>> {
        match self.shared.state.lock().objects.get(name) {
            Some(MemObject::Table(table)) => Some(table.rows.values().cloned().collect()),
            _ => None,
        }
    }

    pub fn vtmd_tables(&self) -> Vec<ObjectName> {
        self.shared
            .state
            .lock()
            .objects
            .iter()
            .filter(|(_, object)| matches!(object, MemObject::Table(t) if t.is_vtmd))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<CatalogEvent> {
        self.shared.state.lock().events.clone()
    }

    pub fn binlog(&self) -> Vec<BinlogEntry> {
        self.shared.state.lock().binlog.clone()
    }

    pub fn lock_holder(&self, name: &ObjectName) -> Option<SessionId> {
        self.shared.locks.lock().get(name).map(|holder| holder.owner)
    }
}

impl LockManager for MemoryEngine {
    fn acquire_exclusive(
        &self,
        name: &ObjectName,
        owner: SessionId,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        let mut locks = self.shared.locks.lock();
        loop {
            match locks.get_mut(name) {
                None => {
                    locks.insert(name.clone(), LockHolder { owner, count: 1 });
                    return Ok(());
                }
                Some(holder) if holder.owner == owner => {
                    holder.count += 1;
                    return Ok(());
                }
                Some(_) => {}
            }
            if self
                .shared
                .released
                .wait_until(&mut locks, deadline)
                .timed_out()
            {
                debug!(object = %name, session = %owner, "metadata lock wait timed out");
                return Err(EngineError::LockWaitTimeout(name.clone()));
            }
        }
    }

    fn release(&self, name: &ObjectName, owner: SessionId) {
        let mut locks = self.shared.locks.lock();
        let remove = match locks.get_mut(name) {
            Some(holder) if holder.owner == owner => {
                holder.count -= 1;
                holder.count == 0
            }
            _ => {
                warn!(object = %name, session = %owner, "release of a lock not held");
                false
            }
        };
        if remove {
            locks.remove(name);
            self.shared.released.notify_all();
        }
    }
}

impl Catalog for MemoryEngine {
    type Table = MemoryTable;

    fn lookup(&self, name: &ObjectName) -> Result<Option<ObjectInfo>, EngineError> {
        let state = self.shared.state.lock();
        Ok(state.objects.get(name).map(|object| match object {
            MemObject::Table(table) => ObjectInfo {
                engine: Some(table.engine),
            },
            MemObject::Orphan => ObjectInfo { engine: None },
        }))
    }

    fn open(
        &self,
        name: &ObjectName,
        intent: OpenIntent,
        options: SessionOptions,
    ) -> Result<MemoryTable, EngineError> {
        let (definition, trx) = {
            let mut state = self.shared.state.lock();
            let table = state.table_mut(name)?;
            let trx = self.shared.registry.begin(IsolationLevel::RepeatableRead);
            (table.definition, trx)
        };
        Ok(MemoryTable {
            shared: Arc::clone(&self.shared),
            name: name.clone(),
            trx,
            intent,
            binlog: options.binlog,
            definition,
            versioning: definition.versioned,
            cursor: None,
        })
    }

    fn create_like(
        &self,
        target: &ObjectName,
        template: &ObjectName,
        tag: TableTag,
    ) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        if state.objects.contains_key(target) {
            return Err(EngineError::TableExists(target.clone()));
        }
        let (definition, engine) = match state.objects.get(template) {
            Some(MemObject::Table(table)) => (table.definition, table.engine),
            _ => return Err(EngineError::NoSuchTable(template.clone())),
        };
        let is_vtmd = matches!(tag, TableTag::Vtmd);
        state.objects.insert(
            target.clone(),
            MemObject::Table(MemTable::new(definition, engine, is_vtmd)),
        );
        state.events.push(CatalogEvent::Created {
            name: target.clone(),
            like: template.clone(),
        });
        Ok(())
    }

    fn rename(&self, from: &ObjectName, to: &ObjectName) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        if state.objects.contains_key(to) {
            return Err(EngineError::TableExists(to.clone()));
        }
        let object = state
            .objects
            .remove(from)
            .ok_or_else(|| EngineError::NoSuchTable(from.clone()))?;
        state.objects.insert(to.clone(), object);
        state.events.push(CatalogEvent::Renamed {
            from: from.clone(),
            to: to.clone(),
        });
        Ok(())
    }

    fn invalidate_handles(&self, name: &ObjectName) {
        self.shared
            .state
            .lock()
            .events
            .push(CatalogEvent::HandlesInvalidated(name.clone()));
    }

    fn invalidate_query_cache(&self, name: &ObjectName) {
        self.shared
            .state
            .lock()
            .events
            .push(CatalogEvent::QueryCacheInvalidated(name.clone()));
    }
}

#[derive(Debug)]
struct Cursor {
    entries: Vec<(Vec<u8>, RowId)>,
    pos: usize,
}

/// Open handle on a `MemoryEngine` table.
#[derive(Debug)]
pub struct MemoryTable {
    shared: Arc<Shared>,
    name: ObjectName,
    trx: TrxId,
    intent: OpenIntent,
    binlog: bool,
    definition: TableDefinition,
    versioning: bool,
    cursor: Option<Cursor>,
}

impl MemoryTable {
    pub fn trx_id(&self) -> TrxId {
        self.trx
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        match self.intent {
            OpenIntent::Write => Ok(()),
            OpenIntent::Read => Err(EngineError::ReadOnly(self.name.clone())),
        }
    }

    fn log_row_event(&self, state: &mut CatalogState, kind: RowEventKind) {
        if self.binlog {
            state.binlog.push(BinlogEntry {
                table: self.name.clone(),
                trx_id: self.trx,
                kind,
            });
        }
    }

    /// Whether a write to `record` closes its epoch rather than changing
    /// it in place.
    fn closes_epoch(&self, record: &VtmdRecord) -> bool {
        self.versioning && record.is_alive() && record.start != self.trx
    }

    fn fetch(&self, row_id: RowId) -> Result<StagedRow, EngineError> {
        let mut state = self.shared.state.lock();
        let table = state.table_mut(&self.name)?;
        let record = table
            .rows
            .get(&row_id)
            .cloned()
            .ok_or(EngineError::RecordDeleted)?;
        Ok(StagedRow { row_id, record })
    }

    fn entries(&self, index: IndexId) -> Result<Vec<(Vec<u8>, RowId)>, EngineError> {
        let mut state = self.shared.state.lock();
        Ok(state.table_mut(&self.name)?.index_entries(index))
    }
}

impl RowStore for MemoryTable {
    fn name(&self) -> &ObjectName {
        &self.name
    }

    fn field_count(&self) -> usize {
        self.definition.fields
    }

    fn is_versioned(&self) -> bool {
        self.definition.versioned
    }

    fn set_versioning(&mut self, enabled: bool) {
        self.versioning = enabled && self.definition.versioned;
    }

    fn max_key_length(&self, index: IndexId) -> usize {
        match index {
            IndexId::End => END_KEY_LEN,
            IndexId::ArchiveName => 1 + self.shared.max_archive_name_len,
        }
    }

    fn index_read(
        &mut self,
        index: IndexId,
        key: &[u8],
        direction: ReadDirection,
    ) -> Result<StagedRow, EngineError> {
        let entries = self.entries(index)?;
        let pos = {
            let mut matching = entries
                .iter()
                .enumerate()
                .filter(|(_, (entry_key, _))| entry_key.as_slice() == key)
                .map(|(pos, _)| pos);
            match direction {
                ReadDirection::Forward => matching.next(),
                ReadDirection::Reverse => matching.last(),
            }
        }
        .ok_or(EngineError::KeyNotFound)?;
        let row_id = entries[pos].1;
        self.cursor = Some(Cursor { entries, pos });
        self.fetch(row_id)
    }

    fn index_first(&mut self, index: IndexId) -> Result<StagedRow, EngineError> {
        let entries = self.entries(index)?;
        let Some(&(_, row_id)) = entries.first() else {
            self.cursor = None;
            return Err(EngineError::EndOfFile);
        };
        self.cursor = Some(Cursor { entries, pos: 0 });
        self.fetch(row_id)
    }

    fn index_next(&mut self) -> Result<StagedRow, EngineError> {
        let cursor = self.cursor.as_mut().ok_or(EngineError::NoCursor)?;
        cursor.pos += 1;
        let row_id = match cursor.entries.get(cursor.pos) {
            Some(&(_, row_id)) => row_id,
            None => return Err(EngineError::EndOfFile),
        };
        self.fetch(row_id)
    }

    fn index_end(&mut self) {
        self.cursor = None;
    }

    fn insert(&mut self, record: &VtmdRecord) -> Result<StagedRow, EngineError> {
        self.check_writable()?;
        let mut stored = record.clone();
        if self.versioning {
            stored.start = self.trx;
            stored.end = TrxId::MAX;
        }
        let mut state = self.shared.state.lock();
        let row_id = state.table_mut(&self.name)?.store(stored.clone());
        self.log_row_event(&mut state, RowEventKind::Insert);
        Ok(StagedRow {
            row_id,
            record: stored,
        })
    }

    fn update(&mut self, old: &StagedRow, new: &VtmdRecord) -> Result<StagedRow, EngineError> {
        self.check_writable()?;
        let mut state = self.shared.state.lock();
        let table = state.table_mut(&self.name)?;
        let current = table
            .rows
            .get(&old.row_id)
            .cloned()
            .ok_or(EngineError::RowNotFound(old.row_id))?;

        let staged = if self.closes_epoch(&current) {
            table.rows.insert(
                old.row_id,
                VtmdRecord {
                    end: self.trx,
                    ..current
                },
            );
            let successor = VtmdRecord {
                start: self.trx,
                end: TrxId::MAX,
                ..new.clone()
            };
            let row_id = table.store(successor.clone());
            StagedRow {
                row_id,
                record: successor,
            }
        } else {
            let mut stored = new.clone();
            if self.versioning {
                stored.start = current.start;
                stored.end = current.end;
            }
            table.rows.insert(old.row_id, stored.clone());
            StagedRow {
                row_id: old.row_id,
                record: stored,
            }
        };
        self.log_row_event(&mut state, RowEventKind::Update);
        Ok(staged)
    }

    fn delete(&mut self, row: &StagedRow) -> Result<(), EngineError> {
        self.check_writable()?;
        let mut state = self.shared.state.lock();
        let table = state.table_mut(&self.name)?;
        let current = table
            .rows
            .get(&row.row_id)
            .cloned()
            .ok_or(EngineError::RowNotFound(row.row_id))?;
        if self.closes_epoch(&current) {
            table.rows.insert(
                row.row_id,
                VtmdRecord {
                    end: self.trx,
                    ..current
                },
            );
        } else {
            table.rows.remove(&row.row_id);
        }
        self.log_row_event(&mut state, RowEventKind::Delete);
        Ok(())
    }
}

impl Drop for MemoryTable {
    fn drop(&mut self) {
        if let Err(err) = self.shared.registry.commit(self.trx) {
            warn!(table = %self.name, "failed to commit handle transaction: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn engine() -> (MemoryEngine, ObjectName) {
        let config = VtmdConfig::default_config();
        let engine = MemoryEngine::new(&config);
        let name = ObjectName::new("s1", "t1_vtmd");
        engine
            .create_like(&name, &config.template(), TableTag::Vtmd)
            .unwrap();
        (engine, name)
    }

    fn open(engine: &MemoryEngine, name: &ObjectName) -> MemoryTable {
        engine
            .open(name, OpenIntent::Write, SessionOptions { binlog: false })
            .unwrap()
    }

    #[test]
    fn versioned_update_closes_the_epoch() {
        let (engine, name) = engine();
        let inserted = open(&engine, &name).insert(&VtmdRecord::live("t1")).unwrap();

        let mut table = open(&engine, &name);
        let successor = table.update(&inserted, &VtmdRecord::live("t2")).unwrap();
        assert_eq!(successor.record.start, table.trx_id());
        assert!(successor.record.is_alive());
        drop(table);

        let rows = engine.rows(&name).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "t1");
        assert_eq!(rows[0].end, successor.record.start);
        assert_eq!(rows[1].name, "t2");
    }

    #[test]
    fn suspended_versioning_updates_in_place() {
        let (engine, name) = engine();
        let inserted = open(&engine, &name).insert(&VtmdRecord::live("t1")).unwrap();

        let mut table = open(&engine, &name);
        table.set_versioning(false);
        let stamped = inserted.record.with_archive_name("t1_arch");
        table.update(&inserted, &stamped).unwrap();
        table.delete(&inserted).unwrap();
        drop(table);

        assert_eq!(engine.rows(&name).unwrap(), vec![]);
    }

    #[test]
    fn reverse_read_positions_on_last_duplicate() {
        let (engine, name) = engine();
        let mut table = open(&engine, &name);
        table.set_versioning(false);
        for start in 1..=3 {
            table
                .insert(&VtmdRecord {
                    start: TrxId(start),
                    end: TrxId(start + 1),
                    ..VtmdRecord::live("t1").with_archive_name("a1")
                })
                .unwrap();
        }

        let key = archive_key(Some("a1"));
        let first = table
            .index_read(IndexId::ArchiveName, &key, ReadDirection::Forward)
            .unwrap();
        let last = table
            .index_read(IndexId::ArchiveName, &key, ReadDirection::Reverse)
            .unwrap();
        assert_eq!(first.record.start, TrxId(1));
        assert_eq!(last.record.start, TrxId(3));
        assert_eq!(table.index_next(), Err(EngineError::EndOfFile));
        assert_eq!(
            table.index_read(IndexId::End, &end_key(TrxId(9)), ReadDirection::Forward),
            Err(EngineError::KeyNotFound)
        );
    }

    #[test]
    fn read_handles_reject_writes() {
        let (engine, name) = engine();
        let mut table = engine
            .open(&name, OpenIntent::Read, SessionOptions::default())
            .unwrap();
        assert_eq!(
            table.insert(&VtmdRecord::live("t1")),
            Err(EngineError::ReadOnly(name))
        );
    }

    #[test]
    fn binlog_records_only_when_enabled() {
        let (engine, name) = engine();
        open(&engine, &name).insert(&VtmdRecord::live("t1")).unwrap();
        assert!(engine.binlog().is_empty());

        engine
            .open(&name, OpenIntent::Write, SessionOptions::default())
            .unwrap()
            .insert(&VtmdRecord::live("t1"))
            .unwrap();
        assert_eq!(engine.binlog().len(), 1);
        assert_eq!(engine.binlog()[0].kind, RowEventKind::Insert);
    }

    #[test]
    fn rename_and_create_report_collisions() {
        let (engine, name) = engine();
        let template = VtmdConfig::default_config().template();
        assert_eq!(
            engine.create_like(&name, &template, TableTag::Vtmd),
            Err(EngineError::TableExists(name.clone()))
        );

        let moved = ObjectName::new("s2", "t1_vtmd");
        engine.rename(&name, &moved).unwrap();
        assert!(!engine.exists(&name));
        assert_eq!(
            engine.rename(&name, &moved),
            Err(EngineError::TableExists(moved.clone()))
        );
        assert_eq!(engine.vtmd_tables(), vec![moved]);
    }

    #[test]
    fn handles_commit_their_transaction() {
        let (engine, name) = engine();
        let table = open(&engine, &name);
        let trx = table.trx_id();
        assert_eq!(engine.registry().commit_id(trx), None);
        drop(table);
        assert!(engine.registry().commit_id(trx).is_some());
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let (engine, name) = engine();
        let holder = SessionId::new();
        engine
            .acquire_exclusive(&name, holder, Duration::from_millis(10))
            .unwrap();

        let waiter_engine = engine.clone();
        let waiter_name = name.clone();
        let waiter = thread::spawn(move || {
            waiter_engine.acquire_exclusive(&waiter_name, SessionId::new(), Duration::from_secs(5))
        });

        thread::sleep(Duration::from_millis(20));
        engine.release(&name, holder);
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_ne!(engine.lock_holder(&name), Some(holder));
    }
}
