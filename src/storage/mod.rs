//! Core storage engine
//!
//! In-memory observation tables behind a single `RwLock`, with:
//! - transactional writes (undo log, all-or-nothing commit)
//! - secondary indexes by encounter and patient
//! - optional durability through a write-ahead log and snapshots
//! - the rebuildable aggregate rollup
//!
//! Every call that reads or writes the tables counts as one statement, which
//! lets callers assert how many round trips a batch operation costs.

pub mod persistence;
pub mod rollup;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{
    LoadedObservation, LoadedObservationSet, ObservationMetadataRecord, ObservationRecord,
    ObservationSetRecord,
};
pub use persistence::{PersistenceManager, Snapshot, WalBatch, WalEntry};
pub use rollup::{
    AggregateObservationSets, LatenessBuckets, LatenessInterval, RollupQuery, VitalSign,
    VitalSignCounts,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage lock poisoned")]
    LockPoisoned,
    #[error("duplicate primary key {0}")]
    DuplicateKey(Uuid),
    #[error("row {0} does not exist")]
    MissingRow(Uuid),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which observation sets a select statement reads.
#[derive(Debug, Clone, PartialEq)]
pub enum SetFilter {
    ById(Uuid),
    Encounters(Vec<String>),
    Patient(String),
    /// `after < record_time <= until`, restricted to the given locations.
    LocationsBetween {
        locations: Vec<String>,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    ModifiedAfter(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOrder {
    RecordTimeDesc,
    ModifiedDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetQuery {
    pub filter: SetFilter,
    pub order: SetOrder,
    pub limit: Option<usize>,
}

impl SetQuery {
    pub fn new(filter: SetFilter) -> Self {
        SetQuery {
            filter,
            order: SetOrder::RecordTimeDesc,
            limit: None,
        }
    }

    pub fn order_by(mut self, order: SetOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// The observation tables and their indexes.
#[derive(Debug, Default, Clone)]
pub struct Tables {
    observation_sets: HashMap<Uuid, ObservationSetRecord>,
    observations: HashMap<Uuid, ObservationRecord>,
    observation_metadata: HashMap<Uuid, ObservationMetadataRecord>,
    // Child observations per set, in insertion order.
    observations_by_set: HashMap<Uuid, Vec<Uuid>>,
    metadata_by_observation: HashMap<Uuid, Uuid>,
    sets_by_encounter: HashMap<String, Vec<Uuid>>,
    sets_by_patient: HashMap<String, Vec<Uuid>>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Result<Self, StorageError> {
        let mut tables = Tables::default();
        for set in snapshot.observation_sets {
            tables.index_set(&set);
            tables.observation_sets.insert(set.uuid, set);
        }
        for observation in snapshot.observations {
            tables.insert_observation(observation)?;
        }
        for metadata in snapshot.observation_metadata {
            tables.insert_metadata(metadata)?;
        }
        Ok(tables)
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut sets: Vec<&ObservationSetRecord> = self.observation_sets.values().collect();
        sets.sort_by_key(|s| (s.audit.created, s.uuid));

        let mut snapshot = Snapshot::default();
        for set in sets {
            for id in self.observation_ids_for(&set.uuid) {
                if let Some(observation) = self.observations.get(id) {
                    snapshot.observations.push(observation.clone());
                }
                if let Some(metadata) = self
                    .metadata_by_observation
                    .get(id)
                    .and_then(|m| self.observation_metadata.get(m))
                {
                    snapshot.observation_metadata.push(metadata.clone());
                }
            }
            snapshot.observation_sets.push(set.clone());
        }
        snapshot
    }

    pub(crate) fn observation_ids_for(&self, set_uuid: &Uuid) -> &[Uuid] {
        self.observations_by_set
            .get(set_uuid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn index_set(&mut self, set: &ObservationSetRecord) {
        if let Some(encounter_id) = &set.encounter_id {
            self.sets_by_encounter
                .entry(encounter_id.clone())
                .or_default()
                .push(set.uuid);
        }
        if let Some(patient_id) = &set.patient_id {
            self.sets_by_patient
                .entry(patient_id.clone())
                .or_default()
                .push(set.uuid);
        }
    }

    fn unindex_set(&mut self, set: &ObservationSetRecord) {
        let keys = [
            (set.encounter_id.as_ref(), &mut self.sets_by_encounter),
            (set.patient_id.as_ref(), &mut self.sets_by_patient),
        ];
        for (key, index) in keys {
            if let Some(key) = key {
                if let Some(ids) = index.get_mut(key) {
                    ids.retain(|id| *id != set.uuid);
                    if ids.is_empty() {
                        index.remove(key);
                    }
                }
            }
        }
    }

    fn insert_observation(&mut self, observation: ObservationRecord) -> Result<(), StorageError> {
        if self.observations.contains_key(&observation.uuid) {
            return Err(StorageError::DuplicateKey(observation.uuid));
        }
        if !self.observation_sets.contains_key(&observation.observation_set_uuid) {
            return Err(StorageError::MissingRow(observation.observation_set_uuid));
        }
        self.observations_by_set
            .entry(observation.observation_set_uuid)
            .or_default()
            .push(observation.uuid);
        self.observations.insert(observation.uuid, observation);
        Ok(())
    }

    fn insert_metadata(&mut self, metadata: ObservationMetadataRecord) -> Result<(), StorageError> {
        if self.observation_metadata.contains_key(&metadata.uuid) {
            return Err(StorageError::DuplicateKey(metadata.uuid));
        }
        if !self.observations.contains_key(&metadata.observation_uuid) {
            return Err(StorageError::MissingRow(metadata.observation_uuid));
        }
        self.metadata_by_observation
            .insert(metadata.observation_uuid, metadata.uuid);
        self.observation_metadata.insert(metadata.uuid, metadata);
        Ok(())
    }

    /// Insert a set with its children. Keys are checked up front so a
    /// rejected insert leaves the tables untouched.
    fn insert_set(
        &mut self,
        set: ObservationSetRecord,
        observations: Vec<ObservationRecord>,
        metadata: Vec<ObservationMetadataRecord>,
    ) -> Result<(), StorageError> {
        if self.observation_sets.contains_key(&set.uuid) {
            return Err(StorageError::DuplicateKey(set.uuid));
        }
        if let Some(dup) = observations
            .iter()
            .map(|o| o.uuid)
            .chain(metadata.iter().map(|m| m.uuid))
            .find(|id| self.observations.contains_key(id) || self.observation_metadata.contains_key(id))
        {
            return Err(StorageError::DuplicateKey(dup));
        }
        let set_uuid = set.uuid;
        self.index_set(&set);
        self.observation_sets.insert(set_uuid, set);

        let children = observations
            .into_iter()
            .try_for_each(|o| self.insert_observation(o))
            .and_then(|_| metadata.into_iter().try_for_each(|m| self.insert_metadata(m)));
        if let Err(e) = children {
            self.remove_set(&set_uuid);
            return Err(e);
        }
        Ok(())
    }

    fn remove_set(&mut self, set_uuid: &Uuid) {
        let Some(set) = self.observation_sets.remove(set_uuid) else {
            return;
        };
        self.unindex_set(&set);
        for id in self.observations_by_set.remove(set_uuid).unwrap_or_default() {
            self.observations.remove(&id);
            if let Some(meta) = self.metadata_by_observation.remove(&id) {
                self.observation_metadata.remove(&meta);
            }
        }
    }

    /// Replace a stored set, returning the previous row. Identity columns are
    /// never patched, so the indexes stay valid.
    fn replace_set(&mut self, set: ObservationSetRecord) -> Option<ObservationSetRecord> {
        match self.observation_sets.get_mut(&set.uuid) {
            Some(existing) => Some(std::mem::replace(existing, set)),
            None => {
                self.index_set(&set);
                self.observation_sets.insert(set.uuid, set);
                None
            }
        }
    }

    fn replace_observation(&mut self, observation: ObservationRecord) -> Option<ObservationRecord> {
        self.observations
            .get_mut(&observation.uuid)
            .map(|existing| std::mem::replace(existing, observation))
    }

    fn load(&self, set_uuid: &Uuid) -> Option<LoadedObservationSet> {
        let set = self.observation_sets.get(set_uuid)?;
        let observations = self
            .observation_ids_for(set_uuid)
            .iter()
            .filter_map(|id| self.observations.get(id))
            .map(|observation| LoadedObservation {
                observation: observation.clone(),
                metadata: self
                    .metadata_by_observation
                    .get(&observation.uuid)
                    .and_then(|m| self.observation_metadata.get(m))
                    .cloned(),
            })
            .collect();
        Some(LoadedObservationSet {
            set: set.clone(),
            observations,
        })
    }

    fn sets_in<'a>(&'a self, ids: &'a [Uuid]) -> impl Iterator<Item = &'a ObservationSetRecord> + 'a {
        ids.iter().filter_map(move |id| self.observation_sets.get(id))
    }

    fn matching(&self, filter: &SetFilter) -> Vec<&ObservationSetRecord> {
        match filter {
            SetFilter::ById(id) => self.observation_sets.get(id).into_iter().collect(),
            SetFilter::Encounters(encounter_ids) => encounter_ids
                .iter()
                .filter_map(|e| self.sets_by_encounter.get(e))
                .flat_map(|ids| self.sets_in(ids))
                .collect(),
            SetFilter::Patient(patient_id) => self
                .sets_by_patient
                .get(patient_id)
                .map(|ids| self.sets_in(ids).collect())
                .unwrap_or_default(),
            SetFilter::LocationsBetween {
                locations,
                after,
                until,
            } => self
                .observation_sets
                .values()
                .filter(|s| {
                    s.location.as_ref().is_some_and(|l| locations.contains(l))
                        && s.record_time > *after
                        && s.record_time <= *until
                })
                .collect(),
            SetFilter::ModifiedAfter(cutoff) => self
                .observation_sets
                .values()
                .filter(|s| s.audit.modified > *cutoff)
                .collect(),
        }
    }

    fn select(&self, query: &SetQuery) -> Vec<&ObservationSetRecord> {
        let mut sets = self.matching(&query.filter);
        // The same encounter id listed twice must not duplicate rows.
        sets.sort_by_key(|s| s.uuid);
        sets.dedup_by_key(|s| s.uuid);
        match query.order {
            SetOrder::RecordTimeDesc => {
                sets.sort_by(|a, b| b.record_time.cmp(&a.record_time).then(b.uuid.cmp(&a.uuid)))
            }
            SetOrder::ModifiedDesc => sets.sort_by(|a, b| {
                b.audit
                    .modified
                    .cmp(&a.audit.modified)
                    .then(b.uuid.cmp(&a.uuid))
            }),
        }
        if let Some(limit) = query.limit {
            sets.truncate(limit);
        }
        sets
    }

    fn apply(&mut self, entry: WalEntry) -> Result<(), StorageError> {
        match entry {
            WalEntry::InsertObservationSet {
                set,
                observations,
                metadata,
            } => self.insert_set(set, observations, metadata),
            WalEntry::UpsertObservationSet { set } => {
                self.replace_set(set);
                Ok(())
            }
            WalEntry::UpsertObservation { observation } => {
                let uuid = observation.uuid;
                self.replace_observation(observation)
                    .map(|_| ())
                    .ok_or(StorageError::MissingRow(uuid))
            }
            WalEntry::DeleteAll => {
                *self = Tables::default();
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub struct StorageEngine {
    tables: RwLock<Tables>,
    rollup: RwLock<Vec<AggregateObservationSets>>,
    persistence: Option<PersistenceManager>,
    flushing: Mutex<()>,
    statements: AtomicUsize,
}

impl StorageEngine {
    /// Open the store described by `config`, restoring the last snapshot and
    /// replaying the write-ahead log when persistence is enabled.
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        if !config.storage.persist {
            return Ok(StorageEngine::in_memory());
        }

        let persistence = PersistenceManager::new(&config.storage.path)?;
        let (mut tables, covered) = match persistence.load_snapshot()? {
            Some(snapshot) => {
                let covered = snapshot.wal_sequence;
                (Tables::from_snapshot(snapshot)?, covered)
            }
            None => (Tables::default(), 0),
        };

        // A crash between snapshot and truncate leaves covered batches behind.
        let batches = persistence.replay_wal(covered)?;
        let replayed = batches.len();
        for entry in batches.into_iter().flat_map(|b| b.entries) {
            tables.apply(entry)?;
        }

        info!(
            path = %config.storage.path,
            sets = tables.observation_sets.len(),
            replayed,
            "observation store opened"
        );

        Ok(StorageEngine {
            tables: RwLock::new(tables),
            rollup: RwLock::new(Vec::new()),
            persistence: Some(persistence),
            flushing: Mutex::new(()),
            statements: AtomicUsize::new(0),
        })
    }

    pub fn in_memory() -> Self {
        StorageEngine {
            tables: RwLock::new(Tables::default()),
            rollup: RwLock::new(Vec::new()),
            persistence: None,
            flushing: Mutex::new(()),
            statements: AtomicUsize::new(0),
        }
    }

    /// Statements executed since the engine was opened.
    pub fn statement_count(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    fn statement(&self) {
        self.statements.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.statement();
        self.tables.read().map_err(|_| StorageError::LockPoisoned)
    }

    /// Start a write transaction. Writers are serialised; readers see only
    /// committed state.
    pub fn begin(&self) -> Result<Transaction<'_>, StorageError> {
        let tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(Transaction {
            engine: self,
            tables,
            undo: Vec::new(),
            pending: Vec::new(),
            finished: false,
        })
    }

    pub fn select_sets(&self, query: &SetQuery) -> Result<Vec<LoadedObservationSet>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .select(query)
            .into_iter()
            .filter_map(|s| tables.load(&s.uuid))
            .collect())
    }

    pub fn select_set_ids(&self, query: &SetQuery) -> Result<Vec<Uuid>, StorageError> {
        let tables = self.read()?;
        Ok(tables.select(query).into_iter().map(|s| s.uuid).collect())
    }

    /// The most recent set of each encounter, found with a per-encounter max
    /// over `record_time` in a single pass.
    pub fn select_latest_per_encounter(
        &self,
        encounter_ids: &[String],
    ) -> Result<BTreeMap<String, LoadedObservationSet>, StorageError> {
        let tables = self.read()?;
        let mut latest = BTreeMap::new();
        for encounter_id in encounter_ids {
            let newest = tables
                .sets_by_encounter
                .get(encounter_id)
                .into_iter()
                .flat_map(|ids| tables.sets_in(ids))
                .max_by(|a, b| a.record_time.cmp(&b.record_time).then(a.uuid.cmp(&b.uuid)));
            if let Some(loaded) = newest.and_then(|s| tables.load(&s.uuid)) {
                latest.insert(encounter_id.clone(), loaded);
            }
        }
        Ok(latest)
    }

    /// Grouped count of sets per encounter; unknown encounters count 0.
    pub fn count_sets_by_encounter(
        &self,
        encounter_ids: &[String],
    ) -> Result<BTreeMap<String, usize>, StorageError> {
        let tables = self.read()?;
        Ok(encounter_ids
            .iter()
            .map(|e| {
                let count = tables.sets_by_encounter.get(e).map_or(0, Vec::len);
                (e.clone(), count)
            })
            .collect())
    }

    /// Rebuild the aggregate rollup from the current tables. Returns the
    /// number of rollup rows.
    pub fn refresh_rollup(&self) -> Result<usize, StorageError> {
        let rows = {
            let tables = self.read()?;
            rollup::build(&tables)
        };
        let count = rows.len();
        *self.rollup.write().map_err(|_| StorageError::LockPoisoned)? = rows;
        debug!(rows = count, "aggregate rollup rebuilt");
        Ok(count)
    }

    pub fn select_rollup(&self, query: &RollupQuery) -> Result<Vec<AggregateObservationSets>, StorageError> {
        self.statement();
        let rows = self.rollup.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(rows.iter().filter(|row| query.matches(row)).cloned().collect())
    }

    /// Write a snapshot of every table and truncate the write-ahead log.
    pub fn flush_all(&self) -> Result<(), StorageError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        // One flush at a time; they share the snapshot's temporary file.
        let _flushing = self.flushing.lock().map_err(|_| StorageError::LockPoisoned)?;
        // Holding the read lock keeps commits out between snapshot and truncate.
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut snapshot = tables.to_snapshot();
        snapshot.wal_sequence = persistence.last_sequence()?;
        persistence.save_snapshot(&snapshot)?;
        persistence.truncate_wal()
    }
}

#[derive(Debug)]
enum Undo {
    InsertedSet(Uuid),
    UpdatedSet(Box<ObservationSetRecord>),
    UpdatedObservation(Box<ObservationRecord>),
    Cleared(Box<Tables>),
}

/// A write transaction. Changes apply to the tables immediately under the
/// write lock and are undone on `rollback` or drop; `commit` makes them
/// durable.
pub struct Transaction<'a> {
    engine: &'a StorageEngine,
    tables: RwLockWriteGuard<'a, Tables>,
    undo: Vec<Undo>,
    pending: Vec<WalEntry>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    /// Insert a set, its observations and their metadata in one statement.
    pub fn bulk_insert(
        &mut self,
        set: ObservationSetRecord,
        observations: Vec<ObservationRecord>,
        metadata: Vec<ObservationMetadataRecord>,
    ) -> Result<(), StorageError> {
        self.engine.statement();
        let uuid = set.uuid;
        let entry = WalEntry::InsertObservationSet {
            set: set.clone(),
            observations: observations.clone(),
            metadata: metadata.clone(),
        };
        self.tables.insert_set(set, observations, metadata)?;
        self.undo.push(Undo::InsertedSet(uuid));
        self.pending.push(entry);
        Ok(())
    }

    pub fn load_set(&mut self, set_uuid: &Uuid) -> Result<Option<LoadedObservationSet>, StorageError> {
        self.engine.statement();
        Ok(self.tables.load(set_uuid))
    }

    pub fn update_set(&mut self, set: ObservationSetRecord) -> Result<(), StorageError> {
        self.engine.statement();
        if !self.tables.observation_sets.contains_key(&set.uuid) {
            return Err(StorageError::MissingRow(set.uuid));
        }
        self.write_set(set);
        Ok(())
    }

    pub fn update_observation(&mut self, observation: ObservationRecord) -> Result<(), StorageError> {
        self.engine.statement();
        let uuid = observation.uuid;
        let previous = self
            .tables
            .replace_observation(observation.clone())
            .ok_or(StorageError::MissingRow(uuid))?;
        self.undo.push(Undo::UpdatedObservation(Box::new(previous)));
        self.pending.push(WalEntry::UpsertObservation { observation });
        Ok(())
    }

    /// Every set of an encounter, unordered.
    pub fn encounter_sets(&mut self, encounter_id: &str) -> Result<Vec<ObservationSetRecord>, StorageError> {
        self.engine.statement();
        let tables = &*self.tables;
        Ok(tables
            .sets_by_encounter
            .get(encounter_id)
            .map(|ids| tables.sets_in(ids).cloned().collect())
            .unwrap_or_default())
    }

    /// Write `mins_late` values in one statement, touching only rows whose
    /// value changes. Returns the number of rows written.
    pub fn update_mins_late(&mut self, values: &[(Uuid, i64)]) -> Result<usize, StorageError> {
        self.engine.statement();
        let mut changed = Vec::new();
        for (uuid, mins_late) in values {
            let set = self
                .tables
                .observation_sets
                .get(uuid)
                .ok_or(StorageError::MissingRow(*uuid))?;
            if set.mins_late != Some(*mins_late) {
                let mut updated = set.clone();
                updated.mins_late = Some(*mins_late);
                changed.push(updated);
            }
        }
        let written = changed.len();
        for set in changed {
            self.write_set(set);
        }
        Ok(written)
    }

    /// Delete every set, observation and metadata row.
    pub fn delete_all(&mut self) -> Result<(), StorageError> {
        self.engine.statement();
        let previous = std::mem::take(&mut *self.tables);
        self.undo.push(Undo::Cleared(Box::new(previous)));
        self.pending.push(WalEntry::DeleteAll);
        Ok(())
    }

    fn write_set(&mut self, set: ObservationSetRecord) {
        self.pending.push(WalEntry::UpsertObservationSet { set: set.clone() });
        if let Some(previous) = self.tables.replace_set(set) {
            self.undo.push(Undo::UpdatedSet(Box::new(previous)));
        }
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        let engine = self.engine;
        if let (Some(persistence), false) = (&engine.persistence, self.pending.is_empty()) {
            if let Err(e) = persistence.append_batch(&self.pending) {
                warn!(error = %e, "WAL append failed, rolling back");
                self.undo_all();
                return Err(e);
            }
        }
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.undo_all();
    }

    fn undo_all(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::InsertedSet(uuid) => self.tables.remove_set(&uuid),
                Undo::UpdatedSet(previous) => {
                    self.tables.replace_set(*previous);
                }
                Undo::UpdatedObservation(previous) => {
                    self.tables.replace_observation(*previous);
                }
                Undo::Cleared(previous) => *self.tables = *previous,
            }
        }
        self.pending.clear();
        self.finished = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_all();
        }
    }
}
