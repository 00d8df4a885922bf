use crate::config::{DatabaseConfig, IsolationLevel};
use crate::error::StoreError;
use crate::store::{StoreClient, StoreEngine, StoredPayload};
use crate::structure::{IndexEntry, Structure, StructureId, StructureSchema, UniqueEntry};
use im::{HashMap as ImHashMap, OrdMap};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

type ClientId = u64;
type RowKey = (String, StructureId);
type UniqueKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub lock_timeout: Duration,
    pub isolation_level: IsolationLevel,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            isolation_level: IsolationLevel::ReadCommitted,
        }
    }
}

impl From<&DatabaseConfig> for EngineOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout,
            isolation_level: config.isolation_level,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    payload: Arc<str>,
    indexes: Arc<Vec<IndexEntry>>,
    uniques: Arc<Vec<UniqueEntry>>,
}

impl StoredRow {
    fn has_unique(&self, key: &UniqueKey) -> bool {
        self.uniques
            .iter()
            .any(|u| u.member == key.0 && u.value == key.1)
    }
}

impl From<Structure> for StoredRow {
    fn from(structure: Structure) -> Self {
        Self {
            payload: structure.payload,
            indexes: Arc::new(structure.indexes),
            uniques: Arc::new(structure.uniques),
        }
    }
}

fn unique_key(entry: &UniqueEntry) -> UniqueKey {
    (entry.member.clone(), entry.value.clone())
}

fn id_taken(schema: &StructureSchema, id: &StructureId) -> StoreError {
    StoreError::UniqueViolation {
        structure: schema.name().to_string(),
        member: schema.id_member().to_string(),
        value: id.to_string(),
    }
}

#[derive(Debug, Clone)]
struct StructureSet {
    schema: Arc<StructureSchema>,
    rows: OrdMap<StructureId, StoredRow>,
    uniques: ImHashMap<UniqueKey, StructureId>,
}

impl StructureSet {
    fn new(schema: Arc<StructureSchema>) -> Self {
        Self {
            schema,
            rows: OrdMap::new(),
            uniques: ImHashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    sets: ImHashMap<String, StructureSet>,
    identity_seeds: HashMap<String, i64>,
    row_locks: HashMap<RowKey, ClientId>,
    next_client_id: ClientId,
}

#[derive(Debug)]
struct EngineShared {
    state: Mutex<EngineState>,
    lock_released: Condvar,
    options: EngineOptions,
}

/// Reference store engine. Committed state lives in persistent maps so a
/// commit can be staged on a cheap copy and swapped in only when every
/// change applies cleanly.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl MemoryEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::default()),
                lock_released: Condvar::new(),
                options,
            }),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(EngineOptions::from(config))
    }

    pub fn options(&self) -> EngineOptions {
        self.shared.options
    }

    pub fn has_structure_set(&self, name: &str) -> bool {
        self.shared.state.lock().sets.contains_key(name)
    }

    pub fn committed_count(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .sets
            .get(name)
            .map_or(0, |set| set.rows.len())
    }

    pub fn committed_payload(&self, name: &str, id: &StructureId) -> Option<Arc<str>> {
        let state = self.shared.state.lock();
        let set = state.sets.get(name)?;
        set.rows.get(id).map(|row| Arc::clone(&row.payload))
    }

    pub fn committed_index_rows(&self, name: &str, id: &StructureId) -> Vec<IndexEntry> {
        let state = self.shared.state.lock();
        state
            .sets
            .get(name)
            .and_then(|set| set.rows.get(id))
            .map(|row| row.indexes.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn held_row_locks(&self) -> usize {
        self.shared.state.lock().row_locks.len()
    }

    fn client(&self, transactional: bool) -> MemoryClient {
        let id = {
            let mut state = self.shared.state.lock();
            state.next_client_id += 1;
            state.next_client_id
        };
        MemoryClient {
            shared: Arc::clone(&self.shared),
            id,
            transactional,
            overlay: Overlay::default(),
            failed: false,
            finished: false,
        }
    }
}

impl StoreEngine for MemoryEngine {
    fn transactional_client(&self) -> Result<Box<dyn StoreClient>, StoreError> {
        Ok(Box::new(self.client(true)))
    }

    fn non_transactional_client(&self) -> Result<Box<dyn StoreClient>, StoreError> {
        Ok(Box::new(self.client(false)))
    }
}

#[derive(Debug, Default)]
struct PendingSet {
    schema: Option<Arc<StructureSchema>>,
    cleared: bool,
    /// `None` masks a committed row as deleted.
    rows: BTreeMap<StructureId, Option<StoredRow>>,
    /// Ids inserted without deleting a committed row first. Commit rejects
    /// them if a committed row with the same id exists by then.
    inserted: HashSet<StructureId>,
}

#[derive(Debug, Default)]
struct Overlay {
    dropped: HashSet<String>,
    sets: HashMap<String, PendingSet>,
}

struct MemoryClient {
    shared: Arc<EngineShared>,
    id: ClientId,
    transactional: bool,
    overlay: Overlay,
    failed: bool,
    finished: bool,
}

impl MemoryClient {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Transaction(
                "store client has already completed its transaction".into(),
            ));
        }
        Ok(())
    }

    fn set_visible(&self, state: &EngineState, name: &str) -> bool {
        if self
            .overlay
            .sets
            .get(name)
            .is_some_and(|pending| pending.schema.is_some())
        {
            return true;
        }
        !self.overlay.dropped.contains(name) && state.sets.contains_key(name)
    }

    fn require_set(&self, state: &EngineState, name: &str) -> Result<(), StoreError> {
        if self.set_visible(state, name) {
            Ok(())
        } else {
            Err(StoreError::StructureSetNotFound(name.to_string()))
        }
    }

    /// Committed rows that still show through this client's overlay.
    fn committed_base<'s>(&self, state: &'s EngineState, name: &str) -> Option<&'s StructureSet> {
        if self.overlay.dropped.contains(name)
            || self
                .overlay
                .sets
                .get(name)
                .is_some_and(|pending| pending.cleared)
        {
            return None;
        }
        state.sets.get(name)
    }

    fn visible_row(&self, state: &EngineState, name: &str, id: &StructureId) -> Option<StoredRow> {
        if let Some(entry) = self
            .overlay
            .sets
            .get(name)
            .and_then(|pending| pending.rows.get(id))
        {
            return entry.clone();
        }
        self.committed_base(state, name)?.rows.get(id).cloned()
    }

    fn visible_rows(
        &self,
        state: &EngineState,
        name: &str,
        lower: Bound<&StructureId>,
        upper: Bound<&StructureId>,
        limit: usize,
    ) -> Vec<(StructureId, StoredRow)> {
        let bounds = (lower.cloned(), upper.cloned());
        let mut committed = self
            .committed_base(state, name)
            .into_iter()
            .flat_map(|set| set.rows.range(bounds.clone()))
            .peekable();
        let mut pending = self
            .overlay
            .sets
            .get(name)
            .into_iter()
            .flat_map(|p| p.rows.range(bounds.clone()))
            .peekable();

        let mut out = Vec::new();
        while out.len() < limit {
            let order = match (committed.peek(), pending.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((committed_id, _)), Some((pending_id, _))) => committed_id.cmp(pending_id),
            };
            match order {
                Ordering::Less => {
                    if let Some((id, row)) = committed.next() {
                        out.push((id.clone(), row.clone()));
                    }
                }
                Ordering::Equal | Ordering::Greater => {
                    if order == Ordering::Equal {
                        committed.next();
                    }
                    if let Some((id, Some(row))) = pending.next() {
                        out.push((id.clone(), row.clone()));
                    }
                }
            }
        }
        out
    }

    fn visible_unique_owner(
        &self,
        state: &EngineState,
        name: &str,
        key: &UniqueKey,
    ) -> Option<StructureId> {
        if let Some(pending) = self.overlay.sets.get(name) {
            let owner = pending.rows.iter().find_map(|(id, row)| match row {
                Some(row) if row.has_unique(key) => Some(id.clone()),
                _ => None,
            });
            if owner.is_some() {
                return owner;
            }
        }
        let owner = self.committed_base(state, name)?.uniques.get(key)?;
        self.visible_row(state, name, owner)
            .filter(|row| row.has_unique(key))
            .map(|_| owner.clone())
    }

    fn lock_row(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        name: &str,
        id: &StructureId,
    ) -> Result<(), StoreError> {
        let key = (name.to_string(), id.clone());
        let deadline = Instant::now() + self.shared.options.lock_timeout;
        loop {
            let owner = state.row_locks.get(&key).copied();
            match owner {
                None => {
                    state.row_locks.insert(key, self.id);
                    return Ok(());
                }
                Some(owner) if owner == self.id => return Ok(()),
                Some(_) if Instant::now() >= deadline => {
                    return Err(StoreError::LockTimeout {
                        structure: name.to_string(),
                        id: id.clone(),
                    });
                }
                Some(_) => {
                    self.shared.lock_released.wait_until(state, deadline);
                }
            }
        }
    }

    fn release_locks(&self, state: &mut EngineState) {
        let before = state.row_locks.len();
        state.row_locks.retain(|_, owner| *owner != self.id);
        if state.row_locks.len() != before {
            self.shared.lock_released.notify_all();
        }
    }

    fn pending_mut(&mut self, name: &str) -> &mut PendingSet {
        self.overlay.sets.entry(name.to_string()).or_default()
    }

    /// Runs a write against the overlay. Non-transactional clients apply
    /// the overlay right away and drop their locks.
    fn write<F>(&mut self, op: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Self, &mut MutexGuard<'_, EngineState>) -> Result<(), StoreError>,
    {
        self.check_open()?;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        let result = op(self, &mut state);
        if self.transactional {
            return result;
        }
        let result = result.and_then(|()| self.apply_overlay(&mut state));
        self.overlay = Overlay::default();
        self.release_locks(&mut state);
        result
    }

    fn delete_ids(
        &mut self,
        state: &mut MutexGuard<'_, EngineState>,
        name: &str,
        ids: &[StructureId],
    ) -> Result<(), StoreError> {
        if !self.set_visible(state, name) {
            return Ok(());
        }
        for id in ids {
            if self.visible_row(state, name, id).is_none() {
                continue;
            }
            self.lock_row(state, name, id)?;
            let pending = self.pending_mut(name);
            pending.inserted.remove(id);
            pending.rows.insert(id.clone(), None);
        }
        Ok(())
    }

    fn apply_overlay(&mut self, state: &mut EngineState) -> Result<(), StoreError> {
        let overlay = std::mem::take(&mut self.overlay);
        let mut sets = state.sets.clone();
        let mut max_identities: HashMap<String, i64> = HashMap::new();

        for name in &overlay.dropped {
            sets.remove(name);
        }

        for (name, pending) in overlay.sets {
            let mut set = match (sets.get(&name), pending.schema) {
                (Some(existing), Some(schema)) => {
                    let mut set = existing.clone();
                    set.schema = schema;
                    set
                }
                (Some(existing), None) => existing.clone(),
                (None, Some(schema)) => StructureSet::new(schema),
                (None, None) => return Err(StoreError::StructureSetNotFound(name)),
            };
            if pending.cleared {
                set.rows = OrdMap::new();
                set.uniques = ImHashMap::new();
            }
            if let Some(id) = pending.inserted.iter().find(|id| set.rows.contains_key(*id)) {
                return Err(StoreError::UniqueViolation {
                    structure: name,
                    member: set.schema.id_member().to_string(),
                    value: id.to_string(),
                });
            }

            for id in pending.rows.keys() {
                if let Some(old) = set.rows.remove(id) {
                    for entry in old.uniques.iter() {
                        let key = unique_key(entry);
                        if set.uniques.get(&key) == Some(id) {
                            set.uniques.remove(&key);
                        }
                    }
                }
            }

            for (id, row) in pending.rows {
                let Some(row) = row else {
                    continue;
                };
                for entry in row.uniques.iter() {
                    let key = unique_key(entry);
                    if set.uniques.get(&key).is_some_and(|owner| *owner != id) {
                        return Err(StoreError::UniqueViolation {
                            structure: name.clone(),
                            member: entry.member.clone(),
                            value: entry.value.clone(),
                        });
                    }
                    set.uniques.insert(key, id.clone());
                }
                if let Some(value) = id.as_identity() {
                    let max = max_identities.entry(name.clone()).or_insert(value);
                    *max = (*max).max(value);
                }
                set.rows.insert(id, row);
            }
            sets.insert(name, set);
        }

        state.sets = sets;
        for name in &overlay.dropped {
            if !state.sets.contains_key(name) {
                state.identity_seeds.remove(name);
            }
        }
        for (name, max) in max_identities {
            let seed = state.identity_seeds.entry(name).or_insert(0);
            *seed = (*seed).max(max);
        }
        Ok(())
    }
}

impl StoreClient for MemoryClient {
    fn is_transactional(&self) -> bool {
        self.transactional
    }

    fn upsert_structure_set(&mut self, schema: &StructureSchema) -> Result<(), StoreError> {
        let schema = Arc::new(schema.clone());
        self.write(|this, _state| {
            let recreated = this.overlay.dropped.contains(schema.name());
            let pending = this.pending_mut(schema.name());
            if recreated {
                pending.cleared = true;
            }
            pending.schema = Some(schema);
            Ok(())
        })
    }

    fn drop_structure_set(&mut self, name: &str) -> Result<(), StoreError> {
        self.write(|this, _state| {
            this.overlay.sets.remove(name);
            this.overlay.dropped.insert(name.to_string());
            Ok(())
        })
    }

    fn structure_set_exists(&mut self, name: &str) -> Result<bool, StoreError> {
        self.check_open()?;
        let state = self.shared.state.lock();
        Ok(self.set_visible(&state, name))
    }

    fn next_identity(&mut self, schema: &StructureSchema, count: u64) -> Result<i64, StoreError> {
        self.check_open()?;
        if !schema.id_is_sequential() {
            return Err(StoreError::UnsupportedByStore {
                structure: schema.name().to_string(),
                operation: "next_identity",
            });
        }
        let count = i64::try_from(count)
            .map_err(|_| StoreError::Validation("identity block too large".into()))?;
        let mut state = self.shared.state.lock();
        let committed_max = state
            .sets
            .get(schema.name())
            .and_then(|set| set.rows.get_max())
            .and_then(|(id, _)| id.as_identity())
            .unwrap_or(0);
        let seed = state
            .identity_seeds
            .entry(schema.name().to_string())
            .or_insert(0);
        *seed = (*seed).max(committed_max);
        let first = *seed + 1;
        *seed += count;
        Ok(first)
    }

    fn get_payload_by_id(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<Option<Arc<str>>, StoreError> {
        if self.transactional
            && self.shared.options.isolation_level == IsolationLevel::RepeatableRead
        {
            return self.get_payload_by_id_with_lock(schema, id);
        }
        self.check_open()?;
        let state = self.shared.state.lock();
        Ok(self
            .visible_row(&state, schema.name(), id)
            .map(|row| row.payload))
    }

    fn get_payload_by_id_with_lock(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<Option<Arc<str>>, StoreError> {
        self.check_open()?;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        self.lock_row(&mut state, schema.name(), id)?;
        let row = self.visible_row(&state, schema.name(), id);
        if !self.transactional {
            self.release_locks(&mut state);
        }
        Ok(row.map(|row| row.payload))
    }

    fn get_payloads_by_ids(
        &mut self,
        schema: &StructureSchema,
        ids: &[StructureId],
    ) -> Result<Vec<StoredPayload>, StoreError> {
        self.check_open()?;
        let state = self.shared.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.visible_row(&state, schema.name(), id)
                    .map(|row| StoredPayload {
                        id: id.clone(),
                        payload: row.payload,
                    })
            })
            .collect())
    }

    fn get_payloads_by_id_interval(
        &mut self,
        schema: &StructureSchema,
        from: &StructureId,
        to: &StructureId,
    ) -> Result<Vec<StoredPayload>, StoreError> {
        self.check_open()?;
        if !schema.id_is_sequential() {
            return Err(StoreError::UnsupportedByStore {
                structure: schema.name().to_string(),
                operation: "get_payloads_by_id_interval",
            });
        }
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.shared.state.lock();
        Ok(self
            .visible_rows(
                &state,
                schema.name(),
                Bound::Included(from),
                Bound::Included(to),
                usize::MAX,
            )
            .into_iter()
            .map(|(id, row)| StoredPayload {
                id,
                payload: row.payload,
            })
            .collect())
    }

    fn read_page(
        &mut self,
        schema: &StructureSchema,
        after: Option<&StructureId>,
        limit: usize,
    ) -> Result<Vec<StoredPayload>, StoreError> {
        self.check_open()?;
        let state = self.shared.state.lock();
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(self
            .visible_rows(&state, schema.name(), lower, Bound::Unbounded, limit)
            .into_iter()
            .map(|(id, row)| StoredPayload {
                id,
                payload: row.payload,
            })
            .collect())
    }

    fn count(&mut self, schema: &StructureSchema) -> Result<u64, StoreError> {
        self.check_open()?;
        let state = self.shared.state.lock();
        let rows = self.visible_rows(
            &state,
            schema.name(),
            Bound::Unbounded,
            Bound::Unbounded,
            usize::MAX,
        );
        Ok(rows.len() as u64)
    }

    fn delete_by_id(
        &mut self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<(), StoreError> {
        self.delete_by_ids(schema, std::slice::from_ref(id))
    }

    fn delete_by_ids(
        &mut self,
        schema: &StructureSchema,
        ids: &[StructureId],
    ) -> Result<(), StoreError> {
        self.write(|this, state| this.delete_ids(state, schema.name(), ids))
    }

    fn delete_where_id_between(
        &mut self,
        schema: &StructureSchema,
        from: &StructureId,
        to: &StructureId,
    ) -> Result<(), StoreError> {
        if !schema.id_is_sequential() {
            return Err(StoreError::UnsupportedByStore {
                structure: schema.name().to_string(),
                operation: "delete_where_id_between",
            });
        }
        if from > to {
            return Ok(());
        }
        self.write(|this, state| {
            let ids: Vec<StructureId> = this
                .visible_rows(
                    state,
                    schema.name(),
                    Bound::Included(from),
                    Bound::Included(to),
                    usize::MAX,
                )
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            this.delete_ids(state, schema.name(), &ids)
        })
    }

    fn delete_all(&mut self, schema: &StructureSchema) -> Result<(), StoreError> {
        self.write(|this, state| {
            let name = schema.name();
            if !this.set_visible(state, name) {
                return Ok(());
            }
            let ids: Vec<StructureId> = this
                .visible_rows(state, name, Bound::Unbounded, Bound::Unbounded, usize::MAX)
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            for id in &ids {
                this.lock_row(state, name, id)?;
            }
            let pending = this.pending_mut(name);
            pending.cleared = true;
            pending.rows.clear();
            pending.inserted.clear();
            Ok(())
        })
    }

    fn bulk_insert(
        &mut self,
        schema: &StructureSchema,
        structures: Vec<Structure>,
    ) -> Result<(), StoreError> {
        self.write(|this, state| {
            let name = schema.name();
            this.require_set(state, name)?;

            let mut batch_ids = HashSet::with_capacity(structures.len());
            for structure in &structures {
                if structure.id.id_type() != schema.id_type() {
                    return Err(StoreError::Validation(format!(
                        "'{name}' expects {:?} ids, got {:?}",
                        schema.id_type(),
                        structure.id.id_type()
                    )));
                }
                if !batch_ids.insert(structure.id.clone()) {
                    return Err(id_taken(schema, &structure.id));
                }
            }

            // Waiting for a lock releases the engine mutex, so existence and
            // unique checks only count once every row lock is held.
            for structure in &structures {
                this.lock_row(state, name, &structure.id)?;
            }

            let mut batch_uniques: HashMap<UniqueKey, StructureId> = HashMap::new();
            for structure in &structures {
                if this.visible_row(state, name, &structure.id).is_some() {
                    return Err(id_taken(schema, &structure.id));
                }
                for entry in &structure.uniques {
                    let key = unique_key(entry);
                    let taken_in_store = this
                        .visible_unique_owner(state, name, &key)
                        .is_some_and(|owner| owner != structure.id);
                    let taken_in_batch = batch_uniques
                        .insert(key, structure.id.clone())
                        .is_some_and(|owner| owner != structure.id);
                    if taken_in_store || taken_in_batch {
                        return Err(StoreError::UniqueViolation {
                            structure: name.to_string(),
                            member: entry.member.clone(),
                            value: entry.value.clone(),
                        });
                    }
                }
            }

            let pending = this.pending_mut(name);
            for structure in structures {
                let id = structure.id.clone();
                if !pending.rows.contains_key(&id) {
                    pending.inserted.insert(id.clone());
                }
                pending.rows.insert(id, Some(StoredRow::from(structure)));
            }
            Ok(())
        })
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        if !self.transactional {
            return Ok(());
        }
        if self.failed {
            self.rollback()?;
            return Err(StoreError::Transaction(
                "cannot commit a failed transaction".into(),
            ));
        }
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        let result = self.apply_overlay(&mut state);
        self.release_locks(&mut state);
        self.finished = true;
        result
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        self.overlay = Overlay::default();
        self.release_locks(&mut state);
        if self.transactional {
            self.finished = true;
        }
        Ok(())
    }

    fn mark_as_failed(&mut self) {
        self.failed = true;
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        self.release_locks(&mut state);
    }
}
