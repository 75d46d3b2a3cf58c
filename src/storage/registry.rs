#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, trace, warn};

use crate::types::{KernelError, RelTypeId, Result, TxId};

/// Application-level handle for a relationship type.
pub trait RelationshipType: Send + Sync {
    /// Name the type is registered under.
    fn name(&self) -> &str;
}

/// A relationship type as persisted: id and name with no application handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRelTypeData {
    /// Registered id.
    pub id: RelTypeId,
    /// Registered name.
    pub name: String,
}

impl RawRelTypeData {
    /// Creates raw type data.
    pub fn new(id: RelTypeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Handle used for types loaded from disk before the application binds its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedRelationshipType(String);

impl NamedRelationshipType {
    /// Wraps `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl RelationshipType for NamedRelationshipType {
    fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Committed,
    PendingCreate(TxId),
    PendingDelete(TxId),
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    id: RelTypeId,
    state: EntryState,
}

impl Entry {
    fn is_committed(&self) -> bool {
        matches!(self.state, EntryState::Committed | EntryState::PendingDelete(_))
    }
}

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, Entry>,
    by_id: HashMap<RelTypeId, String>,
    handles: HashMap<String, Arc<dyn RelationshipType>>,
}

/// Name to id to handle mapping for relationship types.
///
/// Entries created by an open transaction stay pending, visible only to that
/// transaction, until it commits. Deletions keep the entry visible to
/// everyone else until they commit.
#[derive(Default)]
pub struct RelTypeRegistry {
    state: RwLock<RegistryState>,
    creation: ReentrantMutex<()>,
}

impl fmt::Debug for RelTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RelTypeRegistry")
            .field("entries", &state.by_name.len())
            .field("handles", &state.handles.len())
            .finish()
    }
}

impl RelTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialises type creation and deletion. Reentrant on the holding thread.
    pub fn creation_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.creation.lock()
    }

    /// Adds an already committed type loaded from disk.
    pub fn add_raw(&self, raw: &RawRelTypeData) -> Result<()> {
        let mut state = self.state.write();
        if let Some(existing) = state.by_name.get(&raw.name) {
            if existing.id == raw.id {
                return Ok(());
            }
            return Err(KernelError::Corruption("relationship type name stored twice"));
        }
        if state.by_id.contains_key(&raw.id) {
            return Err(KernelError::Corruption("relationship type id stored twice"));
        }
        state.by_name.insert(
            raw.name.clone(),
            Entry {
                id: raw.id,
                state: EntryState::Committed,
            },
        );
        state.by_id.insert(raw.id, raw.name.clone());
        state
            .handles
            .entry(raw.name.clone())
            .or_insert_with(|| Arc::new(NamedRelationshipType::new(raw.name.clone())));
        trace!(id = %raw.id, name = %raw.name, "registry.add_raw");
        Ok(())
    }

    /// Id of `name` as seen by `tx`.
    ///
    /// Committed entries are visible to everyone, pending ones only to the
    /// transaction that created them. A name pending in another transaction is
    /// a [`KernelError::Conflict`].
    pub fn visible_id(&self, name: &str, tx: Option<TxId>) -> Result<Option<RelTypeId>> {
        let state = self.state.read();
        let Some(entry) = state.by_name.get(name) else {
            return Ok(None);
        };
        match entry.state {
            EntryState::Committed => Ok(Some(entry.id)),
            EntryState::PendingCreate(owner) if Some(owner) == tx => Ok(Some(entry.id)),
            EntryState::PendingCreate(owner) => Err(KernelError::Conflict(format!(
                "relationship type '{name}' is being created by {owner}"
            ))),
            EntryState::PendingDelete(owner) if Some(owner) == tx => Ok(None),
            EntryState::PendingDelete(_) => Ok(Some(entry.id)),
        }
    }

    /// Whether a delete of `name` by another transaction is pending.
    pub(crate) fn deleting_tx(&self, name: &str) -> Option<TxId> {
        match self.state.read().by_name.get(name).map(|e| e.state) {
            Some(EntryState::PendingDelete(owner)) => Some(owner),
            _ => None,
        }
    }

    pub(crate) fn insert_pending(&self, id: RelTypeId, name: &str, tx: TxId) -> Result<()> {
        let mut state = self.state.write();
        if state.by_name.contains_key(name) {
            return Err(KernelError::Invalid("relationship type name already registered"));
        }
        if state.by_id.contains_key(&id) {
            return Err(KernelError::Invalid("relationship type id already registered"));
        }
        state.by_name.insert(
            name.to_owned(),
            Entry {
                id,
                state: EntryState::PendingCreate(tx),
            },
        );
        state.by_id.insert(id, name.to_owned());
        debug!(%id, name, %tx, "registry.insert_pending");
        Ok(())
    }

    pub(crate) fn remove_pending(&self, id: RelTypeId, name: &str) {
        let mut state = self.state.write();
        let matches = matches!(
            state.by_name.get(name),
            Some(Entry { id: existing, state: EntryState::PendingCreate(_) }) if *existing == id
        );
        if !matches {
            return;
        }
        state.by_name.remove(name);
        state.by_id.remove(&id);
        debug!(%id, name, "registry.remove_pending");
    }

    pub(crate) fn commit_create(&self, id: RelTypeId, name: &str) {
        let mut state = self.state.write();
        match state.by_name.get_mut(name) {
            Some(entry) if entry.id == id => entry.state = EntryState::Committed,
            _ => warn!(%id, name, "registry.commit_create.missing"),
        }
    }

    pub(crate) fn mark_delete(&self, id: RelTypeId, name: &str, tx: TxId) -> Result<()> {
        let mut state = self.state.write();
        match state.by_name.get_mut(name) {
            Some(entry) if entry.id == id && entry.state == EntryState::Committed => {
                entry.state = EntryState::PendingDelete(tx);
                debug!(%id, name, %tx, "registry.mark_delete");
                Ok(())
            }
            Some(_) => Err(KernelError::Invalid("relationship type is not committed")),
            None => Err(KernelError::Invalid("unknown relationship type")),
        }
    }

    pub(crate) fn revert_delete(&self, id: RelTypeId, name: &str) {
        let mut state = self.state.write();
        if let Some(entry) = state.by_name.get_mut(name) {
            if entry.id == id && matches!(entry.state, EntryState::PendingDelete(_)) {
                entry.state = EntryState::Committed;
            }
        }
    }

    pub(crate) fn commit_delete(&self, id: RelTypeId, name: &str) {
        let mut state = self.state.write();
        let owned = matches!(state.by_name.get(name), Some(entry) if entry.id == id);
        if !owned {
            warn!(%id, name, "registry.commit_delete.missing");
            return;
        }
        state.by_name.remove(name);
        state.by_id.remove(&id);
        state.handles.remove(name);
        debug!(%id, name, "registry.commit_delete");
    }

    /// Associates an application handle with its name.
    pub fn bind_handle(&self, handle: Arc<dyn RelationshipType>) {
        let name = handle.name().to_owned();
        self.state.write().handles.insert(name, handle);
    }

    /// Committed id of `name`.
    pub fn id_for_name(&self, name: &str) -> Option<RelTypeId> {
        self.state
            .read()
            .by_name
            .get(name)
            .filter(|entry| entry.is_committed())
            .map(|entry| entry.id)
    }

    /// Handle of the committed type `id`.
    pub fn handle(&self, id: RelTypeId) -> Option<Arc<dyn RelationshipType>> {
        let state = self.state.read();
        let name = state.by_id.get(&id)?;
        if !state.by_name.get(name)?.is_committed() {
            return None;
        }
        state.handles.get(name).cloned()
    }

    /// Whether `name` is registered and committed.
    pub fn is_valid(&self, name: &str) -> bool {
        self.id_for_name(name).is_some()
    }

    /// Committed types ordered by id.
    pub fn names(&self) -> Vec<RawRelTypeData> {
        let state = self.state.read();
        let mut out: Vec<RawRelTypeData> = state
            .by_name
            .iter()
            .filter(|(_, entry)| entry.is_committed())
            .map(|(name, entry)| RawRelTypeData::new(entry.id, name.clone()))
            .collect();
        out.sort_by_key(|raw| raw.id);
        out
    }

    /// Highest committed or pending id, if any.
    pub fn max_id(&self) -> Option<RelTypeId> {
        self.state.read().by_id.keys().max().copied()
    }
}
