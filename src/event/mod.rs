#![forbid(unsafe_code)]
//! Two-phase event dispatch.
//!
//! Pro-active listeners run after a mutation has been applied but before it is
//! final, and any of them may veto it. Re-active listeners run only once the
//! pro-active gate passed; they can not veto and their failures are logged
//! rather than propagated.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::types::{Result, TxId};

/// Closed set of structural change kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A relationship type was created.
    RelationshipTypeCreate,
    /// A relationship type was deleted.
    RelationshipTypeDelete,
    /// A transaction began.
    TxBegin,
    /// A transaction committed.
    TxCommit,
    /// A transaction rolled back.
    TxRollback,
}

impl EventKind {
    /// Stable name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RelationshipTypeCreate => "relationship_type_create",
            EventKind::RelationshipTypeDelete => "relationship_type_delete",
            EventKind::TxBegin => "tx_begin",
            EventKind::TxCommit => "tx_commit",
            EventKind::TxRollback => "tx_rollback",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an event.
#[derive(Clone, Copy, Debug)]
pub enum EventData<'a> {
    /// The command whose mutation raised the event.
    Command(&'a Command),
    /// The transaction a lifecycle event refers to.
    Transaction(TxId),
}

impl<'a> EventData<'a> {
    /// The originating command, if any.
    pub fn command(&self) -> Option<&'a Command> {
        match self {
            EventData::Command(command) => Some(command),
            EventData::Transaction(_) => None,
        }
    }

    /// The transaction id, if the event refers to one.
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            EventData::Transaction(id) => Some(*id),
            EventData::Command(_) => None,
        }
    }
}

/// Listener consulted before a change becomes final.
pub trait ProActiveListener: Send + Sync {
    /// Returns false to veto the change.
    fn approve(&self, kind: EventKind, data: &EventData<'_>) -> bool;
}

/// Listener informed after a change passed its pro-active gate.
pub trait ReActiveListener: Send + Sync {
    /// Reacts to the change. Errors are logged and otherwise ignored.
    fn notify(&self, kind: EventKind, data: &EventData<'_>) -> Result<()>;
}

impl<F> ProActiveListener for F
where
    F: Fn(EventKind, &EventData<'_>) -> bool + Send + Sync,
{
    fn approve(&self, kind: EventKind, data: &EventData<'_>) -> bool {
        self(kind, data)
    }
}

impl<F> ReActiveListener for F
where
    F: Fn(EventKind, &EventData<'_>) -> Result<()> + Send + Sync,
{
    fn notify(&self, kind: EventKind, data: &EventData<'_>) -> Result<()> {
        self(kind, data)
    }
}

/// Handle returned by listener registration, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Registry<L> = RwLock<HashMap<EventKind, Vec<(ListenerId, Arc<L>)>>>;

/// Counters describing dispatch activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventStats {
    /// Pro-active events raised.
    pub pro_active: u64,
    /// Pro-active events vetoed.
    pub vetoes: u64,
    /// Re-active events raised.
    pub re_active: u64,
    /// Re-active listener failures swallowed.
    pub listener_failures: u64,
}

#[derive(Default)]
struct Counters {
    pro_active: AtomicU64,
    vetoes: AtomicU64,
    re_active: AtomicU64,
    listener_failures: AtomicU64,
}

/// Dispatches events to listeners registered per [`EventKind`], in registration order.
#[derive(Default)]
pub struct EventManager {
    next_listener: AtomicU64,
    pro_active: Registry<dyn ProActiveListener>,
    re_active: Registry<dyn ReActiveListener>,
    counters: Counters,
}

impl EventManager {
    /// Creates a manager with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pro-active listener for `kind`.
    pub fn register_pro_active(
        &self,
        kind: EventKind,
        listener: Arc<dyn ProActiveListener>,
    ) -> ListenerId {
        let id = self.allocate_listener_id();
        self.pro_active
            .write()
            .entry(kind)
            .or_default()
            .push((id, listener));
        debug!(%kind, listener = id.0, "event.register_pro_active");
        id
    }

    /// Registers a re-active listener for `kind`.
    pub fn register_re_active(
        &self,
        kind: EventKind,
        listener: Arc<dyn ReActiveListener>,
    ) -> ListenerId {
        let id = self.allocate_listener_id();
        self.re_active
            .write()
            .entry(kind)
            .or_default()
            .push((id, listener));
        debug!(%kind, listener = id.0, "event.register_re_active");
        id
    }

    /// Removes a pro-active listener. Returns false if it was not registered for `kind`.
    pub fn unregister_pro_active(&self, kind: EventKind, id: ListenerId) -> bool {
        remove_listener(&self.pro_active, kind, id)
    }

    /// Removes a re-active listener. Returns false if it was not registered for `kind`.
    pub fn unregister_re_active(&self, kind: EventKind, id: ListenerId) -> bool {
        remove_listener(&self.re_active, kind, id)
    }

    /// Asks every pro-active listener for `kind` to approve the change.
    ///
    /// Stops at the first veto and returns false; returns true when all approve.
    pub fn generate_pro_active_event(&self, kind: EventKind, data: &EventData<'_>) -> bool {
        self.counters.pro_active.fetch_add(1, Ordering::Relaxed);
        for (id, listener) in snapshot(&self.pro_active, kind) {
            if !listener.approve(kind, data) {
                self.counters.vetoes.fetch_add(1, Ordering::Relaxed);
                debug!(%kind, listener = id.0, "event.pro_active.veto");
                return false;
            }
        }
        trace!(%kind, "event.pro_active.approved");
        true
    }

    /// Notifies every re-active listener for `kind`. Listener failures are logged.
    pub fn generate_re_active_event(&self, kind: EventKind, data: &EventData<'_>) {
        self.counters.re_active.fetch_add(1, Ordering::Relaxed);
        for (id, listener) in snapshot(&self.re_active, kind) {
            if let Err(err) = listener.notify(kind, data) {
                self.counters
                    .listener_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(%kind, listener = id.0, error = %err, "event.re_active.listener_failed");
            }
        }
    }

    /// Returns a snapshot of the dispatch counters.
    pub fn stats(&self) -> EventStats {
        EventStats {
            pro_active: self.counters.pro_active.load(Ordering::Relaxed),
            vetoes: self.counters.vetoes.load(Ordering::Relaxed),
            re_active: self.counters.re_active.load(Ordering::Relaxed),
            listener_failures: self.counters.listener_failures.load(Ordering::Relaxed),
        }
    }

    fn allocate_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }
}

// Listeners run against a copy so they may register or unregister others.
fn snapshot<L: ?Sized>(registry: &Registry<L>, kind: EventKind) -> Vec<(ListenerId, Arc<L>)> {
    registry.read().get(&kind).cloned().unwrap_or_default()
}

fn remove_listener<L: ?Sized>(registry: &Registry<L>, kind: EventKind, id: ListenerId) -> bool {
    let mut map = registry.write();
    let Some(list) = map.get_mut(&kind) else {
        return false;
    };
    let before = list.len();
    list.retain(|(existing, _)| *existing != id);
    before != list.len()
}
