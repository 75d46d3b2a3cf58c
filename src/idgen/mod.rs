#![forbid(unsafe_code)]
//! Per-entity-type identifier namespaces.
//!
//! Ids are reserved eagerly and never handed out twice, even when the command
//! that consumed one is undone. High-water marks are written through a
//! [`PersistenceSource`] when a transaction commits so a reopened store
//! continues past every id it has issued.

mod module;
mod source;

pub use module::IdAllocatorModule;
pub use source::{FileIdSource, MemoryIdSource, PersistenceSource};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::types::{KernelError, Result};

/// Entity types that own an identifier namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Relationship types registered in the type registry.
    RelationshipType,
    /// Graph nodes.
    Node,
    /// Graph relationships.
    Relationship,
    /// Node and relationship properties.
    Property,
}

impl EntityKind {
    /// Number of namespaces.
    pub const COUNT: usize = 4;

    /// All namespaces in persisted order.
    pub const ALL: [EntityKind; EntityKind::COUNT] = [
        EntityKind::RelationshipType,
        EntityKind::Node,
        EntityKind::Relationship,
        EntityKind::Property,
    ];

    /// Slot of the namespace in persisted order.
    pub fn index(self) -> usize {
        match self {
            EntityKind::RelationshipType => 0,
            EntityKind::Node => 1,
            EntityKind::Relationship => 2,
            EntityKind::Property => 3,
        }
    }

    /// Stable lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::RelationshipType => "relationship_type",
            EntityKind::Node => "node",
            EntityKind::Relationship => "relationship",
            EntityKind::Property => "property",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next unissued id per namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HighIds([u64; EntityKind::COUNT]);

impl HighIds {
    /// Builds high ids from raw per-namespace values in persisted order.
    pub fn from_raw(raw: [u64; EntityKind::COUNT]) -> Self {
        Self(raw)
    }

    /// Raw values in persisted order.
    pub fn raw(&self) -> [u64; EntityKind::COUNT] {
        self.0
    }

    /// Next unissued id for `kind`.
    pub fn get(&self, kind: EntityKind) -> u64 {
        self.0[kind.index()]
    }

    /// Sets the next unissued id for `kind`.
    pub fn set(&mut self, kind: EntityKind, next: u64) {
        self.0[kind.index()] = next;
    }
}

/// Monotonic id issuance over every [`EntityKind`] namespace.
pub struct IdAllocator {
    configured: AtomicBool,
    source: Mutex<Option<Arc<dyn PersistenceSource>>>,
    next: [AtomicU64; EntityKind::COUNT],
    persisted: Mutex<HighIds>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    /// Creates an unconfigured allocator.
    pub fn new() -> Self {
        Self {
            configured: AtomicBool::new(false),
            source: Mutex::new(None),
            next: std::array::from_fn(|_| AtomicU64::new(0)),
            persisted: Mutex::new(HighIds::default()),
        }
    }

    /// Binds the allocator to its persistence source and loads the high-water marks.
    ///
    /// May be called exactly once; a second call is [`KernelError::AllocatorMisuse`].
    pub fn configure(&self, source: Arc<dyn PersistenceSource>) -> Result<()> {
        let mut slot = self.source.lock();
        if slot.is_some() {
            return Err(KernelError::AllocatorMisuse(
                "persistence source can not be changed during operations",
            ));
        }
        let high = source.load_high_ids()?;
        for kind in EntityKind::ALL {
            self.next[kind.index()].store(high.get(kind), Ordering::SeqCst);
        }
        *self.persisted.lock() = high;
        info!(source = source.name(), ?high, "idgen.configure");
        *slot = Some(source);
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether [`IdAllocator::configure`] has completed.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Reserves a fresh id in the namespace of `kind`.
    pub fn next_id(&self, kind: EntityKind) -> Result<u64> {
        if !self.is_configured() {
            return Err(KernelError::AllocatorMisuse(
                "id allocator used before configure",
            ));
        }
        let id = self.next[kind.index()]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| next.checked_add(1))
            .map_err(|_| KernelError::Invalid("identifier namespace exhausted"))?;
        trace!(%kind, id, "idgen.next_id");
        Ok(id)
    }

    /// Next id that would be issued for `kind`.
    pub fn high_id(&self, kind: EntityKind) -> u64 {
        self.next[kind.index()].load(Ordering::SeqCst)
    }

    /// Raises the namespace of `kind` so that no id below `floor` is issued.
    pub fn ensure_at_least(&self, kind: EntityKind, floor: u64) {
        let prev = self.next[kind.index()].fetch_max(floor, Ordering::SeqCst);
        if prev < floor {
            debug!(%kind, from = prev, to = floor, "idgen.raise_high_id");
        }
    }

    /// Current high-water marks.
    pub fn snapshot(&self) -> HighIds {
        let mut high = HighIds::default();
        for kind in EntityKind::ALL {
            high.set(kind, self.high_id(kind));
        }
        high
    }

    /// Writes the current high-water marks to the persistence source when they moved.
    pub fn persist(&self) -> Result<()> {
        let source = self
            .source
            .lock()
            .clone()
            .ok_or(KernelError::AllocatorMisuse("id allocator used before configure"))?;
        let mut persisted = self.persisted.lock();
        let high = self.snapshot();
        if high == *persisted {
            return Ok(());
        }
        source.store_high_ids(&high)?;
        debug!(source = source.name(), ?high, "idgen.persist");
        *persisted = high;
        Ok(())
    }
}
