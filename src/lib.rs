//! Transactional mutation kernel for an embedded graph store.
//!
//! Mutations are [`command::Command`]s enqueued on a [`txn::Transaction`],
//! gated by the two-phase [`event`] protocol, and written through
//! bounds-checked [`primitives::window::Buffer`]s over pooled persistence
//! windows. Ids come from per-entity namespaces in [`idgen`]. The
//! relationship type registry on [`Store`] exercises the whole protocol.

#![warn(missing_docs)]

pub mod command;
pub mod event;
pub mod idgen;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod txn;
pub mod types;

pub use command::{Command, CommandPool, CommandState, Mutation};
pub use event::{EventData, EventKind, EventManager, ListenerId, ProActiveListener, ReActiveListener};
pub use idgen::{EntityKind, IdAllocator};
pub use storage::{NamedRelationshipType, RelationshipType, Store, StoreOptions};
pub use txn::{Transaction, TxScope, TxStatus};
pub use types::{KernelError, RelTypeId, Result, TxId};
