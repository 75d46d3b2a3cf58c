//! Store handle, configuration and the relationship type registry.
//!
//! The registry is built entirely from commands: creating or deleting a
//! relationship type enqueues a [`crate::command::Mutation`] on a
//! transaction, executes it, and passes it through the pro-active and
//! re-active event phases.

mod options;
mod registry;
mod reltype_ops;
mod reltype_store;
mod store;

pub use options::StoreOptions;
pub use registry::{NamedRelationshipType, RawRelTypeData, RelTypeRegistry, RelationshipType};
pub use reltype_store::{RelTypeStore, NAME_CAPACITY, RECORD_SIZE, RELTYPE_FILE, RELTYPE_STORE_NAME};
pub use store::{Store, ID_FILE_NAME};
