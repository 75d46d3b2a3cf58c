#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::registry::{RawRelTypeData, RelationshipType};
use super::store::Store;
use crate::command::Mutation;
use crate::event::{EventData, EventKind};
use crate::idgen::EntityKind;
use crate::txn::{CommandSlot, Transaction, TxScope};
use crate::types::{KernelError, RelTypeId, Result, TxId};

impl Store {
    /// Loads committed relationship types read from disk.
    ///
    /// Raises the relationship type id namespace past every loaded id.
    pub fn add_raw_relationship_types(&self, raw: &[RawRelTypeData]) -> Result<()> {
        for data in raw {
            self.registry.add_raw(data)?;
        }
        if let Some(max) = self.registry.max_id() {
            self.ids
                .ensure_at_least(EntityKind::RelationshipType, u64::from(max.0) + 1);
        }
        Ok(())
    }

    /// Registers every handle, creating the ones not yet known.
    ///
    /// Each creation runs in its own transaction.
    pub fn add_valid_relationship_types(
        &self,
        handles: &[Arc<dyn RelationshipType>],
    ) -> Result<Vec<RelTypeId>> {
        handles
            .iter()
            .map(|handle| self.register_relationship_type(Arc::clone(handle), None))
            .collect()
    }

    /// Returns the id of `handle`'s name, creating the relationship type when absent.
    ///
    /// Without `tx` the creation runs in a transaction of its own that is
    /// committed before returning. With `tx` the creation joins it and
    /// becomes visible to others only when the caller commits. A known name
    /// returns its id without raising any event.
    ///
    /// A failed store write is reported as [`KernelError::MutationExecution`];
    /// a veto as [`KernelError::Vetoed`], after which the transaction is
    /// rollback-only.
    pub fn register_relationship_type<'s>(
        &'s self,
        handle: Arc<dyn RelationshipType>,
        tx: Option<&mut Transaction<'s>>,
    ) -> Result<RelTypeId> {
        let name = handle.name().to_owned();
        if name.is_empty() {
            return Err(KernelError::Invalid("relationship type name must not be empty"));
        }
        let tx_id = tx.as_ref().map(|tx| tx.id());
        if let Some(id) = self.registry.visible_id(&name, tx_id)? {
            self.registry.bind_handle(handle);
            return Ok(id);
        }
        let _creation = self.registry.creation_lock();
        if let Some(id) = self.registry.visible_id(&name, tx_id)? {
            self.registry.bind_handle(handle);
            return Ok(id);
        }
        self.ensure_not_deleting(&name, tx_id)?;
        let mut scope = TxScope::begin_or_join(self, tx)?;
        match self.create_relationship_type(scope.tx(), &name) {
            Ok(id) => {
                scope.finish(true)?;
                self.registry.bind_handle(handle);
                info!(%id, name = %name, "reltype.created");
                Ok(id)
            }
            Err(err) => {
                if let Err(finish) = scope.finish(false) {
                    warn!(name = %name, error = %finish, "reltype.create.finish_failed");
                }
                Err(err)
            }
        }
    }

    fn ensure_not_deleting(&self, name: &str, tx: Option<TxId>) -> Result<()> {
        match self.registry.deleting_tx(name) {
            Some(owner) if Some(owner) == tx => Err(KernelError::Invalid(
                "relationship type is being deleted by this transaction",
            )),
            Some(owner) => Err(KernelError::Conflict(format!(
                "relationship type '{name}' is being deleted by {owner}"
            ))),
            None => Ok(()),
        }
    }

    fn create_relationship_type(&self, tx: &mut Transaction<'_>, name: &str) -> Result<RelTypeId> {
        let raw = self.ids.next_id(EntityKind::RelationshipType)?;
        let id = u32::try_from(raw)
            .map(RelTypeId)
            .map_err(|_| KernelError::Invalid("relationship type id space exhausted"))?;
        let command = self.commands.acquire(Mutation::CreateRelationshipType {
            id,
            name: name.to_owned(),
        });
        let slot = tx.add_command(command)?;
        self.execute_and_gate(tx, slot, EventKind::RelationshipTypeCreate)?;
        Ok(id)
    }

    /// Deletes the committed relationship type `name`, returning its id.
    ///
    /// Transaction handling and failure reporting follow
    /// [`Store::register_relationship_type`].
    pub fn delete_relationship_type<'s>(
        &'s self,
        name: &str,
        tx: Option<&mut Transaction<'s>>,
    ) -> Result<RelTypeId> {
        let _creation = self.registry.creation_lock();
        let tx_id = tx.as_ref().map(|tx| tx.id());
        self.ensure_not_deleting(name, tx_id)?;
        let id = self
            .registry
            .visible_id(name, tx_id)?
            .ok_or(KernelError::Invalid("unknown relationship type"))?;
        if self.registry.id_for_name(name).is_none() {
            return Err(KernelError::Invalid("relationship type is not committed"));
        }
        let mut scope = TxScope::begin_or_join(self, tx)?;
        let command = self.commands.acquire(Mutation::DeleteRelationshipType {
            id,
            name: name.to_owned(),
        });
        let outcome = match scope.tx().add_command(command) {
            Ok(slot) => self.execute_and_gate(scope.tx(), slot, EventKind::RelationshipTypeDelete),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                scope.finish(true)?;
                info!(%id, name, "reltype.deleted");
                Ok(id)
            }
            Err(err) => {
                if let Err(finish) = scope.finish(false) {
                    warn!(name, error = %finish, "reltype.delete.finish_failed");
                }
                Err(err)
            }
        }
    }

    // Execute, undo on failure, then run the two event phases.
    fn execute_and_gate(
        &self,
        tx: &mut Transaction<'_>,
        slot: CommandSlot,
        kind: EventKind,
    ) -> Result<()> {
        if let Err(err) = tx.execute(slot) {
            tx.undo(slot)?;
            return Err(err);
        }
        let approved = self
            .events
            .generate_pro_active_event(kind, &EventData::Command(tx.command(slot)?));
        if !approved {
            debug!(tx = %tx.id(), %kind, "reltype.vetoed");
            tx.set_rollback_only()?;
            tx.undo(slot)?;
            return Err(KernelError::Vetoed { kind });
        }
        self.events
            .generate_re_active_event(kind, &EventData::Command(tx.command(slot)?));
        Ok(())
    }

    /// Committed id of `handle`'s name.
    pub fn get_id_for(&self, handle: &dyn RelationshipType) -> Option<RelTypeId> {
        self.registry.id_for_name(handle.name())
    }

    /// Committed id of `name`.
    pub fn id_for_name(&self, name: &str) -> Option<RelTypeId> {
        self.registry.id_for_name(name)
    }

    /// Handle of the committed relationship type `id`.
    pub fn get_relationship_type(&self, id: RelTypeId) -> Option<Arc<dyn RelationshipType>> {
        self.registry.handle(id)
    }

    /// Whether `name` is a committed relationship type.
    pub fn is_valid(&self, name: &str) -> bool {
        self.registry.is_valid(name)
    }

    /// Committed relationship types ordered by id.
    pub fn relationship_types(&self) -> Vec<RawRelTypeData> {
        self.registry.names()
    }
}
