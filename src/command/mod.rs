#![forbid(unsafe_code)]
//! Transaction-scoped, undoable units of mutation.
//!
//! A [`Command`] moves through `Reset -> Enqueued -> Executed -> {Committed | Undone} -> Reset`.
//! The payload is a [`Mutation`] variant; execute, undo and commit dispatch
//! on it. Undo never fails and only reverts the parts of a mutation that were
//! actually applied, so it is safe right after a failed execute and safe to
//! repeat.
//!
//! Execute leaves the record store in a state that reads as unchanged after a
//! crash. [`Command::prepare`] writes the committed form of the record and
//! runs before the owning transaction flushes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::event::EventKind;
use crate::storage::{RelTypeRegistry, RelTypeStore};
use crate::types::{CommandId, KernelError, RelTypeId, Result, TxId};

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Command`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandState {
    /// Fresh or recycled, not attached to a transaction.
    Reset,
    /// Attached to a transaction, not yet applied.
    Enqueued,
    /// Applied to in-memory and buffered state.
    Executed,
    /// Made final by the owning transaction's commit.
    Committed,
    /// Reverted.
    Undone,
}

impl CommandState {
    /// Stable name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Reset => "reset",
            CommandState::Enqueued => "enqueued",
            CommandState::Executed => "executed",
            CommandState::Committed => "committed",
            CommandState::Undone => "undone",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation payload carried by a [`Command`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Adds a relationship type under a freshly reserved id.
    CreateRelationshipType {
        /// Id reserved for the new type.
        id: RelTypeId,
        /// Name of the new type.
        name: String,
    },
    /// Removes a committed relationship type.
    DeleteRelationshipType {
        /// Id of the type being removed.
        id: RelTypeId,
        /// Name of the type being removed.
        name: String,
    },
}

impl Mutation {
    /// Event kind raised for this mutation.
    pub fn event_kind(&self) -> EventKind {
        match self {
            Mutation::CreateRelationshipType { .. } => EventKind::RelationshipTypeCreate,
            Mutation::DeleteRelationshipType { .. } => EventKind::RelationshipTypeDelete,
        }
    }
}

/// State a command touches while executing.
pub struct CommandContext<'a> {
    /// In-memory relationship type registry.
    pub registry: &'a RelTypeRegistry,
    /// Relationship type record store.
    pub records: &'a RelTypeStore,
    /// Transaction that owns the command.
    pub tx: TxId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Applied {
    record: bool,
    registry: bool,
    durable: bool,
}

/// An undoable unit of mutation.
#[derive(Debug)]
pub struct Command {
    id: CommandId,
    state: CommandState,
    mutation: Option<Mutation>,
    applied: Applied,
}

impl Default for Command {
    fn default() -> Self {
        Self::new()
    }
}

impl Command {
    /// Creates an empty command in [`CommandState::Reset`].
    pub fn new() -> Self {
        Self {
            id: CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)),
            state: CommandState::Reset,
            mutation: None,
            applied: Applied::default(),
        }
    }

    /// Creates a command carrying `mutation`.
    pub fn with_mutation(mutation: Mutation) -> Self {
        let mut command = Self::new();
        command.mutation = Some(mutation);
        command
    }

    /// Identity of this instance, stable across pooled reuse.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Payload, if one is set.
    pub fn mutation(&self) -> Option<&Mutation> {
        self.mutation.as_ref()
    }

    /// Sets the payload. Only allowed in [`CommandState::Reset`].
    pub fn set_mutation(&mut self, mutation: Mutation) -> Result<()> {
        self.require(CommandState::Reset, "set mutation")?;
        self.mutation = Some(mutation);
        Ok(())
    }

    /// `Reset -> Enqueued`. Called by the transaction the command is added to.
    pub(crate) fn enqueue(&mut self) -> Result<()> {
        self.require(CommandState::Reset, "enqueue")?;
        if self.mutation.is_none() {
            return Err(KernelError::Invalid("command has no mutation"));
        }
        self.transition(CommandState::Enqueued);
        Ok(())
    }

    /// `Enqueued -> Executed`: applies the mutation.
    ///
    /// On failure the command stays enqueued, keeps track of what it managed
    /// to apply, and returns [`KernelError::MutationExecution`]. The caller
    /// must then call [`Command::undo`].
    pub fn execute(&mut self, ctx: &CommandContext<'_>) -> Result<()> {
        self.require(CommandState::Enqueued, "execute")?;
        let outcome = match self.mutation.clone() {
            Some(Mutation::CreateRelationshipType { id, name }) => self.apply_create(ctx, id, &name),
            Some(Mutation::DeleteRelationshipType { id, name }) => self.apply_delete(ctx, id, &name),
            None => Err(KernelError::Invalid("command has no mutation")),
        };
        match outcome {
            Ok(()) => {
                self.transition(CommandState::Executed);
                Ok(())
            }
            Err(source) => {
                debug!(command = %self.id, tx = %ctx.tx, error = %source, "command.execute.failed");
                Err(KernelError::MutationExecution {
                    command: self.id,
                    source: Box::new(source),
                })
            }
        }
    }

    fn apply_create(&mut self, ctx: &CommandContext<'_>, id: RelTypeId, name: &str) -> Result<()> {
        ctx.records.write_pending(id, name)?;
        self.applied.record = true;
        ctx.registry.insert_pending(id, name, ctx.tx)?;
        self.applied.registry = true;
        Ok(())
    }

    fn apply_delete(&mut self, ctx: &CommandContext<'_>, id: RelTypeId, name: &str) -> Result<()> {
        ctx.registry.mark_delete(id, name, ctx.tx)?;
        self.applied.registry = true;
        Ok(())
    }

    /// Writes the committed form of an executed mutation's record.
    ///
    /// A create turns its pending record in use; a delete frees the record.
    /// Undone commands are skipped and repeating is a no-op. Undo reverts
    /// the write while the command is still `Executed`.
    pub fn prepare(&mut self, ctx: &CommandContext<'_>) -> Result<()> {
        if self.state == CommandState::Undone || self.applied.durable {
            return Ok(());
        }
        self.require(CommandState::Executed, "prepare")?;
        match &self.mutation {
            Some(Mutation::CreateRelationshipType { id, name }) => ctx.records.write(*id, name)?,
            Some(Mutation::DeleteRelationshipType { id, .. }) => ctx.records.clear(*id)?,
            None => {}
        }
        self.applied.durable = true;
        trace!(command = %self.id, tx = %ctx.tx, "command.prepare");
        Ok(())
    }

    /// Reverts whatever the last execute applied and moves to [`CommandState::Undone`].
    ///
    /// Never fails. A no-op outside `Enqueued` and `Executed`.
    pub fn undo(&mut self, ctx: &CommandContext<'_>) {
        if !matches!(self.state, CommandState::Enqueued | CommandState::Executed) {
            trace!(command = %self.id, state = %self.state, "command.undo.noop");
            return;
        }
        match &self.mutation {
            Some(Mutation::CreateRelationshipType { id, name }) => {
                if self.applied.registry {
                    ctx.registry.remove_pending(*id, name);
                }
                if self.applied.record {
                    if let Err(err) = ctx.records.clear(*id) {
                        error!(command = %self.id, id = %id, error = %err, "command.undo.clear_failed");
                    }
                }
            }
            Some(Mutation::DeleteRelationshipType { id, name }) => {
                if self.applied.durable {
                    if let Err(err) = ctx.records.write(*id, name) {
                        error!(command = %self.id, id = %id, error = %err, "command.undo.restore_failed");
                    }
                }
                if self.applied.registry {
                    ctx.registry.revert_delete(*id, name);
                }
            }
            None => {}
        }
        self.applied = Applied::default();
        self.transition(CommandState::Undone);
    }

    /// `Executed -> Committed`: makes the mutation final. Undone commands are skipped.
    ///
    /// Runs [`Command::prepare`] first when the transaction has not.
    pub fn commit(&mut self, ctx: &CommandContext<'_>) -> Result<()> {
        if self.state == CommandState::Undone {
            return Ok(());
        }
        self.require(CommandState::Executed, "commit")?;
        self.prepare(ctx)?;
        match &self.mutation {
            Some(Mutation::CreateRelationshipType { id, name }) => {
                ctx.registry.commit_create(*id, name)
            }
            Some(Mutation::DeleteRelationshipType { id, name }) => {
                ctx.registry.commit_delete(*id, name)
            }
            None => {}
        }
        self.transition(CommandState::Committed);
        Ok(())
    }

    /// Clears the payload for reuse. Rejected while the command is attached to a transaction.
    pub fn reset(&mut self) -> Result<()> {
        if matches!(self.state, CommandState::Enqueued | CommandState::Executed) {
            return Err(self.state_error("reset"));
        }
        self.mutation = None;
        self.applied = Applied::default();
        self.state = CommandState::Reset;
        Ok(())
    }

    fn require(&self, expected: CommandState, op: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.state_error(op))
        }
    }

    fn state_error(&self, op: &'static str) -> KernelError {
        KernelError::CommandState {
            command: self.id,
            op,
            state: self.state,
        }
    }

    fn transition(&mut self, to: CommandState) {
        trace!(command = %self.id, from = %self.state, %to, "command.transition");
        self.state = to;
    }
}

/// Bounded free list of reset commands.
pub struct CommandPool {
    free: Mutex<Vec<Command>>,
    capacity: usize,
}

impl Default for CommandPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl CommandPool {
    /// Default number of idle commands retained.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Creates a pool retaining at most `capacity` idle commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns a command carrying `mutation`, reusing an idle one when available.
    pub fn acquire(&self, mutation: Mutation) -> Command {
        let mut command = self.free.lock().pop().unwrap_or_default();
        command.mutation = Some(mutation);
        command
    }

    /// Resets `command` and keeps it for reuse. Commands still attached to a
    /// transaction, or arriving when the pool is full, are dropped.
    pub fn release(&self, mut command: Command) {
        if command.reset().is_err() {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(command);
        }
    }

    /// Number of idle commands held.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}
