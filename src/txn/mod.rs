#![forbid(unsafe_code)]
//! In-process transaction boundary.
//!
//! Each thread holds at most one active [`Transaction`]. A transaction owns
//! the commands enqueued on it until it resolves: commit makes their effects
//! durable and final in enqueue order, rollback undoes them in reverse order.
//! Handles are passed explicitly; [`TxScope`] implements "begin or join".

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandContext, CommandState};
use crate::event::{EventData, EventKind};
use crate::storage::Store;
use crate::types::{KernelError, Result, TxId};

/// Status of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// Open and able to commit.
    Active,
    /// Open, but will roll back whatever the caller requests.
    MarkedRollback,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

impl TxStatus {
    /// Whether the transaction is still open.
    pub fn is_open(self) -> bool {
        matches!(self, TxStatus::Active | TxStatus::MarkedRollback)
    }

    /// Stable name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Active => "active",
            TxStatus::MarkedRollback => "marked_rollback",
            TxStatus::Committed => "committed",
            TxStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a command inside its transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandSlot(usize);

/// Tracks which thread holds which open transaction.
#[derive(Default)]
pub(crate) struct TxManager {
    next: AtomicU64,
    active: Mutex<HashMap<ThreadId, TxId>>,
}

impl TxManager {
    pub(crate) fn begin(&self) -> Result<(TxId, ThreadId)> {
        let thread = thread::current().id();
        let mut active = self.active.lock();
        if active.contains_key(&thread) {
            return Err(KernelError::TransactionState(
                "a transaction is already active on this thread",
            ));
        }
        let id = TxId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        active.insert(thread, id);
        Ok((id, thread))
    }

    pub(crate) fn end(&self, thread: ThreadId, id: TxId) {
        let mut active = self.active.lock();
        if active.get(&thread) == Some(&id) {
            active.remove(&thread);
        }
    }

    pub(crate) fn is_active_on_current_thread(&self) -> bool {
        self.active.lock().contains_key(&thread::current().id())
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// An open transaction on a [`Store`].
///
/// Dropping a transaction that was neither committed nor rolled back rolls it back.
pub struct Transaction<'s> {
    store: &'s Store,
    id: TxId,
    status: TxStatus,
    commands: Vec<Command>,
    thread: ThreadId,
    started: Instant,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s Store, id: TxId, thread: ThreadId) -> Self {
        Self {
            store,
            id,
            status: TxStatus::Active,
            commands: Vec::new(),
            thread,
            started: Instant::now(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Whether the transaction is open.
    pub fn is_active(&self) -> bool {
        self.status.is_open()
    }

    /// Number of commands enqueued.
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Forces the transaction to roll back when it resolves.
    pub fn set_rollback_only(&mut self) -> Result<()> {
        match self.status {
            TxStatus::Active => {
                debug!(tx = %self.id, "txn.set_rollback_only");
                self.status = TxStatus::MarkedRollback;
                Ok(())
            }
            TxStatus::MarkedRollback => Ok(()),
            _ => Err(KernelError::TransactionState("transaction already resolved")),
        }
    }

    /// Enqueues `command` on this transaction.
    pub fn add_command(&mut self, mut command: Command) -> Result<CommandSlot> {
        if !self.status.is_open() {
            return Err(KernelError::TransactionState(
                "no active transaction to enqueue on",
            ));
        }
        command.enqueue()?;
        debug!(tx = %self.id, command = %command.id(), "txn.enqueue");
        self.commands.push(command);
        Ok(CommandSlot(self.commands.len() - 1))
    }

    /// Executes the command at `slot`.
    pub fn execute(&mut self, slot: CommandSlot) -> Result<()> {
        let store = self.store;
        let ctx = context(store, self.id);
        self.slot_mut(slot)?.execute(&ctx)
    }

    /// Undoes the command at `slot`. Safe to repeat.
    pub fn undo(&mut self, slot: CommandSlot) -> Result<()> {
        let store = self.store;
        let ctx = context(store, self.id);
        self.slot_mut(slot)?.undo(&ctx);
        Ok(())
    }

    /// The command at `slot`.
    pub fn command(&self, slot: CommandSlot) -> Result<&Command> {
        self.commands
            .get(slot.0)
            .ok_or(KernelError::Invalid("unknown command slot"))
    }

    fn slot_mut(&mut self, slot: CommandSlot) -> Result<&mut Command> {
        self.commands
            .get_mut(slot.0)
            .ok_or(KernelError::Invalid("unknown command slot"))
    }

    /// Commits the transaction.
    ///
    /// Every command writes its committed record, then high ids are persisted
    /// and dirty windows flushed before any command is finalised. A transaction marked rollback-only is rolled back instead
    /// and [`KernelError::RolledBack`] returned.
    pub fn commit(mut self) -> Result<()> {
        match self.status {
            TxStatus::Active => {}
            TxStatus::MarkedRollback => {
                self.rollback_inner();
                return Err(KernelError::RolledBack(self.id));
            }
            _ => return Err(KernelError::TransactionState("transaction already resolved")),
        }
        if self
            .commands
            .iter()
            .any(|command| command.state() == CommandState::Enqueued)
        {
            self.rollback_inner();
            return Err(KernelError::TransactionState(
                "transaction holds commands that were never executed",
            ));
        }
        let store = self.store;
        let ctx = context(store, self.id);
        let prepared = self
            .commands
            .iter_mut()
            .try_for_each(|command| command.prepare(&ctx))
            .and_then(|()| store.ids.persist())
            .and_then(|()| store.windows.flush());
        if let Err(err) = prepared {
            error!(tx = %self.id, error = %err, "txn.commit.persist_failed");
            self.rollback_inner();
            return Err(err);
        }
        for command in &mut self.commands {
            command.commit(&ctx)?;
        }
        self.status = TxStatus::Committed;
        let commands = self.release_commands();
        info!(
            tx = %self.id,
            commands,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "txn.commit"
        );
        store
            .events
            .generate_re_active_event(EventKind::TxCommit, &EventData::Transaction(self.id));
        Ok(())
    }

    /// Rolls the transaction back, undoing commands in reverse enqueue order.
    pub fn rollback(mut self) -> Result<()> {
        if !self.status.is_open() {
            return Err(KernelError::TransactionState("transaction already resolved"));
        }
        self.rollback_inner();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let store = self.store;
        let ctx = context(store, self.id);
        for command in self.commands.iter_mut().rev() {
            command.undo(&ctx);
        }
        if let Err(err) = store.ids.persist() {
            warn!(tx = %self.id, error = %err, "txn.rollback.persist_ids_failed");
        }
        self.status = TxStatus::RolledBack;
        let commands = self.release_commands();
        info!(tx = %self.id, commands, "txn.rollback");
        store
            .events
            .generate_re_active_event(EventKind::TxRollback, &EventData::Transaction(self.id));
    }

    fn release_commands(&mut self) -> usize {
        let commands = mem::take(&mut self.commands);
        let count = commands.len();
        for command in commands {
            self.store.commands.release(command);
        }
        self.store.txs.end(self.thread, self.id);
        count
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.status.is_open() {
            warn!(tx = %self.id, status = %self.status, "txn.dropped_unresolved");
            self.rollback_inner();
        }
    }
}

fn context(store: &Store, tx: TxId) -> CommandContext<'_> {
    CommandContext {
        registry: &store.registry,
        records: &store.records,
        tx,
    }
}

/// A transaction that was either begun here or joined from the caller.
pub enum TxScope<'a, 's> {
    /// Begun by this scope; resolved by [`TxScope::finish`].
    Owned(Transaction<'s>),
    /// Supplied by the caller, who resolves it.
    Joined(&'a mut Transaction<'s>),
}

impl<'a, 's> TxScope<'a, 's> {
    /// Joins `tx` when given, otherwise begins a new transaction on `store`.
    pub fn begin_or_join(store: &'s Store, tx: Option<&'a mut Transaction<'s>>) -> Result<Self> {
        match tx {
            Some(tx) if tx.is_active() => Ok(TxScope::Joined(tx)),
            Some(_) => Err(KernelError::TransactionState(
                "joined transaction is not active",
            )),
            None => Ok(TxScope::Owned(store.begin()?)),
        }
    }

    /// The transaction in scope.
    pub fn tx(&mut self) -> &mut Transaction<'s> {
        match self {
            TxScope::Owned(tx) => tx,
            TxScope::Joined(tx) => tx,
        }
    }

    /// Whether this scope began the transaction.
    pub fn started(&self) -> bool {
        matches!(self, TxScope::Owned(_))
    }

    /// Resolves the scope. An owned transaction commits on success and rolls
    /// back otherwise; a joined one is only marked rollback-only on failure.
    pub fn finish(self, success: bool) -> Result<()> {
        match self {
            TxScope::Owned(tx) if success => tx.commit(),
            TxScope::Owned(tx) => tx.rollback(),
            TxScope::Joined(_) if success => Ok(()),
            TxScope::Joined(tx) => tx.set_rollback_only(),
        }
    }
}
