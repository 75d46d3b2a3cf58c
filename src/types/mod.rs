#![forbid(unsafe_code)]
//! Identifier newtypes and the crate-wide error enum.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::command::CommandState;
use crate::event::EventKind;

/// Identifier of a relationship type inside the type registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelTypeId(pub u32);

/// Identifier of a transaction, unique for the lifetime of a [`crate::Store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub u64);

/// Identifier of a store file registered with the window pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

/// Process-unique identity of a [`crate::command::Command`] instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for RelTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors surfaced by the mutation kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Persisted bytes failed validation.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// An argument was rejected before any state changed.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A buffer access fell outside the window it is tied to.
    #[error(
        "illegal buffer access: pos={position} off={offset} width={width} capacity={capacity}"
    )]
    BufferBounds {
        /// File position of the window backing the buffer.
        position: u64,
        /// Requested offset relative to the window base.
        offset: usize,
        /// Width in bytes of the attempted access (zero for repositioning).
        width: usize,
        /// Capacity of the window in bytes.
        capacity: usize,
    },
    /// A command's apply logic could not complete. The command has been or must be undone.
    #[error("failed executing command {command}: {source}")]
    MutationExecution {
        /// Command whose execution failed.
        command: CommandId,
        /// The failure reported by the apply logic.
        #[source]
        source: Box<KernelError>,
    },
    /// A pro-active listener rejected the change.
    #[error("pro-active event {kind:?} was vetoed")]
    Vetoed {
        /// Kind of the vetoed event.
        kind: EventKind,
    },
    /// The identifier allocator was used in a way it does not support.
    #[error("identifier allocator misuse: {0}")]
    AllocatorMisuse(&'static str),
    /// A transaction operation was invoked in the wrong transaction state.
    #[error("transaction state error: {0}")]
    TransactionState(&'static str),
    /// A command lifecycle transition was requested from the wrong state.
    #[error("command {command} cannot {op} while {state}")]
    CommandState {
        /// Command the transition was requested on.
        command: CommandId,
        /// The rejected operation.
        op: &'static str,
        /// State the command was in.
        state: CommandState,
    },
    /// The transaction was rolled back instead of committed.
    #[error("transaction {0} was rolled back")]
    RolledBack(TxId),
    /// Another open transaction holds a conflicting pending change.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Configuration could not be parsed or validated.
    #[error("configuration error: {0}")]
    Config(String),
}

impl KernelError {
    /// Returns true when the error reports a pro-active veto.
    pub fn is_veto(&self) -> bool {
        matches!(self, KernelError::Vetoed { .. })
    }

    /// Returns true when the error reports a failed command execution.
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, KernelError::MutationExecution { .. })
    }
}
