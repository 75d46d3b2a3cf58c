#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::options::StoreOptions;
use super::registry::RelTypeRegistry;
use super::reltype_store::{RelTypeStore, RELTYPE_STORE_NAME};
use crate::command::CommandPool;
use crate::event::{EventData, EventKind, EventManager};
use crate::idgen::{FileIdSource, IdAllocator, IdAllocatorModule};
use crate::primitives::window::WindowPool;
use crate::txn::{Transaction, TxManager};
use crate::types::{KernelError, Result};

/// File name of the identifier high-water mark file.
pub const ID_FILE_NAME: &str = "graphkern.ids";

/// Handle to an open store directory.
///
/// Owns every piece of shared mutable state: listeners, the id allocator,
/// the window pool and the relationship type registry. Created by
/// [`Store::create`] or [`Store::open`], released by [`Store::close`] or drop.
pub struct Store {
    dir: PathBuf,
    opts: StoreOptions,
    pub(crate) events: EventManager,
    pub(crate) ids: Arc<IdAllocator>,
    id_module: IdAllocatorModule,
    pub(crate) windows: Arc<WindowPool>,
    pub(crate) records: RelTypeStore,
    pub(crate) registry: RelTypeRegistry,
    pub(crate) commands: CommandPool,
    pub(crate) txs: TxManager,
    closed: AtomicBool,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("opts", &self.opts)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Store {
    /// Creates a new store in `dir`. Fails if one already exists there.
    pub fn create(dir: impl AsRef<Path>, opts: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref();
        if dir.join(ID_FILE_NAME).exists() {
            return Err(KernelError::Invalid("store already exists"));
        }
        fs::create_dir_all(dir)?;
        Self::open_dir(dir, opts)
    }

    /// Opens the store in `dir`, creating it when `create_if_missing` is set.
    pub fn open(dir: impl AsRef<Path>, opts: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.join(ID_FILE_NAME).exists() {
            if !opts.create_if_missing {
                return Err(KernelError::Invalid("store does not exist"));
            }
            fs::create_dir_all(dir)?;
        }
        Self::open_dir(dir, opts)
    }

    fn open_dir(dir: &Path, opts: StoreOptions) -> Result<Self> {
        opts.validate()?;
        let windows = Arc::new(WindowPool::new(opts.window_options())?);
        let records = RelTypeStore::open(Arc::clone(&windows), dir.join(RELTYPE_STORE_NAME))?;
        let ids = Arc::new(IdAllocator::new());
        let id_module = IdAllocatorModule::new(Arc::clone(&ids));
        id_module.init()?;
        id_module.set_persistence_source(Arc::new(FileIdSource::open(dir.join(ID_FILE_NAME))?))?;
        id_module.start()?;
        let store = Self {
            dir: dir.to_path_buf(),
            opts,
            events: EventManager::new(),
            ids,
            id_module,
            windows,
            records,
            registry: RelTypeRegistry::new(),
            commands: CommandPool::default(),
            txs: TxManager::default(),
            closed: AtomicBool::new(false),
        };
        let raw = store.records.load_all()?;
        store.add_raw_relationship_types(&raw)?;
        store.ids.persist()?;
        info!(
            dir = %store.dir.display(),
            relationship_types = raw.len(),
            "store.open"
        );
        Ok(store)
    }

    /// Directory holding the store files.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    /// Begins a transaction bound to the calling thread.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let (id, thread) = self.txs.begin()?;
        let tx = Transaction::new(self, id, thread);
        self.events
            .generate_re_active_event(EventKind::TxBegin, &EventData::Transaction(id));
        Ok(tx)
    }

    /// Whether the calling thread has an open transaction.
    pub fn is_transaction_active(&self) -> bool {
        self.txs.is_active_on_current_thread()
    }

    /// Number of open transactions across all threads.
    pub fn active_transactions(&self) -> usize {
        self.txs.active_count()
    }

    /// Event dispatcher for listener registration.
    pub fn events(&self) -> &EventManager {
        &self.events
    }

    /// The identifier allocator.
    pub fn id_allocator(&self) -> &IdAllocator {
        &self.ids
    }

    /// The window pool backing the store files.
    pub fn windows(&self) -> &WindowPool {
        &self.windows
    }

    /// Flushes windows, persists high ids and releases the store.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.windows.close()?;
        self.id_module.stop()?;
        self.id_module.destroy()?;
        info!(dir = %self.dir.display(), "store.close");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(dir = %self.dir.display(), error = %err, "store.close_on_drop_failed");
        }
    }
}
