#![forbid(unsafe_code)]
//! Persistence windows: pooled, file-backed byte regions covering a block of
//! fixed-size records, and the [`Buffer`] cursor used to access them.

mod buffer;

pub use buffer::Buffer;

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::primitives::io::FileIo;
use crate::types::{FileId, KernelError, Result};

/// Durability mode applied when dirty windows are flushed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync the file after every flush.
    #[default]
    Full,
    /// Sync only when the pool is closed.
    Normal,
    /// Never sync explicitly.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }
}

impl FromStr for Synchronous {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Ok(Synchronous::Full),
            "normal" => Ok(Synchronous::Normal),
            "off" => Ok(Synchronous::Off),
            other => Err(KernelError::Config(format!(
                "unknown synchronous mode '{other}'"
            ))),
        }
    }
}

/// Configuration for a [`WindowPool`].
#[derive(Clone, Debug)]
pub struct WindowOptions {
    /// Number of records covered by one window.
    pub records_per_window: usize,
    /// Number of windows kept resident before unpinned ones are evicted.
    pub cache_windows: usize,
    /// Durability mode for flushes.
    pub synchronous: Synchronous,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            records_per_window: 128,
            cache_windows: 64,
            synchronous: Synchronous::Full,
        }
    }
}

/// A contiguous block of a store file held in memory.
pub struct PersistenceWindow {
    file: FileId,
    block: u64,
    position: u64,
    data: Box<[u8]>,
    dirty: bool,
}

impl PersistenceWindow {
    fn new(file: FileId, block: u64, size: usize) -> Self {
        Self {
            file,
            block,
            position: block * size as u64,
            data: vec![0u8; size].into_boxed_slice(),
            dirty: false,
        }
    }

    /// File the window belongs to.
    pub fn file(&self) -> FileId {
        self.file
    }

    /// Block number of the window within its file.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// File offset of the first byte of the window.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Size of the window in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether the window holds writes not yet flushed to its file.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read-only cursor over the window.
    pub fn buffer(&self) -> Buffer<&[u8]> {
        Buffer::new(&self.data[..], self.position)
    }

    /// Writable cursor over the window. Marks the window dirty.
    pub fn buffer_mut(&mut self) -> Buffer<&mut [u8]> {
        self.dirty = true;
        Buffer::new(&mut self.data[..], self.position)
    }

    fn load(&mut self, io: &dyn FileIo) -> Result<()> {
        let len = io.len()?;
        if self.position >= len {
            self.data.fill(0);
            return Ok(());
        }
        let available = ((len - self.position) as usize).min(self.data.len());
        match io.read_at(self.position, &mut self.data[..available]) {
            Ok(()) => {}
            Err(KernelError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(KernelError::Corruption("store file shrank during window load"));
            }
            Err(err) => return Err(err),
        }
        self.data[available..].fill(0);
        Ok(())
    }

    fn write_back(&mut self, io: &dyn FileIo) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        io.write_at(self.position, &self.data)?;
        self.dirty = false;
        Ok(())
    }
}

impl fmt::Debug for PersistenceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceWindow")
            .field("file", &self.file)
            .field("block", &self.block)
            .field("position", &self.position)
            .field("capacity", &self.data.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

type WindowKey = (FileId, u64);
type SharedWindow = Arc<RwLock<PersistenceWindow>>;

struct StoreFile {
    io: Arc<dyn FileIo>,
    record_size: usize,
}

/// Counters describing pool activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowPoolStats {
    /// Acquisitions served from resident windows.
    pub hits: u64,
    /// Acquisitions that loaded a window from its file.
    pub misses: u64,
    /// Windows dropped from the pool.
    pub evictions: u64,
    /// Dirty windows written back to their files.
    pub writebacks: u64,
}

impl fmt::Display for WindowPoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} writebacks={}",
            self.hits, self.misses, self.evictions, self.writebacks
        )
    }
}

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

/// Pool of persistence windows keyed by `(file, block)`.
///
/// Windows are loaded on first access and kept in LRU order. When the pool
/// grows past `cache_windows`, windows nobody else holds are evicted, dirty
/// ones being written back first. Writers take the window's write lock, so at
/// most one writer touches a window at a time.
pub struct WindowPool {
    opts: WindowOptions,
    files: RwLock<HashMap<FileId, StoreFile>>,
    cache: Mutex<LruCache<WindowKey, SharedWindow>>,
    counters: PoolCounters,
}

impl WindowPool {
    /// Creates an empty pool.
    pub fn new(opts: WindowOptions) -> Result<Self> {
        if opts.records_per_window == 0 {
            return Err(KernelError::Invalid("records_per_window must be non-zero"));
        }
        if opts.cache_windows == 0 {
            return Err(KernelError::Invalid("cache_windows must be non-zero"));
        }
        Ok(Self {
            opts,
            files: RwLock::new(HashMap::new()),
            cache: Mutex::new(LruCache::unbounded()),
            counters: PoolCounters::default(),
        })
    }

    /// Returns the pool configuration.
    pub fn options(&self) -> &WindowOptions {
        &self.opts
    }

    /// Makes a store file of `record_size`-byte records available to the pool.
    pub fn register_file(
        &self,
        file: FileId,
        io: Arc<dyn FileIo>,
        record_size: usize,
    ) -> Result<()> {
        if record_size == 0 {
            return Err(KernelError::Invalid("record size must be non-zero"));
        }
        let mut files = self.files.write();
        if files.contains_key(&file) {
            return Err(KernelError::Invalid("store file already registered"));
        }
        files.insert(file, StoreFile { io, record_size });
        debug!(%file, record_size, "window_pool.register_file");
        Ok(())
    }

    /// Size in bytes of the windows covering `file`.
    pub fn window_size(&self, file: FileId) -> Result<usize> {
        Ok(self.file_layout(file)?.1 * self.opts.records_per_window)
    }

    /// Number of whole records currently persisted in `file`.
    pub fn persisted_records(&self, file: FileId) -> Result<u64> {
        let (io, record_size) = self.file_layout(file)?;
        Ok(io.len()? / record_size as u64)
    }

    /// Returns the window covering `block` of `file`, loading it if needed.
    pub fn acquire(&self, file: FileId, block: u64) -> Result<SharedWindow> {
        let (io, record_size) = self.file_layout(file)?;
        let key = (file, block);
        let mut cache = self.cache.lock();
        if let Some(window) = cache.get(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(window));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let mut window =
            PersistenceWindow::new(file, block, record_size * self.opts.records_per_window);
        window.load(io.as_ref())?;
        trace!(%file, block, position = window.position(), "window_pool.load");
        let shared = Arc::new(RwLock::new(window));
        cache.put(key, Arc::clone(&shared));
        self.evict_unpinned(&mut cache)?;
        Ok(shared)
    }

    /// Runs `f` with a read-only buffer positioned at the start of `record`.
    pub fn with_record<R>(
        &self,
        file: FileId,
        record: u64,
        f: impl FnOnce(&mut Buffer<&[u8]>) -> Result<R>,
    ) -> Result<R> {
        let (block, offset) = self.locate(file, record)?;
        let shared = self.acquire(file, block)?;
        let window = shared.read();
        let mut buf = window.buffer();
        buf.set_offset(offset)?;
        f(&mut buf)
    }

    /// Runs `f` with a writable buffer positioned at the start of `record`.
    pub fn with_record_mut<R>(
        &self,
        file: FileId,
        record: u64,
        f: impl FnOnce(&mut Buffer<&mut [u8]>) -> Result<R>,
    ) -> Result<R> {
        let (block, offset) = self.locate(file, record)?;
        let shared = self.acquire(file, block)?;
        let mut window = shared.write();
        let mut buf = window.buffer_mut();
        buf.set_offset(offset)?;
        f(&mut buf)
    }

    /// Writes every dirty window back to its file and syncs per [`Synchronous`].
    pub fn flush(&self) -> Result<()> {
        self.flush_with(self.opts.synchronous == Synchronous::Full)
    }

    /// Flushes and syncs regardless of mode unless syncing is [`Synchronous::Off`].
    pub fn close(&self) -> Result<()> {
        self.flush_with(self.opts.synchronous != Synchronous::Off)
    }

    fn flush_with(&self, sync: bool) -> Result<()> {
        let windows: Vec<SharedWindow> = self
            .cache
            .lock()
            .iter()
            .map(|(_, w)| Arc::clone(w))
            .collect();
        let files = self.files.read();
        let mut touched = Vec::new();
        for shared in windows {
            let mut window = shared.write();
            if !window.is_dirty() {
                continue;
            }
            let Some(store_file) = files.get(&window.file()) else {
                return Err(KernelError::Invalid("window references unregistered file"));
            };
            window.write_back(store_file.io.as_ref())?;
            self.counters.writebacks.fetch_add(1, Ordering::Relaxed);
            if !touched.contains(&window.file()) {
                touched.push(window.file());
            }
        }
        if sync {
            for file in &touched {
                if let Some(store_file) = files.get(file) {
                    store_file.io.sync_all()?;
                }
            }
        }
        if !touched.is_empty() {
            debug!(files = touched.len(), sync, "window_pool.flush");
        }
        Ok(())
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> WindowPoolStats {
        WindowPoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            writebacks: self.counters.writebacks.load(Ordering::Relaxed),
        }
    }

    /// Number of windows currently resident.
    pub fn resident(&self) -> usize {
        self.cache.lock().len()
    }

    fn file_layout(&self, file: FileId) -> Result<(Arc<dyn FileIo>, usize)> {
        let files = self.files.read();
        let store_file = files
            .get(&file)
            .ok_or(KernelError::Invalid("store file not registered"))?;
        Ok((Arc::clone(&store_file.io), store_file.record_size))
    }

    fn locate(&self, file: FileId, record: u64) -> Result<(u64, usize)> {
        let (_, record_size) = self.file_layout(file)?;
        let per_window = self.opts.records_per_window as u64;
        let block = record / per_window;
        let offset = (record % per_window) as usize * record_size;
        Ok((block, offset))
    }

    fn evict_unpinned(&self, cache: &mut LruCache<WindowKey, SharedWindow>) -> Result<()> {
        while cache.len() > self.opts.cache_windows {
            let victim = cache
                .iter()
                .rev()
                .find(|(_, w)| Arc::strong_count(w) == 1)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                warn!(
                    resident = cache.len(),
                    limit = self.opts.cache_windows,
                    "window_pool.all_windows_pinned"
                );
                return Ok(());
            };
            if let Some(shared) = cache.pop(&key) {
                let mut window = shared.write();
                if window.is_dirty() {
                    let (io, _) = self.file_layout(key.0)?;
                    window.write_back(io.as_ref())?;
                    self.counters.writebacks.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(file = %key.0, block = key.1, "window_pool.evict");
            }
        }
        Ok(())
    }
}
