#![forbid(unsafe_code)]

use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use tracing::debug;

use super::{EntityKind, HighIds};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{KernelError, Result};

/// Durable home of the allocator's high-water marks.
pub trait PersistenceSource: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;
    /// Loads the persisted high ids, all zero for a fresh store.
    fn load_high_ids(&self) -> Result<HighIds>;
    /// Durably replaces the persisted high ids.
    fn store_high_ids(&self, high: &HighIds) -> Result<()>;
}

/// Volatile source for tests and throwaway stores.
#[derive(Default)]
pub struct MemoryIdSource {
    high: Mutex<HighIds>,
    stores: AtomicUsize,
}

impl MemoryIdSource {
    /// Creates a source that starts from `high`.
    pub fn with_high_ids(high: HighIds) -> Self {
        Self {
            high: Mutex::new(high),
            stores: AtomicUsize::new(0),
        }
    }

    /// Number of times the allocator wrote to this source.
    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::Relaxed)
    }
}

impl PersistenceSource for MemoryIdSource {
    fn name(&self) -> &str {
        "memory"
    }

    fn load_high_ids(&self) -> Result<HighIds> {
        Ok(*self.high.lock())
    }

    fn store_high_ids(&self, high: &HighIds) -> Result<()> {
        *self.high.lock() = *high;
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

const ID_FILE_MAGIC: [u8; 4] = *b"GKID";
const ID_FILE_VERSION: u16 = 1;

const ID_MAGIC: Range<usize> = 0..4;
const ID_VERSION: Range<usize> = 4..6;
const ID_RESERVED: Range<usize> = 6..8;
const ID_SALT: Range<usize> = 8..16;
const ID_COUNT: Range<usize> = 16..20;
const ID_SLOTS_START: usize = 20;
const ID_SLOTS_END: usize = ID_SLOTS_START + EntityKind::COUNT * 8;
const ID_CRC: Range<usize> = ID_SLOTS_END..ID_SLOTS_END + 4;
const ID_FILE_LEN: usize = ID_CRC.end;

/// Id file: a single checksummed block holding one high id per namespace.
pub struct FileIdSource {
    io: Box<dyn FileIo>,
    salt: u64,
    label: String,
}

impl FileIdSource {
    /// Opens the id file at `path`, writing an all-zero one when it is new.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let io = StdFileIo::open(path)?;
        Self::from_io(Box::new(io), path.display().to_string())
    }

    /// Wraps an arbitrary [`FileIo`] as an id file.
    pub fn from_io(io: Box<dyn FileIo>, label: String) -> Result<Self> {
        if !io.is_empty()? {
            let image = read_image(io.as_ref())?;
            let (salt, _) = decode_image(&image)?;
            return Ok(Self { io, salt, label });
        }
        let source = Self {
            io,
            salt: OsRng.next_u64(),
            label,
        };
        source.store_high_ids(&HighIds::default())?;
        debug!(file = %source.label, "idgen.file.create");
        Ok(source)
    }
}

impl PersistenceSource for FileIdSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn load_high_ids(&self) -> Result<HighIds> {
        if self.io.is_empty()? {
            return Ok(HighIds::default());
        }
        let image = read_image(self.io.as_ref())?;
        let (_, high) = decode_image(&image)?;
        Ok(high)
    }

    fn store_high_ids(&self, high: &HighIds) -> Result<()> {
        let image = encode_image(self.salt, high);
        self.io.write_at(0, &image)?;
        self.io.truncate(ID_FILE_LEN as u64)?;
        self.io.sync_all()?;
        debug!(file = %self.label, "idgen.file.store");
        Ok(())
    }
}

fn read_image(io: &dyn FileIo) -> Result<[u8; ID_FILE_LEN]> {
    if io.len()? < ID_FILE_LEN as u64 {
        return Err(KernelError::Corruption("id file truncated"));
    }
    let mut image = [0u8; ID_FILE_LEN];
    io.read_at(0, &mut image)?;
    Ok(image)
}

fn encode_image(salt: u64, high: &HighIds) -> [u8; ID_FILE_LEN] {
    let mut image = [0u8; ID_FILE_LEN];
    image[ID_MAGIC].copy_from_slice(&ID_FILE_MAGIC);
    image[ID_VERSION].copy_from_slice(&ID_FILE_VERSION.to_be_bytes());
    image[ID_RESERVED].fill(0);
    image[ID_SALT].copy_from_slice(&salt.to_be_bytes());
    image[ID_COUNT].copy_from_slice(&(EntityKind::COUNT as u32).to_be_bytes());
    for (slot, value) in high.raw().iter().enumerate() {
        let start = ID_SLOTS_START + slot * 8;
        image[start..start + 8].copy_from_slice(&value.to_be_bytes());
    }
    let crc = image_crc32(salt, &image[..ID_SLOTS_END]);
    image[ID_CRC].copy_from_slice(&crc.to_be_bytes());
    image
}

fn decode_image(image: &[u8; ID_FILE_LEN]) -> Result<(u64, HighIds)> {
    if image[ID_MAGIC] != ID_FILE_MAGIC {
        return Err(KernelError::Corruption("id file magic mismatch"));
    }
    let version = u16::from_be_bytes([image[ID_VERSION.start], image[ID_VERSION.start + 1]]);
    if version != ID_FILE_VERSION {
        return Err(KernelError::Corruption("unsupported id file version"));
    }
    let salt = u64::from_be_bytes(read8(&image[ID_SALT]));
    let count = u32::from_be_bytes(read4(&image[ID_COUNT])) as usize;
    if count != EntityKind::COUNT {
        return Err(KernelError::Corruption("id file namespace count mismatch"));
    }
    let stored = u32::from_be_bytes(read4(&image[ID_CRC]));
    if stored != image_crc32(salt, &image[..ID_SLOTS_END]) {
        return Err(KernelError::Corruption("id file checksum mismatch"));
    }
    let mut raw = [0u64; EntityKind::COUNT];
    for (slot, value) in raw.iter_mut().enumerate() {
        let start = ID_SLOTS_START + slot * 8;
        *value = u64::from_be_bytes(read8(&image[start..start + 8]));
    }
    Ok((salt, HighIds::from_raw(raw)))
}

// Keyed by the magic and the per-file salt.
fn image_crc32(salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&ID_FILE_MAGIC);
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn read4(src: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&src[..4]);
    out
}

fn read8(src: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&src[..8]);
    out
}
