#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use super::registry::RawRelTypeData;
use crate::primitives::io::StdFileIo;
use crate::primitives::window::{Buffer, WindowPool};
use crate::types::{FileId, KernelError, RelTypeId, Result};

/// File id of the relationship type store inside the window pool.
pub const RELTYPE_FILE: FileId = FileId(1);
/// File name of the relationship type store.
pub const RELTYPE_STORE_NAME: &str = "reltypes.store";
/// Size of one relationship type record.
pub const RECORD_SIZE: usize = 64;
/// Longest name a record can hold.
pub const NAME_CAPACITY: usize = RECORD_SIZE - 9;

const RECORD_FREE: u8 = 0;
const RECORD_IN_USE: u8 = 1;
const RECORD_PENDING: u8 = 2;

/// Fixed-size records `[in_use:u8][id:u32][name_len:u32][name]`, record index = id.
///
/// A record written by an uncommitted creation carries the pending flag and
/// reads as free until its transaction commits.
pub struct RelTypeStore {
    windows: Arc<WindowPool>,
}

impl RelTypeStore {
    /// Registers the store file at `path` with `windows`.
    pub fn open(windows: Arc<WindowPool>, path: impl AsRef<Path>) -> Result<Self> {
        let io = StdFileIo::open(path.as_ref())?;
        windows.register_file(RELTYPE_FILE, Arc::new(io), RECORD_SIZE)?;
        Ok(Self { windows })
    }

    /// Writes the committed record for `id`.
    pub fn write(&self, id: RelTypeId, name: &str) -> Result<()> {
        self.put_record(id, name, RECORD_IN_USE)
    }

    /// Writes the record for `id` flagged pending.
    pub fn write_pending(&self, id: RelTypeId, name: &str) -> Result<()> {
        self.put_record(id, name, RECORD_PENDING)
    }

    fn put_record(&self, id: RelTypeId, name: &str, flag: u8) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() > NAME_CAPACITY {
            return Err(KernelError::Invalid(
                "relationship type name exceeds record capacity",
            ));
        }
        self.windows
            .with_record_mut(RELTYPE_FILE, u64::from(id.0), |buf| {
                buf.put_u8(flag)?
                    .put_u32(id.0)?
                    .put_u32(bytes.len() as u32)?
                    .put_bytes(bytes)?
                    .put_zeros(NAME_CAPACITY - bytes.len())?;
                Ok(())
            })?;
        trace!(%id, name, flag, "reltype_store.write");
        Ok(())
    }

    /// Marks the record for `id` free.
    pub fn clear(&self, id: RelTypeId) -> Result<()> {
        self.windows
            .with_record_mut(RELTYPE_FILE, u64::from(id.0), |buf| {
                buf.put_u8(RECORD_FREE)?.put_zeros(RECORD_SIZE - 1)?;
                Ok(())
            })?;
        trace!(%id, "reltype_store.clear");
        Ok(())
    }

    /// Reads the record for `id`; `None` when free or pending.
    pub fn read(&self, id: RelTypeId) -> Result<Option<RawRelTypeData>> {
        self.windows
            .with_record(RELTYPE_FILE, u64::from(id.0), decode_record)
    }

    /// Reads every in-use record persisted in the file.
    pub fn load_all(&self) -> Result<Vec<RawRelTypeData>> {
        let records = self.windows.persisted_records(RELTYPE_FILE)?;
        let mut out = Vec::new();
        for index in 0..records {
            let id = u32::try_from(index)
                .map_err(|_| KernelError::Corruption("relationship type store too large"))?;
            if let Some(raw) = self.read(RelTypeId(id))? {
                if raw.id.0 != id {
                    return Err(KernelError::Corruption(
                        "relationship type record id does not match its slot",
                    ));
                }
                out.push(raw);
            }
        }
        debug!(records, loaded = out.len(), "reltype_store.load_all");
        Ok(out)
    }
}

fn decode_record(buf: &mut Buffer<&[u8]>) -> Result<Option<RawRelTypeData>> {
    match buf.get_u8()? {
        RECORD_FREE | RECORD_PENDING => return Ok(None),
        RECORD_IN_USE => {}
        _ => return Err(KernelError::Corruption("invalid relationship type in-use flag")),
    }
    let id = buf.get_u32()?;
    let len = buf.get_u32()? as usize;
    if len > NAME_CAPACITY {
        return Err(KernelError::Corruption("relationship type name length out of range"));
    }
    let mut name = [0u8; NAME_CAPACITY];
    buf.get_bytes_range(&mut name, 0, len)?;
    let name = std::str::from_utf8(&name[..len])
        .map_err(|_| KernelError::Corruption("relationship type name is not utf-8"))?;
    Ok(Some(RawRelTypeData::new(RelTypeId(id), name)))
}
