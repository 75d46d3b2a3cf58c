#![allow(clippy::all)]

use std::sync::{Arc, Once};

use graphkern::{
    primitives::{
        io::{FileIo, StdFileIo},
        window::{Buffer, Synchronous, WindowOptions, WindowPool},
    },
    types::{FileId, KernelError, Result},
};
use proptest::prelude::*;
use tracing_subscriber::EnvFilter;

const DATA: FileId = FileId(7);
const RECORD: usize = 16;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("graphkern=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn pool(path: &std::path::Path, cache_windows: usize) -> Result<(WindowPool, Arc<StdFileIo>)> {
    let io = Arc::new(StdFileIo::open(path)?);
    let pool = WindowPool::new(WindowOptions {
        records_per_window: 4,
        cache_windows,
        synchronous: Synchronous::Full,
    })?;
    pool.register_file(DATA, io.clone(), RECORD)?;
    Ok((pool, io))
}

#[test]
fn records_survive_eviction_and_reopen() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("data.store");
    {
        let (pool, _) = pool(&path, 2)?;
        for record in 0..32u64 {
            pool.with_record_mut(DATA, record, |buf| {
                buf.put_u64(record * 3)?.put_i64(-(record as i64))?;
                Ok(())
            })?;
        }
        assert!(pool.resident() <= 2);
        assert!(pool.stats().evictions > 0);
        pool.close()?;
    }
    let (pool, io) = pool(&path, 2)?;
    assert_eq!(io.len()?, 32 * RECORD as u64);
    assert_eq!(pool.persisted_records(DATA)?, 32);
    for record in (0..32u64).rev() {
        let (a, b) = pool.with_record(DATA, record, |buf| Ok((buf.get_u64()?, buf.get_i64()?)))?;
        assert_eq!(a, record * 3);
        assert_eq!(b, -(record as i64));
    }
    Ok(())
}

#[test]
fn buffer_is_confined_to_its_window() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let (pool, _) = pool(&dir.path().join("data.store"), 4)?;
    let err = pool
        .with_record_mut(DATA, 3, |buf| {
            buf.put_bytes(&[0xAB; RECORD])?;
            buf.put_u8(1)?;
            Ok(())
        })
        .unwrap_err();
    match err {
        KernelError::BufferBounds {
            position,
            offset,
            width,
            capacity,
        } => {
            assert_eq!(position, 0);
            assert_eq!(offset, 4 * RECORD);
            assert_eq!(width, 1);
            assert_eq!(capacity, 4 * RECORD);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let first = pool.with_record(DATA, 4, |buf| buf.get_u8())?;
    assert_eq!(first, 0);
    Ok(())
}

#[test]
fn read_past_eof_is_zero_filled() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let (pool, io) = pool(&dir.path().join("data.store"), 4)?;
    let value = pool.with_record(DATA, 1_000, |buf| buf.get_u64())?;
    assert_eq!(value, 0);
    assert_eq!(io.len()?, 0);
    Ok(())
}

proptest! {
    #[test]
    fn put_get_round_trip(offset in 0usize..56, a in any::<u8>(), b in any::<i32>(), c in any::<u64>()) {
        let mut bytes = vec![0u8; 64];
        let mut buf = Buffer::new(bytes.as_mut_slice(), 512);
        let width = 1 + 4 + 8;
        prop_assume!(offset + width <= 64);
        buf.set_offset(offset).unwrap();
        buf.put_u8(a).unwrap().put_i32(b).unwrap().put_u64(c).unwrap();
        buf.set_offset(offset).unwrap();
        prop_assert_eq!(buf.get_u8().unwrap(), a);
        prop_assert_eq!(buf.get_i32().unwrap(), b);
        prop_assert_eq!(buf.get_u64().unwrap(), c);
        prop_assert_eq!(buf.offset(), offset + width);
    }

    #[test]
    fn out_of_range_access_leaves_cursor(start in 0usize..=64, width in prop::sample::select(vec![1usize, 4, 8])) {
        let bytes = vec![0u8; 64];
        let mut buf = Buffer::new(bytes.as_slice(), 0);
        buf.set_offset(start).unwrap();
        let result = match width {
            1 => buf.get_u8().map(u64::from),
            4 => buf.get_u32().map(u64::from),
            _ => buf.get_u64(),
        };
        if start + width > 64 {
            let is_bounds = matches!(result, Err(KernelError::BufferBounds { .. }));
            prop_assert!(is_bounds);
            prop_assert_eq!(buf.offset(), start);
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(buf.offset(), start + width);
        }
    }
}
