#![forbid(unsafe_code)]

use std::fmt;
use std::ops::Range;

use tracing::error;

use crate::types::{KernelError, Result};

/// Bounds-checked big-endian cursor over the bytes of one persistence window.
///
/// The offset is always relative to the window base. Every access checks that
/// `offset + width` stays within the window's capacity; a failed access leaves
/// the offset where it was. `Buffer<&[u8]>` is read-only, `Buffer<&mut [u8]>`
/// additionally exposes the `put_*` family.
pub struct Buffer<B> {
    bytes: B,
    position: u64,
    offset: usize,
}

impl<B: AsRef<[u8]>> Buffer<B> {
    /// Wraps `bytes`, the region of a window starting at file `position`.
    pub fn new(bytes: B, position: u64) -> Self {
        Self {
            bytes,
            position,
            offset: 0,
        }
    }

    /// File position of the window this buffer is tied to.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Current offset from the window position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the window region in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.as_ref().len()
    }

    /// Bytes left between the current offset and the end of the window.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.offset
    }

    /// Moves the cursor to `offset` bytes past the window position.
    pub fn set_offset(&mut self, offset: usize) -> Result<&mut Self> {
        if offset > self.capacity() {
            return Err(self.out_of_range(offset, 0));
        }
        self.offset = offset;
        Ok(self)
    }

    /// Reads one byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    /// Reads a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    /// Reads a big-endian `i32`.
    pub fn get_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_be_bytes)
    }

    /// Reads a big-endian `u64`.
    pub fn get_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_be_bytes)
    }

    /// Reads a big-endian `i64`.
    pub fn get_i64(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_be_bytes)
    }

    /// Fills `dst` completely.
    pub fn get_bytes(&mut self, dst: &mut [u8]) -> Result<&mut Self> {
        let len = dst.len();
        self.get_bytes_range(dst, 0, len)
    }

    /// Reads `length` bytes into `dst[offset..offset + length]`.
    pub fn get_bytes_range(
        &mut self,
        dst: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<&mut Self> {
        let target = sub_range(dst.len(), offset, length)?;
        let span = self.span(length)?;
        dst[target].copy_from_slice(&self.bytes.as_ref()[span.clone()]);
        self.offset = span.end;
        Ok(self)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let span = self.span(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes.as_ref()[span.clone()]);
        self.offset = span.end;
        Ok(out)
    }

    fn span(&self, width: usize) -> Result<Range<usize>> {
        match self.offset.checked_add(width) {
            Some(end) if end <= self.capacity() => Ok(self.offset..end),
            _ => Err(self.out_of_range(self.offset, width)),
        }
    }

    fn out_of_range(&self, offset: usize, width: usize) -> KernelError {
        error!(
            position = self.position,
            offset,
            width,
            capacity = self.capacity(),
            "illegal buffer position"
        );
        KernelError::BufferBounds {
            position: self.position,
            offset,
            width,
            capacity: self.capacity(),
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Buffer<B> {
    /// Writes one byte.
    pub fn put_u8(&mut self, value: u8) -> Result<&mut Self> {
        self.write_slice(&[value])
    }

    /// Writes a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> Result<&mut Self> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Writes a big-endian `i32`.
    pub fn put_i32(&mut self, value: i32) -> Result<&mut Self> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Writes a big-endian `u64`.
    pub fn put_u64(&mut self, value: u64) -> Result<&mut Self> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Writes a big-endian `i64`.
    pub fn put_i64(&mut self, value: i64) -> Result<&mut Self> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Writes all of `src`.
    pub fn put_bytes(&mut self, src: &[u8]) -> Result<&mut Self> {
        self.write_slice(src)
    }

    /// Writes `src[offset..offset + length]`.
    pub fn put_bytes_range(&mut self, src: &[u8], offset: usize, length: usize) -> Result<&mut Self> {
        let source = sub_range(src.len(), offset, length)?;
        self.write_slice(&src[source])
    }

    /// Writes `count` zero bytes.
    pub fn put_zeros(&mut self, count: usize) -> Result<&mut Self> {
        let span = self.span(count)?;
        self.bytes.as_mut()[span.clone()].fill(0);
        self.offset = span.end;
        Ok(self)
    }

    fn write_slice(&mut self, src: &[u8]) -> Result<&mut Self> {
        let span = self.span(src.len())?;
        self.bytes.as_mut()[span.clone()].copy_from_slice(src);
        self.offset = span.end;
        Ok(self)
    }
}

fn sub_range(len: usize, offset: usize, length: usize) -> Result<Range<usize>> {
    match offset.checked_add(length) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(KernelError::Invalid("array sub-range out of bounds")),
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("position", &self.position)
            .field("offset", &self.offset)
            .field("capacity", &self.capacity())
            .finish()
    }
}
