// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File-backed virtual memory segments.
//!
//! A segment presents a large byte-addressable memory out of a single
//! small RAM page cached against a backing file. At most one page is
//! resident; a dirty page is written back before another is loaded. The
//! cached window is aligned to half the cache size so that a multi-byte
//! access near the top of a window never runs off the end of the cache.

use byteorder::{ByteOrder, LittleEndian};
use nanoos_abi::KernelError;

use crate::fs::{fcopy, BackingStore, Filesystem};

/// Granularity, in bytes, of backing-file growth.
pub const VIRTUAL_MEMORY_PAGE_SIZE: u32 = 512;

/// A file-backed memory segment with a single cached page.
pub struct VirtualMemory {
    file: Box<dyn BackingStore>,
    /// Logical size: the largest offset ever prepared for access. The
    /// physical file may be larger because growth is page-aligned.
    file_size: u32,
    cache: Box<[u8]>,
    buffer_base_offset: u32,
    buffer_valid_bytes: u32,
    dirty: bool,
}

impl VirtualMemory {
    /// Opens (creating if absent) `name` on `fs` as a segment with a
    /// `cache_bytes` page cache. A zero-byte cache is legal; only the
    /// bulk operations and [`copy`] may be used on such a segment.
    pub fn open(
        fs: &mut dyn Filesystem,
        name: &str,
        cache_bytes: usize,
    ) -> Result<Self, KernelError> {
        let file = fs.open(name)?;
        Self::with_store(file, cache_bytes)
    }

    /// Wraps an already-open backing file.
    pub fn with_store(
        mut file: Box<dyn BackingStore>,
        cache_bytes: usize,
    ) -> Result<Self, KernelError> {
        let file_size = file.len()?;
        Ok(Self {
            file,
            file_size,
            cache: vec![0u8; cache_bytes].into_boxed_slice(),
            buffer_base_offset: 0,
            buffer_valid_bytes: 0,
            dirty: false,
        })
    }

    /// Logical size of the segment in bytes.
    pub fn size(&self) -> u32 {
        self.file_size
    }

    /// Overrides the logical size. Used after an image copy to mark the
    /// populated extent of a segment.
    pub fn set_size(&mut self, size: u32) {
        self.file_size = size;
    }

    /// Flushes a dirty cache and closes the segment.
    pub fn close(mut self) -> Result<(), KernelError> {
        self.write_back()
    }

    fn write_back(&mut self) -> Result<(), KernelError> {
        if self.dirty {
            self.file.write_at(
                self.buffer_base_offset,
                &self.cache[..self.buffer_valid_bytes as usize],
            )?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Writes back a dirty page, clears the cache, and guarantees the
    /// backing file covers `end_offset`, growing it with zeros in
    /// page-aligned steps.
    fn prepare(&mut self, end_offset: u32) -> Result<(), KernelError> {
        self.write_back()?;
        self.cache.fill(0);

        if self.file_size < end_offset {
            let mut length = end_offset - self.file_size;
            if length & (VIRTUAL_MEMORY_PAGE_SIZE - 1) != 0 {
                length &= !(VIRTUAL_MEMORY_PAGE_SIZE - 1);
                length += VIRTUAL_MEMORY_PAGE_SIZE;
            }
            fcopy(None, (self.file.as_mut(), self.file_size), length)?;
            self.file_size = end_offset;
        }

        Ok(())
    }

    /// Makes `offset` resident and returns its index into the cache.
    ///
    /// The loaded window starts at `(offset / half_cache) * half_cache`,
    /// which puts `offset` in the lower half of the window.
    fn get(&mut self, offset: u32) -> Result<usize, KernelError> {
        if self.cache.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        if offset >= self.buffer_base_offset
            && offset < self.buffer_base_offset + self.buffer_valid_bytes
        {
            return Ok((offset - self.buffer_base_offset) as usize);
        }

        let cache_len = self.cache.len() as u32;
        self.prepare(offset + cache_len)?;

        let half = (cache_len >> 1).max(1);
        self.buffer_base_offset = (offset / half) * half;
        self.buffer_valid_bytes =
            self.file.read_at(self.buffer_base_offset, &mut self.cache)? as u32;

        if self.buffer_valid_bytes == 0 {
            return Err(KernelError::Io);
        }

        Ok((offset - self.buffer_base_offset) as usize)
    }

    /// Like [`get`], but also checks that a `width`-byte access fits in
    /// the cache. With half-cache window alignment this only fails when
    /// the cache is smaller than twice the access width.
    fn get_for_width(&mut self, offset: u32, width: usize) -> Result<usize, KernelError> {
        let index = self.get(offset)?;
        if index + width > self.cache.len() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(index)
    }

    pub fn read8(&mut self, offset: u32) -> Result<u8, KernelError> {
        let index = self.get_for_width(offset, 1)?;
        Ok(self.cache[index])
    }

    pub fn read16(&mut self, offset: u32) -> Result<u16, KernelError> {
        let index = self.get_for_width(offset, 2)?;
        Ok(LittleEndian::read_u16(&self.cache[index..]))
    }

    pub fn read32(&mut self, offset: u32) -> Result<u32, KernelError> {
        let index = self.get_for_width(offset, 4)?;
        Ok(LittleEndian::read_u32(&self.cache[index..]))
    }

    pub fn read64(&mut self, offset: u32) -> Result<u64, KernelError> {
        let index = self.get_for_width(offset, 8)?;
        Ok(LittleEndian::read_u64(&self.cache[index..]))
    }

    pub fn write8(&mut self, offset: u32, value: u8) -> Result<(), KernelError> {
        let index = self.get_for_width(offset, 1)?;
        self.cache[index] = value;
        self.dirty = true;
        Ok(())
    }

    pub fn write16(&mut self, offset: u32, value: u16) -> Result<(), KernelError> {
        let index = self.get_for_width(offset, 2)?;
        LittleEndian::write_u16(&mut self.cache[index..], value);
        self.dirty = true;
        Ok(())
    }

    pub fn write32(&mut self, offset: u32, value: u32) -> Result<(), KernelError> {
        let index = self.get_for_width(offset, 4)?;
        LittleEndian::write_u32(&mut self.cache[index..], value);
        self.dirty = true;
        Ok(())
    }

    pub fn write64(&mut self, offset: u32, value: u64) -> Result<(), KernelError> {
        let index = self.get_for_width(offset, 8)?;
        LittleEndian::write_u64(&mut self.cache[index..], value);
        self.dirty = true;
        Ok(())
    }

    /// Reads `buffer.len()` bytes at `offset` straight from the backing
    /// file, bypassing (and invalidating) the page cache. Returns the
    /// number of bytes read.
    pub fn bulk_read(&mut self, offset: u32, buffer: &mut [u8]) -> Result<usize, KernelError> {
        if buffer.is_empty() {
            return Ok(0);
        }
        self.prepare(offset + buffer.len() as u32)?;
        self.buffer_valid_bytes = 0;
        self.buffer_base_offset = 0;
        self.file.read_at(offset, buffer)
    }

    /// Writes `buffer` at `offset` straight to the backing file,
    /// bypassing (and invalidating) the page cache.
    pub fn bulk_write(&mut self, offset: u32, buffer: &[u8]) -> Result<(), KernelError> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.prepare(offset + buffer.len() as u32)?;
        self.buffer_valid_bytes = 0;
        self.buffer_base_offset = 0;
        self.file.write_at(offset, buffer)
    }

    /// Copies `length` bytes (rounded up to a whole page) from `src` to
    /// `dst` at the filesystem level. Both caches are flushed and
    /// invalidated first. Returns the number of bytes copied.
    pub fn copy(
        src: &mut VirtualMemory,
        src_start: u32,
        dst: &mut VirtualMemory,
        dst_start: u32,
        length: u32,
    ) -> Result<u32, KernelError> {
        if src.buffer_valid_bytes > 0 {
            src.file.write_at(
                src.buffer_base_offset,
                &src.cache[..src.buffer_valid_bytes as usize],
            )?;
        }
        src.buffer_valid_bytes = 0;
        src.buffer_base_offset = 0;
        src.dirty = false;

        if dst.buffer_valid_bytes > 0 {
            dst.file.write_at(
                dst.buffer_base_offset,
                &dst.cache[..dst.buffer_valid_bytes as usize],
            )?;
        }
        dst.buffer_valid_bytes = 0;
        dst.buffer_base_offset = 0;
        dst.dirty = false;

        let mut length = length;
        if length & (VIRTUAL_MEMORY_PAGE_SIZE - 1) != 0 {
            length &= !(VIRTUAL_MEMORY_PAGE_SIZE - 1);
            length += VIRTUAL_MEMORY_PAGE_SIZE;
        }

        let copied = fcopy(
            Some((src.file.as_mut(), src_start)),
            (dst.file.as_mut(), dst_start),
            length,
        )?;

        if copied > 0 {
            let end_offset = dst_start + copied;
            if end_offset > dst.file_size {
                dst.file_size = end_offset;
            }
        }

        Ok(copied)
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        // Best effort; the explicit close path reports errors.
        let _ = self.write_back();
    }
}
