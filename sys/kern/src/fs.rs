// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem seam.
//!
//! The actual filesystem (FAT16 over the SD-card driver in the reference
//! system) is an external collaborator; the kernel only needs
//! open-or-create by name, remove, and positioned I/O on an open file.
//! Two implementations are provided: one over the host filesystem and an
//! in-memory one used by tests and hermetic deployments.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use nanoos_abi::KernelError;

/// An open backing file. Offsets are 32-bit because every consumer in the
/// kernel addresses segments with 32-bit offsets.
pub trait BackingStore {
    /// Reads up to `buf.len()` bytes at `offset`. Short reads happen at
    /// end of file; reads entirely past the end return 0.
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, KernelError>;

    /// Writes all of `buf` at `offset`, extending the file as needed.
    fn write_at(&mut self, offset: u32, buf: &[u8]) -> Result<(), KernelError>;

    /// Current file length in bytes.
    fn len(&mut self) -> Result<u32, KernelError>;
}

/// What the kernel asks of the filesystem process: open-or-create and
/// remove, both by name.
pub trait Filesystem {
    fn open(&mut self, name: &str) -> Result<Box<dyn BackingStore>, KernelError>;
    fn remove(&mut self, name: &str) -> Result<(), KernelError>;
}

/// Block size used by [`fcopy`] when shuttling data between files.
pub const FCOPY_BLOCK_SIZE: usize = 512;

/// Copies `length` bytes between backing files in [`FCOPY_BLOCK_SIZE`]
/// chunks. A `None` source writes zeros, which is how segments are grown.
/// Returns the number of bytes written to the destination; a real source
/// that runs out early stops the copy there.
pub fn fcopy(
    src: Option<(&mut dyn BackingStore, u32)>,
    dst: (&mut dyn BackingStore, u32),
    length: u32,
) -> Result<u32, KernelError> {
    let (dst_file, dst_start) = dst;
    let mut block = [0u8; FCOPY_BLOCK_SIZE];
    let mut copied = 0u32;

    match src {
        None => {
            while copied < length {
                let chunk = (length - copied).min(FCOPY_BLOCK_SIZE as u32);
                dst_file.write_at(dst_start + copied, &block[..chunk as usize])?;
                copied += chunk;
            }
        }
        Some((src_file, src_start)) => {
            while copied < length {
                let chunk = (length - copied).min(FCOPY_BLOCK_SIZE as u32) as usize;
                let got = src_file.read_at(src_start + copied, &mut block[..chunk])?;
                if got == 0 {
                    break;
                }
                dst_file.write_at(dst_start + copied, &block[..got])?;
                copied += got as u32;
            }
        }
    }

    Ok(copied)
}

/// A backing file on the host filesystem.
pub struct HostFile {
    file: std::fs::File,
}

impl BackingStore for HostFile {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.file
            .seek(SeekFrom::Start(u64::from(offset)))
            .map_err(|_| KernelError::Io)?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => return Err(KernelError::Io),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u32, buf: &[u8]) -> Result<(), KernelError> {
        let end = u64::from(offset);
        let len = self.file.metadata().map_err(|_| KernelError::Io)?.len();
        if len < end {
            // Positioned writes past EOF leave an implicit gap; make the
            // zero fill explicit so short files read back consistently.
            self.file.set_len(end).map_err(|_| KernelError::Io)?;
        }
        self.file
            .seek(SeekFrom::Start(end))
            .map_err(|_| KernelError::Io)?;
        self.file.write_all(buf).map_err(|_| KernelError::Io)
    }

    fn len(&mut self) -> Result<u32, KernelError> {
        let len = self.file.metadata().map_err(|_| KernelError::Io)?.len();
        u32::try_from(len).map_err(|_| KernelError::Io)
    }
}

/// Host-directory filesystem: every kernel file name maps to an entry in
/// one root directory.
pub struct HostFilesystem {
    root: std::path::PathBuf,
}

impl HostFilesystem {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> std::path::PathBuf {
        // Kernel file names are flat 8.3-style names; strip any leading
        // directory so "/etc/hostname" lands in the root as "hostname".
        let flat = name.rsplit('/').next().unwrap_or(name);
        self.root.join(flat)
    }
}

impl Filesystem for HostFilesystem {
    fn open(&mut self, name: &str) -> Result<Box<dyn BackingStore>, KernelError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(name))
            .map_err(|_| KernelError::Io)?;
        Ok(Box::new(HostFile { file }))
    }

    fn remove(&mut self, name: &str) -> Result<(), KernelError> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KernelError::NotFound)
            }
            Err(_) => Err(KernelError::Io),
        }
    }
}

type SharedBytes = Rc<RefCell<Vec<u8>>>;

/// In-memory filesystem. Opening the same name twice yields handles onto
/// the same bytes, which the virtual memory layer relies on when a
/// program file doubles as a data segment.
#[derive(Default)]
pub struct RamDisk {
    files: Rc<RefCell<HashMap<String, SharedBytes>>>,
}

impl RamDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file with the given contents, replacing any previous one.
    pub fn install(&mut self, name: &str, contents: &[u8]) {
        self.files
            .borrow_mut()
            .insert(name.to_string(), Rc::new(RefCell::new(contents.to_vec())));
    }

    /// Snapshot of a file's contents, if it exists.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .borrow()
            .get(name)
            .map(|bytes| bytes.borrow().clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.borrow().contains_key(name)
    }

    /// A second handle onto the same disk, for tests that keep one side
    /// while the kernel owns the other.
    pub fn handle(&self) -> Self {
        Self {
            files: Rc::clone(&self.files),
        }
    }
}

struct RamFile {
    bytes: SharedBytes,
}

impl BackingStore for RamFile {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, KernelError> {
        let bytes = self.bytes.borrow();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let available = bytes.len() - offset;
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&bytes[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&mut self, offset: u32, buf: &[u8]) -> Result<(), KernelError> {
        let mut bytes = self.bytes.borrow_mut();
        let offset = offset as usize;
        let end = offset + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&mut self) -> Result<u32, KernelError> {
        u32::try_from(self.bytes.borrow().len()).map_err(|_| KernelError::Io)
    }
}

impl Filesystem for RamDisk {
    fn open(&mut self, name: &str) -> Result<Box<dyn BackingStore>, KernelError> {
        let mut files = self.files.borrow_mut();
        let bytes = files
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(RefCell::new(Vec::new())));
        Ok(Box::new(RamFile {
            bytes: Rc::clone(bytes),
        }))
    }

    fn remove(&mut self, name: &str) -> Result<(), KernelError> {
        self.files
            .borrow_mut()
            .remove(name)
            .map(|_| ())
            .ok_or(KernelError::NotFound)
    }
}
