// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable trailer handling.
//!
//! Executables carry their metadata at the tail of the file as 32-bit
//! little-endian words counted backward from EOF: the signature at
//! EOF−4, the format version at EOF−8, and, for version 1, the data
//! length at EOF−12 and the program length at EOF−16. The lengths
//! partition the image into code and initialized data.

use byteorder::{ByteOrder, LittleEndian};
use nanoos_abi::{
    ExeMetadata, KernelError, EXE_SIGNATURE, EXE_SIGNATURE_OFFSET, EXE_VERSION_1,
    EXE_VERSION_OFFSET,
};

use crate::fs::BackingStore;

/// Size of a version-1 trailer in bytes.
const V1_TRAILER_SIZE: u32 = 16;

fn read_word_from_end(
    store: &mut dyn BackingStore,
    file_size: u32,
    back: u32,
) -> Result<u32, KernelError> {
    if file_size < back {
        return Err(KernelError::InvalidArgument);
    }
    let mut word = [0u8; 4];
    let got = store.read_at(file_size - back, &mut word)?;
    if got != 4 {
        return Err(KernelError::Io);
    }
    Ok(LittleEndian::read_u32(&word))
}

/// Reads and validates an executable's trailer. `NotFound` means the
/// file is not one of ours; `InvalidArgument` means the signature is
/// good but the version is not understood.
pub fn read_metadata(store: &mut dyn BackingStore) -> Result<ExeMetadata, KernelError> {
    let file_size = store.len()?;
    if file_size < V1_TRAILER_SIZE {
        return Err(KernelError::NotFound);
    }

    let signature = read_word_from_end(store, file_size, EXE_SIGNATURE_OFFSET)?;
    if signature != EXE_SIGNATURE {
        return Err(KernelError::NotFound);
    }

    let version = read_word_from_end(store, file_size, EXE_VERSION_OFFSET)?;
    if version != EXE_VERSION_1 {
        return Err(KernelError::InvalidArgument);
    }

    Ok(ExeMetadata {
        data_length: read_word_from_end(store, file_size, 12)?,
        program_length: read_word_from_end(store, file_size, 16)?,
    })
}

/// Appends a version-1 trailer describing an image whose first
/// `program_length` bytes are code and whose next `data_length` bytes
/// are initialized data. This is the write side the packaging utility
/// uses.
pub fn write_v1_trailer(
    store: &mut dyn BackingStore,
    program_length: u32,
    data_length: u32,
) -> Result<(), KernelError> {
    let file_size = store.len()?;
    let mut trailer = [0u8; V1_TRAILER_SIZE as usize];
    LittleEndian::write_u32(&mut trailer[0..4], program_length);
    LittleEndian::write_u32(&mut trailer[4..8], data_length);
    LittleEndian::write_u32(&mut trailer[8..12], EXE_VERSION_1);
    LittleEndian::write_u32(&mut trailer[12..16], EXE_SIGNATURE);
    store.write_at(file_size, &trailer)
}
