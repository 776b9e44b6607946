// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RV32IM virtual machine.
//!
//! Guest programs run as ordinary scheduled processes. The 32-bit guest
//! address space is split into segment windows by the top byte of the
//! address: window 0 holds the program image (addresses at or past the
//! executable's data start resolve to the data segment, a second cache
//! window over the same backing file), window 1 is the downward-growing
//! stack, and window 2 is mapped I/O masked to a CLINT-style register
//! block. Each window is a file-backed virtual memory segment, so the
//! guest gets a 32-bit address space out of a few dozen bytes of cache.

use nanoos_abi::{GuestFault, KernelError, MisaFlags, ProcessId};

use crate::exe;
use crate::fs::Filesystem;
use crate::vmem::VirtualMemory;

mod exec;
mod syscall;

pub use exec::Control;
pub use syscall::{spawn_rv32, VmProcess};

pub const RV32_INSTRUCTION_SIZE: u32 = 4;
/// Load address of the first program byte.
pub const RV32_PROGRAM_START: u32 = 0x1000;
/// Size of one segment window.
pub const RV32_MEMORY_SIZE: u32 = 0x100_0000;
/// Top of the guest stack; the stack occupies window 1 and grows down.
pub const RV32_STACK_START: u32 = 2 * RV32_MEMORY_SIZE;
/// Window selector: segment index = address >> shift.
pub const RV32_MEMORY_SEGMENT_SHIFT: u32 = 24;
/// Mapped-I/O offsets are masked into a 64 KiB CLINT-style block.
pub const RV32_CLINT_ADDR_MASK: u32 = 0xFFFF;
/// CLINT machine-time register offset (low word; high word at +4).
/// Other offsets in the block, timer-compare included, read and write
/// straight through to the mapped segment file.
pub const RV32_CLINT_MTIME: u32 = 0xBFF8;

/// Guest instructions executed per scheduler tick before yielding.
pub const VM_INSTRUCTIONS_PER_SLICE: u32 = 128;

const PROGRAM_MEMORY: usize = 0;
const STACK_MEMORY: usize = 1;
const MAPPED_MEMORY: usize = 2;
const DATA_MEMORY: usize = 3;

const PROGRAM_CACHE_BYTES: usize = 128;
const DATA_CACHE_BYTES: usize = 128;
const STACK_CACHE_BYTES: usize = 32;
const MAP_CACHE_BYTES: usize = 32;

/// State of a single virtual RV32IM core: the integer register file,
/// the program counter, and the machine-level CSRs.
#[derive(Clone, Debug, Default)]
pub struct Rv32Core {
    pub x: [u32; 32],
    pub pc: u32,
    pub mstatus: u32,
    pub misa: u32,
    pub mie: u32,
    pub mtvec: u32,
    pub mscratch: u32,
    pub mepc: u32,
    pub mcause: u32,
    pub mtval: u32,
    pub mip: u32,
}

/// Full state needed to run one guest: core registers plus the four
/// segment windows and the data-window bounds parsed from the
/// executable trailer.
pub struct Rv32Vm {
    pub(crate) core: Rv32Core,
    segments: [VirtualMemory; 4],
    data_start: u32,
    data_end: u32,
    pub(crate) running: bool,
    pub(crate) exit_code: i32,
    /// Kernel time snapshot backing the CLINT mtime register.
    time_millis: u64,
    phy_file: String,
    stack_file: String,
}

impl Rv32Vm {
    /// Loads `path` as a guest: validates the trailer, copies the image
    /// into the per-process physical-memory file, and opens the stack
    /// and mapped-I/O segments. Segment files are named after the PID.
    pub fn load(
        fs: &mut dyn Filesystem,
        pid: ProcessId,
        path: &str,
    ) -> Result<Self, KernelError> {
        let mut raw_binary = fs.open(path)?;
        let metadata = exe::read_metadata(raw_binary.as_mut())?;
        let mut program_binary = VirtualMemory::with_store(raw_binary, 0)?;

        let phy_file = format!("pid{}phy.mem", pid.0);
        let stack_file = format!("pid{}stk.mem", pid.0);
        let map_file = format!("pid{}map.mem", pid.0);

        let mut program = VirtualMemory::open(fs, &phy_file, PROGRAM_CACHE_BYTES)?;
        let mut data = VirtualMemory::open(fs, &phy_file, DATA_CACHE_BYTES)?;

        // One copy places both the code and the initialized data; the
        // two windows just cache different parts of the same file.
        let image_size = program_binary.size();
        let copied = VirtualMemory::copy(
            &mut program_binary,
            0,
            &mut program,
            RV32_PROGRAM_START,
            image_size,
        )?;
        if copied < image_size {
            return Err(KernelError::Io);
        }
        program.set_size(RV32_PROGRAM_START + image_size);
        data.set_size(RV32_PROGRAM_START + image_size);
        program_binary.close()?;

        let data_start = RV32_PROGRAM_START + metadata.program_length;
        let data_end = data_start + metadata.data_length;

        // Prime both cache windows on their own halves of the image.
        let _ = program.read8(RV32_PROGRAM_START)?;
        if metadata.data_length > 0 {
            let _ = data.read8(data_start)?;
        }

        let mut stack = VirtualMemory::open(fs, &stack_file, STACK_CACHE_BYTES)?;
        let _ = stack.write8(0, 0)?;

        let mapped = VirtualMemory::open(fs, &map_file, MAP_CACHE_BYTES)?;

        let mut core = Rv32Core::default();
        core.misa =
            (MisaFlags::MXL_32 | MisaFlags::I_EXT | MisaFlags::M_EXT).bits();
        core.pc = RV32_PROGRAM_START;
        core.x[2] = RV32_STACK_START;

        Ok(Self {
            core,
            segments: [program, stack, mapped, data],
            data_start,
            data_end,
            running: true,
            exit_code: 0,
            time_millis: 0,
            phy_file,
            stack_file,
        })
    }

    /// Removes the scratch segment files for a PID without needing a
    /// loaded VM. Used when a process image is replaced in place.
    pub fn remove_scratch_files(fs: &mut dyn Filesystem, pid: ProcessId) {
        let _ = fs.remove(&format!("pid{}phy.mem", pid.0));
        let _ = fs.remove(&format!("pid{}stk.mem", pid.0));
    }

    /// Releases the segments. The physical-memory and stack files are
    /// scratch and get removed; the mapped-I/O file is kept.
    pub fn cleanup(self, fs: &mut dyn Filesystem) {
        let Self {
            segments,
            phy_file,
            stack_file,
            ..
        } = self;
        for segment in segments {
            if segment.close().is_err() {
                log::debug!("vm: segment close failed during cleanup");
            }
        }
        let _ = fs.remove(&phy_file);
        let _ = fs.remove(&stack_file);
    }

    pub fn core(&self) -> &Rv32Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Rv32Core {
        &mut self.core
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// End of the initialized data window, as declared by the trailer.
    pub fn data_end(&self) -> u32 {
        self.data_end
    }

    /// Refreshes the time value mirrored at the CLINT mtime offset.
    pub fn set_time_millis(&mut self, millis: u64) {
        self.time_millis = millis;
    }

    /// Maps a guest address to a segment index and an offset within its
    /// backing file.
    ///
    /// Stack addresses are flipped: the aligned word holding the
    /// address lands at `STACK_START - word_base - 4`, with byte order
    /// preserved inside the word, so the file grows as the stack does.
    fn resolve(&self, address: u32) -> Result<(usize, u32), GuestFault> {
        match address >> RV32_MEMORY_SEGMENT_SHIFT {
            0 => {
                if address >= self.data_start {
                    Ok((DATA_MEMORY, address))
                } else {
                    Ok((PROGRAM_MEMORY, address))
                }
            }
            1 => {
                let word_base = address & !3;
                let offset =
                    (RV32_STACK_START - word_base - RV32_INSTRUCTION_SIZE) | (address & 3);
                Ok((STACK_MEMORY, offset))
            }
            2 => Ok((MAPPED_MEMORY, address & RV32_CLINT_ADDR_MASK)),
            _ => Err(GuestFault::MemoryAccess { address }),
        }
    }

    fn access_fault(address: u32) -> impl FnOnce(KernelError) -> GuestFault {
        move |_| GuestFault::MemoryAccess { address }
    }

    pub fn read8(&mut self, address: u32) -> Result<u8, GuestFault> {
        let (segment, offset) = self.resolve(address)?;
        self.segments[segment]
            .read8(offset)
            .map_err(Self::access_fault(address))
    }

    pub fn read16(&mut self, address: u32) -> Result<u16, GuestFault> {
        let (segment, offset) = self.resolve(address)?;
        self.segments[segment]
            .read16(offset)
            .map_err(Self::access_fault(address))
    }

    pub fn read32(&mut self, address: u32) -> Result<u32, GuestFault> {
        let (segment, offset) = self.resolve(address)?;
        if segment == MAPPED_MEMORY {
            // The machine timer reads as the kernel clock, not as file
            // contents.
            if offset == RV32_CLINT_MTIME {
                return Ok(self.time_millis as u32);
            }
            if offset == RV32_CLINT_MTIME + 4 {
                return Ok((self.time_millis >> 32) as u32);
            }
        }
        self.segments[segment]
            .read32(offset)
            .map_err(Self::access_fault(address))
    }

    pub fn write8(&mut self, address: u32, value: u8) -> Result<(), GuestFault> {
        let (segment, offset) = self.resolve(address)?;
        self.segments[segment]
            .write8(offset, value)
            .map_err(Self::access_fault(address))
    }

    pub fn write16(&mut self, address: u32, value: u16) -> Result<(), GuestFault> {
        let (segment, offset) = self.resolve(address)?;
        self.segments[segment]
            .write16(offset, value)
            .map_err(Self::access_fault(address))
    }

    pub fn write32(&mut self, address: u32, value: u32) -> Result<(), GuestFault> {
        let (segment, offset) = self.resolve(address)?;
        self.segments[segment]
            .write32(offset, value)
            .map_err(Self::access_fault(address))
    }

    /// Copies a bounded run of guest bytes into a host buffer.
    pub fn read_bytes(&mut self, address: u32, length: u32) -> Result<Vec<u8>, GuestFault> {
        let mut bytes = Vec::with_capacity(length as usize);
        for i in 0..length {
            bytes.push(self.read8(address + i)?);
        }
        Ok(bytes)
    }

    /// Copies a host buffer into guest memory.
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), GuestFault> {
        for (i, byte) in bytes.iter().enumerate() {
            self.write8(address + i as u32, *byte)?;
        }
        Ok(())
    }

    /// Reads a NUL-terminated guest string of at most `max` bytes.
    pub fn read_cstring(&mut self, address: u32, max: u32) -> Result<Vec<u8>, GuestFault> {
        let mut bytes = Vec::new();
        for i in 0..max {
            let byte = self.read8(address + i)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(bytes)
    }

    fn fetch(&mut self) -> Result<u32, GuestFault> {
        let pc = self.core.pc;
        self.segments[PROGRAM_MEMORY]
            .read32(pc)
            .map_err(|_| GuestFault::MemoryAccess { address: pc })
    }

    /// Fetches and executes one instruction. `Control::Ecall` surfaces
    /// an environment call to the embedder with the PC already advanced
    /// past the ECALL.
    pub fn step(&mut self) -> Result<Control, GuestFault> {
        let instruction = self.fetch()?;
        self.core.x[0] = 0;
        exec::execute(self, instruction)
    }
}
