// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and everything that
//! talks to it: process identifiers, per-kernel-process command numbers,
//! error enumerations, the executable trailer format, the overlay header
//! format, and the guest system-call numbering.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};

/// The total number of concurrent processes the OS can run, including the
/// scheduler.
///
/// If this value is ever raised past 15, the owner field packed into a
/// memory node no longer has room for every PID plus the "unowned" marker
/// and must be widened first.
pub const NUM_PROCESSES: usize = 7;

/// The number of processes managed by the scheduler's queues. One fewer
/// than the total because the scheduler itself is never enqueued.
pub const SCHEDULER_NUM_PROCESSES: usize = NUM_PROCESSES - 1;

/// The total number of inter-process messages available to all processes.
pub const NUM_MESSAGES: usize = 6;

/// Number of slots in the per-process key/value storage.
pub const NUM_PROCESS_STORAGE_KEYS: usize = 1;

/// Per-process storage key reserved for the `fgets` line buffer.
pub const FGETS_CONSOLE_BUFFER_KEY: usize = 0;

/// Number of console ports the console process manages.
pub const NUM_CONSOLE_PORTS: usize = 2;

/// Number of file descriptors in a process's descriptor table.
/// Descriptors 0..3 are stdin, stdout and stderr.
pub const NUM_FILE_DESCRIPTORS: usize = 3;

/// Names a process slot.
///
/// PIDs are small dense integers in `[0, NUM_PROCESSES)`. PID 0 is the
/// scheduler; the other kernel processes have fixed well-known IDs so
/// that clients can address them without a lookup.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct ProcessId(pub u8);

impl ProcessId {
    /// The scheduler's own PID.
    pub const SCHEDULER: Self = Self(0);
    /// The console process.
    pub const CONSOLE: Self = Self(1);
    /// The memory manager process.
    pub const MEMORY_MANAGER: Self = Self(2);
    /// The SD-card block driver process (external collaborator).
    pub const SD_CARD: Self = Self(3);
    /// The filesystem process (external collaborator).
    pub const FILESYSTEM: Self = Self(4);
    /// The first PID available for user commands.
    pub const FIRST_USER: Self = Self(5);

    /// Returns this PID as a table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Checks whether this PID can name a process slot at all.
    pub fn is_valid(self) -> bool {
        self.index() < NUM_PROCESSES
    }
}

impl From<ProcessId> for u64 {
    fn from(pid: ProcessId) -> u64 {
        u64::from(pid.0)
    }
}

/// Numeric user identity. `ROOT` owns the system; `NONE` marks a process
/// slot with no logged-in owner.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct UserId(pub i16);

impl UserId {
    pub const ROOT: Self = Self(0);
    pub const NONE: Self = Self(-1);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::NONE
    }
}

/// Scheduling state of a process slot.
///
/// Every slot except the scheduler's own is in exactly one of the four
/// scheduler queues unless it is the currently running process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Slot is unallocated and sits on the *free* queue.
    Free,
    /// Runnable; on the *ready* queue.
    Ready,
    /// Currently executing. At most one process is in this state.
    Running,
    /// Blocked with no deadline; on the *waiting* queue.
    Waiting,
    /// Blocked with a deadline; on the *timed-waiting* queue.
    TimedWaiting,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::Free
    }
}

/// Commands understood by the scheduler's inter-process message handler.
///
/// The discriminants are the wire message-type values; handlers drop any
/// incoming type at or beyond [`NUM_SCHEDULER_COMMANDS`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum SchedulerCommand {
    RunProcess = 0,
    KillProcess = 1,
    GetNumRunningProcesses = 2,
    GetProcessInfo = 3,
    GetProcessUser = 4,
    SetProcessUser = 5,
    CloseAllFileDescriptors = 6,
    GetHostname = 7,
    Execve = 8,
}

pub const NUM_SCHEDULER_COMMANDS: u16 = 9;

impl core::convert::TryFrom<u16> for SchedulerCommand {
    type Error = ();

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::RunProcess),
            1 => Ok(Self::KillProcess),
            2 => Ok(Self::GetNumRunningProcesses),
            3 => Ok(Self::GetProcessInfo),
            4 => Ok(Self::GetProcessUser),
            5 => Ok(Self::SetProcessUser),
            6 => Ok(Self::CloseAllFileDescriptors),
            7 => Ok(Self::GetHostname),
            8 => Ok(Self::Execve),
            _ => Err(()),
        }
    }
}

/// Responses the scheduler sends back. Numbered after the commands so the
/// two spaces never collide in a process's queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum SchedulerResponse {
    /// Sent to a caller that launched a foreground process, once that
    /// process has completed. `data` carries the exit status.
    ProcessComplete = 9,
    /// Generic reply carrying a status or value for the accessor
    /// commands.
    Returning = 10,
}

/// Commands understood by the memory manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum MemoryManagerCommand {
    Realloc = 0,
    Free = 1,
    GetFreeMemory = 2,
    /// Restricted to the scheduler.
    FreeProcessMemory = 3,
}

pub const NUM_MEMORY_MANAGER_COMMANDS: u16 = 4;

impl core::convert::TryFrom<u16> for MemoryManagerCommand {
    type Error = ();

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Realloc),
            1 => Ok(Self::Free),
            2 => Ok(Self::GetFreeMemory),
            3 => Ok(Self::FreeProcessMemory),
            _ => Err(()),
        }
    }
}

/// Responses the memory manager sends back.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum MemoryManagerResponse {
    ReturningPointer = 4,
    ReturningFreeMemory = 5,
    ReturningStatus = 6,
}

/// Commands understood by the console process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ConsoleCommand {
    /// `func` = arena offset of the bytes, `data` = length. The console
    /// frees the buffer unless the sender is waiting on the message.
    Write = 0,
    AcquirePort = 1,
    ReleasePort = 2,
    SetEcho = 3,
}

pub const NUM_CONSOLE_COMMANDS: u16 = 4;

impl core::convert::TryFrom<u16> for ConsoleCommand {
    type Error = ();

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Write),
            1 => Ok(Self::AcquirePort),
            2 => Ok(Self::ReleasePort),
            3 => Ok(Self::SetEcho),
            _ => Err(()),
        }
    }
}

/// Responses the console process sends back.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ConsoleResponse {
    ReturningStatus = 4,
}

/// Commands understood by the filesystem process. The filesystem itself
/// is an external collaborator; these numbers define the seam.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum FilesystemCommand {
    OpenFile = 0,
    CloseFile = 1,
    ReadFile = 2,
    WriteFile = 3,
    SeekFile = 4,
    RemoveFile = 5,
    CopyFile = 6,
}

pub const NUM_FILESYSTEM_COMMANDS: u16 = 7;

/// Responses the filesystem process sends back.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum FilesystemResponse {
    Returning = 7,
}

/// Error kinds reported by kernel services.
///
/// The kernel never panics on these; they travel in replies (or as a null
/// pointer, in the memory manager's case) and the caller decides.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KernelError {
    /// Allocator exhausted.
    OutOfMemory,
    /// Filesystem or device read/write failed.
    Io,
    /// Null pointer, bad PID, unknown command.
    InvalidArgument,
    /// Message pool full or port already owned.
    Busy,
    /// File, process or overlay export missing.
    NotFound,
    /// Wait-for-reply exceeded its deadline.
    Timedout,
    /// A privileged call was attempted by a process other than the
    /// scheduler.
    PermissionDenied,
}

/// An unrecoverable condition detected in a VM guest. The host converts
/// these into a negative guest exit code and otherwise keeps running.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GuestFault {
    /// Invalid opcode or invalid funct encoding.
    IllegalInstruction { pc: u32, instruction: u32 },
    /// A load, store or fetch the paging engine refused.
    MemoryAccess { address: u32 },
    /// A CSR number outside the implemented machine-level set.
    UnsupportedCsr { csr: u32 },
    /// An ECALL with a number outside the syscall table.
    BadSyscall { number: u32 },
}

impl GuestFault {
    /// Exit code reported to the scheduler for a faulted guest.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::IllegalInstruction { .. } => -2,
            Self::MemoryAccess { .. } => -3,
            Self::UnsupportedCsr { .. } => -4,
            Self::BadSyscall { .. } => -5,
        }
    }
}

/// System calls available to RV32IM guest programs.
///
/// The guest places the number in `a7` and arguments in `a0`..`a6`;
/// results come back in `a0`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Syscall {
    Exit = 0,
    Write = 1,
    Read = 2,
    Open = 3,
    Close = 4,
    Seek = 5,
    NanoSleep = 6,
    TimespecGet = 7,
    SetEcho = 8,
    Exec = 9,
}

impl core::convert::TryFrom<u32> for Syscall {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Write),
            2 => Ok(Self::Read),
            3 => Ok(Self::Open),
            4 => Ok(Self::Close),
            5 => Ok(Self::Seek),
            6 => Ok(Self::NanoSleep),
            7 => Ok(Self::TimespecGet),
            8 => Ok(Self::SetEcho),
            9 => Ok(Self::Exec),
            _ => Err(()),
        }
    }
}

/// Guest stream sentinels, resolved through the owning process's file
/// descriptor table.
pub const STREAM_STDIN: u32 = 0;
pub const STREAM_STDOUT: u32 = 1;
pub const STREAM_STDERR: u32 = 2;

/// Longest single guest write the kernel will honor; longer requests are
/// truncated to this.
pub const MAX_WRITE_LENGTH: u32 = 128;

/// Directs one side of a file descriptor at a kernel process: reads or
/// writes on the descriptor become messages of `message_type` sent to
/// `process_id`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IoPipe {
    pub process_id: u8,
    pub message_type: u16,
}

impl IoPipe {
    pub const UNCONNECTED: Self = Self {
        process_id: u8::MAX,
        message_type: 0,
    };

    pub fn is_connected(&self) -> bool {
        usize::from(self.process_id) < NUM_PROCESSES
    }
}

/// A process file descriptor: where its input comes from and where its
/// output goes. These are not Unix pipes, just routing records.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub input_pipe: IoPipe,
    pub output_pipe: IoPipe,
}

/// Information about one process, exportable to user processes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfoElement {
    pub pid: u8,
    pub user_id: i16,
    pub name: [u8; 16],
}

/// Snapshot returned by a GET_PROCESS_INFO request, serialized into a
/// caller-provided buffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub num_processes: u8,
    pub processes: [ProcessInfoElement; NUM_PROCESSES],
}

//
// Executable format.
//
// A NanoOs executable carries its metadata at the *tail* of the file, as
// 32-bit little-endian words counted backward from EOF. Only the
// signature and version offsets are fixed; everything else is
// version-specific.
//

/// Bytes backward from EOF where the signature word lives.
pub const EXE_SIGNATURE_OFFSET: u32 = 4;

/// Bytes backward from EOF where the format version lives.
pub const EXE_VERSION_OFFSET: u32 = 8;

/// The signature word: `"NoOs"` read as a little-endian `u32`.
pub const EXE_SIGNATURE: u32 = u32::from_le_bytes(*b"NoOs");

/// The only trailer version currently defined. Version-1 trailers add
/// the program and data segment lengths ahead of the version word.
pub const EXE_VERSION_1: u32 = 1;

/// Metadata parsed from an executable trailer. The two lengths partition
/// the loaded image into code and initialized data.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExeMetadata {
    pub program_length: u32,
    pub data_length: u32,
}

//
// Overlay format.
//
// Overlays are native-code commands loaded into a fixed window; their
// header advertises named exports that the kernel looks up by binary
// search.
//

/// Value identifying a valid overlay header: `"NanoOsOL"` as a
/// little-endian `u64`.
pub const OVERLAY_MAGIC: u64 = u64::from_le_bytes(*b"NanoOsOL");

/// Length of an overlay export name, including NUL padding.
pub const OVERLAY_NAME_LENGTH: usize = 16;

/// Packs an overlay version from its components:
/// `(major << 24) | (minor << 16) | (revision << 8) | build`.
pub const fn overlay_version(major: u8, minor: u8, revision: u8, build: u8) -> u32 {
    (major as u32) << 24 | (minor as u32) << 16 | (revision as u32) << 8 | build as u32
}

/// The fixed-size portion of an overlay header. The export records
/// follow it, sorted by name.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OverlayHeader {
    pub magic: u64,
    pub version: u32,
    pub num_exports: u16,
}

impl OverlayHeader {
    pub fn is_valid(&self) -> bool {
        self.magic == OVERLAY_MAGIC
    }
}

/// Converts a short name to the padded 16-byte form used in export
/// records. Names longer than the field are truncated.
pub fn overlay_export_name(name: &str) -> [u8; OVERLAY_NAME_LENGTH] {
    let mut out = [0; OVERLAY_NAME_LENGTH];
    for (slot, byte) in out.iter_mut().zip(name.as_bytes()) {
        *slot = *byte;
    }
    out
}

bitflags::bitflags! {
    /// Bits of the RISC-V `misa` CSR the VM advertises.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MisaFlags: u32 {
        /// MXL = 1: 32-bit machine.
        const MXL_32 = 1 << 30;
        /// Base integer ISA.
        const I_EXT = 1 << 8;
        /// Integer multiply/divide extension.
        const M_EXT = 1 << 12;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn scheduler_commands_round_trip() {
        for raw in 0..NUM_SCHEDULER_COMMANDS {
            let cmd = SchedulerCommand::try_from(raw).unwrap();
            assert_eq!(cmd as u16, raw);
        }
        assert!(SchedulerCommand::try_from(NUM_SCHEDULER_COMMANDS).is_err());
    }

    #[test]
    fn responses_do_not_collide_with_commands() {
        assert!(SchedulerResponse::ProcessComplete as u16 >= NUM_SCHEDULER_COMMANDS);
        assert!(
            MemoryManagerResponse::ReturningPointer as u16 >= NUM_MEMORY_MANAGER_COMMANDS
        );
        assert!(ConsoleResponse::ReturningStatus as u16 >= NUM_CONSOLE_COMMANDS);
    }

    #[test]
    fn export_names_pad_and_truncate() {
        assert_eq!(&overlay_export_name("ls")[..3], b"ls\0");
        let long = overlay_export_name("averyveryverylongexportname");
        assert_eq!(&long, b"averyveryverylon");
    }

    #[test]
    fn exe_signature_is_ascii() {
        assert_eq!(EXE_SIGNATURE.to_le_bytes(), *b"NoOs");
    }
}
