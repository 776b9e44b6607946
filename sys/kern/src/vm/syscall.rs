// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ECALL bridge and the VM's scheduling wrapper.
//!
//! A guest issues a system call by placing the call number in `a7` and
//! arguments in `a0`..`a6`; the result comes back in `a0`. Calls that
//! need to hand bytes to another process stage them in an arena
//! allocation obtained from the memory manager by message, the same
//! pointer-as-payload convention every other process uses. That makes
//! several syscalls multi-step: the VM parks on the reply and picks the
//! guest back up where it left off.

use core::convert::TryFrom;

use nanoos_abi::{
    FilesystemCommand, FilesystemResponse, IoPipe, KernelError, MemoryManagerCommand,
    MemoryManagerResponse, ProcessId, SchedulerCommand, SchedulerResponse, Syscall,
    MAX_WRITE_LENGTH, NUM_FILE_DESCRIPTORS,
};

use super::{Rv32Vm, VM_INSTRUCTIONS_PER_SLICE};
use crate::msg::MessageBuilder;
use crate::proc::LaunchArgs;
use crate::sched::{pack_ptr_len, ExecContext, Process, Step, WaitReason};

/// Register indices for the syscall ABI.
const REG_A0: usize = 10;
const REG_A1: usize = 11;
const REG_A2: usize = 12;
const REG_A7: usize = 17;

/// Longest guest path accepted by the filesystem syscalls.
const MAX_PATH_LENGTH: u32 = 64;

/// Largest single filesystem read staged through the arena.
const MAX_READ_LENGTH: u32 = 512;

/// `timespec_get` base value for calendar time.
const TIME_UTC: u32 = 1;

/// Spawn function for the command registry: runs `args[0]` as an
/// RV32IM executable.
pub fn spawn_rv32(args: &LaunchArgs) -> Box<dyn Process> {
    Box::new(VmProcess::new(args.args.clone()))
}

/// What a staged arena buffer is for, once the pointer arrives.
enum StagedOp {
    /// Forward the bytes to an output pipe (console or another kernel
    /// process); the receiver frees the buffer.
    PipeWrite { pipe: IoPipe, len: u32 },
    /// OPEN: path bytes plus open flags.
    FsOpen { flags: u32, len: u32 },
    /// READ: an empty buffer the filesystem fills; copied back into
    /// guest memory afterwards.
    FsRead { fd: u32, guest_buf: u32, len: u32 },
    /// EXEC: command line handed to the scheduler.
    Exec { len: u32 },
}

/// A request to another kernel process with a typed reply.
struct KernelRequest {
    to: ProcessId,
    msg_type: u16,
    func: u64,
    data: u64,
    reply_type: u16,
    /// Copy `len` arena bytes back into guest memory on completion.
    copy_back: Option<CopyBack>,
    /// Arena buffer to free once the reply is in.
    free_ptr: Option<u32>,
}

struct CopyBack {
    guest_buf: u32,
    arena_ptr: u32,
}

enum Phase {
    /// Segments not loaded yet.
    Boot,
    /// Executing guest instructions.
    Run,
    /// Need to send the REALLOC for a staged buffer (retried when the
    /// message pool is full).
    Alloc { op: StagedOp, bytes: Option<Vec<u8>> },
    /// REALLOC sent; waiting for the pointer.
    AllocAwait { op: StagedOp, bytes: Option<Vec<u8>> },
    /// Need to send a kernel request (retried when the pool is full).
    Request(KernelRequest),
    /// Request sent; waiting for its reply.
    Await(KernelRequest),
    /// EXECVE sent; a failure reply resumes the old image, otherwise
    /// the scheduler swaps this process out.
    ExecRequested,
}

/// Runs one RV32IM guest as a scheduled process.
pub struct VmProcess {
    args: Vec<String>,
    vm: Option<Rv32Vm>,
    phase: Phase,
    /// Arena buffers whose FREE message could not be sent yet.
    pending_frees: Vec<u32>,
}

impl VmProcess {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            vm: None,
            phase: Phase::Boot,
            pending_frees: Vec::new(),
        }
    }

    fn flush_frees(&mut self, cx: &mut ExecContext<'_>) {
        while let Some(ptr) = self.pending_frees.pop() {
            let builder = MessageBuilder::new(MemoryManagerCommand::Free as u16)
                .data(u64::from(ptr));
            if cx.send(ProcessId::MEMORY_MANAGER, builder).is_err() {
                self.pending_frees.push(ptr);
                break;
            }
        }
    }

    fn finish(&mut self, cx: &mut ExecContext<'_>, code: i32) -> Step {
        if let Some(vm) = self.vm.take() {
            vm.cleanup(cx.filesystem());
        }
        Step::Done(code)
    }

    fn set_a0(&mut self, value: u32) {
        if let Some(vm) = self.vm.as_mut() {
            vm.core.x[REG_A0] = value;
        }
    }

    /// Resolves a guest stream handle to the matching output pipe.
    fn output_pipe(&self, cx: &ExecContext<'_>, stream: u32) -> Option<IoPipe> {
        if (stream as usize) < NUM_FILE_DESCRIPTORS {
            let fd = cx.file_descriptor(stream as usize)?;
            if fd.output_pipe.is_connected() {
                return Some(fd.output_pipe);
            }
        }
        None
    }

    /// Moves a staged operation forward by sending its REALLOC request.
    fn begin_alloc(
        &mut self,
        cx: &mut ExecContext<'_>,
        op: StagedOp,
        bytes: Option<Vec<u8>>,
        size: u32,
    ) -> Step {
        let builder = MessageBuilder::new(MemoryManagerCommand::Realloc as u16)
            .func(0)
            .data(u64::from(size.max(1)))
            .waiting();
        match cx.send(ProcessId::MEMORY_MANAGER, builder) {
            Ok(_) => {
                self.phase = Phase::AllocAwait { op, bytes };
                Step::Block(WaitReason::ReplyOfType {
                    reply_type: MemoryManagerResponse::ReturningPointer as u16,
                    deadline: None,
                })
            }
            Err(KernelError::Busy) => {
                self.phase = Phase::Alloc { op, bytes };
                Step::Yield
            }
            Err(_) => {
                // No memory manager; nothing the guest can do.
                self.set_a0(-1i32 as u32);
                self.phase = Phase::Run;
                Step::Yield
            }
        }
    }

    /// Handles the arrival of a staged-buffer pointer.
    fn dispatch_staged(
        &mut self,
        cx: &mut ExecContext<'_>,
        op: StagedOp,
        ptr: u32,
    ) -> Option<Step> {
        match op {
            StagedOp::PipeWrite { pipe, len } => {
                let builder = MessageBuilder::new(pipe.message_type)
                    .func(u64::from(ptr))
                    .data(u64::from(len));
                match cx.send(ProcessId(pipe.process_id), builder) {
                    Ok(_) => self.set_a0(len),
                    Err(_) => {
                        self.set_a0(-1i32 as u32);
                        self.pending_frees.push(ptr);
                    }
                }
                self.phase = Phase::Run;
                None
            }
            StagedOp::FsOpen { flags, len } => {
                self.phase = Phase::Request(KernelRequest {
                    to: ProcessId::FILESYSTEM,
                    msg_type: FilesystemCommand::OpenFile as u16,
                    func: pack_ptr_len(ptr, len),
                    data: u64::from(flags),
                    reply_type: FilesystemResponse::Returning as u16,
                    copy_back: None,
                    free_ptr: Some(ptr),
                });
                None
            }
            StagedOp::FsRead { fd, guest_buf, len } => {
                self.phase = Phase::Request(KernelRequest {
                    to: ProcessId::FILESYSTEM,
                    msg_type: FilesystemCommand::ReadFile as u16,
                    func: pack_ptr_len(ptr, len),
                    data: u64::from(fd),
                    reply_type: FilesystemResponse::Returning as u16,
                    copy_back: Some(CopyBack {
                        guest_buf,
                        arena_ptr: ptr,
                    }),
                    free_ptr: Some(ptr),
                });
                None
            }
            StagedOp::Exec { len } => {
                // Waiting, so a failure comes back as a reply; success
                // never replies, the scheduler just swaps this image out.
                let builder = MessageBuilder::new(SchedulerCommand::Execve as u16)
                    .data(pack_ptr_len(ptr, len))
                    .waiting();
                match cx.send(ProcessId::SCHEDULER, builder) {
                    Ok(_) => {
                        self.phase = Phase::ExecRequested;
                        Some(Step::Yield)
                    }
                    Err(_) => {
                        self.set_a0(-1i32 as u32);
                        self.pending_frees.push(ptr);
                        self.phase = Phase::Run;
                        None
                    }
                }
            }
        }
    }

    fn send_request(&mut self, cx: &mut ExecContext<'_>, request: KernelRequest) -> Step {
        let builder = MessageBuilder::new(request.msg_type)
            .func(request.func)
            .data(request.data)
            .waiting();
        match cx.send(request.to, builder) {
            Ok(_) => {
                let reply_type = request.reply_type;
                self.phase = Phase::Await(request);
                Step::Block(WaitReason::ReplyOfType {
                    reply_type,
                    deadline: None,
                })
            }
            Err(KernelError::Busy) => {
                self.phase = Phase::Request(request);
                Step::Yield
            }
            Err(_) => {
                // Collaborator process is not installed.
                if let Some(ptr) = request.free_ptr {
                    self.pending_frees.push(ptr);
                }
                self.set_a0(-1i32 as u32);
                self.phase = Phase::Run;
                Step::Yield
            }
        }
    }

    /// Completes an awaited kernel request once its reply arrives.
    /// Returns false if the reply has not arrived yet.
    fn complete_request(&mut self, cx: &mut ExecContext<'_>, request: KernelRequest) -> bool {
        let Some(index) = cx.pop_message_of_type(request.reply_type) else {
            self.phase = Phase::Await(request);
            return false;
        };
        let result = cx.message(index).data as i64;
        cx.release(index);

        if let Some(copy_back) = &request.copy_back {
            if result > 0 {
                let count = result as usize;
                if let Some(bytes) = cx.arena_read(copy_back.arena_ptr, count) {
                    if let Some(vm) = self.vm.as_mut() {
                        if vm.write_bytes(copy_back.guest_buf, &bytes).is_err() {
                            log::debug!("vm: read buffer copy-back faulted");
                        }
                    }
                }
            }
        }
        if let Some(ptr) = request.free_ptr {
            // The reply slot was just released, so the FREE send below
            // always finds a message slot.
            self.pending_frees.push(ptr);
            self.flush_frees(cx);
        }

        self.set_a0(result as u32);
        self.phase = Phase::Run;
        true
    }

    /// Executes up to one slice of guest instructions.
    fn run_slice(&mut self, cx: &mut ExecContext<'_>) -> Step {
        for _ in 0..VM_INSTRUCTIONS_PER_SLICE {
            let vm = self.vm.as_mut().expect("vm exists while running");
            vm.set_time_millis(u64::from(cx.now()));

            match vm.step() {
                Ok(super::Control::Proceed) => {}
                Ok(super::Control::Ecall) => {
                    if let Some(step) = self.handle_syscall(cx) {
                        return step;
                    }
                    if !matches!(self.phase, Phase::Run) {
                        // Syscall left a pending operation without a
                        // park; let it progress next tick.
                        return Step::Yield;
                    }
                }
                Err(fault) => {
                    log::debug!("vm: guest fault {fault:?}");
                    return self.finish(cx, fault.exit_code());
                }
            }
        }
        Step::Yield
    }

    /// Dispatches one ECALL. Returns the step to take now, or `None` to
    /// keep executing the current slice.
    fn handle_syscall(&mut self, cx: &mut ExecContext<'_>) -> Option<Step> {
        let vm = self.vm.as_mut().expect("vm exists while running");
        let number = vm.core.x[REG_A7];
        let a0 = vm.core.x[REG_A0];
        let a1 = vm.core.x[REG_A1];
        let a2 = vm.core.x[REG_A2];

        let syscall = match Syscall::try_from(number) {
            Ok(syscall) => syscall,
            Err(()) => {
                let fault = nanoos_abi::GuestFault::BadSyscall { number };
                log::debug!("vm: {fault:?}");
                return Some(self.finish(cx, fault.exit_code()));
            }
        };

        match syscall {
            Syscall::Exit => {
                let vm = self.vm.as_mut().expect("vm exists while running");
                vm.running = false;
                vm.exit_code = a0 as i32;
                let code = vm.exit_code;
                Some(self.finish(cx, code))
            }

            Syscall::Write => {
                let len = a2.min(MAX_WRITE_LENGTH);
                let Some(pipe) = self.output_pipe(cx, a0) else {
                    self.set_a0(-1i32 as u32);
                    return None;
                };
                if len == 0 {
                    self.set_a0(0);
                    return None;
                }
                let vm = self.vm.as_mut().expect("vm exists while running");
                match vm.read_bytes(a1, len) {
                    Ok(bytes) => Some(self.begin_alloc(
                        cx,
                        StagedOp::PipeWrite { pipe, len },
                        Some(bytes),
                        len,
                    )),
                    Err(fault) => {
                        log::debug!("vm: write source faulted {fault:?}");
                        Some(self.finish(cx, fault.exit_code()))
                    }
                }
            }

            Syscall::Read => {
                if (a0 as usize) < NUM_FILE_DESCRIPTORS {
                    // Console input is an external collaborator; there
                    // is nothing behind the standard input pipe here.
                    self.set_a0(-1i32 as u32);
                    return None;
                }
                let len = a2.min(MAX_READ_LENGTH);
                if len == 0 {
                    self.set_a0(0);
                    return None;
                }
                Some(self.begin_alloc(
                    cx,
                    StagedOp::FsRead {
                        fd: a0,
                        guest_buf: a1,
                        len,
                    },
                    None,
                    len,
                ))
            }

            Syscall::Open => {
                let vm = self.vm.as_mut().expect("vm exists while running");
                match vm.read_cstring(a0, MAX_PATH_LENGTH) {
                    Ok(path) => {
                        let len = path.len() as u32;
                        Some(self.begin_alloc(
                            cx,
                            StagedOp::FsOpen { flags: a1, len },
                            Some(path),
                            len,
                        ))
                    }
                    Err(fault) => Some(self.finish(cx, fault.exit_code())),
                }
            }

            Syscall::Close => {
                self.phase = Phase::Request(KernelRequest {
                    to: ProcessId::FILESYSTEM,
                    msg_type: FilesystemCommand::CloseFile as u16,
                    func: 0,
                    data: u64::from(a0),
                    reply_type: FilesystemResponse::Returning as u16,
                    copy_back: None,
                    free_ptr: None,
                });
                None
            }

            Syscall::Seek => {
                self.phase = Phase::Request(KernelRequest {
                    to: ProcessId::FILESYSTEM,
                    msg_type: FilesystemCommand::SeekFile as u16,
                    func: u64::from(a0),
                    data: pack_ptr_len(a1, a2),
                    reply_type: FilesystemResponse::Returning as u16,
                    copy_back: None,
                    free_ptr: None,
                });
                None
            }

            Syscall::NanoSleep => {
                self.set_a0(0);
                Some(Step::Block(WaitReason::Until(
                    cx.now().after_millis(u64::from(a0)),
                )))
            }

            Syscall::TimespecGet => {
                let now = cx.now();
                let vm = self.vm.as_mut().expect("vm exists while running");
                let result = vm
                    .write_bytes(a0, &now.as_secs().to_le_bytes())
                    .and_then(|_| {
                        vm.write_bytes(a0 + 8, &now.subsec_nanos().to_le_bytes())
                    });
                match result {
                    Ok(()) => self.set_a0(if a1 == TIME_UTC { TIME_UTC } else { 0 }),
                    Err(_) => self.set_a0(0),
                }
                None
            }

            Syscall::SetEcho => {
                let builder =
                    MessageBuilder::new(nanoos_abi::ConsoleCommand::SetEcho as u16)
                        .data(u64::from(a0));
                if cx.send(ProcessId::CONSOLE, builder).is_err() {
                    log::debug!("vm: set-echo dropped");
                }
                self.set_a0(0);
                None
            }

            Syscall::Exec => {
                let vm = self.vm.as_mut().expect("vm exists while running");
                match vm.read_cstring(a0, MAX_PATH_LENGTH) {
                    Ok(path) => {
                        let len = path.len() as u32;
                        Some(self.begin_alloc(
                            cx,
                            StagedOp::Exec { len },
                            Some(path),
                            len,
                        ))
                    }
                    Err(fault) => Some(self.finish(cx, fault.exit_code())),
                }
            }
        }
    }
}

impl Process for VmProcess {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        self.flush_frees(cx);

        loop {
            match std::mem::replace(&mut self.phase, Phase::Run) {
                Phase::Boot => {
                    let path = match self.args.first() {
                        Some(path) => path.clone(),
                        None => {
                            log::warn!("vm: launched without a program path");
                            return Step::Done(-1);
                        }
                    };
                    let pid = cx.pid();
                    match Rv32Vm::load(cx.filesystem(), pid, &path) {
                        Ok(vm) => {
                            self.vm = Some(vm);
                            self.phase = Phase::Run;
                        }
                        Err(e) => {
                            log::warn!("vm: could not load {path}: {e:?}");
                            return Step::Done(-1);
                        }
                    }
                }
                Phase::Run => return self.run_slice(cx),
                Phase::Alloc { op, bytes } => {
                    let size = match &op {
                        StagedOp::PipeWrite { len, .. }
                        | StagedOp::FsOpen { len, .. }
                        | StagedOp::FsRead { len, .. }
                        | StagedOp::Exec { len } => *len,
                    };
                    let step = self.begin_alloc(cx, op, bytes, size);
                    if !matches!(self.phase, Phase::Run) {
                        return step;
                    }
                }
                Phase::AllocAwait { op, bytes } => {
                    let reply_type = MemoryManagerResponse::ReturningPointer as u16;
                    let Some(index) = cx.pop_message_of_type(reply_type) else {
                        self.phase = Phase::AllocAwait { op, bytes };
                        return Step::Block(WaitReason::ReplyOfType {
                            reply_type,
                            deadline: None,
                        });
                    };
                    let ptr = cx.message(index).func as u32;
                    cx.release(index);

                    if ptr == 0 {
                        // Out of memory; the call reports failure and
                        // the guest carries on.
                        self.set_a0(-1i32 as u32);
                        self.phase = Phase::Run;
                        continue;
                    }
                    if let Some(bytes) = &bytes {
                        if !cx.arena_write(ptr, bytes) {
                            self.set_a0(-1i32 as u32);
                            self.pending_frees.push(ptr);
                            self.phase = Phase::Run;
                            continue;
                        }
                    }
                    if let Some(step) = self.dispatch_staged(cx, op, ptr) {
                        return step;
                    }
                    if !matches!(self.phase, Phase::Run) {
                        // A follow-on request was queued; send it on
                        // this same pass.
                        continue;
                    }
                }
                Phase::Request(request) => {
                    let step = self.send_request(cx, request);
                    if !matches!(self.phase, Phase::Run) {
                        return step;
                    }
                }
                Phase::Await(request) => {
                    if !self.complete_request(cx, request) {
                        return Step::Block(WaitReason::ReplyOfType {
                            reply_type: match &self.phase {
                                Phase::Await(r) => r.reply_type,
                                _ => FilesystemResponse::Returning as u16,
                            },
                            deadline: None,
                        });
                    }
                }
                Phase::ExecRequested => {
                    let reply_type = SchedulerResponse::Returning as u16;
                    if let Some(index) = cx.pop_message_of_type(reply_type) {
                        // The exec failed; resume the old image.
                        cx.release(index);
                        self.set_a0(-1i32 as u32);
                        self.phase = Phase::Run;
                        continue;
                    }
                    self.phase = Phase::ExecRequested;
                    return Step::Yield;
                }
            }
        }
    }
}
