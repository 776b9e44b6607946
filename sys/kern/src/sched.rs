// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! Single-threaded, cooperative, round-robin. The scheduler is itself a
//! process (PID 0) and owns the main loop; every other process is
//! resumed at most once per tick and runs until it returns a [`Step`].
//! There is no preemption: the only suspension points are the values a
//! process returns.
//!
//! Per tick the scheduler (1) delivers pending scheduler-originated
//! messages ahead of normal work, (2) resumes the head of the *ready*
//! queue, (3) re-enqueues it according to the step it returned, (4)
//! services its own message queue until empty, and (5) promotes
//! timed-waiting processes whose deadline has passed.

use core::convert::TryFrom;

use nanoos_abi::{
    ConsoleCommand, FileDescriptor, KernelError, MemoryManagerCommand, ProcessId,
    ProcessInfo, ProcessState, SchedulerCommand, SchedulerResponse, UserId,
    NUM_PROCESSES, NUM_PROCESS_STORAGE_KEYS,
};

use crate::fs::Filesystem;
use crate::memmgr::MemoryRegion;
use crate::msg::{Message, MessageBuilder, MessageIndex, MessagePool};
use crate::proc::{CommandRegistry, LaunchArgs, LaunchInfo, ProcessDescriptor, ProcessQueue};
use crate::time::Timestamp;
use crate::users::UserTable;

/// Exit code reported for a process torn down by KILL_PROCESS.
pub const KILLED_EXIT_CODE: i32 = -1;

/// A schedulable process body. `run` is the cooperative resumption: it
/// executes until it returns, and the returned [`Step`] is the only
/// suspension point.
pub trait Process {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step;
}

/// What a process does at a suspension point.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub enum Step {
    /// Go to the tail of the ready queue.
    Yield,
    /// Park until the wait condition holds.
    Block(WaitReason),
    /// Exit with a status code.
    Done(i32),
}

/// Why a process is parked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// Any incoming message wakes the process.
    AnyMessage,
    /// Only a message of `reply_type` wakes the process; with a
    /// deadline, passing it wakes the process with the timed-out flag
    /// set and the original message still in flight.
    ReplyOfType {
        reply_type: u16,
        deadline: Option<Timestamp>,
    },
    /// Sleep until the given instant.
    Until(Timestamp),
}

/// Packs an arena pointer and a length into one payload word.
pub fn pack_ptr_len(ptr: u32, len: u32) -> u64 {
    u64::from(ptr) | (u64::from(len) << 32)
}

/// Inverse of [`pack_ptr_len`].
pub fn unpack_ptr_len(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

/// Snapshot of queue membership, for diagnostics and invariant checks.
#[derive(Clone, Debug, Default)]
pub struct QueueCensus {
    pub ready: Vec<ProcessId>,
    pub waiting: Vec<ProcessId>,
    pub timed_waiting: Vec<ProcessId>,
    pub free: Vec<ProcessId>,
}

/// The kernel: process table, queues, message pool, managed memory, and
/// the collaborator seams.
pub struct Kernel {
    processes: Vec<ProcessDescriptor>,
    ready: ProcessQueue,
    waiting: ProcessQueue,
    timed_waiting: ProcessQueue,
    free: ProcessQueue,
    pool: MessagePool,
    arena: MemoryRegion,
    commands: CommandRegistry,
    filesystem: Box<dyn Filesystem>,
    users: UserTable,
    hostname: String,
    now: Timestamp,
    /// Scheduler-originated messages awaiting delivery; retried when the
    /// pool is exhausted.
    outbox: Vec<(ProcessId, MessageBuilder)>,
    running: Option<ProcessId>,
}

impl Kernel {
    pub(crate) fn assemble(
        arena: MemoryRegion,
        commands: CommandRegistry,
        filesystem: Box<dyn Filesystem>,
        users: UserTable,
        hostname: String,
    ) -> Self {
        let mut processes: Vec<ProcessDescriptor> = (0..NUM_PROCESSES as u8)
            .map(|pid| ProcessDescriptor::new(ProcessId(pid)))
            .collect();

        // The scheduler's own descriptor exists for its message queue
        // but never sits in any queue.
        processes[0].name.push_str("scheduler");
        processes[0].state = ProcessState::Running;

        // Hand out high slots first so launches do not squat on the
        // well-known collaborator PIDs while those are uninstalled.
        let mut free = ProcessQueue::new("free");
        for pid in (1..NUM_PROCESSES as u8).rev() {
            free.push(ProcessId(pid));
        }

        Self {
            processes,
            ready: ProcessQueue::new("ready"),
            waiting: ProcessQueue::new("waiting"),
            timed_waiting: ProcessQueue::new("timed waiting"),
            free,
            pool: MessagePool::new(),
            arena,
            commands,
            filesystem,
            users,
            hostname,
            now: Timestamp::ZERO,
            outbox: Vec::new(),
            running: None,
        }
    }

    /// Installs a process in a specific well-known slot. Used at boot
    /// for the kernel processes and by tests for collaborators.
    pub fn install_process(
        &mut self,
        pid: ProcessId,
        name: &str,
        behavior: Box<dyn Process>,
    ) -> Result<(), KernelError> {
        if !pid.is_valid() || pid == ProcessId::SCHEDULER {
            return Err(KernelError::InvalidArgument);
        }
        if self.processes[pid.index()].is_alive() {
            return Err(KernelError::Busy);
        }
        if !self.free.remove(pid) {
            return Err(KernelError::InvalidArgument);
        }
        let desc = &mut self.processes[pid.index()];
        desc.name.push_str(name);
        desc.state = ProcessState::Ready;
        desc.behavior = Some(behavior);
        desc.user_id = UserId::ROOT;
        desc.kernel_service = true;
        self.ready.push(pid);
        Ok(())
    }

    /// Allocates a free slot for a process body, outside the command
    /// registry. This is the launch path tests and collaborators use.
    pub fn launch(
        &mut self,
        name: &str,
        user: UserId,
        behavior: Box<dyn Process>,
    ) -> Result<ProcessId, KernelError> {
        let pid = self.free.pop().ok_or(KernelError::Busy)?;
        let desc = &mut self.processes[pid.index()];
        desc.name.push_str(name);
        desc.state = ProcessState::Ready;
        desc.user_id = user;
        desc.behavior = Some(behavior);
        desc.connect_standard_descriptors();
        self.ready.push(pid);
        Ok(pid)
    }

    /// Current kernel time.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Index of a command in the registry, as RUN_PROCESS wants it.
    /// The lookup key is the first token of `input`.
    pub fn command_index(&self, input: &str) -> Option<usize> {
        self.commands.lookup(input).map(|(index, _)| index)
    }

    /// Login check against the user table; the shell calls this before
    /// adopting a user identity with SET_PROCESS_USER.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<UserId> {
        self.users.authenticate(username, password)
    }

    /// Username for a user ID, for prompts and process listings.
    pub fn username_of(&self, user: UserId) -> Option<&str> {
        self.users.by_id(user).map(|u| u.username.as_str())
    }

    pub fn process_state(&self, pid: ProcessId) -> Option<ProcessState> {
        self.processes.get(pid.index()).map(|d| d.state)
    }

    pub fn process_name(&self, pid: ProcessId) -> Option<&str> {
        self.processes.get(pid.index()).map(|d| d.name.as_str())
    }

    pub fn process_user(&self, pid: ProcessId) -> Option<UserId> {
        self.processes.get(pid.index()).map(|d| d.user_id)
    }

    /// Free bytes in the managed region; diagnostic mirror of the
    /// GET_FREE_MEMORY command.
    pub fn free_memory(&self) -> usize {
        self.arena.free_bytes()
    }

    pub fn messages_in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn census(&self) -> QueueCensus {
        QueueCensus {
            ready: self.ready.iter().collect(),
            waiting: self.waiting.iter().collect(),
            timed_waiting: self.timed_waiting.iter().collect(),
            free: self.free.iter().collect(),
        }
    }

    /// Stages a NUL-free string in the arena on behalf of `owner`. This
    /// is the console-side helper used to hand input lines to
    /// RUN_PROCESS; the allocation is tagged so reclaim-by-owner finds
    /// it if the message never lands.
    pub fn stage_input(&mut self, owner: ProcessId, input: &str) -> Result<u32, KernelError> {
        let bytes = input.as_bytes();
        let ptr = self
            .arena
            .realloc(0, bytes.len().max(1), owner)
            .ok_or(KernelError::OutOfMemory)?;
        self.arena
            .bytes_mut(ptr, bytes.len())
            .ok_or(KernelError::OutOfMemory)?
            .copy_from_slice(bytes);
        Ok(ptr)
    }

    /// Reads `len` bytes out of the arena.
    pub fn arena_read(&self, ptr: u32, len: usize) -> Option<Vec<u8>> {
        self.arena.bytes(ptr, len).map(|b| b.to_vec())
    }

    /// Runs `count` scheduler ticks.
    pub fn run_ticks(&mut self, count: u64) {
        for _ in 0..count {
            self.tick();
        }
    }

    /// Ticks until `done` reports true, up to `max_ticks`. Returns
    /// whether the predicate was satisfied.
    pub fn run_until(&mut self, max_ticks: u64, mut done: impl FnMut(&Kernel) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    /// One scheduler loop iteration.
    pub fn tick(&mut self) {
        self.now.advance(1);
        self.flush_outbox();
        if let Some(pid) = self.ready.pop() {
            self.resume(pid);
        }
        self.service_own_queue();
        self.promote_timed_waiters();
    }

    /// Queues a scheduler-originated message. Delivery happens at the
    /// head of the next tick, ahead of normal work.
    pub(crate) fn queue_kernel_message(&mut self, to: ProcessId, builder: MessageBuilder) {
        self.outbox.push((to, builder));
    }

    fn flush_outbox(&mut self) {
        let pending = std::mem::take(&mut self.outbox);
        for (to, builder) in pending {
            if !to.is_valid() || !self.processes[to.index()].is_alive() {
                log::debug!("scheduler: dropping message to dead process {}", to.0);
                continue;
            }
            let Some(index) = self.pool.acquire() else {
                // Pool exhausted; retry on a later tick.
                self.outbox.push((to, builder));
                continue;
            };
            builder.fill(self.pool.get_mut(index), ProcessId::SCHEDULER, to);
            let msg_type = self.pool.get(index).msg_type;

            let desc = &mut self.processes[to.index()];
            let is_kernel_process = desc.kernel_service;
            if is_kernel_process && desc.scheduler_message.is_none() {
                desc.scheduler_message = Some(index);
            } else if desc.queue.push_back(index).is_err() {
                log::warn!("scheduler: queue overflow delivering to {}", to.0);
                self.pool.release(index);
                continue;
            }

            if is_kernel_process {
                // Kernel processes handle scheduler traffic before
                // anything else runs.
                self.promote_front(to);
            } else {
                self.note_delivery(to, msg_type);
            }
        }
    }

    fn promote_front(&mut self, pid: ProcessId) {
        match self.processes[pid.index()].state {
            ProcessState::Ready => {
                if self.ready.remove(pid) {
                    self.ready.push_front(pid);
                }
            }
            ProcessState::Waiting => {
                self.waiting.remove(pid);
                self.make_ready(pid, false);
                self.ready.remove(pid);
                self.ready.push_front(pid);
            }
            ProcessState::TimedWaiting => {
                self.timed_waiting.remove(pid);
                self.make_ready(pid, false);
                self.ready.remove(pid);
                self.ready.push_front(pid);
            }
            ProcessState::Free | ProcessState::Running => {}
        }
    }

    fn make_ready(&mut self, pid: ProcessId, timed_out: bool) {
        let desc = &mut self.processes[pid.index()];
        desc.state = ProcessState::Ready;
        desc.wait = None;
        desc.timed_out = timed_out;
        self.ready.push(pid);
    }

    /// Wakes `to` if the message just queued satisfies its wait.
    fn note_delivery(&mut self, to: ProcessId, msg_type: u16) {
        let desc = &self.processes[to.index()];
        let wake = match (&desc.state, &desc.wait) {
            (ProcessState::Waiting | ProcessState::TimedWaiting, Some(reason)) => {
                match reason {
                    WaitReason::AnyMessage => true,
                    WaitReason::ReplyOfType { reply_type, .. } => *reply_type == msg_type,
                    WaitReason::Until(_) => false,
                }
            }
            _ => false,
        };
        if wake {
            self.waiting.remove(to);
            self.timed_waiting.remove(to);
            self.make_ready(to, false);
        }
    }

    fn resume(&mut self, pid: ProcessId) {
        // EXECVE swap happens at this safe point, before the old image
        // would run again.
        if let Some(new_behavior) = self.processes[pid.index()].pending_exec.take() {
            self.processes[pid.index()].behavior = Some(new_behavior);
        }

        let Some(mut behavior) = self.processes[pid.index()].behavior.take() else {
            return;
        };
        self.processes[pid.index()].state = ProcessState::Running;
        self.running = Some(pid);

        let step = behavior.run(&mut ExecContext { kernel: self, pid });

        self.running = None;
        self.processes[pid.index()].timed_out = false;

        match step {
            Step::Yield => {
                let desc = &mut self.processes[pid.index()];
                desc.behavior = Some(behavior);
                desc.state = ProcessState::Ready;
                self.ready.push(pid);
            }
            Step::Block(reason) => {
                self.processes[pid.index()].behavior = Some(behavior);
                self.park(pid, reason);
            }
            Step::Done(code) => {
                drop(behavior);
                self.teardown(pid, code);
            }
        }
    }

    fn park(&mut self, pid: ProcessId, reason: WaitReason) {
        // If the wake condition already holds there is nothing to wait
        // for; go straight back to ready.
        let already_satisfied = {
            let desc = &self.processes[pid.index()];
            match &reason {
                WaitReason::AnyMessage => {
                    !desc.queue.is_empty() || desc.scheduler_message.is_some()
                }
                WaitReason::ReplyOfType { reply_type, .. } => desc
                    .queue
                    .iter()
                    .any(|i| self.pool.get(*i).msg_type == *reply_type),
                WaitReason::Until(deadline) => *deadline <= self.now,
            }
        };
        if already_satisfied {
            self.make_ready(pid, false);
            return;
        }

        let desc = &mut self.processes[pid.index()];
        desc.wait = Some(reason);
        match reason {
            WaitReason::Until(_)
            | WaitReason::ReplyOfType {
                deadline: Some(_), ..
            } => {
                desc.state = ProcessState::TimedWaiting;
                self.timed_waiting.push(pid);
            }
            _ => {
                desc.state = ProcessState::Waiting;
                self.waiting.push(pid);
            }
        }
    }

    fn promote_timed_waiters(&mut self) {
        let due: Vec<(ProcessId, bool)> = self
            .timed_waiting
            .iter()
            .filter_map(|pid| {
                let desc = &self.processes[pid.index()];
                match desc.wait {
                    Some(WaitReason::Until(deadline)) if deadline <= self.now => {
                        Some((pid, false))
                    }
                    Some(WaitReason::ReplyOfType {
                        deadline: Some(deadline),
                        ..
                    }) if deadline <= self.now => Some((pid, true)),
                    _ => None,
                }
            })
            .collect();

        for (pid, timed_out) in due {
            self.timed_waiting.remove(pid);
            self.make_ready(pid, timed_out);
        }
    }

    fn service_own_queue(&mut self) {
        while let Some(index) = self.processes[0].queue.pop_front() {
            self.handle_scheduler_command(index);
        }
    }

    pub(crate) fn send_from(
        &mut self,
        from: ProcessId,
        to: ProcessId,
        builder: MessageBuilder,
    ) -> Result<MessageIndex, KernelError> {
        if !to.is_valid() {
            log::warn!("send: {} is not a valid PID", to.0);
            return Err(KernelError::InvalidArgument);
        }
        if !self.processes[to.index()].is_alive() {
            log::warn!("send: process {} is not running", to.0);
            return Err(KernelError::NotFound);
        }
        let index = self.pool.acquire().ok_or(KernelError::Busy)?;
        builder.fill(self.pool.get_mut(index), from, to);
        let msg_type = self.pool.get(index).msg_type;
        if self.processes[to.index()].queue.push_back(index).is_err() {
            self.pool.release(index);
            return Err(KernelError::Busy);
        }
        self.note_delivery(to, msg_type);
        Ok(index)
    }

    /// Re-initializes a request slot as its own reply and queues it back
    /// to the original sender.
    pub(crate) fn reply_from(
        &mut self,
        from: ProcessId,
        request: MessageIndex,
        builder: MessageBuilder,
    ) -> Result<(), KernelError> {
        let original_sender = self.pool.get(request).from;
        if !original_sender.is_valid()
            || !self.processes[original_sender.index()].is_alive()
        {
            self.pool.release(request);
            return Err(KernelError::NotFound);
        }
        builder.fill(self.pool.get_mut(request), from, original_sender);
        let slot = self.pool.get_mut(request);
        slot.done = true;
        let msg_type = slot.msg_type;
        if self.processes[original_sender.index()]
            .queue
            .push_back(request)
            .is_err()
        {
            self.pool.release(request);
            return Err(KernelError::Busy);
        }
        self.note_delivery(original_sender, msg_type);
        Ok(())
    }

    /// Destroys a process: removes it from its queue, releases queued
    /// messages, releases its console ports, asks the memory manager to
    /// reclaim everything it owns, notifies a waiting launcher, and
    /// returns the descriptor to the free queue.
    fn teardown(&mut self, pid: ProcessId, exit_code: i32) {
        self.ready.remove(pid);
        self.waiting.remove(pid);
        self.timed_waiting.remove(pid);

        while let Some(index) = self.processes[pid.index()].queue.pop_front() {
            self.pool.release(index);
        }
        if let Some(index) = self.processes[pid.index()].scheduler_message.take() {
            self.pool.release(index);
        }

        self.queue_kernel_message(
            ProcessId::CONSOLE,
            MessageBuilder::new(ConsoleCommand::ReleasePort as u16).data(u64::from(pid.0)),
        );

        if let Some(launch) = self.processes[pid.index()].launch.take() {
            if !launch.background && launch.caller != pid {
                self.queue_kernel_message(
                    launch.caller,
                    MessageBuilder::new(SchedulerResponse::ProcessComplete as u16)
                        .data(exit_code as i64 as u64),
                );
            }
        }

        self.queue_kernel_message(
            ProcessId::MEMORY_MANAGER,
            MessageBuilder::new(MemoryManagerCommand::FreeProcessMemory as u16)
                .data(u64::from(pid.0)),
        );

        self.processes[pid.index()].reset();
        self.free.push(pid);
    }

    fn handle_scheduler_command(&mut self, index: MessageIndex) {
        let message = self.pool.get(index).clone();
        let command = match SchedulerCommand::try_from(message.msg_type) {
            Ok(command) => command,
            Err(()) => {
                log::warn!(
                    "scheduler: dropping invalid command {} from process {}",
                    message.msg_type,
                    message.from.0
                );
                self.pool.release(index);
                return;
            }
        };

        match command {
            SchedulerCommand::RunProcess => self.handle_run_process(index, &message),
            SchedulerCommand::KillProcess => self.handle_kill_process(index, &message),
            SchedulerCommand::GetNumRunningProcesses => {
                let count = self.processes.iter().filter(|d| d.is_alive()).count() as u64;
                self.reply_status(index, &message, count);
            }
            SchedulerCommand::GetProcessInfo => self.handle_get_process_info(index, &message),
            SchedulerCommand::GetProcessUser => {
                let user = self.processes[message.from.index()].user_id;
                self.reply_status(index, &message, user.0 as i64 as u64);
            }
            SchedulerCommand::SetProcessUser => {
                self.processes[message.from.index()].user_id = UserId(message.data as i16);
                self.reply_status(index, &message, 0);
            }
            SchedulerCommand::CloseAllFileDescriptors => {
                self.processes[message.from.index()].file_descriptors =
                    [FileDescriptor::default(); nanoos_abi::NUM_FILE_DESCRIPTORS];
                self.reply_status(index, &message, 0);
            }
            SchedulerCommand::GetHostname => self.handle_get_hostname(index, &message),
            SchedulerCommand::Execve => self.handle_execve(index, &message),
        }
    }

    /// Replies with a single status/value word when the sender is
    /// waiting; otherwise just releases the request.
    fn reply_status(&mut self, index: MessageIndex, message: &Message, value: u64) {
        if message.waiting {
            let reply = MessageBuilder::new(SchedulerResponse::Returning as u16)
                .data(value)
                .size(value as usize);
            if self.reply_from(ProcessId::SCHEDULER, index, reply).is_err() {
                log::warn!("scheduler: could not deliver reply to {}", message.from.0);
            }
        } else {
            self.pool.release(index);
        }
    }

    /// RUN_PROCESS: `func` = command-registry index, `data` = packed
    /// arena pointer/length of the raw console input, `size` = console
    /// port. On success the input string is freed here; on failure the
    /// caller keeps ownership of it.
    fn handle_run_process(&mut self, index: MessageIndex, message: &Message) {
        let (input_ptr, input_len) = unpack_ptr_len(message.data);
        let console_port = message.size as u8;

        let Some(entry) = self.commands.get(message.func as usize).copied() else {
            log::warn!("scheduler: RUN_PROCESS named an unknown command");
            self.reply_status(index, message, 1);
            return;
        };

        let input = match self.arena.bytes(input_ptr, input_len as usize) {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => {
                log::warn!("scheduler: RUN_PROCESS input pointer is invalid");
                self.reply_status(index, message, 1);
                return;
            }
        };
        let (args, background) = crate::proc::parse_args(&input);
        if args.is_empty() {
            self.reply_status(index, message, 1);
            return;
        }

        let Some(pid) = self.free.pop() else {
            // Pool full. The caller cleans up the payload it allocated.
            log::warn!("scheduler: no free process slot for {}", entry.name);
            self.reply_status(index, message, 1);
            return;
        };

        let launch_args = LaunchArgs { args, console_port };
        let behavior = (entry.spawn)(&launch_args);
        let caller_user = self.processes[message.from.index()].user_id;

        let desc = &mut self.processes[pid.index()];
        desc.name.push_str(entry.name);
        desc.user_id = caller_user;
        desc.state = ProcessState::Ready;
        desc.behavior = Some(behavior);
        desc.connect_standard_descriptors();
        desc.launch = Some(LaunchInfo {
            caller: message.from,
            console_port,
            background,
        });
        self.ready.push(pid);

        // The launch wrapper owns the console input now; free it.
        self.queue_kernel_message(
            ProcessId::MEMORY_MANAGER,
            MessageBuilder::new(MemoryManagerCommand::Free as u16)
                .data(u64::from(input_ptr)),
        );

        if background {
            // Background launches are reported complete immediately.
            self.queue_kernel_message(
                message.from,
                MessageBuilder::new(SchedulerResponse::ProcessComplete as u16).data(0),
            );
        }

        self.reply_status(index, message, 0);
    }

    fn handle_kill_process(&mut self, index: MessageIndex, message: &Message) {
        let target = ProcessId(message.data as u8);
        if !target.is_valid()
            || target == ProcessId::SCHEDULER
            || !self.processes[target.index()].is_alive()
        {
            log::warn!("scheduler: cannot kill process {}", message.data);
            self.reply_status(index, message, 1);
            return;
        }
        self.teardown(target, KILLED_EXIT_CODE);
        self.reply_status(index, message, 0);
    }

    /// GET_PROCESS_INFO: `func` = arena buffer pointer, `data` = buffer
    /// capacity. The snapshot is serialized into the caller's buffer and
    /// the reply reports the encoded length.
    fn handle_get_process_info(&mut self, index: MessageIndex, message: &Message) {
        let mut info = ProcessInfo::default();
        for desc in self.processes.iter().filter(|d| d.is_alive()) {
            let element = &mut info.processes[usize::from(info.num_processes)];
            element.pid = desc.pid.0;
            element.user_id = desc.user_id.0;
            let name = desc.name.as_bytes();
            let count = name.len().min(element.name.len());
            element.name[..count].copy_from_slice(&name[..count]);
            info.num_processes += 1;
        }

        let ptr = message.func as u32;
        let capacity = message.data as usize;
        let written = match self.arena.bytes_mut(ptr, capacity) {
            Some(buffer) => ssmarshal::serialize(buffer, &info).unwrap_or(0),
            None => 0,
        };
        self.reply_status(index, message, written as u64);
    }

    /// GET_HOSTNAME: `func` = arena buffer pointer, `data` = capacity.
    fn handle_get_hostname(&mut self, index: MessageIndex, message: &Message) {
        let ptr = message.func as u32;
        let capacity = message.data as usize;
        let name = self.hostname.as_bytes();
        let count = name.len().min(capacity);
        let written = match self.arena.bytes_mut(ptr, count) {
            Some(buffer) => {
                buffer.copy_from_slice(&name[..count]);
                count
            }
            None => 0,
        };
        self.reply_status(index, message, written as u64);
    }

    /// EXECVE: `data` = packed arena pointer/length of the command line.
    /// The caller's image is replaced at its next scheduling point; PID,
    /// user, and file descriptors are kept.
    fn handle_execve(&mut self, index: MessageIndex, message: &Message) {
        let (input_ptr, input_len) = unpack_ptr_len(message.data);
        let input = match self.arena.bytes(input_ptr, input_len as usize) {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => {
                self.reply_status(index, message, 1);
                return;
            }
        };
        let (args, _) = crate::proc::parse_args(&input);

        self.queue_kernel_message(
            ProcessId::MEMORY_MANAGER,
            MessageBuilder::new(MemoryManagerCommand::Free as u16)
                .data(u64::from(input_ptr)),
        );

        let caller = message.from;
        if args.is_empty() || !self.processes[caller.index()].is_alive() {
            self.reply_status(index, message, 1);
            return;
        }

        let console_port = self.processes[caller.index()]
            .launch
            .as_ref()
            .map(|l| l.console_port)
            .unwrap_or(0);
        let launch_args = LaunchArgs {
            args,
            console_port,
        };
        let path = launch_args.args[0].clone();
        // The old image's scratch segment files would otherwise shadow
        // the new one.
        crate::vm::Rv32Vm::remove_scratch_files(self.filesystem.as_mut(), caller);
        let behavior = crate::vm::spawn_rv32(&launch_args);

        let desc = &mut self.processes[caller.index()];
        desc.name.clear();
        desc.name.push_str(&path);
        desc.pending_exec = Some(behavior);
        self.pool.release(index);
    }

    //
    // Split-borrow accessors used by ExecContext.
    //

    fn descriptor(&self, pid: ProcessId) -> &ProcessDescriptor {
        &self.processes[pid.index()]
    }

    fn descriptor_mut(&mut self, pid: ProcessId) -> &mut ProcessDescriptor {
        &mut self.processes[pid.index()]
    }
}

/// The view of the kernel handed to a running process. All interaction
/// with the rest of the system goes through here.
pub struct ExecContext<'a> {
    kernel: &'a mut Kernel,
    pid: ProcessId,
}

impl ExecContext<'_> {
    /// PID of the running process.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn now(&self) -> Timestamp {
        self.kernel.now
    }

    /// Scheduler-originated message, if one is staged. Kernel processes
    /// check this before their own queue.
    pub fn take_scheduler_message(&mut self) -> Option<MessageIndex> {
        self.kernel.descriptor_mut(self.pid).scheduler_message.take()
    }

    /// Pops the next incoming message.
    pub fn pop_message(&mut self) -> Option<MessageIndex> {
        self.kernel.descriptor_mut(self.pid).queue.pop_front()
    }

    /// Pops the first queued message of the given type, preserving the
    /// order of the rest. This is the reply-wait poll.
    pub fn pop_message_of_type(&mut self, msg_type: u16) -> Option<MessageIndex> {
        let len = self.kernel.descriptor(self.pid).queue.len();
        let mut found = None;
        for _ in 0..len {
            let index = self
                .kernel
                .descriptor_mut(self.pid)
                .queue
                .pop_front()
                .expect("iterating within len");
            if found.is_none() && self.kernel.pool.get(index).msg_type == msg_type {
                found = Some(index);
            } else {
                let _ = self.kernel.descriptor_mut(self.pid).queue.push_back(index);
            }
        }
        found
    }

    pub fn message(&self, index: MessageIndex) -> &Message {
        self.kernel.pool.get(index)
    }

    pub fn message_mut(&mut self, index: MessageIndex) -> &mut Message {
        self.kernel.pool.get_mut(index)
    }

    /// Sends a fully-built message. On `Busy` the pool is exhausted and
    /// the caller should yield and retry; on `NotFound` the recipient is
    /// dead.
    pub fn send(
        &mut self,
        to: ProcessId,
        builder: MessageBuilder,
    ) -> Result<MessageIndex, KernelError> {
        self.kernel.send_from(self.pid, to, builder)
    }

    /// Replies to a request by reusing its slot, marking it done.
    pub fn reply(
        &mut self,
        request: MessageIndex,
        builder: MessageBuilder,
    ) -> Result<(), KernelError> {
        self.kernel.reply_from(self.pid, request, builder)
    }

    /// Returns a message slot to the pool. Only call this with messages
    /// popped from the queue or sent fire-and-forget by this process.
    pub fn release(&mut self, index: MessageIndex) {
        self.kernel.pool.release(index);
    }

    /// Whether the last blocking wait ended by deadline.
    pub fn timed_out(&self) -> bool {
        self.kernel.descriptor(self.pid).timed_out
    }

    /// Per-process storage read. Only the running process may read its
    /// storage.
    pub fn storage(&self, key: usize) -> Option<u64> {
        if key >= NUM_PROCESS_STORAGE_KEYS {
            return None;
        }
        Some(self.kernel.descriptor(self.pid).storage[key])
    }

    /// Per-process storage write.
    pub fn set_storage(&mut self, key: usize, value: u64) -> bool {
        if key >= NUM_PROCESS_STORAGE_KEYS {
            return false;
        }
        self.kernel.descriptor_mut(self.pid).storage[key] = value;
        true
    }

    pub fn file_descriptor(&self, fd: usize) -> Option<FileDescriptor> {
        self.kernel
            .descriptor(self.pid)
            .file_descriptors
            .get(fd)
            .copied()
    }

    pub fn set_file_descriptor(&mut self, fd: usize, descriptor: FileDescriptor) -> bool {
        match self
            .kernel
            .descriptor_mut(self.pid)
            .file_descriptors
            .get_mut(fd)
        {
            Some(slot) => {
                *slot = descriptor;
                true
            }
            None => false,
        }
    }

    /// Shared-address-space read of arena bytes.
    pub fn arena_read(&self, ptr: u32, len: usize) -> Option<Vec<u8>> {
        self.kernel.arena.bytes(ptr, len).map(|b| b.to_vec())
    }

    /// Shared-address-space write of arena bytes.
    pub fn arena_write(&mut self, ptr: u32, bytes: &[u8]) -> bool {
        match self.kernel.arena.bytes_mut(ptr, bytes.len()) {
            Some(buffer) => {
                buffer.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Allocator metadata access. In-crate only: the memory manager is
    /// the sole process that may operate the allocator.
    pub(crate) fn allocator(&mut self) -> &mut MemoryRegion {
        &mut self.kernel.arena
    }

    /// The filesystem collaborator, for kernel processes that manage
    /// backing files.
    pub(crate) fn filesystem(&mut self) -> &mut dyn Filesystem {
        self.kernel.filesystem.as_mut()
    }
}
