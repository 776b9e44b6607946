// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process descriptors, process queues, the command registry, and
//! console-input parsing.

use heapless::Deque;
use nanoos_abi::{
    FileDescriptor, IoPipe, ProcessId, ProcessState, UserId, NUM_FILE_DESCRIPTORS,
    NUM_MESSAGES, NUM_PROCESS_STORAGE_KEYS, SCHEDULER_NUM_PROCESSES,
};

use crate::msg::MessageIndex;
use crate::sched::{Process, WaitReason};

/// What a launched process was started from, used for completion
/// notification and console release.
#[derive(Clone, Debug)]
pub struct LaunchInfo {
    /// PID of the process that asked for the launch.
    pub caller: ProcessId,
    /// Console port the input came from.
    pub console_port: u8,
    /// Trailing `&`: the caller was notified at launch instead of at
    /// completion.
    pub background: bool,
}

/// Descriptor for one process slot.
pub struct ProcessDescriptor {
    pub name: String,
    pub pid: ProcessId,
    pub user_id: UserId,
    pub state: ProcessState,
    /// Set for the kernel service processes installed at boot; they get
    /// scheduler-originated messages delivered ahead of their queue.
    pub kernel_service: bool,
    /// Incoming message queue; FIFO of pool indices.
    pub queue: Deque<MessageIndex, NUM_MESSAGES>,
    /// Scheduler-originated message, delivered with priority ahead of
    /// the queue.
    pub scheduler_message: Option<MessageIndex>,
    /// Small integer-keyed storage for kernel library bookkeeping.
    pub storage: [u64; NUM_PROCESS_STORAGE_KEYS],
    pub file_descriptors: [FileDescriptor; NUM_FILE_DESCRIPTORS],
    /// The process's execution state; taken out while the process runs.
    pub behavior: Option<Box<dyn Process>>,
    /// Why the process is parked, when it is.
    pub wait: Option<WaitReason>,
    /// Whether the last wait ended by deadline rather than by wake.
    pub timed_out: bool,
    pub launch: Option<LaunchInfo>,
    /// Behavior to swap in at the next scheduling point (EXECVE).
    pub pending_exec: Option<Box<dyn Process>>,
}

impl ProcessDescriptor {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            name: String::new(),
            pid,
            user_id: UserId::NONE,
            state: ProcessState::Free,
            kernel_service: false,
            queue: Deque::new(),
            scheduler_message: None,
            storage: [0; NUM_PROCESS_STORAGE_KEYS],
            file_descriptors: [FileDescriptor::default(); NUM_FILE_DESCRIPTORS],
            behavior: None,
            wait: None,
            timed_out: false,
            launch: None,
            pending_exec: None,
        }
    }

    /// Whether messages may be sent to this process.
    pub fn is_alive(&self) -> bool {
        self.state != ProcessState::Free
    }

    /// Resets everything except the PID, returning the slot to the free
    /// pool's pristine shape. Queued message indices must already have
    /// been drained by the caller.
    pub fn reset(&mut self) {
        self.name.clear();
        self.user_id = UserId::NONE;
        self.state = ProcessState::Free;
        self.kernel_service = false;
        self.queue.clear();
        self.scheduler_message = None;
        self.storage = [0; NUM_PROCESS_STORAGE_KEYS];
        self.file_descriptors = [FileDescriptor::default(); NUM_FILE_DESCRIPTORS];
        self.behavior = None;
        self.wait = None;
        self.timed_out = false;
        self.launch = None;
        self.pending_exec = None;
    }

    /// Default descriptor table for a launched command: stdout and
    /// stderr route to the console's write command; stdin is left
    /// unconnected until the console assigns it.
    pub fn connect_standard_descriptors(&mut self) {
        let console_write = IoPipe {
            process_id: ProcessId::CONSOLE.0,
            message_type: nanoos_abi::ConsoleCommand::Write as u16,
        };
        self.file_descriptors[0] = FileDescriptor {
            input_pipe: IoPipe::UNCONNECTED,
            output_pipe: IoPipe::UNCONNECTED,
        };
        for fd in &mut self.file_descriptors[1..3] {
            *fd = FileDescriptor {
                input_pipe: IoPipe::UNCONNECTED,
                output_pipe: console_write,
            };
        }
    }
}

/// A fixed-capacity FIFO of process slots. The name is only used in
/// diagnostics.
pub struct ProcessQueue {
    pub name: &'static str,
    ring: Deque<ProcessId, SCHEDULER_NUM_PROCESSES>,
}

impl ProcessQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ring: Deque::new(),
        }
    }

    pub fn push(&mut self, pid: ProcessId) {
        if self.ring.push_back(pid).is_err() {
            // Capacity equals the number of schedulable processes, so
            // this means a descriptor is in two queues at once.
            log::warn!("queue {}: dropped pid {} at capacity", self.name, pid.0);
        }
    }

    /// Priority insert at the head.
    pub fn push_front(&mut self, pid: ProcessId) {
        if self.ring.push_front(pid).is_err() {
            log::warn!("queue {}: dropped pid {} at capacity", self.name, pid.0);
        }
    }

    pub fn pop(&mut self) -> Option<ProcessId> {
        self.ring.pop_front()
    }

    /// Removes a specific PID, preserving the order of the rest.
    pub fn remove(&mut self, pid: ProcessId) -> bool {
        let mut found = false;
        for _ in 0..self.ring.len() {
            let head = self.ring.pop_front().expect("iterating within len");
            if head == pid && !found {
                found = true;
            } else {
                let _ = self.ring.push_back(head);
            }
        }
        found
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.ring.iter().any(|p| *p == pid)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.ring.iter().copied()
    }
}

/// Arguments handed to a command's spawn function.
#[derive(Clone, Debug)]
pub struct LaunchArgs {
    /// argv-style arguments; `args[0]` is the command name or path.
    pub args: Vec<String>,
    pub console_port: u8,
}

/// A runnable command: name, one-line help, and a constructor for the
/// process that executes it.
#[derive(Copy, Clone)]
pub struct CommandEntry {
    pub name: &'static str,
    pub help: &'static str,
    pub spawn: fn(&LaunchArgs) -> Box<dyn Process>,
}

/// The table of commands RUN_PROCESS and EXECVE can launch, sorted by
/// name for binary-search lookup.
pub struct CommandRegistry {
    entries: Vec<CommandEntry>,
}

impl CommandRegistry {
    pub fn new(mut entries: Vec<CommandEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(b.name));
        Self { entries }
    }

    /// Looks up the command named by the first token of `input`.
    pub fn lookup(&self, input: &str) -> Option<(usize, &CommandEntry)> {
        let name_len = input
            .find(|c: char| c.is_whitespace() || c == '&')
            .unwrap_or(input.len());
        let name = &input[..name_len];
        if name.is_empty() {
            return None;
        }
        self.entries
            .binary_search_by(|entry| entry.name.cmp(name))
            .ok()
            .map(|index| (index, &self.entries[index]))
    }

    pub fn get(&self, index: usize) -> Option<&CommandEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandEntry> {
        self.entries.iter()
    }
}

/// Splits a raw console input line into argv-style tokens. Double and
/// single quotes group words; a backslash escapes the quote character
/// inside a quoted run. A trailing `&` (its own token or glued to the
/// last one) requests a background launch and is stripped.
pub fn parse_args(input: &str) -> (Vec<String>, bool) {
    let mut args = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let quote = match bytes[i] {
            b'"' => Some(b'"'),
            b'\'' => Some(b'\''),
            _ => None,
        };

        let mut token = Vec::new();
        if let Some(quote) = quote {
            i += 1;
            let mut backslashes = 0;
            while i < bytes.len() {
                let c = bytes[i];
                if c == quote && backslashes % 2 == 0 {
                    i += 1;
                    break;
                }
                if c == b'\\' {
                    backslashes += 1;
                } else {
                    backslashes = 0;
                }
                token.push(c);
                i += 1;
            }
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                token.push(bytes[i]);
                i += 1;
            }
        }

        args.push(String::from_utf8_lossy(&token).into_owned());
    }

    let mut background = false;
    if let Some(last) = args.last_mut() {
        if last == "&" {
            background = true;
            args.pop();
        } else if last.ends_with('&') {
            background = true;
            last.truncate(last.len() - 1);
        }
    }

    (args, background)
}
