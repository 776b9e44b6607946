// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The console front end (PID 1).
//!
//! The serial hardware and the interactive shell are external
//! collaborators; this process owns the port table and the output path.
//! A port's output is gated by an ownership field: a process acquires a
//! port before writing and the scheduler releases a dead process's
//! ports during teardown.

use core::convert::TryFrom;
use std::cell::RefCell;
use std::rc::Rc;

use nanoos_abi::{
    ConsoleCommand, ConsoleResponse, MemoryManagerCommand, ProcessId,
    NUM_CONSOLE_PORTS,
};

use crate::msg::{MessageBuilder, MessageIndex};
use crate::sched::{ExecContext, Process, Step};

/// What the serial layer provides: byte output per port and non-blocking
/// byte input.
pub trait ConsoleDriver {
    fn write(&mut self, port: usize, bytes: &[u8]);

    /// Polls one byte of input; `None` when nothing is pending.
    fn read_byte(&mut self, _port: usize) -> Option<u8> {
        None
    }
}

/// Driver that writes port 0 and 1 to standard output and error.
#[derive(Default)]
pub struct StdoutConsole;

impl ConsoleDriver for StdoutConsole {
    fn write(&mut self, port: usize, bytes: &[u8]) {
        use std::io::Write;
        if port == 0 {
            let _ = std::io::stdout().write_all(bytes);
        } else {
            let _ = std::io::stderr().write_all(bytes);
        }
    }
}

/// Driver that captures output for inspection; used by tests.
#[derive(Default)]
pub struct CaptureConsole {
    ports: [Rc<RefCell<Vec<u8>>>; NUM_CONSOLE_PORTS],
}

impl CaptureConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle onto a port's captured bytes; stays valid after the
    /// driver is moved into the kernel.
    pub fn port(&self, port: usize) -> Rc<RefCell<Vec<u8>>> {
        Rc::clone(&self.ports[port])
    }
}

impl ConsoleDriver for CaptureConsole {
    fn write(&mut self, port: usize, bytes: &[u8]) {
        if let Some(captured) = self.ports.get(port) {
            captured.borrow_mut().extend_from_slice(bytes);
        }
    }
}

#[derive(Default)]
struct ConsolePort {
    output_owner: Option<ProcessId>,
    echo: bool,
}

/// The console process.
pub struct Console {
    driver: Box<dyn ConsoleDriver>,
    ports: [ConsolePort; NUM_CONSOLE_PORTS],
    /// Arena buffers whose FREE message could not be sent yet.
    pending_frees: Vec<u32>,
}

impl Console {
    pub fn new(driver: Box<dyn ConsoleDriver>) -> Self {
        Self {
            driver,
            ports: Default::default(),
            pending_frees: Vec::new(),
        }
    }

    /// Port a process may write to: one it owns, else an unowned port 0.
    fn writable_port(&self, pid: ProcessId) -> Option<usize> {
        if let Some(port) = self
            .ports
            .iter()
            .position(|p| p.output_owner == Some(pid))
        {
            return Some(port);
        }
        if self.ports[0].output_owner.is_none() {
            return Some(0);
        }
        None
    }

    fn dispatch(&mut self, cx: &mut ExecContext<'_>, index: MessageIndex) {
        let msg_type = cx.message(index).msg_type;
        let command = match ConsoleCommand::try_from(msg_type) {
            Ok(command) => command,
            Err(()) => {
                log::warn!("console: dropping unknown command {msg_type}");
                cx.release(index);
                return;
            }
        };

        match command {
            ConsoleCommand::Write => self.handle_write(cx, index),
            ConsoleCommand::AcquirePort => self.handle_acquire(cx, index),
            ConsoleCommand::ReleasePort => self.handle_release(cx, index),
            ConsoleCommand::SetEcho => self.handle_set_echo(cx, index),
        }
    }

    /// WRITE: `func` = arena offset of the bytes, `data` = length. The
    /// console frees the buffer (receiver-frees ownership transfer)
    /// unless the sender is waiting, in which case the sender keeps it.
    fn handle_write(&mut self, cx: &mut ExecContext<'_>, index: MessageIndex) {
        let message = cx.message(index);
        let from = message.from;
        let waiting = message.waiting;
        let ptr = message.func as u32;
        let len = message.data as usize;

        match self.writable_port(from) {
            Some(port) => match cx.arena_read(ptr, len) {
                Some(bytes) => self.driver.write(port, &bytes),
                None => log::warn!("console: write with invalid buffer from {}", from.0),
            },
            None => {
                log::warn!("console: process {} does not own an output port", from.0)
            }
        }

        if waiting {
            let reply = MessageBuilder::new(ConsoleResponse::ReturningStatus as u16);
            if cx.reply(index, reply).is_err() {
                log::warn!("console: could not deliver write reply");
            }
        } else {
            cx.release(index);
            self.pending_frees.push(ptr);
        }
    }

    fn handle_acquire(&mut self, cx: &mut ExecContext<'_>, index: MessageIndex) {
        let message = cx.message(index);
        let from = message.from;
        let waiting = message.waiting;
        let port = message.data as usize;

        let status: u64 = match self.ports.get_mut(port) {
            Some(slot) if slot.output_owner.is_none() || slot.output_owner == Some(from) => {
                slot.output_owner = Some(from);
                0
            }
            Some(_) => 1,
            None => 1,
        };

        if waiting {
            let reply =
                MessageBuilder::new(ConsoleResponse::ReturningStatus as u16).data(status);
            if cx.reply(index, reply).is_err() {
                log::warn!("console: could not deliver acquire reply");
            }
        } else {
            cx.release(index);
        }
    }

    /// RELEASE_PORT: `data` = PID whose ports are released. Sent by the
    /// owner itself or by the scheduler during teardown.
    fn handle_release(&mut self, cx: &mut ExecContext<'_>, index: MessageIndex) {
        let message = cx.message(index);
        let from = message.from;
        let target = ProcessId(message.data as u8);

        let target = if from == ProcessId::SCHEDULER { target } else { from };
        for port in &mut self.ports {
            if port.output_owner == Some(target) {
                port.output_owner = None;
                port.echo = false;
            }
        }
        cx.release(index);
    }

    fn handle_set_echo(&mut self, cx: &mut ExecContext<'_>, index: MessageIndex) {
        let message = cx.message(index);
        let from = message.from;
        let enable = message.data != 0;

        let port = self.writable_port(from).unwrap_or(0);
        self.ports[port].echo = enable;
        cx.release(index);
    }

    fn retry_pending_frees(&mut self, cx: &mut ExecContext<'_>) {
        while let Some(ptr) = self.pending_frees.pop() {
            let builder = MessageBuilder::new(MemoryManagerCommand::Free as u16)
                .data(u64::from(ptr));
            if cx.send(ProcessId::MEMORY_MANAGER, builder).is_err() {
                // Pool exhausted or manager missing; try again later.
                self.pending_frees.push(ptr);
                break;
            }
        }
    }
}

impl Process for Console {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        if let Some(index) = cx.take_scheduler_message() {
            self.dispatch(cx, index);
        }
        while let Some(index) = cx.pop_message() {
            self.dispatch(cx, index);
        }
        self.retry_pending_frees(cx);
        Step::Yield
    }
}
