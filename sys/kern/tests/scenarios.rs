//! End-to-end scenarios against a booted kernel: an in-memory disk, a
//! capture console, and guest programs assembled on the fly.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{data_address, install_program, rv32};
use nanoos_abi::{
    KernelError, MemoryManagerCommand, MemoryManagerResponse, ProcessId, ProcessState,
    SchedulerCommand, SchedulerResponse, UserId,
};
use nanoos_kern::console::CaptureConsole;
use nanoos_kern::fs::RamDisk;
use nanoos_kern::msg::MessageBuilder;
use nanoos_kern::proc::CommandEntry;
use nanoos_kern::sched::{pack_ptr_len, ExecContext, Kernel, Process, Step, WaitReason};
use nanoos_kern::startup::{boot, KernelConfig};
use nanoos_kern::vm::spawn_rv32;

/// Boots a kernel over the given disk with one VM-backed command per
/// installed program name. Returns the kernel and the captured port-0
/// output.
fn boot_with(disk: &RamDisk, commands: Vec<CommandEntry>) -> (Kernel, Rc<std::cell::RefCell<Vec<u8>>>) {
    let console = CaptureConsole::new();
    let port0 = console.port(0);
    let kernel = boot(KernelConfig {
        memory_bytes: 16 * 1024,
        filesystem: Box::new(disk.handle()),
        console: Box::new(console),
        commands,
        users: Vec::new(),
    });
    (kernel, port0)
}

/// Stand-in for the shell: launches one command line through
/// RUN_PROCESS and records the launch status and the completion code.
struct Shell {
    command_index: u64,
    input_ptr: u32,
    input_len: u32,
    phase: u8,
    run_status: Rc<Cell<Option<u64>>>,
    exit_code: Rc<Cell<Option<i64>>>,
}

impl Shell {
    fn new(
        kernel: &mut Kernel,
        input: &str,
    ) -> (Self, Rc<Cell<Option<u64>>>, Rc<Cell<Option<i64>>>) {
        let command_index =
            kernel.command_index(input).expect("command is registered") as u64;
        let input_ptr = kernel
            .stage_input(ProcessId::CONSOLE, input)
            .expect("input stages");
        let run_status = Rc::new(Cell::new(None));
        let exit_code = Rc::new(Cell::new(None));
        (
            Self {
                command_index,
                input_ptr,
                input_len: input.len() as u32,
                phase: 0,
                run_status: run_status.clone(),
                exit_code: exit_code.clone(),
            },
            run_status,
            exit_code,
        )
    }
}

impl Process for Shell {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        match self.phase {
            0 => {
                let builder = MessageBuilder::new(SchedulerCommand::RunProcess as u16)
                    .func(self.command_index)
                    .data(pack_ptr_len(self.input_ptr, self.input_len))
                    .size(0)
                    .waiting();
                match cx.send(ProcessId::SCHEDULER, builder) {
                    Ok(_) => {
                        self.phase = 1;
                        Step::Block(WaitReason::ReplyOfType {
                            reply_type: SchedulerResponse::Returning as u16,
                            deadline: None,
                        })
                    }
                    Err(KernelError::Busy) => Step::Yield,
                    Err(_) => Step::Done(1),
                }
            }
            1 => match cx.pop_message_of_type(SchedulerResponse::Returning as u16) {
                Some(index) => {
                    let status = cx.message(index).data;
                    cx.release(index);
                    self.run_status.set(Some(status));
                    if status != 0 {
                        return Step::Done(1);
                    }
                    self.phase = 2;
                    Step::Block(WaitReason::ReplyOfType {
                        reply_type: SchedulerResponse::ProcessComplete as u16,
                        deadline: None,
                    })
                }
                None => Step::Block(WaitReason::ReplyOfType {
                    reply_type: SchedulerResponse::Returning as u16,
                    deadline: None,
                }),
            },
            _ => match cx.pop_message_of_type(SchedulerResponse::ProcessComplete as u16) {
                Some(index) => {
                    self.exit_code.set(Some(cx.message(index).data as i64));
                    cx.release(index);
                    Step::Done(0)
                }
                None => Step::Block(WaitReason::ReplyOfType {
                    reply_type: SchedulerResponse::ProcessComplete as u16,
                    deadline: None,
                }),
            },
        }
    }
}

fn echo_program() -> (Vec<u32>, Vec<u8>) {
    // write(stdout, "Hi\n", 3); exit(7)
    let code_len = 9;
    let data_addr = data_address(code_len);
    let [lui11, addi11] = rv32::li(11, data_addr);
    let code = vec![
        lui11,
        addi11,
        rv32::addi(10, 0, 1), // stdout
        rv32::addi(12, 0, 3),
        rv32::addi(17, 0, 1), // write
        rv32::ecall(),
        rv32::addi(10, 0, 7),
        rv32::addi(17, 0, 0), // exit
        rv32::ecall(),
    ];
    assert_eq!(code.len(), code_len);
    (code, b"Hi\n".to_vec())
}

fn vm_command(name: &'static str) -> CommandEntry {
    CommandEntry {
        name,
        help: "run a guest binary",
        spawn: spawn_rv32,
    }
}

#[test]
fn s3_vm_echo_reaches_the_console_with_exit_status() {
    let mut disk = RamDisk::new();
    let (code, data) = echo_program();
    install_program(&mut disk, "hi.bin", &code, &data);

    let (mut kernel, port0) = boot_with(&disk, vec![vm_command("hi.bin")]);
    let (shell, run_status, exit_code) = Shell::new(&mut kernel, "hi.bin");
    let shell_pid = kernel.launch("shell", UserId::ROOT, Box::new(shell)).unwrap();

    assert!(kernel.run_until(512, |k| {
        k.process_state(shell_pid) == Some(ProcessState::Free)
    }));

    assert_eq!(run_status.get(), Some(0));
    assert_eq!(exit_code.get(), Some(7));
    assert_eq!(port0.borrow().as_slice(), b"Hi\n");
    // The guest's scratch segment files were reclaimed on exit.
    for pid in 0..nanoos_abi::NUM_PROCESSES {
        assert!(!disk.exists(&format!("pid{pid}phy.mem")));
        assert!(!disk.exists(&format!("pid{pid}stk.mem")));
    }
}

#[test]
fn background_launches_report_complete_immediately() {
    let mut disk = RamDisk::new();
    let (code, data) = echo_program();
    install_program(&mut disk, "hi.bin", &code, &data);

    let (mut kernel, port0) = boot_with(&disk, vec![vm_command("hi.bin")]);
    let (shell, run_status, exit_code) = Shell::new(&mut kernel, "hi.bin &");
    let shell_pid = kernel.launch("shell", UserId::ROOT, Box::new(shell)).unwrap();

    assert!(kernel.run_until(64, |k| {
        k.process_state(shell_pid) == Some(ProcessState::Free)
    }));
    // The shell was told "complete" at launch, not at exit.
    assert_eq!(run_status.get(), Some(0));
    assert_eq!(exit_code.get(), Some(0));

    // The program still runs to completion on its own.
    assert!(kernel.run_until(512, |k| {
        (1..nanoos_abi::NUM_PROCESSES as u8)
            .filter(|pid| {
                k.process_state(ProcessId(*pid)) != Some(ProcessState::Free)
            })
            .count()
            == 2 // console + memory manager
    }));
    assert_eq!(port0.borrow().as_slice(), b"Hi\n");
}

/// Asks the memory manager for the free-byte count over messages.
struct FreeMemoryProbe {
    sent: bool,
    result: Rc<Cell<Option<usize>>>,
}

impl Process for FreeMemoryProbe {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        let reply_type = MemoryManagerResponse::ReturningFreeMemory as u16;
        if !self.sent {
            let builder =
                MessageBuilder::new(MemoryManagerCommand::GetFreeMemory as u16).waiting();
            return match cx.send(ProcessId::MEMORY_MANAGER, builder) {
                Ok(_) => {
                    self.sent = true;
                    Step::Block(WaitReason::ReplyOfType {
                        reply_type,
                        deadline: None,
                    })
                }
                Err(KernelError::Busy) => Step::Yield,
                Err(_) => Step::Done(1),
            };
        }
        match cx.pop_message_of_type(reply_type) {
            Some(index) => {
                self.result.set(Some(cx.message(index).size));
                cx.release(index);
                Step::Done(0)
            }
            None => Step::Block(WaitReason::ReplyOfType {
                reply_type,
                deadline: None,
            }),
        }
    }
}

#[test]
fn s1_free_memory_query_round_trips() {
    let disk = RamDisk::new();
    let (mut kernel, _) = boot_with(&disk, Vec::new());

    let result = Rc::new(Cell::new(None));
    let pid = kernel
        .launch(
            "probe",
            UserId::ROOT,
            Box::new(FreeMemoryProbe {
                sent: false,
                result: result.clone(),
            }),
        )
        .unwrap();

    assert!(kernel.run_until(64, |k| {
        k.process_state(pid) == Some(ProcessState::Free)
    }));

    let free = result.get().expect("reply carried the size field");
    assert!(free > 0);
    assert!(free < 16 * 1024);
}

/// Allocates twice via messages and then spins.
struct ChildAllocator {
    phase: u8,
    allocations: Rc<Cell<u8>>,
}

impl Process for ChildAllocator {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        let reply_type = MemoryManagerResponse::ReturningPointer as u16;
        match self.phase {
            0 | 2 => {
                let builder = MessageBuilder::new(MemoryManagerCommand::Realloc as u16)
                    .func(0)
                    .data(128)
                    .waiting();
                match cx.send(ProcessId::MEMORY_MANAGER, builder) {
                    Ok(_) => {
                        self.phase += 1;
                        Step::Block(WaitReason::ReplyOfType {
                            reply_type,
                            deadline: None,
                        })
                    }
                    Err(KernelError::Busy) => Step::Yield,
                    Err(_) => Step::Done(1),
                }
            }
            1 | 3 => match cx.pop_message_of_type(reply_type) {
                Some(index) => {
                    assert_ne!(cx.message(index).func, 0);
                    cx.release(index);
                    self.allocations.set(self.allocations.get() + 1);
                    self.phase += 1;
                    Step::Yield
                }
                None => Step::Block(WaitReason::ReplyOfType {
                    reply_type,
                    deadline: None,
                }),
            },
            _ => Step::Yield,
        }
    }
}

/// Sends one KILL_PROCESS for the target.
struct Parent {
    target: ProcessId,
    sent: bool,
}

impl Process for Parent {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        if self.sent {
            return Step::Done(0);
        }
        let builder = MessageBuilder::new(SchedulerCommand::KillProcess as u16)
            .data(u64::from(self.target.0));
        match cx.send(ProcessId::SCHEDULER, builder) {
            Ok(_) => {
                self.sent = true;
                Step::Yield
            }
            Err(KernelError::Busy) => Step::Yield,
            Err(_) => Step::Done(1),
        }
    }
}

#[test]
fn s2_killing_a_child_reclaims_its_allocations() {
    let disk = RamDisk::new();
    let (mut kernel, _) = boot_with(&disk, Vec::new());
    // Let boot-time traffic settle before taking the baseline.
    kernel.run_ticks(8);
    let baseline = kernel.free_memory();

    let allocations = Rc::new(Cell::new(0));
    let child = kernel
        .launch(
            "child",
            UserId::ROOT,
            Box::new(ChildAllocator {
                phase: 0,
                allocations: allocations.clone(),
            }),
        )
        .unwrap();

    assert!(kernel.run_until(128, |_| allocations.get() == 2));
    assert!(kernel.free_memory() < baseline);

    kernel
        .launch(
            "parent",
            UserId::ROOT,
            Box::new(Parent {
                target: child,
                sent: false,
            }),
        )
        .unwrap();

    assert!(kernel.run_until(128, |k| {
        k.process_state(child) == Some(ProcessState::Free)
            && k.free_memory() == baseline
    }));
}

#[test]
fn nanosleep_parks_the_guest_for_the_requested_time() {
    let mut disk = RamDisk::new();
    let code = vec![
        rv32::addi(10, 0, 25),
        rv32::addi(17, 0, 6), // nanosleep
        rv32::ecall(),
        rv32::addi(10, 0, 0),
        rv32::addi(17, 0, 0), // exit
        rv32::ecall(),
    ];
    install_program(&mut disk, "nap.bin", &code, &[]);

    let (mut kernel, _) = boot_with(&disk, vec![vm_command("nap.bin")]);
    let (shell, _, exit_code) = Shell::new(&mut kernel, "nap.bin");
    let shell_pid = kernel.launch("shell", UserId::ROOT, Box::new(shell)).unwrap();

    let start = u64::from(kernel.now());
    assert!(kernel.run_until(512, |k| {
        k.process_state(shell_pid) == Some(ProcessState::Free)
    }));
    let elapsed = u64::from(kernel.now()) - start;

    assert_eq!(exit_code.get(), Some(0));
    assert!(elapsed >= 25, "slept only {elapsed} ticks");
}

#[test]
fn exec_replaces_the_running_image() {
    let mut disk = RamDisk::new();

    // first.bin: exec("second.bin")
    let exec_code_len = 4;
    let path_addr = data_address(exec_code_len);
    let [lui10, addi10] = rv32::li(10, path_addr);
    let exec_code = vec![lui10, addi10, rv32::addi(17, 0, 9), rv32::ecall()];
    assert_eq!(exec_code.len(), exec_code_len);
    install_program(&mut disk, "first.bin", &exec_code, b"second.bin\0");

    // second.bin: exit(42)
    let second = vec![
        rv32::addi(10, 0, 42),
        rv32::addi(17, 0, 0),
        rv32::ecall(),
    ];
    install_program(&mut disk, "second.bin", &second, &[]);

    let (mut kernel, _) = boot_with(&disk, vec![vm_command("first.bin")]);
    let (shell, run_status, exit_code) = Shell::new(&mut kernel, "first.bin");
    let shell_pid = kernel.launch("shell", UserId::ROOT, Box::new(shell)).unwrap();

    assert!(kernel.run_until(1024, |k| {
        k.process_state(shell_pid) == Some(ProcessState::Free)
    }));

    assert_eq!(run_status.get(), Some(0));
    // The completion status comes from the image exec'd in place.
    assert_eq!(exit_code.get(), Some(42));
}

/// Allocates a buffer, then exercises GET_PROCESS_INFO and
/// GET_HOSTNAME against it.
struct InfoProbe {
    phase: u8,
    buffer: u32,
    info_len: Rc<Cell<usize>>,
    buffer_ptr: Rc<Cell<u32>>,
    hostname_len: Rc<Cell<usize>>,
}

impl Process for InfoProbe {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        match self.phase {
            0 => {
                let builder = MessageBuilder::new(MemoryManagerCommand::Realloc as u16)
                    .func(0)
                    .data(512)
                    .waiting();
                match cx.send(ProcessId::MEMORY_MANAGER, builder) {
                    Ok(_) => {
                        self.phase = 1;
                        Step::Block(WaitReason::ReplyOfType {
                            reply_type: MemoryManagerResponse::ReturningPointer as u16,
                            deadline: None,
                        })
                    }
                    Err(KernelError::Busy) => Step::Yield,
                    Err(_) => Step::Done(1),
                }
            }
            1 => {
                let reply_type = MemoryManagerResponse::ReturningPointer as u16;
                let Some(index) = cx.pop_message_of_type(reply_type) else {
                    return Step::Block(WaitReason::ReplyOfType {
                        reply_type,
                        deadline: None,
                    });
                };
                self.buffer = cx.message(index).func as u32;
                cx.release(index);
                assert_ne!(self.buffer, 0);
                self.buffer_ptr.set(self.buffer);

                let builder = MessageBuilder::new(SchedulerCommand::GetProcessInfo as u16)
                    .func(u64::from(self.buffer))
                    .data(512)
                    .waiting();
                match cx.send(ProcessId::SCHEDULER, builder) {
                    Ok(_) => {
                        self.phase = 2;
                        Step::Block(WaitReason::ReplyOfType {
                            reply_type: SchedulerResponse::Returning as u16,
                            deadline: None,
                        })
                    }
                    Err(_) => Step::Done(1),
                }
            }
            2 => {
                let reply_type = SchedulerResponse::Returning as u16;
                let Some(index) = cx.pop_message_of_type(reply_type) else {
                    return Step::Block(WaitReason::ReplyOfType {
                        reply_type,
                        deadline: None,
                    });
                };
                self.info_len.set(cx.message(index).data as usize);
                cx.release(index);

                // Use the top half of the buffer so the hostname does
                // not clobber the serialized snapshot.
                let builder = MessageBuilder::new(SchedulerCommand::GetHostname as u16)
                    .func(u64::from(self.buffer + 256))
                    .data(64)
                    .waiting();
                match cx.send(ProcessId::SCHEDULER, builder) {
                    Ok(_) => {
                        self.phase = 3;
                        Step::Block(WaitReason::ReplyOfType {
                            reply_type,
                            deadline: None,
                        })
                    }
                    Err(_) => Step::Done(1),
                }
            }
            _ => {
                let reply_type = SchedulerResponse::Returning as u16;
                let Some(index) = cx.pop_message_of_type(reply_type) else {
                    return Step::Block(WaitReason::ReplyOfType {
                        reply_type,
                        deadline: None,
                    });
                };
                self.hostname_len.set(cx.message(index).data as usize);
                cx.release(index);
                Step::Done(0)
            }
        }
    }
}

#[test]
fn process_info_snapshot_lists_the_kernel_processes() {
    let mut disk = RamDisk::new();
    disk.install("/etc/hostname", b"nanobox\n");
    let (mut kernel, _) = boot_with(&disk, Vec::new());

    let info_len = Rc::new(Cell::new(0));
    let buffer_ptr = Rc::new(Cell::new(0));
    let hostname_len = Rc::new(Cell::new(0));
    let pid = kernel
        .launch(
            "info",
            UserId::ROOT,
            Box::new(InfoProbe {
                phase: 0,
                buffer: 0,
                info_len: info_len.clone(),
                buffer_ptr: buffer_ptr.clone(),
                hostname_len: hostname_len.clone(),
            }),
        )
        .unwrap();

    assert!(kernel.run_until(128, |k| {
        k.process_state(pid) == Some(ProcessState::Free)
    }));

    // The info snapshot was serialized into the probe's buffer before
    // the probe exited; the bytes are still intact to inspect.
    let len = info_len.get();
    assert!(len > 0);
    let bytes = kernel.arena_read(buffer_ptr.get(), len).unwrap();
    let (info, _): (nanoos_abi::ProcessInfo, usize) =
        ssmarshal::deserialize(&bytes).expect("snapshot deserializes");

    let pids: Vec<u8> = info.processes[..usize::from(info.num_processes)]
        .iter()
        .map(|p| p.pid)
        .collect();
    assert!(pids.contains(&ProcessId::SCHEDULER.0));
    assert!(pids.contains(&ProcessId::CONSOLE.0));
    assert!(pids.contains(&ProcessId::MEMORY_MANAGER.0));

    // GET_HOSTNAME wrote the booted hostname's length back.
    assert_eq!(hostname_len.get(), "nanobox".len());
}

/// RUN_PROCESS with a command index nobody registered.
struct BadLauncher {
    status: Rc<Cell<Option<u64>>>,
    sent: bool,
    input_ptr: u32,
}

impl Process for BadLauncher {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        let reply_type = SchedulerResponse::Returning as u16;
        if !self.sent {
            let builder = MessageBuilder::new(SchedulerCommand::RunProcess as u16)
                .func(999)
                .data(pack_ptr_len(self.input_ptr, 4))
                .waiting();
            return match cx.send(ProcessId::SCHEDULER, builder) {
                Ok(_) => {
                    self.sent = true;
                    Step::Block(WaitReason::ReplyOfType {
                        reply_type,
                        deadline: None,
                    })
                }
                Err(KernelError::Busy) => Step::Yield,
                Err(_) => Step::Done(1),
            };
        }
        match cx.pop_message_of_type(reply_type) {
            Some(index) => {
                self.status.set(Some(cx.message(index).data));
                cx.release(index);
                Step::Done(0)
            }
            None => Step::Block(WaitReason::ReplyOfType {
                reply_type,
                deadline: None,
            }),
        }
    }
}

#[test]
fn login_checksum_gates_user_identity() {
    let disk = RamDisk::new();
    let console = CaptureConsole::new();
    let kernel = boot(KernelConfig {
        memory_bytes: 8 * 1024,
        filesystem: Box::new(disk.handle()),
        console: Box::new(console),
        commands: Vec::new(),
        users: vec![nanoos_kern::users::User {
            user_id: UserId::ROOT,
            username: "root".to_string(),
            checksum: nanoos_kern::users::login_checksum("root", "toor"),
        }],
    });

    assert_eq!(kernel.authenticate("root", "toor"), Some(UserId::ROOT));
    assert_eq!(kernel.authenticate("root", "wrong"), None);
    assert_eq!(kernel.username_of(UserId::ROOT), Some("root"));
}

#[test]
fn unknown_commands_fail_with_nonzero_status() {
    let disk = RamDisk::new();
    let (mut kernel, _) = boot_with(&disk, Vec::new());
    let input_ptr = kernel.stage_input(ProcessId::CONSOLE, "nope").unwrap();

    let status = Rc::new(Cell::new(None));
    let pid = kernel
        .launch(
            "bad",
            UserId::ROOT,
            Box::new(BadLauncher {
                status: status.clone(),
                sent: false,
                input_ptr,
            }),
        )
        .unwrap();

    assert!(kernel.run_until(64, |k| {
        k.process_state(pid) == Some(ProcessState::Free)
    }));
    assert_eq!(status.get(), Some(1));
}
