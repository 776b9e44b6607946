// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup: assemble the tables, install the kernel processes,
//! and hand back a scheduler ready to tick.

use nanoos_abi::ProcessId;

use crate::console::{Console, ConsoleDriver};
use crate::fs::{BackingStore, Filesystem};
use crate::memmgr::{MemoryManager, MemoryRegion};
use crate::proc::{CommandEntry, CommandRegistry};
use crate::sched::Kernel;
use crate::users::{User, UserTable};

/// Everything the board/test harness provides to bring the kernel up.
pub struct KernelConfig {
    /// Bytes of RAM handed to the memory manager.
    pub memory_bytes: usize,
    pub filesystem: Box<dyn Filesystem>,
    pub console: Box<dyn ConsoleDriver>,
    pub commands: Vec<CommandEntry>,
    pub users: Vec<User>,
}

fn read_hostname(fs: &mut dyn Filesystem) -> String {
    fn read_line(file: &mut dyn BackingStore) -> Option<String> {
        let len = file.len().ok()?;
        if len == 0 {
            return None;
        }
        let mut bytes = vec![0u8; (len as usize).min(64)];
        let got = file.read_at(0, &mut bytes).ok()?;
        bytes.truncate(got);
        let text = String::from_utf8_lossy(&bytes);
        let line = text.lines().next()?.trim();
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }

    match fs.open("/etc/hostname") {
        Ok(mut file) => read_line(file.as_mut()).unwrap_or_else(|| "localhost".to_string()),
        Err(_) => "localhost".to_string(),
    }
}

/// Boots the kernel: reads `/etc/hostname`, claims the memory region,
/// and installs the console and memory manager processes. The region is
/// claimed after everything else is sized, mirroring the original's
/// rule that the memory manager starts last and takes whatever is left.
pub fn boot(config: KernelConfig) -> Kernel {
    let KernelConfig {
        memory_bytes,
        mut filesystem,
        console,
        commands,
        users,
    } = config;

    let hostname = read_hostname(filesystem.as_mut());
    let registry = CommandRegistry::new(commands);
    let user_table = UserTable::new(users);

    let arena = MemoryRegion::new(memory_bytes);
    let mut kernel = Kernel::assemble(arena, registry, filesystem, user_table, hostname);

    kernel
        .install_process(ProcessId::CONSOLE, "console", Box::new(Console::new(console)))
        .expect("console slot is free at boot");
    kernel
        .install_process(
            ProcessId::MEMORY_MANAGER,
            "memory manager",
            Box::new(MemoryManager),
        )
        .expect("memory manager slot is free at boot");

    log::debug!(
        "boot: {} bytes of dynamic memory, hostname {}",
        kernel.free_memory(),
        kernel.hostname()
    );
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CaptureConsole;
    use crate::fs::RamDisk;
    use nanoos_abi::ProcessState;

    fn config(disk: RamDisk) -> KernelConfig {
        KernelConfig {
            memory_bytes: 8192,
            filesystem: Box::new(disk),
            console: Box::new(CaptureConsole::new()),
            commands: Vec::new(),
            users: Vec::new(),
        }
    }

    #[test]
    fn boot_installs_kernel_processes() {
        let kernel = boot(config(RamDisk::new()));
        assert_eq!(
            kernel.process_state(ProcessId::CONSOLE),
            Some(ProcessState::Ready)
        );
        assert_eq!(
            kernel.process_state(ProcessId::MEMORY_MANAGER),
            Some(ProcessState::Ready)
        );
        assert_eq!(kernel.process_name(ProcessId::CONSOLE), Some("console"));
        assert_eq!(kernel.hostname(), "localhost");
    }

    #[test]
    fn boot_reads_hostname_file() {
        let mut disk = RamDisk::new();
        disk.install("/etc/hostname", b"nanobox\n");
        let kernel = boot(config(disk));
        assert_eq!(kernel.hostname(), "nanobox");
    }

    #[test]
    fn kernel_ticks_idle_without_incident() {
        let mut kernel = boot(config(RamDisk::new()));
        kernel.run_ticks(100);
        assert_eq!(kernel.messages_in_flight(), 0);
        assert_eq!(u64::from(kernel.now()), 100);
    }
}
