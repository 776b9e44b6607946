// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The memory manager: sole dynamic allocator for the kernel and every
//! process.
//!
//! The managed region is a contiguous byte arena. Allocation moves
//! `malloc_next` monotonically downward from `malloc_start`; it only
//! moves back up when the most recently allocated block is freed
//! (triangular compaction). Every allocation carries an 8-byte node
//! record just below it holding the previous node's offset, the size,
//! and the owning PID, so an entire process's memory can be reclaimed in
//! one walk.
//!
//! "Pointers" handed to clients are non-zero byte offsets into the
//! arena; zero is the null pointer. Allocation requests arrive as
//! messages; the handlers reply by reusing the request slot.

use core::convert::TryFrom;

use nanoos_abi::{
    MemoryManagerCommand, MemoryManagerResponse, ProcessId, NUM_MEMORY_MANAGER_COMMANDS,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::sched::{ExecContext, Process, Step};

/// Owner value marking a node that belongs to no process.
const OWNER_NONE: u16 = u16::MAX;

/// Node record placed immediately below every allocation.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct MemNode {
    /// Arena offset of the previous (older, higher) node's data, or 0 at
    /// the sentinel.
    prev: u32,
    /// Allocation size in bytes; 0 means the node is logically free.
    size: u16,
    /// PID of the owning process, or `OWNER_NONE`.
    owner: u16,
}

const MEM_NODE_SIZE: u32 = core::mem::size_of::<MemNode>() as u32;

/// The managed arena plus its allocation bookkeeping.
pub struct MemoryRegion {
    buffer: Box<[u8]>,
    /// Data offset of the most recent allocation; equals `malloc_start`
    /// when the region is empty.
    malloc_next: u32,
    /// Top of the region: the sentinel node's data offset.
    malloc_start: u32,
    /// Lowest offset allocatable; also keeps offset 0 free to act as
    /// null.
    malloc_end: u32,
}

impl MemoryRegion {
    /// Builds a region over `size` bytes of RAM. The top node is a
    /// non-zero-size sentinel so the compaction walk always terminates.
    pub fn new(size: usize) -> Self {
        assert!(size >= 2 * MEM_NODE_SIZE as usize, "region too small");
        let mut region = Self {
            buffer: vec![0u8; size].into_boxed_slice(),
            malloc_next: size as u32,
            malloc_start: size as u32,
            malloc_end: MEM_NODE_SIZE,
        };
        region.write_node(
            region.malloc_start,
            MemNode {
                prev: 0,
                size: u16::MAX,
                owner: OWNER_NONE,
            },
        );
        region
    }

    fn read_node(&self, data_offset: u32) -> MemNode {
        let start = (data_offset - MEM_NODE_SIZE) as usize;
        MemNode::read_from_bytes(&self.buffer[start..data_offset as usize])
            .expect("node record is exactly MEM_NODE_SIZE bytes")
    }

    fn write_node(&mut self, data_offset: u32, node: MemNode) {
        let start = (data_offset - MEM_NODE_SIZE) as usize;
        node.write_to(&mut self.buffer[start..data_offset as usize])
            .expect("node record is exactly MEM_NODE_SIZE bytes");
    }

    fn is_dynamic_pointer(&self, ptr: u32) -> bool {
        ptr >= self.malloc_end && ptr <= self.malloc_start && ptr != 0
    }

    /// Bytes still available for allocation.
    pub fn free_bytes(&self) -> usize {
        (self.malloc_next - self.malloc_end) as usize
    }

    /// Total bytes under management.
    pub fn total_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Shared-address-space read access to arena contents.
    pub fn bytes(&self, offset: u32, length: usize) -> Option<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(length)?;
        self.buffer.get(start..end)
    }

    /// Shared-address-space write access to arena contents.
    pub fn bytes_mut(&mut self, offset: u32, length: usize) -> Option<&mut [u8]> {
        let start = offset as usize;
        let end = start.checked_add(length)?;
        self.buffer.get_mut(start..end)
    }

    /// Recorded size of an allocation, 0 for anything else.
    pub fn size_of(&self, ptr: u32) -> usize {
        if self.is_dynamic_pointer(ptr) {
            usize::from(self.read_node(ptr).size)
        } else {
            0
        }
    }

    /// Frees a previously-allocated offset. Freeing the top-of-heap
    /// block compacts past every already-free node below the sentinel;
    /// freeing anything else leaves a hole until a later top free.
    /// Pointers outside the region are silently ignored.
    pub fn free(&mut self, ptr: u32) {
        if !self.is_dynamic_pointer(ptr) {
            return;
        }
        let mut node = self.read_node(ptr);
        if node.size == 0 {
            // Double free; nothing to do.
            return;
        }
        node.size = 0;
        node.owner = OWNER_NONE;
        self.write_node(ptr, node);

        if ptr == self.malloc_next {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let mut cur = self.malloc_next;
        while cur != 0 {
            let node = self.read_node(cur);
            if node.size != 0 {
                break;
            }
            self.malloc_next = node.prev;
            cur = node.prev;
        }
    }

    /// The allocator entry point; `ptr == 0` allocates fresh memory and
    /// `size == 0` frees. Returns the data offset, or `None` when out of
    /// memory or handed a foreign pointer.
    pub fn realloc(&mut self, ptr: u32, size: usize, owner: ProcessId) -> Option<u32> {
        let size = u16::try_from((size + 7) & !7).ok()?;

        if size == 0 {
            self.free(ptr);
            return None;
        }

        if self.is_dynamic_pointer(ptr) {
            let node = self.read_node(ptr);
            if size <= node.size {
                // Fits where it is. The recorded size is deliberately
                // not shrunk.
                return Some(ptr);
            }
            if ptr == self.malloc_next {
                // Top of heap: extend downward in place.
                let old_size = u32::from(node.size);
                let grown = ptr + old_size - u32::from(size);
                if grown >= self.malloc_end + MEM_NODE_SIZE {
                    self.write_node(
                        grown,
                        MemNode {
                            prev: node.prev,
                            size,
                            owner: node.owner,
                        },
                    );
                    self.buffer.copy_within(
                        ptr as usize..(ptr + old_size) as usize,
                        grown as usize,
                    );
                    self.malloc_next = grown;
                    return Some(grown);
                }
                return None;
            }
        } else if ptr != 0 {
            // Not ours; we cannot resize it.
            return None;
        }

        // Fresh allocation below the current top.
        let needed = u32::from(size) + MEM_NODE_SIZE;
        if self.malloc_next < self.malloc_end + needed {
            return None;
        }
        let fresh = self.malloc_next - needed;
        self.write_node(
            fresh,
            MemNode {
                prev: self.malloc_next,
                size,
                owner: u16::from(owner.0),
            },
        );
        self.malloc_next = fresh;

        if ptr != 0 {
            let old_size = self.size_of(ptr);
            self.buffer
                .copy_within(ptr as usize..ptr as usize + old_size, fresh as usize);
            self.free(ptr);
        }

        Some(fresh)
    }

    /// Frees every node owned by `pid`, then compacts from the top.
    pub fn free_by_owner(&mut self, pid: ProcessId) {
        let target = u16::from(pid.0);

        let mut cur = self.malloc_next;
        while cur != 0 {
            let mut node = self.read_node(cur);
            let prev = node.prev;
            if node.owner == target {
                node.size = 0;
                node.owner = OWNER_NONE;
                self.write_node(cur, node);
            }
            cur = prev;
        }

        self.compact();
    }

    /// Re-tags an allocation with a new owner. The scheduler uses this
    /// when handing launch payloads to a freshly created process; the
    /// caller is responsible for the privilege check.
    pub fn assign_owner(&mut self, ptr: u32, pid: ProcessId) -> bool {
        if !self.is_dynamic_pointer(ptr) {
            return false;
        }
        let mut node = self.read_node(ptr);
        if node.size == 0 {
            return false;
        }
        node.owner = u16::from(pid.0);
        self.write_node(ptr, node);
        true
    }

    /// True when no node other than the sentinel holds memory. Used by
    /// invariant checks.
    pub fn is_empty(&self) -> bool {
        self.malloc_next == self.malloc_start
    }

    #[cfg(test)]
    fn owners(&self) -> Vec<(u32, u16, u16)> {
        let mut out = Vec::new();
        let mut cur = self.malloc_next;
        while cur != 0 {
            let node = self.read_node(cur);
            out.push((cur, node.size, node.owner));
            cur = node.prev;
        }
        out
    }
}

/// The memory manager process (PID 2). Handles a scheduler-delivered
/// message first, then drains its own queue, then yields.
#[derive(Default)]
pub struct MemoryManager;

impl Process for MemoryManager {
    fn run(&mut self, cx: &mut ExecContext<'_>) -> Step {
        if let Some(index) = cx.take_scheduler_message() {
            self.dispatch(cx, index);
        }
        while let Some(index) = cx.pop_message() {
            self.dispatch(cx, index);
        }
        Step::Yield
    }
}

impl MemoryManager {
    fn dispatch(&mut self, cx: &mut ExecContext<'_>, index: crate::msg::MessageIndex) {
        let msg_type = cx.message(index).msg_type;
        let command = match MemoryManagerCommand::try_from(msg_type) {
            Ok(command) => command,
            Err(()) => {
                debug_assert!(msg_type >= NUM_MEMORY_MANAGER_COMMANDS);
                log::warn!("memory manager: dropping unknown command {msg_type}");
                cx.release(index);
                return;
            }
        };

        match command {
            MemoryManagerCommand::Realloc => self.handle_realloc(cx, index),
            MemoryManagerCommand::Free => self.handle_free(cx, index),
            MemoryManagerCommand::GetFreeMemory => self.handle_get_free_memory(cx, index),
            MemoryManagerCommand::FreeProcessMemory => {
                self.handle_free_process_memory(cx, index)
            }
        }
    }

    /// REALLOC: `func` = pointer (0 to allocate fresh), `data` = new
    /// size. Replies with the new pointer, 0 on out-of-memory.
    fn handle_realloc(&mut self, cx: &mut ExecContext<'_>, index: crate::msg::MessageIndex) {
        let message = cx.message(index);
        let from = message.from;
        let ptr = message.func as u32;
        let size = message.data as usize;

        let new_ptr = cx.allocator().realloc(ptr, size, from).unwrap_or(0);
        let recorded = cx.allocator().size_of(new_ptr);

        let reply = crate::msg::MessageBuilder::new(
            MemoryManagerResponse::ReturningPointer as u16,
        )
        .func(u64::from(new_ptr))
        .data(recorded as u64)
        .size(recorded);
        if cx.reply(index, reply).is_err() {
            log::warn!("memory manager: could not deliver realloc reply");
        }
    }

    /// FREE: `data` = pointer. Fire and forget; the handler releases the
    /// message.
    fn handle_free(&mut self, cx: &mut ExecContext<'_>, index: crate::msg::MessageIndex) {
        let ptr = cx.message(index).data as u32;
        cx.allocator().free(ptr);
        cx.release(index);
    }

    /// GET_FREE_MEMORY: replies with the free byte count in the `size`
    /// field.
    fn handle_get_free_memory(
        &mut self,
        cx: &mut ExecContext<'_>,
        index: crate::msg::MessageIndex,
    ) {
        let free = cx.allocator().free_bytes();
        let reply = crate::msg::MessageBuilder::new(
            MemoryManagerResponse::ReturningFreeMemory as u16,
        )
        .data(free as u64)
        .size(free);
        if cx.reply(index, reply).is_err() {
            log::warn!("memory manager: could not deliver free-memory reply");
        }
    }

    /// FREE_PROCESS_MEMORY: `data` = PID. Only the scheduler may do
    /// this; anyone else gets a non-zero status and a log line.
    fn handle_free_process_memory(
        &mut self,
        cx: &mut ExecContext<'_>,
        index: crate::msg::MessageIndex,
    ) {
        let message = cx.message(index);
        let from = message.from;
        let waiting = message.waiting;
        let pid = ProcessId(message.data as u8);

        let status: u64 = if from == ProcessId::SCHEDULER {
            cx.allocator().free_by_owner(pid);
            0
        } else {
            log::warn!(
                "memory manager: process {} may not free another process's memory",
                from.0
            );
            1
        };

        if waiting {
            let reply = crate::msg::MessageBuilder::new(
                MemoryManagerResponse::ReturningStatus as u16,
            )
            .data(status);
            if cx.reply(index, reply).is_err() {
                log::warn!("memory manager: could not deliver reclaim reply");
            }
        } else {
            cx.release(index);
        }
    }
}
