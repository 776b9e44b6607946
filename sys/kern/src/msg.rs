// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inter-process messages.
//!
//! Messages are the only sanctioned way for processes to communicate. A
//! global fixed pool holds every message record; per-process FIFO queues
//! hold indices into the pool, never references (the descriptor/message/
//! queue graph is cyclic, so everything is index-addressed). A message
//! carries two opaque payload words, `func` and `data` (the names are
//! historical wire-format ones), plus a `size` field used by replies
//! that report a byte count.

use nanoos_abi::{ProcessId, NUM_MESSAGES};

/// Index of a message slot in the global pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct MessageIndex(pub(crate) u8);

impl MessageIndex {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// One message record.
#[derive(Clone, Debug)]
pub struct Message {
    /// Command or response number, scoped to the recipient process.
    pub msg_type: u16,
    pub from: ProcessId,
    pub to: ProcessId,
    /// Slot is out of the pool.
    pub in_use: bool,
    /// Recipient has finished handling the message.
    pub done: bool,
    /// Sender intends to wait for a reply.
    pub waiting: bool,
    /// First opaque payload word.
    pub func: u64,
    /// Second opaque payload word.
    pub data: u64,
    /// Byte-count side channel used by some replies.
    pub size: usize,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            msg_type: 0,
            from: ProcessId::SCHEDULER,
            to: ProcessId::SCHEDULER,
            in_use: false,
            done: false,
            waiting: false,
            func: 0,
            data: 0,
            size: 0,
        }
    }
}

/// Builds a message in one step before its first send, so a
/// half-initialized record can never enter a queue.
#[derive(Copy, Clone, Debug)]
pub struct MessageBuilder {
    msg_type: u16,
    func: u64,
    data: u64,
    size: usize,
    waiting: bool,
}

impl MessageBuilder {
    pub fn new(msg_type: u16) -> Self {
        Self {
            msg_type,
            func: 0,
            data: 0,
            size: 0,
            waiting: false,
        }
    }

    pub fn func(mut self, func: u64) -> Self {
        self.func = func;
        self
    }

    pub fn data(mut self, data: u64) -> Self {
        self.data = data;
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Marks the sender as waiting for a reply.
    pub fn waiting(mut self) -> Self {
        self.waiting = true;
        self
    }

    pub(crate) fn fill(self, message: &mut Message, from: ProcessId, to: ProcessId) {
        message.msg_type = self.msg_type;
        message.from = from;
        message.to = to;
        message.func = self.func;
        message.data = self.data;
        message.size = self.size;
        message.waiting = self.waiting;
        message.done = false;
        message.in_use = true;
    }
}

/// The global pool of message records.
pub struct MessagePool {
    slots: [Message; NUM_MESSAGES],
}

impl MessagePool {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Message::default()),
        }
    }

    /// Finds a free slot by linear scan; single-threaded, so no locking.
    /// Returns `None` when the pool is exhausted; the caller yields and
    /// retries.
    pub fn acquire(&mut self) -> Option<MessageIndex> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                slot.done = false;
                slot.waiting = false;
                return Some(MessageIndex(i as u8));
            }
        }
        None
    }

    /// Returns a message to the pool.
    pub fn release(&mut self, index: MessageIndex) {
        let slot = &mut self.slots[index.index()];
        slot.in_use = false;
        slot.done = false;
        slot.waiting = false;
    }

    pub fn get(&self, index: MessageIndex) -> &Message {
        &self.slots[index.index()]
    }

    pub fn get_mut(&mut self, index: MessageIndex) -> &mut Message {
        &mut self.slots[index.index()]
    }

    /// Number of slots currently out of the pool.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_at_capacity_and_recovers_on_release() {
        let mut pool = MessagePool::new();
        let mut held = Vec::new();
        for _ in 0..NUM_MESSAGES {
            held.push(pool.acquire().expect("slot within capacity"));
        }
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_flight(), NUM_MESSAGES);

        pool.release(held[2]);
        let again = pool.acquire().expect("released slot is reusable");
        assert_eq!(again, held[2]);
    }

    #[test]
    fn builder_fills_every_field_before_send() {
        let mut pool = MessagePool::new();
        let index = pool.acquire().unwrap();

        MessageBuilder::new(7)
            .func(0xAAAA)
            .data(0xBBBB)
            .size(16)
            .waiting()
            .fill(pool.get_mut(index), ProcessId(3), ProcessId(2));

        let message = pool.get(index);
        assert_eq!(message.msg_type, 7);
        assert_eq!(message.from, ProcessId(3));
        assert_eq!(message.to, ProcessId(2));
        assert_eq!(message.func, 0xAAAA);
        assert_eq!(message.data, 0xBBBB);
        assert_eq!(message.size, 16);
        assert!(message.waiting);
        assert!(!message.done);
        assert!(message.in_use);
    }

    #[test]
    fn release_clears_flags() {
        let mut pool = MessagePool::new();
        let index = pool.acquire().unwrap();
        pool.get_mut(index).done = true;
        pool.release(index);
        assert!(!pool.get(index).in_use);
        assert!(!pool.get(index).done);
    }
}
