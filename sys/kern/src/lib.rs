// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NanoOs kernel.
//!
//! A cooperatively multitasked micro-kernel for very small machines: a
//! fixed pool of processes multiplexed over one thread of execution, a
//! message pool as the only inter-process communication primitive, a
//! centralized owner-tagged allocator, and an RV32IM virtual machine
//! that runs user programs over file-backed paged segments.
//!
//! # Design principles
//!
//! 1. One thread, explicit suspension. A process runs until it returns
//!    a [`sched::Step`]; nothing preempts it.
//! 2. Indices, not references. Processes, messages and queues form a
//!    cyclic graph, so descriptors live in a PID-indexed arena and
//!    queues carry indices.
//! 3. Hardware behind traits. The filesystem and the serial console
//!    are collaborators plugged in at boot, which also makes the whole
//!    kernel runnable on a host.

#![forbid(unsafe_code)]

pub mod console;
pub mod exe;
pub mod fs;
pub mod memmgr;
pub mod msg;
pub mod overlay;
pub mod proc;
pub mod sched;
pub mod startup;
pub mod time;
pub mod users;
pub mod vm;
pub mod vmem;
