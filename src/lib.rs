//! Address-space and demand-paging core for the VeridianOS microkernel.
//!
//! This crate owns the parts of virtual memory management that sit between
//! the architecture page table and the rest of the kernel: hole/mapping
//! trees per address space, the four memory-object (bundle) variants, the
//! demand-paging pipeline that backs a pager-served bundle, copy-on-write
//! chains, bulk page-to-page copies, and the foreign-address-space
//! accessor used by syscall argument marshalling.
//!
//! It deliberately does not own: the physical frame allocator, the
//! architecture page table implementation, the kernel heap, the scheduler,
//! or pager IPC transport — see [`platform`] for the traits this crate
//! consumes instead of assuming.
//!
//! Suspension throughout the crate follows one pattern: an operation that
//! might need to wait (for a physical frame, a pager reply, a TLB
//! shootdown) takes a `&mut *Node` continuation argument and returns `bool`
//! — `true` means it already completed and the node can be read
//! immediately, `false` means the node's `worklet` will fire once it has.
//! See [`worklet`] and [`lock`] for the two primitives that make this safe
//! without `async`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod bulk_copy;
pub mod cow;
pub mod error;
pub mod lock;
pub mod managed_space;
pub mod mapping;
pub mod memory_object;
pub mod page;
pub mod platform;
pub mod view;
pub mod worklet;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{KernelError, KernelResult};
