//! The memory-object (bundle) family: the unit of physical backing.
//!
//! Every variant exposes the same fetch contract (see [`Memory`]). Two of
//! the four variants — [`HardwareMemory`] and [`AllocatedMemory`] — are
//! self-contained and defined here. The other two, `BackingMemory` and
//! `FrontalMemory`, share state through a [`crate::managed_space::ManagedSpace`]
//! and live in that module.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::lock::{CriticalLock, NullInterrupts};
use crate::page::{CachingMode, PageAccessor, PhysicalAddress, ABSENT, PAGE_SIZE};
use crate::platform::{PhysicalAllocator, PhysicalMap};
use crate::worklet::Worklet;

/// Shared slot a [`FetchNode`]'s result is written into.
///
/// Split out from `FetchNode` itself so a bundle that must suspend (only
/// `FrontalMemory` does) can hand a clone of the slot to the completion
/// machinery and fire `node.worklet` without needing the node itself to
/// outlive the call — the caller is expected to have kept its own handle
/// (typically by boxing the node into its own continuation state) before
/// calling `fetch_range`.
pub type FetchSlot = Arc<CriticalLock<Option<FetchRange>>>;

/// Which concrete variant a [`Memory`] trait object is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTag {
    Hardware,
    Allocated,
    Backing,
    Frontal,
}

/// Output of a completed fetch: physical frame, how many bytes of the
/// underlying chunk/page remain contiguous from there, and caching mode.
#[derive(Debug, Clone, Copy)]
pub struct FetchRange {
    pub physical: PhysicalAddress,
    pub remaining: usize,
    pub caching: CachingMode,
}

/// Carries one in-flight `fetch_range` call across a possible suspension.
///
/// A caller that sees `fetch_range` return `true` may read
/// [`FetchNode::range`] immediately; a caller that sees `false` must wait
/// for `worklet` to fire before touching it (fast-path invariant).
pub struct FetchNode {
    pub worklet: Worklet,
    slot: FetchSlot,
}

impl FetchNode {
    pub fn new() -> Self {
        Self {
            worklet: Worklet::unset(),
            slot: Arc::new(CriticalLock::new(None)),
        }
    }

    /// Record the result of a completed fetch.
    pub fn complete(&self, physical: PhysicalAddress, remaining: usize, caching: CachingMode) {
        let mut slot = self.slot.lock::<NullInterrupts>();
        *slot = Some(FetchRange {
            physical,
            remaining,
            caching,
        });
        slot.unlock();
    }

    /// The completed range. Panics if the fetch hasn't completed yet —
    /// the caller's job is to only call this after `true` or a worklet fire.
    pub fn range(&self) -> FetchRange {
        let slot = self.slot.lock::<NullInterrupts>();
        let range = slot.expect("FetchNode::range() read before completion");
        slot.unlock();
        range
    }

    /// A clone of this node's result slot, handed to completion machinery
    /// that outlives this call (see [`FetchSlot`]).
    pub fn slot(&self) -> FetchSlot {
        self.slot.clone()
    }
}

impl Default for FetchNode {
    fn default() -> Self {
        Self::new()
    }
}

/// The common contract every bundle variant implements.
///
/// `peek_range` is synchronous and non-allocating: it never faults
/// anything in, only reports current residency. `fetch_range` may
/// allocate and populate a page; see the module docs on suspension.
pub trait Memory: Send + Sync {
    fn tag(&self) -> MemoryTag;

    /// Total addressable length in bytes.
    fn length(&self) -> usize;

    /// Report current residency for the page containing `offset` without
    /// materialising anything. Returns `(ABSENT, _)` if not resident.
    fn peek_range(&self, offset: usize) -> (PhysicalAddress, CachingMode);

    /// Ensure the page containing `offset` is backed, completing `node`
    /// either synchronously (`true`) or via `node.worklet` (`false`).
    fn fetch_range(&self, offset: usize, node: &mut FetchNode) -> bool;
}

/// Wraps a fixed physical range with a caching mode. Never allocates;
/// `fetch_range` always succeeds synchronously. Immutable length.
pub struct HardwareMemory {
    base: PhysicalAddress,
    length: usize,
    cache_mode: CachingMode,
}

impl HardwareMemory {
    pub fn new(base: PhysicalAddress, length: usize, cache_mode: CachingMode) -> Self {
        assert!(base.as_u64() % PAGE_SIZE as u64 == 0, "base must be page-aligned");
        assert!(length % PAGE_SIZE == 0, "length must be page-aligned");
        Self {
            base,
            length,
            cache_mode,
        }
    }
}

impl Memory for HardwareMemory {
    fn tag(&self) -> MemoryTag {
        MemoryTag::Hardware
    }

    fn length(&self) -> usize {
        self.length
    }

    fn peek_range(&self, offset: usize) -> (PhysicalAddress, CachingMode) {
        assert!(offset % PAGE_SIZE == 0);
        (self.base + offset as u64, self.cache_mode)
    }

    fn fetch_range(&self, offset: usize, node: &mut FetchNode) -> bool {
        assert!(offset % PAGE_SIZE == 0);
        node.complete(self.base + offset as u64, self.length - offset, self.cache_mode);
        true
    }
}

/// Anonymous memory divided into power-of-two **chunks**. A chunk is
/// either absent or owns a contiguous physical allocation; first access
/// allocates and zero-fills the whole chunk. Resizable upward only. On
/// drop, every present chunk is freed.
pub struct AllocatedMemory {
    allocator: Arc<dyn PhysicalAllocator>,
    mapper: Arc<dyn PhysicalMap>,
    chunk_size: usize,
    chunk_align: usize,
    chunks: CriticalLock<Vec<PhysicalAddress>>,
}

impl AllocatedMemory {
    /// `desired_chunk_size` is rounded up to a power of two;
    /// `desired_length` is rounded up to a multiple of that chunk size.
    pub fn new(
        allocator: Arc<dyn PhysicalAllocator>,
        mapper: Arc<dyn PhysicalMap>,
        desired_length: usize,
        desired_chunk_size: usize,
        chunk_align: usize,
    ) -> Self {
        let chunk_size = desired_chunk_size.next_power_of_two();
        let length = (desired_length + chunk_size - 1) & !(chunk_size - 1);
        assert!(chunk_size % PAGE_SIZE == 0);
        assert!(chunk_align % PAGE_SIZE == 0);
        assert!(chunk_size % chunk_align == 0);
        Self {
            allocator,
            mapper,
            chunk_size,
            chunk_align,
            chunks: CriticalLock::new(alloc::vec![ABSENT; length / chunk_size]),
        }
    }

    /// Grow the object to `new_length`, which must already be a multiple
    /// of the chunk size and no smaller than the current length.
    pub fn resize(&self, new_length: usize) {
        let mut chunks = self.chunks.lock::<NullInterrupts>();
        assert!(new_length % self.chunk_size == 0);
        let num_chunks = new_length / self.chunk_size;
        assert!(num_chunks >= chunks.len());
        chunks.resize(num_chunks, ABSENT);
        chunks.unlock();
    }

    /// Synchronous write used by `fork`'s eager-copy path: write `size`
    /// bytes (at most one page) at `offset`, allocating the backing chunk
    /// on demand.
    pub fn copy_kernel_to_this_sync(&self, offset: usize, data: &[u8]) {
        assert!(data.len() <= PAGE_SIZE);
        let mut chunks = self.chunks.lock::<NullInterrupts>();
        let index = offset / self.chunk_size;
        assert!(index < chunks.len());
        if chunks[index].is_absent() {
            chunks[index] = self.allocate_and_zero_chunk();
        }
        let chunk_base = chunks[index];
        chunks.unlock();

        let page_index = (offset % self.chunk_size) / PAGE_SIZE;
        let mut accessor =
            PageAccessor::new(self.mapper.as_ref(), chunk_base + (page_index * PAGE_SIZE) as u64);
        let page_off = offset % PAGE_SIZE;
        accessor.as_mut_slice()[page_off..page_off + data.len()].copy_from_slice(data);
    }

    fn allocate_and_zero_chunk(&self) -> PhysicalAddress {
        let physical = self
            .allocator
            .allocate(self.chunk_size, self.chunk_align)
            .expect("physical allocator exhausted");
        let mut progress = 0;
        while progress < self.chunk_size {
            let mut accessor =
                PageAccessor::new(self.mapper.as_ref(), physical + progress as u64);
            accessor.zero();
            progress += PAGE_SIZE;
        }
        physical
    }
}

impl Memory for AllocatedMemory {
    fn tag(&self) -> MemoryTag {
        MemoryTag::Allocated
    }

    fn length(&self) -> usize {
        let chunks = self.chunks.lock::<NullInterrupts>();
        let len = chunks.len() * self.chunk_size;
        chunks.unlock();
        len
    }

    fn peek_range(&self, offset: usize) -> (PhysicalAddress, CachingMode) {
        assert!(offset % PAGE_SIZE == 0);
        let chunks = self.chunks.lock::<NullInterrupts>();
        let index = offset / self.chunk_size;
        let disp = offset & (self.chunk_size - 1);
        assert!(index < chunks.len());
        let chunk = chunks[index];
        chunks.unlock();
        if chunk.is_absent() {
            (ABSENT, CachingMode::Null)
        } else {
            (chunk + disp as u64, CachingMode::Null)
        }
    }

    fn fetch_range(&self, offset: usize, node: &mut FetchNode) -> bool {
        let mut chunks = self.chunks.lock::<NullInterrupts>();
        let index = offset / self.chunk_size;
        let disp = offset & (self.chunk_size - 1);
        assert!(index < chunks.len());
        if chunks[index].is_absent() {
            chunks[index] = self.allocate_and_zero_chunk();
        }
        let chunk = chunks[index];
        chunks.unlock();

        node.complete(chunk + disp as u64, self.chunk_size - disp, CachingMode::Null);
        true
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        let chunks = self.chunks.lock_bare();
        for &chunk in chunks.iter() {
            if !chunk.is_absent() {
                self.allocator.free(chunk, self.chunk_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestArena;

    #[test]
    fn hardware_memory_fetch_is_always_synchronous() {
        let mem = HardwareMemory::new(PhysicalAddress::new(0x1000), PAGE_SIZE * 4, CachingMode::Null);
        let mut node = FetchNode::new();
        assert!(mem.fetch_range(0, &mut node));
        assert_eq!(node.range().physical, PhysicalAddress::new(0x1000));
    }

    #[test]
    fn allocated_memory_zero_fills_on_first_fetch() {
        let arena = TestArena::new(16 * PAGE_SIZE);
        let mem = AllocatedMemory::new(arena.clone(), arena.clone(), PAGE_SIZE * 4, PAGE_SIZE, PAGE_SIZE);

        assert_eq!(mem.peek_range(0).0, ABSENT);

        let mut node = FetchNode::new();
        assert!(mem.fetch_range(0, &mut node));
        let range = node.range();
        let accessor = PageAccessor::new(arena.as_ref(), range.physical);
        assert!(accessor.as_slice().iter().all(|&b| b == 0));

        // Second peek now observes the chunk.
        assert_ne!(mem.peek_range(0).0, ABSENT);
    }

    #[test]
    fn allocated_memory_resize_grows_only() {
        let arena = TestArena::new(16 * PAGE_SIZE);
        let mem = AllocatedMemory::new(arena.clone(), arena, PAGE_SIZE, PAGE_SIZE, PAGE_SIZE);
        mem.resize(PAGE_SIZE * 3);
        assert_eq!(mem.length(), PAGE_SIZE * 3);
    }
}
