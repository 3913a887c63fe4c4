//! Host-side fakes for the external collaborators, used only by this
//! crate's own `#[cfg(test)]` modules. A real kernel supplies its own
//! physical allocator, page table, and work queue; these exist purely so
//! the paging pipeline can be exercised deterministically on the host.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::page::{PhysicalAddress, ABSENT, PAGE_SIZE};
use crate::platform::{PhysicalAllocator, PhysicalMap};
use crate::worklet::Worklet;

/// A fixed-capacity arena that plays both physical allocator (bump,
/// non-reclaiming) and physical-to-virtual mapper (identity offset into
/// the arena's own backing storage) for host tests.
pub struct TestArena {
    backing: Vec<u8>,
    next: AtomicUsize,
    capacity: usize,
}

impl TestArena {
    pub fn new(capacity: usize) -> Arc<Self> {
        let mut backing = Vec::with_capacity(capacity);
        backing.resize(capacity, 0u8);
        Arc::new(Self {
            backing,
            next: AtomicUsize::new(0),
            capacity,
        })
    }
}

impl PhysicalAllocator for TestArena {
    fn allocate(&self, size: usize, align: usize) -> Option<PhysicalAddress> {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned.checked_add(size)?;
            if end > self.capacity {
                return None;
            }
            if self
                .next
                .compare_exchange(current, end, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(PhysicalAddress::new(aligned as u64));
            }
        }
    }

    fn free(&self, _addr: PhysicalAddress, _size: usize) {
        // Bump allocator: reclaiming individual ranges isn't needed for tests.
    }
}

impl PhysicalMap for TestArena {
    unsafe fn map(&self, addr: PhysicalAddress) -> *mut u8 {
        assert!(!addr.is_absent());
        let offset = addr.as_u64() as usize;
        assert!(offset + PAGE_SIZE <= self.capacity, "address outside test arena");
        // SAFETY: `backing` is allocated once at its full capacity and
        // never reallocated afterward, so this pointer stays valid for
        // the arena's lifetime.
        unsafe { self.backing.as_ptr().cast_mut().add(offset) }
    }

    unsafe fn unmap(&self, _addr: PhysicalAddress) {}
}

/// Drives a [`Worklet`] immediately on `post`, so tests that exercise a
/// suspension path can observe its effects synchronously.
pub struct InlineWorkQueue;

impl crate::platform::WorkQueue for InlineWorkQueue {
    fn post(&self, worklet: Worklet) {
        worklet.fire();
    }
}

/// Wraps a [`crate::platform::ArchPageTable`] fake backed by a plain set,
/// good enough to assert install/uninstall behaviour in tests.
pub struct FakePageTable {
    mapped: crate::lock::CriticalLock<alloc::collections::BTreeSet<u64>>,
}

impl FakePageTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mapped: crate::lock::CriticalLock::new(alloc::collections::BTreeSet::new()),
        })
    }
}

impl crate::platform::ArchPageTable for FakePageTable {
    fn map_single_4k(
        &self,
        vaddr: crate::page::VirtualAddress,
        _phys: PhysicalAddress,
        _user: bool,
        _access: crate::platform::PageAccess,
        _caching: crate::page::CachingMode,
    ) {
        let mut mapped = self.mapped.lock::<crate::lock::NullInterrupts>();
        mapped.insert(vaddr.as_u64());
        mapped.unlock();
    }

    fn unmap_range(
        &self,
        vaddr: crate::page::VirtualAddress,
        length: usize,
        _mode: crate::platform::PageMode,
    ) {
        let mut mapped = self.mapped.lock::<crate::lock::NullInterrupts>();
        let mut addr = vaddr.as_u64();
        let end = addr + length as u64;
        while addr < end {
            mapped.remove(&addr);
            addr += PAGE_SIZE as u64;
        }
        mapped.unlock();
    }

    fn is_mapped(&self, vaddr: crate::page::VirtualAddress) -> bool {
        let mapped = self.mapped.lock::<crate::lock::NullInterrupts>();
        let result = mapped.contains(&vaddr.as_u64());
        mapped.unlock();
        result
    }

    fn submit_shootdown(&self, node: crate::platform::ShootdownHandle) {
        // Tests run single-threaded: fire the completion immediately.
        // submit_shootdown is documented as allowed to invoke it synchronously.
        node.fire();
    }

    fn activate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_allocate_respects_alignment_and_capacity() {
        let arena = TestArena::new(PAGE_SIZE * 4);
        let a = PhysicalAllocator::allocate(&*arena, PAGE_SIZE, PAGE_SIZE).unwrap();
        let b = PhysicalAllocator::allocate(&*arena, PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_ne!(a, b);
        assert!(PhysicalAllocator::allocate(&*arena, PAGE_SIZE * 10, PAGE_SIZE).is_none());
    }
}
