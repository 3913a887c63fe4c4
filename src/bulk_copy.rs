//! Bundle-to-bundle and kernel-buffer-to-bundle copy routines.
//!
//! [`transfer`] drives a bundle-to-bundle copy page by page, suspending at
//! either side's `fetch_range` and resuming through the same worklet
//! discipline as everything else in this crate — a CoW chain materialising
//! its copy store from a Frontal-backed root is the case that actually
//! needs this. [`copy_to_bundle`]/[`copy_from_bundle`] move a plain kernel
//! buffer in or out of a bundle that is assumed never to suspend (true of
//! every variant except `FrontalMemory` and a CoW chain's walk), which
//! keeps them a simple loop instead of a continuation.

extern crate alloc;

use alloc::sync::Arc;

use crate::lock::{CriticalLock, NullInterrupts};
use crate::memory_object::{FetchNode, FetchRange, Memory};
use crate::page::{PageAccessor, PAGE_SIZE};
use crate::platform::PhysicalMap;
use crate::worklet::Worklet;

struct TransferShared {
    dest: Arc<dyn Memory>,
    dest_offset: usize,
    src: Arc<dyn Memory>,
    src_offset: usize,
    size: usize,
    mapper: Arc<dyn PhysicalMap>,
    state: CriticalLock<TransferState>,
}

struct TransferState {
    progress: usize,
    worklet: Worklet,
}

/// Copy `size` bytes from `src` (at `src_offset`) into `dest` (at
/// `dest_offset`). Returns `true` if it completed synchronously; otherwise
/// `worklet` fires once every byte has landed.
///
/// Panics (via the bounds asserts below) if either range runs past its
/// bundle's length — this is a programming error, not a runtime condition.
pub fn transfer(
    dest: Arc<dyn Memory>,
    dest_offset: usize,
    src: Arc<dyn Memory>,
    src_offset: usize,
    size: usize,
    mapper: Arc<dyn PhysicalMap>,
    worklet: Worklet,
) -> bool {
    assert!(dest_offset + size <= dest.length());
    assert!(src_offset + size <= src.length());
    let shared = Arc::new(TransferShared {
        dest,
        dest_offset,
        src,
        src_offset,
        size,
        mapper,
        state: CriticalLock::new(TransferState { progress: 0, worklet }),
    });
    process(shared, true)
}

fn process(shared: Arc<TransferShared>, top_level: bool) -> bool {
    loop {
        let progress = shared.state.lock_bare().progress;
        if progress >= shared.size {
            finish(&shared, top_level);
            return true;
        }

        let mut dest_fetch = FetchNode::new();
        let dest_ready = shared.dest.fetch_range(shared.dest_offset + progress, &mut dest_fetch);
        let dest_range = if dest_ready {
            dest_fetch.range()
        } else {
            let shared2 = shared.clone();
            let slot = dest_fetch.slot();
            dest_fetch.worklet.set(move || {
                let range = slot.lock_bare().expect("dest fetch incomplete");
                resume_with_dest(shared2, range);
            });
            return false;
        };

        if !copy_with_dest(&shared, progress, dest_range) {
            return false;
        }
        // Synchronous chunk landed; loop around for the next one.
    }
}

/// Re-entry point once a suspended dest fetch's worklet has fired.
fn resume_with_dest(shared: Arc<TransferShared>, dest_range: FetchRange) {
    let progress = shared.state.lock_bare().progress;
    if copy_with_dest(&shared, progress, dest_range) {
        process(shared, false);
    }
    // else: copy_with_dest already armed its own resumption.
}

/// Fetch the source side for the chunk starting at `progress` (whose
/// destination range is already known) and copy it. Returns `true` if the
/// copy happened synchronously.
fn copy_with_dest(shared: &Arc<TransferShared>, progress: usize, dest_range: FetchRange) -> bool {
    let mut src_fetch = FetchNode::new();
    let src_ready = shared.src.fetch_range(shared.src_offset + progress, &mut src_fetch);
    if src_ready {
        let src_range = src_fetch.range();
        do_copy(shared, progress, dest_range, src_range);
        true
    } else {
        let shared2 = shared.clone();
        let slot = src_fetch.slot();
        src_fetch.worklet.set(move || {
            let src_range = slot.lock_bare().expect("src fetch incomplete");
            do_copy(&shared2, progress, dest_range, src_range);
            process(shared2, false);
        });
        false
    }
}

/// Copy the largest chunk that's safe given both sides' remaining
/// contiguous span and what's left of the whole transfer, then advance
/// progress by that amount.
fn do_copy(shared: &TransferShared, progress: usize, dest_range: FetchRange, src_range: FetchRange) {
    let chunk = dest_range
        .remaining
        .min(src_range.remaining)
        .min(shared.size - progress);
    assert!(chunk > 0);

    let dest_accessor = PageAccessor::new(shared.mapper.as_ref(), dest_range.physical);
    let src_accessor = PageAccessor::new(shared.mapper.as_ref(), src_range.physical);
    // SAFETY: both sides' `fetch_range` promised at least `chunk` readable
    // or writable bytes starting at their returned physical address.
    unsafe {
        core::ptr::copy_nonoverlapping(src_accessor.as_mut_ptr(), dest_accessor.as_mut_ptr(), chunk);
    }

    let mut state = shared.state.lock::<NullInterrupts>();
    state.progress += chunk;
    state.unlock();
}

fn finish(shared: &TransferShared, top_level: bool) {
    if top_level {
        return;
    }
    let mut state = shared.state.lock::<NullInterrupts>();
    let worklet = core::mem::replace(&mut state.worklet, Worklet::unset());
    state.unlock();
    worklet.fire();
}

/// Write `data` into `dest` starting at `offset`. Assumes `dest.fetch_range`
/// always completes synchronously (true for every variant except
/// `FrontalMemory`/a CoW mapping — use [`transfer`] against those).
pub fn copy_to_bundle(dest: &dyn Memory, mut offset: usize, mut data: &[u8], mapper: &dyn PhysicalMap) {
    while !data.is_empty() {
        let mut node = FetchNode::new();
        let ready = dest.fetch_range(offset, &mut node);
        assert!(ready, "copy_to_bundle requires a non-suspending bundle");
        let range = node.range();
        let chunk = range.remaining.min(data.len());
        let accessor = PageAccessor::new(mapper, range.physical);
        // SAFETY: `fetch_range` promised `range.remaining` writable bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), accessor.as_mut_ptr(), chunk);
        }
        offset += chunk;
        data = &data[chunk..];
    }
}

/// Read `data.len()` bytes out of `src` starting at `offset` into `data`.
/// Same non-suspension assumption as [`copy_to_bundle`].
pub fn copy_from_bundle(src: &dyn Memory, mut offset: usize, mut data: &mut [u8], mapper: &dyn PhysicalMap) {
    while !data.is_empty() {
        let mut node = FetchNode::new();
        let ready = src.fetch_range(offset, &mut node);
        assert!(ready, "copy_from_bundle requires a non-suspending bundle");
        let range = node.range();
        let chunk = range.remaining.min(data.len());
        let accessor = PageAccessor::new(mapper, range.physical);
        // SAFETY: `fetch_range` promised `range.remaining` readable bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(accessor.as_mut_ptr(), data.as_mut_ptr(), chunk);
        }
        offset += chunk;
        let (_, rest) = data.split_at_mut(chunk);
        data = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_object::AllocatedMemory;
    use crate::test_support::TestArena;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn transfer_moves_bytes_end_to_end_between_allocated_bundles() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let src: Arc<dyn Memory> = Arc::new(AllocatedMemory::new(
            arena.clone(),
            arena.clone(),
            4 * PAGE_SIZE,
            PAGE_SIZE,
            PAGE_SIZE,
        ));
        let dest: Arc<dyn Memory> = Arc::new(AllocatedMemory::new(
            arena.clone(),
            arena.clone(),
            4 * PAGE_SIZE,
            PAGE_SIZE,
            PAGE_SIZE,
        ));

        let pattern: alloc::vec::Vec<u8> = (0..0x2000u32).map(|i| (i % 251) as u8).collect();
        copy_to_bundle(src.as_ref(), 0x123, &pattern, arena.as_ref());

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let mut worklet = Worklet::unset();
        worklet.set(move || fired_clone.store(true, Ordering::SeqCst));

        let done = transfer(dest.clone(), 0x0, src, 0x123, 0x2000, arena.clone(), worklet);
        assert!(done, "AllocatedMemory never suspends, transfer should finish synchronously");
        assert!(!fired.load(Ordering::SeqCst), "synchronous completion must not fire the worklet");

        let mut out = alloc::vec![0u8; 0x2000];
        copy_from_bundle(dest.as_ref(), 0x0, &mut out, arena.as_ref());
        assert_eq!(out, pattern);
    }

    #[test]
    fn copy_to_bundle_then_copy_from_bundle_round_trips_misaligned_ranges() {
        let arena = TestArena::new(16 * PAGE_SIZE);
        let mem = AllocatedMemory::new(arena.clone(), arena.clone(), 4 * PAGE_SIZE, PAGE_SIZE, PAGE_SIZE);
        let pattern: alloc::vec::Vec<u8> = (0..3000u32).map(|i| (i % 200) as u8).collect();
        copy_to_bundle(&mem, 777, &pattern, arena.as_ref());
        let mut out = alloc::vec![0u8; pattern.len()];
        copy_from_bundle(&mem, 777, &mut out, arena.as_ref());
        assert_eq!(out, pattern);
    }
}
