//! The demand-paging pipeline shared between a [`BackingMemory`] (the
//! physical-frame owner) and a [`FrontalMemory`] (what mappings actually
//! see). Exactly one [`ManagedSpace`] sits between the pair, holding the
//! per-page residency state and the queues that hand Missing pages off to
//! whatever external pager is driving `BackingMemory`.
//!
//! Three queues carry work across the gap: `initiate_load_queue` holds
//! Frontal requests waiting on a page; `submitted_manage_queue` holds
//! manager offers waiting on a Missing page to service; when the two meet,
//! consecutive Missing pages are fused onto one manager offer — a single
//! pager round-trip can then satisfy several queued Frontal requests,
//! which is the entire point of fusing rather than handing over one page
//! at a time. `pending_load_queue` holds Frontal requests whose page is
//! already Loading, waiting for [`ManagedSpace::complete_load`].

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::lock::{CriticalLock, NullInterrupts};
use crate::memory_object::{FetchNode, Memory, MemoryTag};
use crate::page::{CachingMode, PageAccessor, PhysicalAddress, ABSENT, PAGE_SIZE};
use crate::platform::{PhysicalAllocator, PhysicalMap};
use crate::worklet::Worklet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Missing,
    Loading,
    Loaded,
}

type ManageSlot = Arc<CriticalLock<Option<(usize, usize)>>>;

/// Carries one in-flight `submit_manage` call, analogous to [`FetchNode`].
pub struct ManageNode {
    pub worklet: Worklet,
    slot: ManageSlot,
}

impl ManageNode {
    pub fn new() -> Self {
        Self {
            worklet: Worklet::unset(),
            slot: Arc::new(CriticalLock::new(None)),
        }
    }

    /// The fused `(offset, length)` this manager request was bound to.
    /// Panics if called before completion.
    pub fn range(&self) -> (usize, usize) {
        let slot = self.slot.lock::<NullInterrupts>();
        let range = slot.expect("ManageNode::range() read before completion");
        slot.unlock();
        range
    }

    pub fn is_ready(&self) -> bool {
        self.slot.lock_bare().is_some()
    }
}

impl Default for ManageNode {
    fn default() -> Self {
        Self::new()
    }
}

struct LoadEntry {
    offset: usize,
    worklet: Worklet,
    slot: crate::memory_object::FetchSlot,
    result: Option<PhysicalAddress>,
}

struct ManageEntry {
    offset: usize,
    length: usize,
    worklet: Worklet,
    slot: ManageSlot,
}

struct Inner {
    pages: Vec<PhysicalAddress>,
    state: Vec<PageState>,
    initiate_load_queue: VecDeque<LoadEntry>,
    pending_load_queue: VecDeque<LoadEntry>,
    completed_load_queue: VecDeque<LoadEntry>,
    submitted_manage_queue: VecDeque<ManageEntry>,
    completed_manage_queue: VecDeque<ManageEntry>,
}

/// Owns the physical pages and residency state shared by exactly one
/// [`BackingMemory`]/[`FrontalMemory`] pair. Protected by a single mutex —
/// the one object-local lock this pipeline ever needs.
pub struct ManagedSpace {
    allocator: Arc<dyn PhysicalAllocator>,
    mapper: Arc<dyn PhysicalMap>,
    length: usize,
    inner: CriticalLock<Inner>,
}

impl ManagedSpace {
    pub fn new(allocator: Arc<dyn PhysicalAllocator>, mapper: Arc<dyn PhysicalMap>, length: usize) -> Arc<Self> {
        assert!(length % PAGE_SIZE == 0);
        let page_count = length / PAGE_SIZE;
        Arc::new(Self {
            allocator,
            mapper,
            length,
            inner: CriticalLock::new(Inner {
                pages: alloc::vec![ABSENT; page_count],
                state: alloc::vec![PageState::Missing; page_count],
                initiate_load_queue: VecDeque::new(),
                pending_load_queue: VecDeque::new(),
                completed_load_queue: VecDeque::new(),
                submitted_manage_queue: VecDeque::new(),
                completed_manage_queue: VecDeque::new(),
            }),
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Backing's view: guarantee the page at `offset` has a physical frame,
    /// allocating and zeroing it on first touch. Never inspects or changes
    /// residency state — that's the manage/load pipeline's job.
    fn ensure_page(&self, offset: usize) -> PhysicalAddress {
        let mut inner = self.inner.lock::<NullInterrupts>();
        let idx = offset / PAGE_SIZE;
        if inner.pages[idx].is_absent() {
            let physical = self
                .allocator
                .allocate(PAGE_SIZE, PAGE_SIZE)
                .expect("physical allocator exhausted");
            let mut accessor = PageAccessor::new(self.mapper.as_ref(), physical);
            accessor.zero();
            inner.pages[idx] = physical;
        }
        let physical = inner.pages[idx];
        inner.unlock();
        physical
    }

    fn peek_page(&self, offset: usize) -> PhysicalAddress {
        let inner = self.inner.lock::<NullInterrupts>();
        let phys = inner.pages[offset / PAGE_SIZE];
        inner.unlock();
        phys
    }

    /// Frontal's view: only a `Loaded` page is visible.
    fn frontal_peek(&self, offset: usize) -> (PhysicalAddress, CachingMode) {
        let inner = self.inner.lock::<NullInterrupts>();
        let idx = offset / PAGE_SIZE;
        let result = if inner.state[idx] == PageState::Loaded {
            (inner.pages[idx], CachingMode::Null)
        } else {
            (ABSENT, CachingMode::Null)
        };
        inner.unlock();
        result
    }

    fn frontal_fetch(&self, offset: usize, node: &mut FetchNode) -> bool {
        let mut inner = self.inner.lock::<NullInterrupts>();
        let idx = offset / PAGE_SIZE;
        if inner.state[idx] == PageState::Loaded {
            let physical = inner.pages[idx];
            inner.unlock();
            node.complete(physical, PAGE_SIZE, CachingMode::Null);
            return true;
        }

        inner.initiate_load_queue.push_back(LoadEntry {
            offset,
            worklet: core::mem::replace(&mut node.worklet, Worklet::unset()),
            slot: node.slot(),
            result: None,
        });
        progress_loads(&mut inner);
        let (loads, manages) = drain_completions(&mut inner);
        inner.unlock();

        fire_loads(loads);
        // Any manage offer completed here belongs to some earlier,
        // already-returned `submit_manage` call, never to this one — a
        // Frontal fetch never submits a manage offer itself — so every
        // entry fires.
        fire_manages(manages, None);
        false
    }

    /// Backing's way of offering to service whatever Missing pages are
    /// waiting. Returns `true` if fused synchronously (rare — usually
    /// there's no Missing page waiting yet and the offer just queues).
    ///
    /// When the fuse happens inside this very call, `node`'s own worklet
    /// (just moved into the queued entry) must not fire — the synchronous
    /// `true` return is the only signal the caller gets, same discipline as
    /// `bulk_copy::process`/`finish`. `own_slot` is how `fire_manages` tells
    /// that entry apart from any other, previously-queued offer that also
    /// happens to resolve during this call's `progress_loads` pass (those
    /// belong to a different, already-returned `submit_manage` call and
    /// must still fire).
    pub fn submit_manage(&self, node: &mut ManageNode) -> bool {
        let mut inner = self.inner.lock::<NullInterrupts>();
        let own_slot = node.slot.clone();
        inner.submitted_manage_queue.push_back(ManageEntry {
            offset: 0,
            length: 0,
            worklet: core::mem::replace(&mut node.worklet, Worklet::unset()),
            slot: own_slot.clone(),
        });
        progress_loads(&mut inner);
        let (loads, manages) = drain_completions(&mut inner);
        inner.unlock();

        fire_loads(loads);
        fire_manages(manages, Some(&own_slot));
        node.is_ready()
    }

    /// Backing calls this once it has filled `[offset, offset+length)`
    /// with real content, flipping those pages `Loading -> Loaded` and
    /// waking every Frontal request that was waiting on them.
    pub fn complete_load(&self, offset: usize, length: usize) {
        assert!(offset % PAGE_SIZE == 0 && length % PAGE_SIZE == 0);
        let mut inner = self.inner.lock::<NullInterrupts>();
        let start = offset / PAGE_SIZE;
        let count = length / PAGE_SIZE;
        for i in 0..count {
            debug_assert_eq!(
                inner.state[start + i],
                PageState::Loading,
                "completeLoad observed a page outside the range it was bound to"
            );
            inner.state[start + i] = PageState::Loaded;
        }

        let mut still_pending = VecDeque::new();
        while let Some(mut entry) = inner.pending_load_queue.pop_front() {
            let idx = entry.offset / PAGE_SIZE;
            if inner.state[idx] == PageState::Loaded {
                entry.result = Some(inner.pages[idx]);
                inner.completed_load_queue.push_back(entry);
            } else {
                still_pending.push_back(entry);
            }
        }
        inner.pending_load_queue = still_pending;

        let (loads, manages) = drain_completions(&mut inner);
        inner.unlock();

        fire_loads(loads);
        fire_manages(manages, None);
    }
}

/// Advance `initiate_load_queue` as far as it can go without blocking:
/// Loaded pages move straight to `completed_load_queue`, Loading pages
/// move to `pending_load_queue` to await `complete_load`, and a Missing
/// page at the front fuses onto one waiting manager offer together with
/// however many of the *next queued requests* are for the immediately
/// following, still-Missing pages — never further, and never a page no
/// request has actually asked for.
fn progress_loads(inner: &mut Inner) {
    loop {
        let Some(front) = inner.initiate_load_queue.front() else {
            break;
        };
        let page_index = front.offset / PAGE_SIZE;
        match inner.state[page_index] {
            PageState::Loaded => {
                let mut entry = inner.initiate_load_queue.pop_front().unwrap();
                entry.result = Some(inner.pages[page_index]);
                inner.completed_load_queue.push_back(entry);
            }
            PageState::Loading => {
                let entry = inner.initiate_load_queue.pop_front().unwrap();
                inner.pending_load_queue.push_back(entry);
            }
            PageState::Missing => {
                if inner.submitted_manage_queue.is_empty() {
                    log::debug!("progress_loads stalled at page {page_index}: no manager offer queued");
                    break;
                }
                // Bound the fuse by the consecutive requests actually
                // queued for these pages, not by the managed space's whole
                // page count — spec.md's "within this load's remaining
                // length" (see usermem.cpp's progress/length check). A page
                // nobody asked for must never be dragged into Loading just
                // because it happens to sit between two unrelated requests
                // or past the last queued one.
                let mut fused = 0usize;
                for entry in inner.initiate_load_queue.iter() {
                    let idx = entry.offset / PAGE_SIZE;
                    if idx != page_index + fused || inner.state[idx] != PageState::Missing {
                        break;
                    }
                    fused += 1;
                }
                let mut manage = inner.submitted_manage_queue.pop_front().unwrap();
                manage.offset = page_index * PAGE_SIZE;
                manage.length = fused * PAGE_SIZE;
                for i in 0..fused {
                    inner.state[page_index + i] = PageState::Loading;
                }
                inner.completed_manage_queue.push_back(manage);
                // Loop again: the same front entry is now Loading and will
                // be classified into pending_load_queue on the next pass.
            }
        }
    }
}

fn drain_completions(inner: &mut Inner) -> (VecDeque<LoadEntry>, VecDeque<ManageEntry>) {
    (
        core::mem::take(&mut inner.completed_load_queue),
        core::mem::take(&mut inner.completed_manage_queue),
    )
}

fn fire_loads(loads: VecDeque<LoadEntry>) {
    for entry in loads {
        let physical = entry.result.expect("completed load entry missing its result");
        {
            let mut slot = entry.slot.lock::<NullInterrupts>();
            *slot = Some(crate::memory_object::FetchRange {
                physical,
                remaining: PAGE_SIZE,
                caching: CachingMode::Null,
            });
            slot.unlock();
        }
        entry.worklet.fire();
    }
}

/// Fire every completed manage entry's worklet, except `skip` — the offer
/// (if any) that just resolved synchronously inside the call that submitted
/// it, whose caller already observed completion via a `true` return and
/// must not also see its worklet fire.
fn fire_manages(manages: VecDeque<ManageEntry>, skip: Option<&ManageSlot>) {
    for entry in manages {
        {
            let mut slot = entry.slot.lock::<NullInterrupts>();
            *slot = Some((entry.offset, entry.length));
            slot.unlock();
        }
        if skip.is_some_and(|s| Arc::ptr_eq(&entry.slot, s)) {
            continue;
        }
        entry.worklet.fire();
    }
}

/// The physical-frame owner in a managed pair. `peek_range`/`fetch_range`
/// allocate on demand and never consult residency state; an external
/// pager drives [`ManagedSpace::submit_manage`]/[`ManagedSpace::complete_load`]
/// directly using the same handle.
pub struct BackingMemory {
    space: Arc<ManagedSpace>,
}

impl BackingMemory {
    pub fn new(space: Arc<ManagedSpace>) -> Self {
        Self { space }
    }

    pub fn submit_manage(&self, node: &mut ManageNode) -> bool {
        self.space.submit_manage(node)
    }

    pub fn complete_load(&self, offset: usize, length: usize) {
        self.space.complete_load(offset, length)
    }
}

impl Memory for BackingMemory {
    fn tag(&self) -> MemoryTag {
        MemoryTag::Backing
    }

    fn length(&self) -> usize {
        self.space.length()
    }

    fn peek_range(&self, offset: usize) -> (PhysicalAddress, CachingMode) {
        (self.space.peek_page(offset), CachingMode::Null)
    }

    fn fetch_range(&self, offset: usize, node: &mut FetchNode) -> bool {
        let physical = self.space.ensure_page(offset);
        node.complete(physical, PAGE_SIZE, CachingMode::Null);
        true
    }
}

/// What mappings actually see: a page only resolves once the manage/load
/// pipeline has marked it `Loaded`. `fetch_range` on a not-yet-loaded page
/// queues the request and returns `false`.
pub struct FrontalMemory {
    space: Arc<ManagedSpace>,
}

impl FrontalMemory {
    pub fn new(space: Arc<ManagedSpace>) -> Self {
        Self { space }
    }
}

impl Memory for FrontalMemory {
    fn tag(&self) -> MemoryTag {
        MemoryTag::Frontal
    }

    fn length(&self) -> usize {
        self.space.length()
    }

    fn peek_range(&self, offset: usize) -> (PhysicalAddress, CachingMode) {
        self.space.frontal_peek(offset)
    }

    fn fetch_range(&self, offset: usize, node: &mut FetchNode) -> bool {
        self.space.frontal_fetch(offset, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestArena;

    fn space(pages: usize) -> Arc<ManagedSpace> {
        let arena = TestArena::new(pages * PAGE_SIZE * 2);
        ManagedSpace::new(arena.clone(), arena, pages * PAGE_SIZE)
    }

    #[test]
    fn frontal_fetch_queues_until_backing_completes_load() {
        let space = space(2);
        let backing = BackingMemory::new(space.clone());
        let frontal = FrontalMemory::new(space);

        let mut fetch = FetchNode::new();
        let fired = Arc::new(core::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        fetch.worklet.set(move || fired_clone.store(true, core::sync::atomic::Ordering::SeqCst));
        assert!(!frontal.fetch_range(0, &mut fetch));

        let mut manage = ManageNode::new();
        // The manage offer binds synchronously since page 0 was already Missing.
        assert!(backing.submit_manage(&mut manage));
        let (offset, length) = manage.range();
        assert_eq!(offset, 0);
        assert!(length >= PAGE_SIZE);

        assert!(!fired.load(core::sync::atomic::Ordering::SeqCst));
        backing.complete_load(offset, length);
        assert!(fired.load(core::sync::atomic::Ordering::SeqCst));

        // Now resolves synchronously.
        let mut second = FetchNode::new();
        assert!(frontal.fetch_range(0, &mut second));
    }

    #[test]
    fn consecutive_missing_pages_fuse_onto_one_manage_request() {
        let space = space(3);
        let backing = BackingMemory::new(space.clone());
        let frontal = FrontalMemory::new(space);

        let mut a = FetchNode::new();
        let mut b = FetchNode::new();
        assert!(!frontal.fetch_range(0, &mut a));
        assert!(!frontal.fetch_range(PAGE_SIZE, &mut b));

        let mut manage = ManageNode::new();
        assert!(backing.submit_manage(&mut manage));
        let (offset, length) = manage.range();
        assert_eq!(offset, 0);
        assert_eq!(length, 2 * PAGE_SIZE);
    }
}
