//! The copy-on-write chain: an anti-linear list of per-generation overlay
//! objects, each owning a sparse set of pages that have diverged from its
//! parent.
//!
//! A chain's own [`CowChain::pages`] map is authoritative only for the pages
//! *this* generation has materialised. A miss walks toward the root — each
//! ancestor either owns the page (copy it down) or doesn't (keep walking),
//! terminating at a [`VirtualView`] that isn't itself a chain. The walk is
//! iterative rather than recursive: every step strictly shortens the
//! distance to the root, so there's no risk of unbounded stack growth from a
//! long fork lineage.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::bulk_copy::transfer;
use crate::lock::{CriticalLock, NullInterrupts};
use crate::memory_object::{AllocatedMemory, Memory, MemoryTag};
use crate::page::{CachingMode, PhysicalAddress, ABSENT, PAGE_SIZE};
use crate::platform::{PhysicalAllocator, PhysicalMap};
use crate::view::VirtualView;
use crate::worklet::Worklet;

pub(crate) type PageSlot = Arc<CriticalLock<Option<(PhysicalAddress, CachingMode)>>>;

/// Carries one in-flight [`CowChain::prepare_page`] call across a possible
/// suspension, the same shape as [`crate::memory_object::FetchNode`]. Also
/// reused by [`crate::mapping::Mapping::prepare_range`] for the `NormalMapping`
/// side, since both ultimately resolve to a `(physaddr, caching)` pair.
pub struct PrepareNode {
    pub worklet: Worklet,
    slot: PageSlot,
}

impl PrepareNode {
    pub fn new() -> Self {
        Self {
            worklet: Worklet::unset(),
            slot: Arc::new(CriticalLock::new(None)),
        }
    }

    pub fn complete(&self, physical: PhysicalAddress, caching: CachingMode) {
        let mut slot = self.slot.lock::<NullInterrupts>();
        *slot = Some((physical, caching));
        slot.unlock();
    }

    /// Panics if read before completion — same contract as `FetchNode::range`.
    pub fn result(&self) -> (PhysicalAddress, CachingMode) {
        let slot = self.slot.lock::<NullInterrupts>();
        let result = slot.expect("PrepareNode::result() read before completion");
        slot.unlock();
        result
    }

    /// Convenience accessor for call sites that only care about the frame.
    pub fn physical(&self) -> PhysicalAddress {
        self.result().0
    }

    pub(crate) fn slot_handle(&self) -> PageSlot {
        self.slot.clone()
    }
}

impl Default for PrepareNode {
    fn default() -> Self {
        Self::new()
    }
}

/// What a chain's materialisation walk bottoms out on: either another,
/// strictly older chain, or a terminal view onto a bundle. `Root`'s offset
/// plays the same role as a chain's `super_offset`: the mapping this chain
/// was built from may itself start partway into its view.
#[derive(Clone)]
enum Parent {
    Root { view: Arc<dyn VirtualView>, offset: usize },
    Chain(Arc<CowChain>),
}

/// One generation of a CoW lineage.
///
/// `pages` is a sparse page-index -> physical-frame map; a page present
/// here is always backed at the matching offset in `copy_store`. Lookups go
/// through the chain's mutex rather than raw atomics (see DESIGN.md) — the
/// rest of this crate makes the same trade, and a structural insert still
/// needs *some* exclusion.
pub struct CowChain {
    parent: Parent,
    super_offset: usize,
    length: usize,
    copy_store: Arc<AllocatedMemory>,
    mapper: Arc<dyn PhysicalMap>,
    pages: CriticalLock<BTreeMap<usize, PhysicalAddress>>,
}

impl CowChain {
    /// A chain whose parent is a terminal view (the common case: the first
    /// CoW generation over a plain mapping). `view_offset` is the mapping's
    /// own offset into `parent_view`, in case it doesn't start at zero.
    pub fn new_over_view(
        parent_view: Arc<dyn VirtualView>,
        view_offset: usize,
        length: usize,
        allocator: Arc<dyn PhysicalAllocator>,
        mapper: Arc<dyn PhysicalMap>,
    ) -> Arc<Self> {
        Self::new(
            Parent::Root {
                view: parent_view,
                offset: view_offset,
            },
            0,
            length,
            allocator,
            mapper,
        )
    }

    /// A chain layered on top of another, strictly older, chain.
    pub fn new_over_chain(
        parent: Arc<CowChain>,
        super_offset: usize,
        length: usize,
        allocator: Arc<dyn PhysicalAllocator>,
        mapper: Arc<dyn PhysicalMap>,
    ) -> Arc<Self> {
        Self::new(Parent::Chain(parent), super_offset, length, allocator, mapper)
    }

    fn new(
        parent: Parent,
        super_offset: usize,
        length: usize,
        allocator: Arc<dyn PhysicalAllocator>,
        mapper: Arc<dyn PhysicalMap>,
    ) -> Arc<Self> {
        assert!(length % PAGE_SIZE == 0);
        let copy_store = Arc::new(AllocatedMemory::new(
            allocator,
            mapper.clone(),
            length,
            PAGE_SIZE,
            PAGE_SIZE,
        ));
        Arc::new(Self {
            parent,
            super_offset,
            length,
            copy_store,
            mapper,
            pages: CriticalLock::new(BTreeMap::new()),
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// `resolveRange`: the fast lock-free-in-spirit path. Present means a
    /// fault isn't needed; absent forces one, which drives `prepare_page`.
    pub fn resolve_page(&self, page_index: usize) -> PhysicalAddress {
        let pages = self.pages.lock::<NullInterrupts>();
        let found = pages.get(&page_index).copied().unwrap_or(ABSENT);
        pages.unlock();
        found
    }

    fn local_lookup(&self, page_index: usize) -> Option<PhysicalAddress> {
        let pages = self.pages.lock::<NullInterrupts>();
        let found = pages.get(&page_index).copied();
        pages.unlock();
        found
    }

    /// Ensure the page at `page_index` is materialised into this chain's
    /// copy store, completing `node` synchronously (`true`) or via
    /// `node.worklet` once the underlying transfer lands (`false`).
    pub fn prepare_page(self: &Arc<Self>, page_index: usize, node: &mut PrepareNode) -> bool {
        assert!(page_index * PAGE_SIZE < self.length);
        if let Some(physical) = self.local_lookup(page_index) {
            node.complete(physical, CachingMode::Null);
            return true;
        }

        // Walk toward the root, accumulating displacement through each
        // ancestor's super_offset, until an ancestor owns the page or we
        // reach the terminal view.
        let mut disp = page_index * PAGE_SIZE;
        let mut current = self.parent.clone();
        loop {
            match current {
                Parent::Chain(ancestor) => {
                    let ancestor_index = disp / PAGE_SIZE;
                    if ancestor.local_lookup(ancestor_index).is_some() {
                        let src: Arc<dyn Memory> = ancestor.copy_store.clone();
                        return self.materialize(src, ancestor_index * PAGE_SIZE, page_index, node);
                    }
                    disp += ancestor.super_offset;
                    current = ancestor.parent.clone();
                }
                Parent::Root { view, offset } => {
                    let range = view.translate_range(disp + offset, PAGE_SIZE);
                    return self.materialize(range.bundle, range.displacement, page_index, node);
                }
            }
        }
    }

    /// Copy one page from `(src_bundle, src_offset)` into this chain's copy
    /// store at `page_index` and record the result in `pages`.
    fn materialize(
        self: &Arc<Self>,
        src_bundle: Arc<dyn Memory>,
        src_offset: usize,
        page_index: usize,
        node: &mut PrepareNode,
    ) -> bool {
        let dest_offset = page_index * PAGE_SIZE;
        let dest_bundle: Arc<dyn Memory> = self.copy_store.clone();
        let chain = self.clone();
        let node_slot = node.slot_handle();
        let outer_worklet = core::mem::replace(&mut node.worklet, Worklet::unset());

        let mut transfer_worklet = Worklet::unset();
        transfer_worklet.set(move || {
            let physical = chain.finish_materialize(page_index, dest_offset);
            let mut slot = node_slot.lock::<NullInterrupts>();
            *slot = Some((physical, CachingMode::Null));
            slot.unlock();
            outer_worklet.fire();
        });

        let ready = transfer(
            dest_bundle,
            dest_offset,
            src_bundle,
            src_offset,
            PAGE_SIZE,
            self.mapper.clone(),
            transfer_worklet,
        );
        if ready {
            let physical = self.finish_materialize(page_index, dest_offset);
            node.complete(physical, CachingMode::Null);
        }
        ready
    }

    fn finish_materialize(&self, page_index: usize, dest_offset: usize) -> PhysicalAddress {
        let (physical, _) = self.copy_store.peek_range(dest_offset);
        debug_assert!(!physical.is_absent());
        let mut pages = self.pages.lock::<NullInterrupts>();
        pages.insert(page_index, physical);
        pages.unlock();
        physical
    }
}

impl core::fmt::Debug for CowChain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CowChain")
            .field("length", &self.length)
            .field("super_offset", &self.super_offset)
            .field("tag", &MemoryTag::Allocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk_copy::{copy_from_bundle, copy_to_bundle};
    use crate::memory_object::AllocatedMemory;
    use crate::test_support::TestArena;
    use crate::view::ExteriorBundleView;

    fn root_view(arena: &Arc<TestArena>, pattern: u8) -> Arc<dyn VirtualView> {
        let bundle: Arc<dyn Memory> = Arc::new(AllocatedMemory::new(
            arena.clone(),
            arena.clone(),
            4 * PAGE_SIZE,
            PAGE_SIZE,
            PAGE_SIZE,
        ));
        copy_to_bundle(bundle.as_ref(), 0, &[pattern; PAGE_SIZE], arena.as_ref());
        Arc::new(ExteriorBundleView::new(bundle, 0, 4 * PAGE_SIZE))
    }

    #[test]
    fn prepare_page_materialises_from_root_view() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let view = root_view(&arena, 0xAA);
        let chain = CowChain::new_over_view(view, 0, 4 * PAGE_SIZE, arena.clone(), arena.clone());

        assert!(chain.resolve_page(0).is_absent());
        let mut node = PrepareNode::new();
        assert!(chain.prepare_page(0, &mut node));
        let physical = node.physical();
        assert_eq!(chain.resolve_page(0), physical);

        let mut out = [0u8; PAGE_SIZE];
        copy_from_bundle(chain.copy_store.as_ref(), 0, &mut out, arena.as_ref());
        assert!(out.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn child_chain_falls_through_to_grandparent_view() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let view = root_view(&arena, 0x55);
        let parent = CowChain::new_over_view(view, 0, PAGE_SIZE, arena.clone(), arena.clone());
        let child = CowChain::new_over_chain(parent.clone(), 0, PAGE_SIZE, arena.clone(), arena.clone());

        // Neither chain has materialised page 0 yet; child's walk must fall
        // through the (empty) parent chain to the root view.
        let mut node = PrepareNode::new();
        assert!(child.prepare_page(0, &mut node));
        assert!(parent.resolve_page(0).is_absent(), "materialising in the child must not populate the parent");
        assert_eq!(child.resolve_page(0), node.physical());
    }

    #[test]
    fn child_chain_copies_from_parent_chain_when_parent_already_has_the_page() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let view = root_view(&arena, 0x11);
        let parent = CowChain::new_over_view(view, 0, PAGE_SIZE, arena.clone(), arena.clone());

        let mut parent_node = PrepareNode::new();
        assert!(parent.prepare_page(0, &mut parent_node));
        let parent_physical = parent_node.physical();

        let child = CowChain::new_over_chain(parent.clone(), 0, PAGE_SIZE, arena.clone(), arena.clone());
        let mut child_node = PrepareNode::new();
        assert!(child.prepare_page(0, &mut child_node));
        let child_physical = child_node.physical();

        assert_ne!(parent_physical, child_physical, "child must own a distinct copy-store page");
    }
}
