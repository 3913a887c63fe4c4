//! The mapping family: a half-open virtual range bound either to a plain
//! [`VirtualView`] or to a [`CowChain`], plus the permission/fork-behaviour
//! flags an [`crate::address_space::AddressSpace`] needs to install it into
//! a page table, resolve a fault, or duplicate it across a `fork`.

extern crate alloc;

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::cow::{CowChain, PrepareNode};
use crate::memory_object::{FetchNode, Memory};
use crate::page::{CachingMode, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::platform::{ArchPageTable, PageAccess, PageMode};
use crate::view::VirtualView;

bitflags! {
    /// Permission and fork-behaviour bits a mapping carries. Mirrors the
    /// `map` flag space in spec §6: permission bits plus the fork-disposition
    /// and CoW-at-map-time bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;

        /// This mapping's range becomes a hole in a forked child.
        const DROP_AT_FORK = 1 << 3;
        /// This mapping's view is shared verbatim with a forked child.
        const SHARE_AT_FORK = 1 << 4;
        /// A forked child gets an independent copy of this mapping's data.
        const COPY_ON_WRITE_AT_FORK = 1 << 5;
        /// The mapping itself is CoW from the moment it's created.
        const COPY_ON_WRITE = 1 << 6;
    }
}

impl MappingFlags {
    /// Architectures without fine-grained permission bits coarsen the
    /// requested set: `W -> RW`, `X -> RX`, `WX -> RWX`; `R`/`RW`/`RWX` are
    /// already coarse enough and pass through unchanged. Zero permission
    /// bits is a caller bug, asserted here rather than reported (the
    /// caller's validation layer is expected to have rejected it already).
    pub fn coarsen_permissions(self) -> Self {
        let perm_bits = self & (Self::READ | Self::WRITE | Self::EXECUTE);
        assert!(!perm_bits.is_empty(), "map requires at least one permission bit");
        let coarsened = if perm_bits.contains(Self::WRITE) || perm_bits.contains(Self::EXECUTE) {
            Self::READ | perm_bits
        } else {
            perm_bits
        };
        (self - (Self::READ | Self::WRITE | Self::EXECUTE)) | coarsened
    }

    pub fn page_access(self) -> PageAccess {
        PageAccess {
            write: self.contains(Self::WRITE),
            execute: self.contains(Self::EXECUTE),
        }
    }
}

#[derive(Clone)]
enum Backing {
    Normal { view: Arc<dyn VirtualView>, view_offset: usize },
    Cow { chain: Arc<CowChain> },
}

/// A `[address, address + length)` range bound into one address space.
///
/// Cheap to clone: every field is either `Copy` or an `Arc` handle, so an
/// `AddressSpace` can hand out a snapshot of a mapping to a fault handler
/// without holding the mapping-tree lock across a possible suspension.
#[derive(Clone)]
pub struct Mapping {
    pub address: VirtualAddress,
    pub length: usize,
    pub flags: MappingFlags,
    backing: Backing,
}

impl Mapping {
    pub fn new_normal(
        address: VirtualAddress,
        length: usize,
        flags: MappingFlags,
        view: Arc<dyn VirtualView>,
        view_offset: usize,
    ) -> Self {
        assert!(length > 0 && length % PAGE_SIZE == 0);
        assert!(view_offset + length <= view.length());
        Self {
            address,
            length,
            flags,
            backing: Backing::Normal { view, view_offset },
        }
    }

    pub fn new_cow(address: VirtualAddress, length: usize, flags: MappingFlags, chain: Arc<CowChain>) -> Self {
        assert!(length > 0 && length % PAGE_SIZE == 0);
        assert_eq!(chain.length(), length);
        Self {
            address,
            length,
            flags,
            backing: Backing::Cow { chain },
        }
    }

    pub fn is_cow(&self) -> bool {
        matches!(self.backing, Backing::Cow { .. })
    }

    /// Synchronous, non-allocating residency check for the page at mapping-
    /// relative `offset`.
    pub fn peek_range(&self, offset: usize) -> (PhysicalAddress, CachingMode) {
        match &self.backing {
            Backing::Normal { view, view_offset } => {
                let range = view.translate_range(view_offset + offset, PAGE_SIZE);
                range.bundle.peek_range(range.displacement)
            }
            Backing::Cow { chain } => (chain.resolve_page(offset / PAGE_SIZE), CachingMode::Null),
        }
    }

    /// `resolveRange`: what the fault fast path consults once `prepare_range`
    /// is known to have completed.
    pub fn resolve_range(&self, offset: usize) -> (PhysicalAddress, CachingMode) {
        self.peek_range(offset)
    }

    /// `prepareRange` for the single page containing `offset`: ensure it's
    /// backed, possibly suspending. `node` is completed with the resolved
    /// physical frame either synchronously or via its worklet.
    pub fn prepare_range(&self, offset: usize, node: &mut PrepareNode) -> bool {
        match &self.backing {
            Backing::Normal { view, view_offset } => {
                let range = view.translate_range(view_offset + offset, PAGE_SIZE);
                let mut fetch = FetchNode::new();
                if range.bundle.fetch_range(range.displacement, &mut fetch) {
                    let fetched = fetch.range();
                    node.complete(fetched.physical, fetched.caching);
                    return true;
                }
                let node_slot_worklet = core::mem::replace(&mut node.worklet, crate::worklet::Worklet::unset());
                let slot = fetch.slot();
                let complete = node_completer(node);
                fetch.worklet.set(move || {
                    let fetched = slot.lock_bare().expect("fetch incomplete");
                    complete(fetched.physical, fetched.caching);
                    node_slot_worklet.fire();
                });
                false
            }
            Backing::Cow { chain } => chain.prepare_page(offset / PAGE_SIZE, node),
        }
    }

    /// Walk this mapping's page range and install every currently-resident
    /// page into `table`. With `overwrite`, any existing entry at a vaddr is
    /// replaced; otherwise the page table is expected to be empty there.
    pub fn install(&self, table: &dyn ArchPageTable, overwrite: bool) {
        let access = self.flags.page_access();
        let mut offset = 0;
        while offset < self.length {
            let (physical, caching) = self.peek_range(offset);
            if !physical.is_absent() {
                let vaddr = self.address + offset as u64;
                if overwrite && table.is_mapped(vaddr) {
                    table.unmap_range(vaddr, PAGE_SIZE, PageMode::Normal);
                } else {
                    debug_assert!(!table.is_mapped(vaddr), "install(overwrite=false) expects an empty slot");
                }
                table.map_single_4k(vaddr, physical, true, access, caching);
            }
            offset += PAGE_SIZE;
        }
    }

    /// Remove this mapping's whole range from the page table. `clear` mirrors
    /// `PageMode::Remap` vs `::Normal`: a real unmap always clears with a
    /// shootdown scheduled; `false` is only used for teardown paths that
    /// already know no other CPU can be holding a stale translation.
    pub fn uninstall(&self, table: &dyn ArchPageTable, clear: bool) {
        let mode = if clear { PageMode::Remap } else { PageMode::Normal };
        table.unmap_range(self.address, self.length, mode);
    }

    /// `shareMapping`: a new mapping in `dest` over the same view and
    /// offset. Not defined for a CoW mapping — forked CoW must re-CoW
    /// rather than alias the same chain, so callers should check
    /// [`Mapping::is_cow`] before calling this.
    pub fn share_mapping(&self, dest_address: VirtualAddress) -> Mapping {
        match &self.backing {
            Backing::Normal { view, view_offset } => {
                Mapping::new_normal(dest_address, self.length, self.flags, view.clone(), *view_offset)
            }
            Backing::Cow { .. } => panic!("shareMapping is not defined on a CowMapping"),
        }
    }

    /// `copyOnWrite`: build a fresh chain parented on this mapping's current
    /// backing (the view for a `NormalMapping`, the chain itself for a
    /// `CowMapping`) and wrap it as a new `CowMapping` at `dest_address`.
    pub fn copy_on_write(
        &self,
        dest_address: VirtualAddress,
        allocator: Arc<dyn crate::platform::PhysicalAllocator>,
        mapper: Arc<dyn crate::platform::PhysicalMap>,
    ) -> Mapping {
        let chain = match &self.backing {
            Backing::Normal { view, view_offset } => {
                CowChain::new_over_view(view.clone(), *view_offset, self.length, allocator, mapper)
            }
            Backing::Cow { chain } => CowChain::new_over_chain(chain.clone(), 0, self.length, allocator, mapper),
        };
        Mapping::new_cow(dest_address, self.length, self.flags, chain)
    }
}

/// Helper used by `prepare_range`'s async branch: writes straight into the
/// caller's `PrepareNode` slot without re-borrowing `node` inside the
/// closure (it's moved into the fetch worklet instead).
fn node_completer(node: &PrepareNode) -> impl Fn(PhysicalAddress, CachingMode) + Send + 'static {
    let slot = node.slot_handle();
    move |physical: PhysicalAddress, caching: CachingMode| {
        let mut guard = slot.lock_bare();
        *guard = Some((physical, caching));
    }
}
