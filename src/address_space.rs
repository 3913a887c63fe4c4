//! Per-process address space: a hole tree and a mapping tree over the same
//! range, a page-table handle, and the operations that keep all three
//! consistent — `map`, `unmap`, `handle_fault`, `fork`, and the foreign
//! accessor used to read/write another space's memory.
//!
//! Both trees are kept as a plain `BTreeMap<u64, _>` keyed by start address
//! rather than an augmented balanced tree with a cached `largestHole`. A
//! `map` walks the hole tree linearly looking for the first (or last, for
//! `PREFER_TOP`) entry big enough; that is O(n) in the number of holes
//! instead of O(log n), which is the trade this crate makes everywhere else
//! a `BTreeMap` stands in for a more specialised structure (see DESIGN.md).

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use bitflags::bitflags;

use crate::cow::PrepareNode;
use crate::error::{KernelError, KernelResult};
use crate::lock::{CriticalLock, NullInterrupts};
use crate::memory_object::{AllocatedMemory, Memory};
use crate::mapping::{Mapping, MappingFlags};
use crate::page::{PageAccessor, VirtualAddress, PAGE_SIZE};
use crate::platform::{ArchPageTable, PhysicalAllocator, PhysicalMap, ShootNode, ShootdownHandle};
use crate::view::{ExteriorBundleView, VirtualView};
use crate::worklet::Worklet;

bitflags! {
    /// Allocation-time-only bits for `map`, distinct from [`MappingFlags`]'s
    /// permission and fork-disposition bits: these never outlive the call
    /// that consumes them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapOptions: u32 {
        /// Place the mapping at the caller-given address exactly, or fail.
        const FIXED = 1 << 0;
        /// Fault every page in eagerly before returning.
        const POPULATE = 1 << 1;
        /// Prefer the lowest address among holes big enough to fit.
        const PREFER_BOTTOM = 1 << 2;
        /// Prefer the highest address among holes big enough to fit.
        const PREFER_TOP = 1 << 3;
        /// Allow the mapping to install with no pages resident yet.
        const DONT_REQUIRE_BACKING = 1 << 4;
    }
}

/// Whether a faulting access was a write or an instruction fetch; read is
/// the implicit default since every mapping that exists at all is readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultFlags {
    pub write: bool,
    pub execute: bool,
}

/// Fork's eager-copy path is the implemented steady state; the real
/// CoW-at-fork branch (constructing a `CowMapping` in both parent and
/// child) is wired up but not the default — see DESIGN.md's Open Question
/// on this.
const REAL_COW_AT_FORK: bool = false;

struct Inner {
    holes: BTreeMap<u64, usize>,
    mappings: BTreeMap<u64, Mapping>,
}

/// One process's view of virtual memory: a partition of `[base, base +
/// length)` into holes and mappings, plus the page-table handle those
/// mappings are installed into.
pub struct AddressSpace {
    table: Arc<dyn ArchPageTable>,
    allocator: Arc<dyn PhysicalAllocator>,
    mapper: Arc<dyn PhysicalMap>,
    base: u64,
    length: usize,
    inner: CriticalLock<Inner>,
}

impl AddressSpace {
    pub fn new(
        table: Arc<dyn ArchPageTable>,
        allocator: Arc<dyn PhysicalAllocator>,
        mapper: Arc<dyn PhysicalMap>,
        base: VirtualAddress,
        length: usize,
    ) -> Arc<Self> {
        assert!(length > 0 && length % PAGE_SIZE == 0);
        let mut holes = BTreeMap::new();
        holes.insert(base.as_u64(), length);
        Arc::new(Self {
            table,
            allocator,
            mapper,
            base: base.as_u64(),
            length,
            inner: CriticalLock::new(Inner {
                holes,
                mappings: BTreeMap::new(),
            }),
        })
    }

    pub fn base(&self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// `map`: bind `view[view_offset, view_offset + length)` into this
    /// space, choosing an address (or honouring `MapOptions::FIXED`) and
    /// installing any already-resident pages.
    pub fn map(
        self: &Arc<Self>,
        view: Arc<dyn VirtualView>,
        address: Option<VirtualAddress>,
        view_offset: usize,
        length: usize,
        flags: MappingFlags,
        options: MapOptions,
    ) -> KernelResult<VirtualAddress> {
        assert!(length > 0 && length % PAGE_SIZE == 0);
        if view_offset + length > view.length() {
            return Err(KernelError::BufferTooSmall {
                requested: view_offset + length,
                available: view.length(),
            });
        }
        let flags = flags.coarsen_permissions();

        let mut inner = self.inner.lock::<NullInterrupts>();
        let start = if options.contains(MapOptions::FIXED) {
            let addr = address
                .expect("MapOptions::FIXED requires an explicit address")
                .as_u64();
            self.reserve_fixed(&mut inner, addr, length)?;
            addr
        } else {
            self.allocate_from_holes(&mut inner, length, options)?
        };

        let mapping = Mapping::new_normal(VirtualAddress::new(start), length, flags, view, view_offset);
        mapping.install(self.table.as_ref(), false);
        inner.mappings.insert(start, mapping);
        inner.unlock();

        if options.contains(MapOptions::POPULATE) {
            self.populate(start, length);
        }
        Ok(VirtualAddress::new(start))
    }

    fn populate(&self, start: u64, length: usize) {
        let mapping = {
            let inner = self.inner.lock::<NullInterrupts>();
            let mapping = inner.mappings.get(&start).cloned();
            inner.unlock();
            mapping
        };
        let Some(mapping) = mapping else { return };
        let mut offset = 0;
        while offset < length {
            let mut node = PrepareNode::new();
            // Best-effort warm-up: a bundle that must suspend (Frontal) just
            // has its load kicked off here; the actual fault path installs
            // the page once it lands.
            let _ = mapping.prepare_range(offset, &mut node);
            offset += PAGE_SIZE;
        }
        mapping.install(self.table.as_ref(), true);
    }

    fn allocate_from_holes(&self, inner: &mut Inner, length: usize, options: MapOptions) -> KernelResult<u64> {
        let prefer_top = options.contains(MapOptions::PREFER_TOP);
        let found = if prefer_top {
            inner
                .holes
                .iter()
                .rev()
                .find(|&(_, &hole_len)| hole_len >= length)
                .map(|(&addr, &hole_len)| (addr, hole_len))
        } else {
            inner
                .holes
                .iter()
                .find(|&(_, &hole_len)| hole_len >= length)
                .map(|(&addr, &hole_len)| (addr, hole_len))
        };

        let (hole_addr, hole_len) = found.ok_or_else(|| {
            let available = inner.holes.values().sum();
            log::warn!("address space out of holes: requested {length}, {available} available");
            KernelError::OutOfMemory { requested: length, available }
        })?;

        let offset = if prefer_top { hole_len - length } else { 0 };
        let start = hole_addr + offset as u64;
        self.split_hole(inner, hole_addr, hole_len, offset, length);
        Ok(start)
    }

    fn reserve_fixed(&self, inner: &mut Inner, addr: u64, length: usize) -> KernelResult<()> {
        assert!(addr % PAGE_SIZE as u64 == 0);
        let hole = inner
            .holes
            .range(..=addr)
            .next_back()
            .map(|(&a, &l)| (a, l))
            .filter(|&(a, l)| addr + length as u64 <= a + l as u64);
        match hole {
            Some((hole_addr, hole_len)) => {
                let offset = (addr - hole_addr) as usize;
                self.split_hole(inner, hole_addr, hole_len, offset, length);
                Ok(())
            }
            None => Err(KernelError::InvalidAddress { addr: addr as usize }),
        }
    }

    /// Replace `[hole_addr, hole_addr + hole_len)` with whatever's left
    /// after carving `[hole_addr + offset, hole_addr + offset + length)`
    /// out of it: a front remainder, a back remainder, neither, or both.
    fn split_hole(&self, inner: &mut Inner, hole_addr: u64, hole_len: usize, offset: usize, length: usize) {
        inner.holes.remove(&hole_addr);
        if offset > 0 {
            inner.holes.insert(hole_addr, offset);
        }
        let tail_offset = offset + length;
        if tail_offset < hole_len {
            inner.holes.insert(hole_addr + tail_offset as u64, hole_len - tail_offset);
        }
    }

    /// `unmap`: exact-match only — partial unmap of a mapping isn't
    /// supported (callers split their own mapping calls up front). Removes
    /// the mapping, uninstalls it, and submits a shootdown whose completion
    /// reopens the hole and merges it with any adjacent hole.
    pub fn unmap(self: &Arc<Self>, address: VirtualAddress, length: usize) -> KernelResult<()> {
        let addr = address.as_u64();
        let mapping = {
            let mut inner = self.inner.lock::<NullInterrupts>();
            let found = inner.mappings.get(&addr).cloned();
            let result = match found {
                Some(mapping) if mapping.length == length => {
                    inner.mappings.remove(&addr);
                    Ok(mapping)
                }
                Some(_) => panic!("partial unmap is not supported; unmap the whole mapping"),
                None => Err(KernelError::UnmappedMemory { addr: addr as usize }),
            };
            inner.unlock();
            result?
        };

        mapping.uninstall(self.table.as_ref(), true);

        let this = self.clone();
        self.table.submit_shootdown(ShootdownHandle {
            node: ShootNode { address, size: length },
            on_complete: Box::new(move |_node| {
                this.insert_hole_and_merge(addr, length);
            }),
        });
        Ok(())
    }

    fn insert_hole_and_merge(&self, addr: u64, length: usize) {
        let mut inner = self.inner.lock::<NullInterrupts>();
        merge_hole_into(&mut inner.holes, addr, length);
        inner.unlock();
    }

    /// `handleFault`: look up the mapping covering `address`, reject if the
    /// access exceeds its permissions, otherwise `prepareRange` the
    /// faulting page and install it. `node` completes with whether a
    /// mapping was found and permitted at all (a permission violation or a
    /// fault on unmapped memory both complete synchronously with `false`).
    pub fn handle_fault(self: &Arc<Self>, address: VirtualAddress, fault: FaultFlags, node: &mut FaultNode) -> bool {
        let addr = address.page_down().as_u64();
        let found = {
            let inner = self.inner.lock::<NullInterrupts>();
            let result = inner
                .mappings
                .range(..=addr)
                .next_back()
                .filter(|(&m_addr, m)| addr < m_addr + m.length as u64)
                .map(|(&m_addr, m)| (m_addr, m.clone()));
            inner.unlock();
            result
        };
        let Some((mapping_start, mapping)) = found else {
            node.complete(false);
            return true;
        };
        let permitted = (!fault.write || mapping.flags.contains(MappingFlags::WRITE))
            && (!fault.execute || mapping.flags.contains(MappingFlags::EXECUTE));
        if !permitted {
            node.complete(false);
            return true;
        }

        let page_offset = (addr - mapping_start) as usize;
        let vaddr = VirtualAddress::new(addr);
        let table = self.table.clone();
        let access = mapping.flags.page_access();

        let mut prep = PrepareNode::new();
        let prep_slot = prep.slot_handle();
        let node_slot = node.slot_handle();
        let outer_worklet = core::mem::replace(&mut node.worklet, Worklet::unset());
        let table_for_closure = table.clone();
        prep.worklet.set(move || {
            let (physical, caching) = prep_slot
                .lock_bare()
                .expect("prepare_range fired its worklet before completing");
            table_for_closure.map_single_4k(vaddr, physical, true, access, caching);
            let mut slot = node_slot.lock::<NullInterrupts>();
            *slot = Some(true);
            slot.unlock();
            outer_worklet.fire();
        });

        if mapping.prepare_range(page_offset, &mut prep) {
            let (physical, caching) = prep.result();
            table.map_single_4k(vaddr, physical, true, access, caching);
            node.complete(true);
            true
        } else {
            false
        }
    }

    /// `fork`: duplicate this space's hole tree verbatim, then walk every
    /// mapping and dispatch on its fork-disposition flag. `DropAtFork`
    /// leaves a hole in the child; `ShareAtFork` aliases the same view;
    /// everything else (the default) is copy-on-write-at-fork, which this
    /// crate implements as an eager synchronous copy unless
    /// `REAL_COW_AT_FORK` is flipped on. Returns the child and whether the
    /// whole fork completed synchronously; if not, `node.worklet` fires
    /// once every copy has landed.
    pub fn fork(self: &Arc<Self>, child_table: Arc<dyn ArchPageTable>, node: &mut ForkNode) -> (Arc<AddressSpace>, bool) {
        let mut child_holes;
        let mut child_mappings = BTreeMap::new();
        let mut jobs: VecDeque<ForkJob> = VecDeque::new();

        {
            let inner = self.inner.lock::<NullInterrupts>();
            child_holes = inner.holes.clone();

            for (&addr, mapping) in inner.mappings.iter() {
                if mapping.flags.contains(MappingFlags::DROP_AT_FORK) {
                    merge_hole_into(&mut child_holes, addr, mapping.length);
                } else if mapping.flags.contains(MappingFlags::SHARE_AT_FORK) {
                    let shared = mapping.share_mapping(VirtualAddress::new(addr));
                    child_mappings.insert(addr, shared);
                } else if REAL_COW_AT_FORK {
                    let cow = mapping.copy_on_write(VirtualAddress::new(addr), self.allocator.clone(), self.mapper.clone());
                    child_mappings.insert(addr, cow);
                } else {
                    let dest = Arc::new(AllocatedMemory::new(
                        self.allocator.clone(),
                        self.mapper.clone(),
                        mapping.length,
                        PAGE_SIZE,
                        PAGE_SIZE,
                    ));
                    let view: Arc<dyn VirtualView> =
                        Arc::new(ExteriorBundleView::new(dest.clone() as Arc<dyn Memory>, 0, mapping.length));
                    let child_mapping =
                        Mapping::new_normal(VirtualAddress::new(addr), mapping.length, mapping.flags, view, 0);
                    child_mappings.insert(addr, child_mapping);

                    let mut offset = 0;
                    while offset < mapping.length {
                        jobs.push_back(ForkJob {
                            mapping: mapping.clone(),
                            dest: dest.clone(),
                            offset,
                        });
                        offset += PAGE_SIZE;
                    }
                }
            }
            inner.unlock();
        }

        let child = Arc::new(AddressSpace {
            table: child_table,
            allocator: self.allocator.clone(),
            mapper: self.mapper.clone(),
            base: self.base,
            length: self.length,
            inner: CriticalLock::new(Inner {
                holes: child_holes,
                mappings: child_mappings,
            }),
        });

        {
            let inner = child.inner.lock::<NullInterrupts>();
            for mapping in inner.mappings.values() {
                mapping.install(child.table.as_ref(), false);
            }
            inner.unlock();
        }

        if jobs.is_empty() {
            return (child, true);
        }

        let shared = Arc::new(ForkShared {
            mapper: self.mapper.clone(),
            state: CriticalLock::new(ForkState {
                jobs,
                worklet: core::mem::replace(&mut node.worklet, Worklet::unset()),
            }),
        });
        let done = process_fork(shared, true);
        (child, done)
    }
}

fn merge_hole_into(holes: &mut BTreeMap<u64, usize>, addr: u64, length: usize) {
    let mut final_addr = addr;
    let mut final_len = length;

    if let Some((&prev_addr, &prev_len)) = holes.range(..addr).next_back() {
        if prev_addr + prev_len as u64 == addr {
            holes.remove(&prev_addr);
            final_addr = prev_addr;
            final_len += prev_len;
        }
    }
    let succ_addr = final_addr + final_len as u64;
    if let Some((&next_addr, &next_len)) = holes.range(succ_addr..).next() {
        if next_addr == succ_addr {
            holes.remove(&next_addr);
            final_len += next_len;
        }
    }
    holes.insert(final_addr, final_len);
}

/// Carries one in-flight `handle_fault` call across a possible suspension.
pub struct FaultNode {
    pub worklet: Worklet,
    slot: Arc<CriticalLock<Option<bool>>>,
}

impl FaultNode {
    pub fn new() -> Self {
        Self {
            worklet: Worklet::unset(),
            slot: Arc::new(CriticalLock::new(None)),
        }
    }

    pub fn complete(&self, resolved: bool) {
        let mut slot = self.slot.lock::<NullInterrupts>();
        *slot = Some(resolved);
        slot.unlock();
    }

    /// Whether the fault was actually resolvable (a mapping existed and
    /// permitted the access). Panics if read before completion.
    pub fn resolved(&self) -> bool {
        let slot = self.slot.lock::<NullInterrupts>();
        let result = slot.expect("FaultNode::resolved() read before completion");
        slot.unlock();
        result
    }

    fn slot_handle(&self) -> Arc<CriticalLock<Option<bool>>> {
        self.slot.clone()
    }
}

impl Default for FaultNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Carries one `fork` call across however many pages need an eager copy.
pub struct ForkNode {
    pub worklet: Worklet,
}

impl ForkNode {
    pub fn new() -> Self {
        Self { worklet: Worklet::unset() }
    }
}

impl Default for ForkNode {
    fn default() -> Self {
        Self::new()
    }
}

struct ForkJob {
    mapping: Mapping,
    dest: Arc<AllocatedMemory>,
    offset: usize,
}

struct ForkState {
    jobs: VecDeque<ForkJob>,
    worklet: Worklet,
}

struct ForkShared {
    mapper: Arc<dyn PhysicalMap>,
    state: CriticalLock<ForkState>,
}

fn process_fork(shared: Arc<ForkShared>, top_level: bool) -> bool {
    loop {
        let job = {
            let mut state = shared.state.lock::<NullInterrupts>();
            let job = state.jobs.pop_front();
            state.unlock();
            job
        };
        let Some(job) = job else {
            finish_fork(&shared, top_level);
            return true;
        };

        let mut prep = PrepareNode::new();
        let shared2 = shared.clone();
        let mapper_for_copy = shared.mapper.clone();
        let job_mapping = job.mapping.clone();
        let job_dest = job.dest.clone();
        let job_offset = job.offset;
        prep.worklet.set(move || {
            copy_fork_page(mapper_for_copy.as_ref(), &job_mapping, &job_dest, job_offset);
            process_fork(shared2, false);
        });

        if job.mapping.prepare_range(job.offset, &mut prep) {
            copy_fork_page(shared.mapper.as_ref(), &job.mapping, &job.dest, job.offset);
            continue;
        }
        return false;
    }
}

fn finish_fork(shared: &ForkShared, top_level: bool) {
    if top_level {
        return;
    }
    let mut state = shared.state.lock::<NullInterrupts>();
    let worklet = core::mem::replace(&mut state.worklet, Worklet::unset());
    state.unlock();
    worklet.fire();
}

fn copy_fork_page(mapper: &dyn PhysicalMap, mapping: &Mapping, dest: &AllocatedMemory, offset: usize) {
    let (physical, _) = mapping.resolve_range(offset);
    debug_assert!(!physical.is_absent(), "prepare_range completed without a resident page");
    let accessor = PageAccessor::new(mapper, physical);
    dest.copy_kernel_to_this_sync(offset, accessor.as_slice());
}

/// Carries one `ForeignAccessor::acquire` call across however many pages
/// in the span still need to be faulted in.
pub struct AcquireNode {
    pub worklet: Worklet,
}

impl AcquireNode {
    pub fn new() -> Self {
        Self { worklet: Worklet::unset() }
    }
}

impl Default for AcquireNode {
    fn default() -> Self {
        Self::new()
    }
}

struct AcquireState {
    offsets: VecDeque<usize>,
    worklet: Worklet,
}

struct AcquireShared {
    mapping: Mapping,
    state: CriticalLock<AcquireState>,
}

fn drive_acquire(shared: Arc<AcquireShared>, top_level: bool) -> bool {
    loop {
        let offset = {
            let mut state = shared.state.lock::<NullInterrupts>();
            let next = state.offsets.pop_front();
            state.unlock();
            next
        };
        let Some(offset) = offset else {
            finish_acquire(&shared, top_level);
            return true;
        };

        let mut prep = PrepareNode::new();
        let shared2 = shared.clone();
        prep.worklet.set(move || {
            drive_acquire(shared2, false);
        });
        if shared.mapping.prepare_range(offset, &mut prep) {
            continue;
        }
        return false;
    }
}

fn finish_acquire(shared: &AcquireShared, top_level: bool) {
    if top_level {
        return;
    }
    let mut state = shared.state.lock::<NullInterrupts>();
    let worklet = core::mem::replace(&mut state.worklet, Worklet::unset());
    state.unlock();
    worklet.fire();
}

/// A handle for reading or writing a span of another address space's
/// memory, used by syscall argument marshalling. `acquire` must complete
/// (synchronously or via its node's worklet) before `load`/`write` are
/// called.
pub struct ForeignAccessor {
    address: VirtualAddress,
    length: usize,
    mapping: Mapping,
    mapping_start: u64,
}

impl ForeignAccessor {
    /// Locate the single mapping in `space` that covers
    /// `[address, address + length)`. Spanning more than one mapping is
    /// rejected — callers split the request at mapping boundaries first.
    pub fn new(space: &Arc<AddressSpace>, address: VirtualAddress, length: usize) -> KernelResult<Self> {
        let found = {
            let inner = space.inner.lock::<NullInterrupts>();
            let result = inner
                .mappings
                .range(..=address.as_u64())
                .next_back()
                .filter(|(&m_addr, m)| address.as_u64() + length as u64 <= m_addr + m.length as u64)
                .map(|(&m_addr, m)| (m_addr, m.clone()));
            inner.unlock();
            result
        };
        let (mapping_start, mapping) = found.ok_or(KernelError::UnmappedMemory {
            addr: address.as_u64() as usize,
        })?;
        Ok(Self {
            address,
            length,
            mapping,
            mapping_start,
        })
    }

    /// `acquire`: ensure every page across the span is backed.
    pub fn acquire(&self, node: &mut AcquireNode) -> bool {
        let start = (self.address.as_u64() - self.mapping_start) as usize;
        let aligned_start = start & !(PAGE_SIZE - 1);
        let end = start + self.length;

        let mut offsets = VecDeque::new();
        let mut off = aligned_start;
        while off < end {
            offsets.push_back(off);
            off += PAGE_SIZE;
        }

        let shared = Arc::new(AcquireShared {
            mapping: self.mapping.clone(),
            state: CriticalLock::new(AcquireState {
                offsets,
                worklet: core::mem::replace(&mut node.worklet, Worklet::unset()),
            }),
        });
        drive_acquire(shared, true)
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`. Every page
    /// in range is asserted present — callers must have driven `acquire`
    /// to completion first.
    pub fn load(&self, mapper: &dyn PhysicalMap, offset: usize, out: &mut [u8]) -> KernelResult<()> {
        assert!(offset + out.len() <= self.length);
        let base = (self.address.as_u64() - self.mapping_start) as usize + offset;
        let mut done = 0;
        while done < out.len() {
            let mapping_offset = (base + done) & !(PAGE_SIZE - 1);
            let page_off = (base + done) % PAGE_SIZE;
            let (physical, _) = self.mapping.resolve_range(mapping_offset);
            assert!(!physical.is_absent(), "load observed an absent page; call acquire first");
            let accessor = PageAccessor::new(mapper, physical);
            let chunk = (PAGE_SIZE - page_off).min(out.len() - done);
            out[done..done + chunk].copy_from_slice(&accessor.as_slice()[page_off..page_off + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into the span starting at `offset`. Unlike `load`, an
    /// absent page is reported as a `Fault` rather than asserted against —
    /// a foreign write is more likely to be racing a concurrent unmap in
    /// the target space than a caller bug.
    pub fn write(&self, mapper: &dyn PhysicalMap, offset: usize, data: &[u8]) -> KernelResult<()> {
        assert!(offset + data.len() <= self.length);
        let base = (self.address.as_u64() - self.mapping_start) as usize + offset;
        let mut done = 0;
        while done < data.len() {
            let mapping_offset = (base + done) & !(PAGE_SIZE - 1);
            let page_off = (base + done) % PAGE_SIZE;
            let (physical, _) = self.mapping.resolve_range(mapping_offset);
            if physical.is_absent() {
                return Err(KernelError::Fault {
                    addr: self.address.as_u64() as usize + done,
                });
            }
            let mut accessor = PageAccessor::new(mapper, physical);
            let chunk = (PAGE_SIZE - page_off).min(data.len() - done);
            accessor.as_mut_slice()[page_off..page_off + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePageTable, TestArena};

    fn space(arena: &Arc<TestArena>, base: u64, length: usize) -> Arc<AddressSpace> {
        AddressSpace::new(FakePageTable::new(), arena.clone(), arena.clone(), VirtualAddress::new(base), length)
    }

    fn anon_view(arena: &Arc<TestArena>, length: usize) -> Arc<dyn VirtualView> {
        let bundle: Arc<dyn Memory> =
            Arc::new(AllocatedMemory::new(arena.clone(), arena.clone(), length, PAGE_SIZE, PAGE_SIZE));
        Arc::new(ExteriorBundleView::new(bundle, 0, length))
    }

    #[test]
    fn map_write_unmap_then_remap_observes_a_zeroed_range() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let space = space(&arena, 0x100000, 16 * PAGE_SIZE);

        let addr = space
            .map(
                anon_view(&arena, 3 * PAGE_SIZE),
                Some(VirtualAddress::new(0x200000)),
                0,
                3 * PAGE_SIZE,
                MappingFlags::READ | MappingFlags::WRITE,
                MapOptions::FIXED,
            )
            .unwrap();
        assert_eq!(addr, VirtualAddress::new(0x200000));

        let mut fault = FaultNode::new();
        assert!(space.handle_fault(
            VirtualAddress::new(0x200FFF),
            FaultFlags { write: true, execute: false },
            &mut fault
        ));
        assert!(fault.resolved());

        let accessor = ForeignAccessor::new(&space, VirtualAddress::new(0x200FFF), 1).unwrap();
        accessor.write(arena.as_ref(), 0, &[0xAB]).unwrap();
        let mut byte = [0u8];
        accessor.load(arena.as_ref(), 0, &mut byte).unwrap();
        assert_eq!(byte[0], 0xAB);

        space.unmap(VirtualAddress::new(0x200000), 3 * PAGE_SIZE).unwrap();

        let addr2 = space
            .map(
                anon_view(&arena, 3 * PAGE_SIZE),
                Some(VirtualAddress::new(0x200000)),
                0,
                3 * PAGE_SIZE,
                MappingFlags::READ | MappingFlags::WRITE,
                MapOptions::FIXED,
            )
            .unwrap();
        assert_eq!(addr2, VirtualAddress::new(0x200000));

        let accessor2 = ForeignAccessor::new(&space, VirtualAddress::new(0x200FFF), 1).unwrap();
        let mut acq = AcquireNode::new();
        assert!(accessor2.acquire(&mut acq));
        let mut byte2 = [0xFFu8];
        accessor2.load(arena.as_ref(), 0, &mut byte2).unwrap();
        assert_eq!(byte2[0], 0x00);
    }

    #[test]
    fn fault_on_unmapped_address_fails_until_mapped() {
        let arena = TestArena::new(32 * PAGE_SIZE);
        let space = space(&arena, 0x100000, 16 * PAGE_SIZE);

        let mut first = FaultNode::new();
        assert!(space.handle_fault(VirtualAddress::new(0x101000), FaultFlags::default(), &mut first));
        assert!(!first.resolved());

        space
            .map(
                anon_view(&arena, PAGE_SIZE),
                Some(VirtualAddress::new(0x101000)),
                0,
                PAGE_SIZE,
                MappingFlags::READ,
                MapOptions::FIXED,
            )
            .unwrap();

        let mut second = FaultNode::new();
        assert!(space.handle_fault(VirtualAddress::new(0x101000), FaultFlags::default(), &mut second));
        assert!(second.resolved());
    }

    #[test]
    fn write_fault_on_read_only_mapping_is_rejected() {
        let arena = TestArena::new(32 * PAGE_SIZE);
        let space = space(&arena, 0x100000, 16 * PAGE_SIZE);
        space
            .map(
                anon_view(&arena, PAGE_SIZE),
                Some(VirtualAddress::new(0x101000)),
                0,
                PAGE_SIZE,
                MappingFlags::READ,
                MapOptions::FIXED,
            )
            .unwrap();

        let mut fault = FaultNode::new();
        assert!(space.handle_fault(
            VirtualAddress::new(0x101000),
            FaultFlags { write: true, execute: false },
            &mut fault
        ));
        assert!(!fault.resolved());
    }

    #[test]
    fn hole_allocation_honours_bottom_and_top_bias() {
        let arena = TestArena::new(16 * PAGE_SIZE);
        let space = space(&arena, 0x0, 0x10000);
        {
            let mut inner = space.inner.lock::<NullInterrupts>();
            inner.holes.clear();
            inner.holes.insert(0x1000, 0x1000);
            inner.holes.insert(0x5000, 0x4000);
            inner.unlock();
        }

        let bottom = space
            .map(
                anon_view(&arena, PAGE_SIZE),
                None,
                0,
                PAGE_SIZE,
                MappingFlags::READ,
                MapOptions::PREFER_BOTTOM,
            )
            .unwrap();
        assert_eq!(bottom, VirtualAddress::new(0x1000));

        {
            let mut inner = space.inner.lock::<NullInterrupts>();
            inner.mappings.clear();
            inner.holes.clear();
            inner.holes.insert(0x1000, 0x1000);
            inner.holes.insert(0x5000, 0x4000);
            inner.unlock();
        }
        let top = space
            .map(
                anon_view(&arena, PAGE_SIZE),
                None,
                0,
                PAGE_SIZE,
                MappingFlags::READ,
                MapOptions::PREFER_TOP,
            )
            .unwrap();
        assert_eq!(top, VirtualAddress::new(0x8000));
    }

    #[test]
    fn unmap_merges_with_both_neighbouring_holes() {
        let arena = TestArena::new(16 * PAGE_SIZE);
        let space = space(&arena, 0x0, 0x4000);
        space
            .map(
                anon_view(&arena, PAGE_SIZE),
                Some(VirtualAddress::new(0x1000)),
                0,
                PAGE_SIZE,
                MappingFlags::READ,
                MapOptions::FIXED,
            )
            .unwrap();
        space.unmap(VirtualAddress::new(0x1000), PAGE_SIZE).unwrap();

        let inner = space.inner.lock::<NullInterrupts>();
        assert_eq!(inner.holes.len(), 1);
        assert_eq!(*inner.holes.get(&0).unwrap(), 0x4000);
        inner.unlock();
    }

    #[test]
    fn fork_eager_copy_isolates_parent_and_child_writes() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let parent = space(&arena, 0x0, 0x10000);
        parent
            .map(
                anon_view(&arena, PAGE_SIZE),
                Some(VirtualAddress::new(0x1000)),
                0,
                PAGE_SIZE,
                MappingFlags::READ | MappingFlags::WRITE | MappingFlags::COPY_ON_WRITE_AT_FORK,
                MapOptions::FIXED,
            )
            .unwrap();

        let parent_accessor = ForeignAccessor::new(&parent, VirtualAddress::new(0x1000), 1).unwrap();
        parent_accessor.write(arena.as_ref(), 0, &[0x42]).unwrap();

        let mut fork_node = ForkNode::new();
        let (child, done) = parent.fork(FakePageTable::new(), &mut fork_node);
        assert!(done, "AllocatedMemory never suspends, fork should finish synchronously");

        let child_accessor = ForeignAccessor::new(&child, VirtualAddress::new(0x1000), 1).unwrap();
        let mut acq = AcquireNode::new();
        assert!(child_accessor.acquire(&mut acq));

        let mut before = [0u8];
        child_accessor.load(arena.as_ref(), 0, &mut before).unwrap();
        assert_eq!(before[0], 0x42, "child must start with the parent's content");

        child_accessor.write(arena.as_ref(), 0, &[0x99]).unwrap();
        let mut parent_after = [0u8];
        parent_accessor.load(arena.as_ref(), 0, &mut parent_after).unwrap();
        assert_eq!(parent_after[0], 0x42, "writes in the child must not be visible to the parent");
    }

    #[test]
    fn fork_drop_at_fork_leaves_a_hole_in_the_child() {
        let arena = TestArena::new(32 * PAGE_SIZE);
        let parent = space(&arena, 0x0, 0x4000);
        parent
            .map(
                anon_view(&arena, PAGE_SIZE),
                Some(VirtualAddress::new(0x1000)),
                0,
                PAGE_SIZE,
                MappingFlags::READ | MappingFlags::DROP_AT_FORK,
                MapOptions::FIXED,
            )
            .unwrap();

        let mut fork_node = ForkNode::new();
        let (child, done) = parent.fork(FakePageTable::new(), &mut fork_node);
        assert!(done);

        let inner = child.inner.lock::<NullInterrupts>();
        assert!(!inner.mappings.contains_key(&0x1000));
        assert_eq!(*inner.holes.get(&0).unwrap(), 0x4000);
        inner.unlock();
    }
}
