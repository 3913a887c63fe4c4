//! The view layer: how a mapping's offset maps onto a bundle's offset.
//!
//! A `VirtualView` only ever describes an offset/size pair against some
//! bundle — it never materialises pages itself. [`ExteriorBundleView`] is
//! the one implementation today (a plain sub-range of a bundle); the trait
//! exists so a future view kind (e.g. a striped or scatter-gather view)
//! slots in without touching [`crate::mapping::Mapping`].

extern crate alloc;

use alloc::sync::Arc;

use crate::memory_object::Memory;
use crate::page::PAGE_SIZE;

/// The result of translating a mapping-relative range through a view: the
/// bundle it resolves to, the bundle-relative displacement, and how much
/// of the request actually fit (clamped to what's left of the view).
#[derive(Clone)]
pub struct ViewRange {
    pub bundle: Arc<dyn Memory>,
    pub displacement: usize,
    pub size: usize,
}

/// A mapping's window onto the bundle(s) that back it.
pub trait VirtualView: Send + Sync {
    /// Total length this view covers.
    fn length(&self) -> usize;

    /// Translate `[offset, offset + size)` (relative to this view) into the
    /// underlying bundle's coordinates, clamping `size` to what remains.
    fn translate_range(&self, offset: usize, size: usize) -> ViewRange;
}

/// A contiguous sub-range of a single bundle.
pub struct ExteriorBundleView {
    bundle: Arc<dyn Memory>,
    view_offset: usize,
    view_size: usize,
}

impl ExteriorBundleView {
    pub fn new(bundle: Arc<dyn Memory>, view_offset: usize, view_size: usize) -> Self {
        assert!(view_offset % PAGE_SIZE == 0, "view offset must be page-aligned");
        assert!(view_size % PAGE_SIZE == 0, "view size must be page-aligned");
        assert!(view_offset + view_size <= bundle.length());
        Self {
            bundle,
            view_offset,
            view_size,
        }
    }

    pub fn bundle(&self) -> &Arc<dyn Memory> {
        &self.bundle
    }
}

impl VirtualView for ExteriorBundleView {
    fn length(&self) -> usize {
        self.view_size
    }

    fn translate_range(&self, offset: usize, size: usize) -> ViewRange {
        assert!(offset <= self.view_size);
        let clamped = size.min(self.view_size - offset);
        ViewRange {
            bundle: self.bundle.clone(),
            displacement: self.view_offset + offset,
            size: clamped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_object::{AllocatedMemory, MemoryTag};
    use crate::test_support::TestArena;

    #[test]
    fn translate_range_clamps_to_remaining_view_length() {
        let arena = TestArena::new(16 * PAGE_SIZE);
        let bundle: Arc<dyn Memory> = Arc::new(AllocatedMemory::new(
            arena.clone(),
            arena,
            4 * PAGE_SIZE,
            PAGE_SIZE,
            PAGE_SIZE,
        ));
        let view = ExteriorBundleView::new(bundle, PAGE_SIZE, 2 * PAGE_SIZE);
        assert_eq!(view.bundle().tag(), MemoryTag::Allocated);

        let range = view.translate_range(PAGE_SIZE, PAGE_SIZE * 10);
        assert_eq!(range.displacement, 2 * PAGE_SIZE);
        assert_eq!(range.size, PAGE_SIZE);
    }
}
