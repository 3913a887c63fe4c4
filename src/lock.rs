//! Lock discipline shared by every object-local mutex in this crate.
//!
//! The concurrency model is: an IRQ-disabling outer section, then at most
//! one object-local mutex, never two nested object mutexes. The guard
//! returned by [`CriticalLock::lock`] bundles both and must be released
//! with an explicit `.unlock()` before the caller posts a continuation —
//! dropping it without unlocking is a bug and panics, the same contract
//! `SpinLockGuard` uses so that splice-then-unlock-then-fire code can't
//! accidentally fire a worklet while still holding the lock.

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

/// Disables and restores local interrupts around a critical section.
///
/// The real disable/restore mechanism is architecture-specific and lives
/// outside this crate; hosted builds and tests use [`NullInterrupts`].
pub trait InterruptControl {
    /// Disable interrupts, returning whether they were enabled before the call.
    fn disable() -> bool;
    /// Restore interrupts to the state `was_enabled` describes.
    fn restore(was_enabled: bool);
}

/// No-op interrupt control for hosted (non-bare-metal) builds and tests.
pub struct NullInterrupts;

impl InterruptControl for NullInterrupts {
    fn disable() -> bool {
        false
    }

    fn restore(_was_enabled: bool) {}
}

/// An object-local mutex guarded by the IRQ-mutex-outermost discipline.
pub struct CriticalLock<T> {
    inner: Mutex<T>,
}

impl<T> CriticalLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock with interrupts disabled. `I` picks the interrupt
    /// backend; pass [`NullInterrupts`] in hosted contexts.
    pub fn lock<I: InterruptControl>(&self) -> CriticalGuard<'_, T> {
        let was_enabled = I::disable();
        CriticalGuard {
            guard: Some(self.inner.lock()),
            restore: Some((was_enabled, restore_fn::<I>)),
        }
    }

    /// Access the value without the IRQ/unlock discipline, for call sites
    /// that are not on a suspension path (e.g. test setup).
    pub fn lock_bare(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

type RestoreFn = fn(bool);

fn restore_fn<I: InterruptControl>(was_enabled: bool) {
    I::restore(was_enabled);
}

/// Guard returned by [`CriticalLock::lock`]. Must be released with
/// [`unlock`](Self::unlock) before invoking any worklet or posting to a
/// work queue; dropping it while still locked panics.
#[must_use = "call `.unlock()` before firing any continuation"]
pub struct CriticalGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    restore: Option<(bool, RestoreFn)>,
}

impl<'a, T> CriticalGuard<'a, T> {
    /// Release the object mutex and restore interrupts.
    pub fn unlock(mut self) {
        self.guard = None;
        if let Some((was_enabled, restore)) = self.restore.take() {
            restore(was_enabled);
        }
    }
}

impl<'a, T> Deref for CriticalGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_deref().expect("use of CriticalGuard after unlock")
    }
}

impl<'a, T> DerefMut for CriticalGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().expect("use of CriticalGuard after unlock")
    }
}

impl<'a, T> Drop for CriticalGuard<'a, T> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            panic!(
                "CriticalGuard dropped without calling `.unlock()` first; \
                 a continuation may be about to fire while the lock is still held"
            );
        }
    }
}
