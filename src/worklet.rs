//! One-shot continuation primitive used at every suspension point.
//!
//! A [`Worklet`] is scheduled by a [`crate::platform::WorkQueue`] and fires
//! exactly once, on whatever CPU drains the queue. Operations that may
//! suspend follow the same shape throughout this crate: return `true` if
//! the fast path completed synchronously, or stash a `Worklet` and return
//! `false`, with the worklet driving the rest of the state machine when it
//! fires. The fast-path return must stay allocation-free so a resident
//! page never pays for a continuation it doesn't need.

extern crate alloc;

use alloc::boxed::Box;

/// A one-shot callback, armed with [`Worklet::set`] and consumed by
/// [`Worklet::fire`]. Firing an unset worklet is a bug and panics.
pub struct Worklet {
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl Worklet {
    /// An unarmed worklet; must be `set` before it can fire.
    pub const fn unset() -> Self {
        Self { callback: None }
    }

    /// Arm the worklet with its continuation.
    pub fn set<F: FnOnce() + Send + 'static>(&mut self, callback: F) {
        self.callback = Some(Box::new(callback));
    }

    /// Run the armed continuation, consuming it.
    pub fn fire(self) {
        match self.callback {
            Some(cb) => cb(),
            None => panic!("Worklet fired without being set"),
        }
    }

    pub fn is_set(&self) -> bool {
        self.callback.is_some()
    }
}

impl Default for Worklet {
    fn default() -> Self {
        Self::unset()
    }
}
