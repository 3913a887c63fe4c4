//! Error types for the virtual memory core.
//!
//! Mirrors the kernel-wide `KernelError` pattern: named-field variants
//! instead of string literals, `#[must_use]` so a caller can't silently
//! drop a failed operation, and `Display` for logging.

use core::fmt;

/// Errors surfaced across address-space, mapping, and bundle operations.
///
/// Most internal-consistency violations (a variant receiving an operation
/// it doesn't implement, a state machine observed in the wrong state,
/// misaligned offsets on page-aligned APIs) are programming errors and are
/// asserted rather than represented here — see the module docs on
/// `address_space` for the rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "vmcore errors must be handled, not silently discarded"]
pub enum KernelError {
    /// `map` was asked to place a view slice past the view's length.
    BufferTooSmall { requested: usize, available: usize },
    /// A foreign accessor `write` hit a page that resolved to absent.
    Fault { addr: usize },
    /// The hole tree has no region large enough to satisfy an allocation.
    OutOfMemory { requested: usize, available: usize },
    /// `map` with `Fixed` landed on an address already covered by a mapping.
    InvalidAddress { addr: usize },
    /// An operation referenced a virtual address with no mapping.
    UnmappedMemory { addr: usize },
}

/// Result alias for vmcore operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall {
                requested,
                available,
            } => write!(
                f,
                "buffer too small: requested {} bytes, view has {}",
                requested, available
            ),
            Self::Fault { addr } => write!(f, "fault at 0x{:x}", addr),
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::InvalidAddress { addr } => write!(f, "invalid address: 0x{:x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at 0x{:x}", addr),
        }
    }
}
