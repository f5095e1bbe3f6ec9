//! Monotonic identifier allocators.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Per-connection transaction id allocator.
///
/// Issues values starting at `initial + 1`; when the counter saturates it
/// wraps back to the first issued value rather than zero. Collisions with a
/// transaction that is still pending after a wrap are detected at `read`
/// time by the connection, which refuses to pair them.
#[derive(Debug)]
pub struct TransactionIds {
    current: AtomicU32,
    initial: u32,
}

impl TransactionIds {
    /// Create an allocator whose first issued id is `initial + 1`.
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        Self {
            current: AtomicU32::new(initial),
            initial,
        }
    }

    /// Allocate the next transaction id.
    pub fn next(&self) -> u32 {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            let next = if current == u32::MAX {
                self.initial.wrapping_add(1)
            } else {
                current + 1
            };
            match self.current.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Process-wide connection id allocator.
#[derive(Debug, Default)]
pub struct ConnectionIds(AtomicU64);

impl ConnectionIds {
    /// Create an allocator starting at one.
    #[must_use]
    pub const fn new() -> Self { Self(AtomicU64::new(0)) }

    /// Allocate the next connection id.
    pub fn next(&self) -> u64 { self.0.fetch_add(1, Ordering::Relaxed) + 1 }
}
