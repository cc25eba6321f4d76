//! Read/write spin locks with ordered-acquisition deadlock checking.
//!
//! The hot paths of the engine are guarded by many small locks - one per
//! connection slot or per cache line of shared state - rather than one big
//! mutex. [`RawRwLock`] is the primitive: a 32-bit packed state word holding
//! the exclusive owner's thread id in the upper 16 bits and the shared
//! reader count in the lower 16, acquired by bounded busy-spinning before
//! yielding. [`RwSpinLock`] wraps a value with RAII guards on top of it.
//!
//! In debug builds every acquisition is recorded by a global deadlock
//! profiler which maintains a per-thread acquisition stack and a graph of
//! held-then-acquired edges; a cycle in that graph is reported and asserted
//! on at the moment it first becomes possible, not when it eventually
//! happens to deadlock.

mod deadlock;
mod lock;

pub use {deadlock::*, lock::*};

use std::sync::atomic::{AtomicU16, Ordering};

static NEXT_THREAD_ID: AtomicU16 = AtomicU16::new(1);

thread_local! {
    static THREAD_ID: u16 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small dense id of the calling thread, used as the lock owner tag.
///
/// Ids start at 1; 0 is reserved for "no owner".
#[must_use]
pub fn current_thread_id() -> u16 {
    THREAD_ID.with(|id| *id)
}
