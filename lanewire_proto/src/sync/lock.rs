//! See [`RawRwLock`] and [`RwSpinLock`].

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU16, AtomicU32, Ordering},
    thread,
};

use web_time::{Duration, Instant};

use super::current_thread_id;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SPIN_COUNT: u32 = 5000;
const WRITE_THREAD_MASK: u32 = 0xFFFF_0000;
const READ_COUNT_MASK: u32 = 0x0000_FFFF;
const EMPTY_FLAG: u32 = 0;

/// Read/write spin lock with a packed 32-bit state word:
///
/// ```text
/// [WWWWWWWW WWWWWWWW][RRRRRRRR RRRRRRRR]
/// W: exclusive owner thread id
/// R: shared reader count
/// ```
///
/// Write acquisition is reentrant for the owning thread. Both acquisition
/// paths busy-spin a bounded number of times, then yield; a thread that
/// cannot acquire within 10 seconds trips a debug assertion.
///
/// `name` identifies the lock to the deadlock profiler in debug builds.
#[derive(Debug)]
pub struct RawRwLock {
    state: AtomicU32,
    /// Write reentrancy depth. Only ever touched by the owning thread.
    write_count: AtomicU16,
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(EMPTY_FLAG),
            write_count: AtomicU16::new(0),
        }
    }

    /// Acquires the lock exclusively, blocking until available.
    pub fn write_lock(&self, name: &'static str) {
        #[cfg(debug_assertions)]
        super::deadlock::profiler_push(name);
        #[cfg(not(debug_assertions))]
        let _ = name;

        // reacquisition by the owning thread always succeeds
        let owner = (self.state.load(Ordering::Acquire) & WRITE_THREAD_MASK) >> 16;
        if u32::from(current_thread_id()) == owner {
            self.write_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let begin = Instant::now();
        let desired = (u32::from(current_thread_id()) << 16) & WRITE_THREAD_MASK;
        loop {
            for _ in 0..MAX_SPIN_COUNT {
                if self
                    .state
                    .compare_exchange(EMPTY_FLAG, desired, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.write_count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }

            debug_assert!(
                begin.elapsed() < ACQUIRE_TIMEOUT,
                "lock timed out: thread could not acquire write lock in 10s"
            );

            thread::yield_now();
        }
    }

    /// Releases one level of exclusive ownership.
    pub fn write_unlock(&self, name: &'static str) {
        #[cfg(debug_assertions)]
        super::deadlock::profiler_pop(name);
        #[cfg(not(debug_assertions))]
        let _ = name;

        debug_assert_eq!(
            self.state.load(Ordering::Relaxed) & READ_COUNT_MASK,
            0,
            "write unlock while readers are still inside"
        );

        let count = self.write_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if count == 0 {
            self.state.store(EMPTY_FLAG, Ordering::Release);
        }
    }

    /// Acquires the lock shared, blocking until no other thread holds it
    /// exclusively.
    pub fn read_lock(&self, name: &'static str) {
        #[cfg(debug_assertions)]
        super::deadlock::profiler_push(name);
        #[cfg(not(debug_assertions))]
        let _ = name;

        // the exclusive owner may freely take shared entries too
        let owner = (self.state.load(Ordering::Acquire) & WRITE_THREAD_MASK) >> 16;
        if u32::from(current_thread_id()) == owner {
            self.state.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let begin = Instant::now();
        loop {
            for _ in 0..MAX_SPIN_COUNT {
                let expected = self.state.load(Ordering::Relaxed) & READ_COUNT_MASK;
                if self
                    .state
                    .compare_exchange(expected, expected + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }

            debug_assert!(
                begin.elapsed() < ACQUIRE_TIMEOUT,
                "lock timed out: thread could not acquire read lock in 10s"
            );

            thread::yield_now();
        }
    }

    /// Releases one shared entry.
    pub fn read_unlock(&self, name: &'static str) {
        #[cfg(debug_assertions)]
        super::deadlock::profiler_pop(name);
        #[cfg(not(debug_assertions))]
        let _ = name;

        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(prev & READ_COUNT_MASK, 0, "read unlock without read lock");
    }
}

/// Value guarded by a [`RawRwLock`], accessed through RAII guards.
///
/// Unlike the raw lock, the typed wrapper must not be reacquired reentrantly
/// for writing: the guards hand out references, and two live write guards
/// would alias.
#[derive(Debug)]
pub struct RwSpinLock<T> {
    raw: RawRwLock,
    name: &'static str,
    value: UnsafeCell<T>,
}

// Same justification as std::sync::RwLock: the raw lock serialises access
// to the UnsafeCell contents.
unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    /// Creates a lock around `value`. `name` identifies it to the deadlock
    /// profiler.
    #[must_use]
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            name,
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires shared access.
    #[must_use]
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.raw.read_lock(self.name);
        ReadGuard { lock: self }
    }

    /// Acquires exclusive access.
    #[must_use]
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.write_lock(self.name);
        WriteGuard { lock: self }
    }

    /// Gets the value without locking; safe because `&mut self` proves
    /// unique access.
    #[must_use]
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// Shared access to a [`RwSpinLock`] value.
#[derive(Debug)]
pub struct ReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // read lock held for the guard's lifetime
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock(self.lock.name);
    }
}

/// Exclusive access to a [`RwSpinLock`] value.
#[derive(Debug)]
pub struct WriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // write lock held for the guard's lifetime
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.write_unlock(self.lock.name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn write_excludes_write() {
        let lock = Arc::new(RwSpinLock::new("test.counter", 0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.write() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 40_000);
    }

    #[test]
    fn readers_share() {
        let lock = RwSpinLock::new("test.shared", 7u32);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 14);
    }

    #[test]
    fn raw_write_reentrancy() {
        let lock = RawRwLock::new();
        lock.write_lock("test.reentrant");
        lock.write_lock("test.reentrant");
        lock.write_unlock("test.reentrant");
        lock.write_unlock("test.reentrant");
        // fully released again
        lock.read_lock("test.reentrant");
        lock.read_unlock("test.reentrant");
    }

    #[test]
    fn thread_ids_distinct() {
        let here = current_thread_id();
        let there = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, 0);
        assert_ne!(here, there);
    }
}
