//! Thread/interrupt synchronization primitives
//!
//! The driver serializes structural state behind one coarse exclusive
//! lock and signals blocked callers from interrupt context through
//! [`Completion`] flags. The lock is never held while blocking on a
//! completion.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, UsbError};
use crate::hw::UsbHw;

/// Polling interval for lock acquisition and completion waits
const POLL_INTERVAL_US: u32 = 100;

/// Exclusive-access container for driver structural state
///
/// Interrupt handlers must never take this lock; they communicate
/// through atomics and [`Completion`] signals only.
pub struct Exclusive<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `locked`.
unsafe impl<T: Send> Sync for Exclusive<T> {}

impl<T> Exclusive<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire exclusive access, spinning with a delay back-off.
    pub fn lock<'a, H: UsbHw>(&'a self, hw: &H) -> ExclGuard<'a, T> {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hw.delay_us(POLL_INTERVAL_US);
        }
        ExclGuard { owner: self }
    }
}

/// RAII guard for [`Exclusive`]; releases the lock on drop
pub struct ExclGuard<'a, T> {
    owner: &'a Exclusive<T>,
}

impl<T> Deref for ExclGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for ExclGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for ExclGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.locked.store(false, Ordering::Release);
    }
}

/// One-shot wake flag posted from interrupt context
///
/// Waiters consume the flag; a post with no waiter is remembered until
/// the next wait. Waits are bounded counted-delay polls through the
/// hardware delay source, so they need no OS support and remain
/// testable against mock hardware.
pub struct Completion {
    signaled: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    /// Post the signal. Interrupt-safe, never blocks.
    pub fn post(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    /// Consume the signal if it is pending.
    pub fn take(&self) -> bool {
        self.signaled.swap(false, Ordering::Acquire)
    }

    /// Discard any stale signal before arming a new wait.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Block until the signal is posted.
    pub fn wait<H: UsbHw>(&self, hw: &H) {
        while !self.take() {
            hw.delay_us(POLL_INTERVAL_US);
        }
    }

    /// Block until the signal is posted or `timeout_us` elapses.
    pub fn wait_timeout<H: UsbHw>(&self, hw: &H, timeout_us: u32) -> Result<()> {
        let mut elapsed = 0;
        loop {
            if self.take() {
                return Ok(());
            }
            if elapsed >= timeout_us {
                return Err(UsbError::Timeout);
            }
            hw.delay_us(POLL_INTERVAL_US);
            elapsed += POLL_INTERVAL_US;
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    struct NullHw {
        delays: AtomicU32,
    }

    impl NullHw {
        fn new() -> Self {
            Self {
                delays: AtomicU32::new(0),
            }
        }
    }

    impl UsbHw for NullHw {
        fn read_reg(&self, _reg: crate::hw::Reg) -> u32 {
            0
        }
        fn write_reg(&self, _reg: crate::hw::Reg, _value: u32) {}
        fn delay_us(&self, us: u32) {
            self.delays.fetch_add(us, Ordering::Relaxed);
        }
        fn dcache_clean(&self, _addr: usize, _len: usize) {}
        fn dcache_invalidate(&self, _addr: usize, _len: usize) {}
    }

    #[test]
    fn test_completion_post_then_wait() {
        let hw = NullHw::new();
        let c = Completion::new();
        c.post();
        assert!(c.wait_timeout(&hw, 1000).is_ok());
        // Signal was consumed
        assert!(!c.take());
    }

    #[test]
    fn test_completion_wait_times_out() {
        let hw = NullHw::new();
        let c = Completion::new();
        assert_eq!(c.wait_timeout(&hw, 1000), Err(UsbError::Timeout));
        assert!(hw.delays.load(Ordering::Relaxed) >= 1000);
    }

    #[test]
    fn test_exclusive_lock_serializes() {
        let hw = NullHw::new();
        let excl = Exclusive::new(0u32);
        {
            let mut guard = excl.lock(&hw);
            *guard += 1;
        }
        let guard = excl.lock(&hw);
        assert_eq!(*guard, 1);
    }
}
