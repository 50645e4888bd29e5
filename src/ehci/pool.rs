//! Fixed descriptor pools for QH and qTD structures
//!
//! Descriptors live in a statically sized arena so their addresses are
//! stable for hardware link pointers. The free list is a stack of slot
//! indices kept outside the descriptors themselves; a released slot is
//! exactly the one the next allocation returns.

use core::fmt;
use core::marker::PhantomData;

use heapless::Vec;

use crate::error::{Result, UsbError};

/// An item a [`DescriptorPool`] can hand out
pub trait PoolItem {
    /// Initial value used to build the arena
    const NEW: Self;

    /// Clear all hardware-visible state before reuse
    fn reset(&self);
}

/// Typed index into a descriptor pool
pub struct Handle<T> {
    index: u8,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u8) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.index)
    }
}

pub type QhHandle = Handle<super::QueueHead>;
pub type QtdHandle = Handle<super::QueueTd>;

/// Arena-backed descriptor pool with an index free list
pub struct DescriptorPool<T: PoolItem, const N: usize> {
    slots: [T; N],
    free: Vec<u8, N>,
}

impl<T: PoolItem, const N: usize> DescriptorPool<T, N> {
    pub fn new() -> Self {
        let mut free = Vec::new();
        // Reverse order so the first allocation takes slot 0
        for i in (0..N).rev() {
            let _ = free.push(i as u8);
        }
        Self {
            slots: [T::NEW; N],
            free,
        }
    }

    /// Claim a descriptor, cleared of any previous state.
    pub fn allocate(&mut self) -> Result<Handle<T>> {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].reset();
                Ok(Handle::new(index))
            }
            None => Err(UsbError::NoResources),
        }
    }

    /// Return a descriptor to the pool.
    pub fn release(&mut self, handle: Handle<T>) -> Result<()> {
        let index = handle.index;
        if (index as usize) >= N || self.free.contains(&index) {
            return Err(UsbError::InvalidState);
        }
        // Capacity equals N, so the push cannot fail after the check above
        let _ = self.free.push(index);
        Ok(())
    }

    pub fn get(&self, handle: Handle<T>) -> &T {
        &self.slots[handle.index()]
    }

    /// Address of a slot for hardware link pointers
    pub fn addr_of(&self, handle: Handle<T>) -> u32 {
        &self.slots[handle.index()] as *const T as usize as u32
    }

    /// Map a hardware link pointer back to a pool slot.
    ///
    /// Returns `None` for addresses outside the arena.
    pub fn handle_of_addr(&self, addr: u32) -> Option<Handle<T>> {
        let base = self.slots.as_ptr() as usize as u32;
        let size = core::mem::size_of::<T>() as u32;
        let offset = addr.wrapping_sub(base);
        let index = offset / size;
        if offset % size == 0 && (index as usize) < N {
            Some(Handle::new(index as u8))
        } else {
            None
        }
    }

    /// Descriptors currently unclaimed
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl<T: PoolItem, const N: usize> Default for DescriptorPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ehci::{QueueHead, QueueTd};
    use core::sync::atomic::Ordering;

    #[test]
    fn test_pool_exhaustion() {
        let mut pool: DescriptorPool<QueueTd, 4> = DescriptorPool::new();
        for _ in 0..4 {
            pool.allocate().unwrap();
        }
        assert_eq!(pool.allocate().unwrap_err(), UsbError::NoResources);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_then_allocate_returns_same_slot() {
        let mut pool: DescriptorPool<QueueHead, 4> = DescriptorPool::new();
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.release(a).unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_allocate_resets_descriptor() {
        let mut pool: DescriptorPool<QueueTd, 2> = DescriptorPool::new();
        let h = pool.allocate().unwrap();
        pool.get(h).token.store(0xffff_ffff, Ordering::Relaxed);
        pool.release(h).unwrap();
        let h2 = pool.allocate().unwrap();
        assert_eq!(h, h2);
        assert_eq!(pool.get(h2).token.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_double_release_rejected() {
        let mut pool: DescriptorPool<QueueTd, 2> = DescriptorPool::new();
        let h = pool.allocate().unwrap();
        pool.release(h).unwrap();
        assert_eq!(pool.release(h).unwrap_err(), UsbError::InvalidState);
    }

    #[test]
    fn test_addr_roundtrip() {
        let mut pool: DescriptorPool<QueueHead, 4> = DescriptorPool::new();
        let h = pool.allocate().unwrap();
        let addr = pool.addr_of(h);
        assert_eq!(pool.handle_of_addr(addr), Some(h));
        assert_eq!(pool.handle_of_addr(addr + 1), None);
        assert_eq!(pool.handle_of_addr(addr.wrapping_sub(96)), None);
    }

    #[test]
    fn test_qtd_pool_of_three_recycles_identity() {
        let mut pool: DescriptorPool<QueueTd, 3> = DescriptorPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert!(pool.allocate().is_err());
        pool.release(b).unwrap();
        let again = pool.allocate().unwrap();
        assert_eq!(again, b);
        assert_ne!(again, a);
        assert_ne!(again, c);
    }
}
