//! Transfer buffer pools
//!
//! Two pools back the driver's buffer services: fixed 128-byte buffers
//! for descriptor traffic during enumeration, and a small set of
//! size-classed I/O buffers for class driver data. Both live behind the
//! host's exclusive lock, so plain bookkeeping suffices.

use crate::error::{Result, UsbError};

/// Size of one descriptor transfer buffer
pub const TRANSFER_BUFSIZE: usize = 128;

const IO_SMALL_SIZE: usize = 512;
const IO_LARGE_SIZE: usize = 4096;
const IO_SMALL_COUNT: usize = 8;
const IO_LARGE_COUNT: usize = 2;

/// Handle to a 128-byte descriptor buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(usize);

/// Pool of fixed-size descriptor buffers
pub struct BufferPool<const N: usize> {
    buffers: [[u8; TRANSFER_BUFSIZE]; N],
    used: [bool; N],
}

impl<const N: usize> BufferPool<N> {
    pub const fn new() -> Self {
        Self {
            buffers: [[0; TRANSFER_BUFSIZE]; N],
            used: [false; N],
        }
    }

    pub fn allocate(&mut self) -> Result<BufferId> {
        for (i, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(BufferId(i));
            }
        }
        Err(UsbError::NoResources)
    }

    pub fn release(&mut self, id: BufferId) -> Result<()> {
        if id.0 >= N || !self.used[id.0] {
            return Err(UsbError::InvalidState);
        }
        self.used[id.0] = false;
        Ok(())
    }

    pub fn get(&self, id: BufferId) -> &[u8] {
        &self.buffers[id.0]
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut [u8] {
        &mut self.buffers[id.0]
    }

    pub fn available(&self) -> usize {
        self.used.iter().filter(|u| !**u).count()
    }
}

/// Handle to a size-classed I/O buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBufferId {
    Small(usize),
    Large(usize),
}

/// Size-classed pool for larger I/O buffers
pub struct IoBufferPool {
    small: [[u8; IO_SMALL_SIZE]; IO_SMALL_COUNT],
    large: [[u8; IO_LARGE_SIZE]; IO_LARGE_COUNT],
    small_used: [bool; IO_SMALL_COUNT],
    large_used: [bool; IO_LARGE_COUNT],
}

impl IoBufferPool {
    pub const fn new() -> Self {
        Self {
            small: [[0; IO_SMALL_SIZE]; IO_SMALL_COUNT],
            large: [[0; IO_LARGE_SIZE]; IO_LARGE_COUNT],
            small_used: [false; IO_SMALL_COUNT],
            large_used: [false; IO_LARGE_COUNT],
        }
    }

    /// Allocate a buffer of at least `size` bytes from the smallest
    /// class that fits.
    pub fn allocate(&mut self, size: usize) -> Result<IoBufferId> {
        if size <= IO_SMALL_SIZE {
            for (i, used) in self.small_used.iter_mut().enumerate() {
                if !*used {
                    *used = true;
                    return Ok(IoBufferId::Small(i));
                }
            }
            // Small class exhausted; a large buffer still satisfies the request
        }
        if size <= IO_LARGE_SIZE {
            for (i, used) in self.large_used.iter_mut().enumerate() {
                if !*used {
                    *used = true;
                    return Ok(IoBufferId::Large(i));
                }
            }
            return Err(UsbError::NoResources);
        }
        Err(UsbError::InvalidParameter)
    }

    pub fn release(&mut self, id: IoBufferId) -> Result<()> {
        match id {
            IoBufferId::Small(i) => {
                if i >= IO_SMALL_COUNT || !self.small_used[i] {
                    return Err(UsbError::InvalidState);
                }
                self.small_used[i] = false;
            }
            IoBufferId::Large(i) => {
                if i >= IO_LARGE_COUNT || !self.large_used[i] {
                    return Err(UsbError::InvalidState);
                }
                self.large_used[i] = false;
            }
        }
        Ok(())
    }

    pub fn get(&self, id: IoBufferId) -> &[u8] {
        match id {
            IoBufferId::Small(i) => &self.small[i],
            IoBufferId::Large(i) => &self.large[i],
        }
    }

    pub fn get_mut(&mut self, id: IoBufferId) -> &mut [u8] {
        match id {
            IoBufferId::Small(i) => &mut self.small[i],
            IoBufferId::Large(i) => &mut self.large[i],
        }
    }
}
