//! EHCI queue element Transfer Descriptor (qTD)
//!
//! Layout per EHCI Specification Section 3.5: exactly one 32-byte,
//! 32-byte-aligned block, fully owned by hardware while a transfer is
//! active.

use core::sync::atomic::{AtomicU32, Ordering};

use super::pool::PoolItem;
use super::TERMINATE;
use crate::error::{Result, UsbError};

/// qTD token bit definitions (EHCI Section 3.5.3)
pub mod token {
    /// Transfer is live; hardware clears this on completion
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    /// Serious error halted the endpoint
    pub const STATUS_HALTED: u32 = 1 << 6;
    /// Data buffer overrun or underrun
    pub const STATUS_DATA_BUFFER_ERROR: u32 = 1 << 5;
    /// Device sent more data than expected
    pub const STATUS_BABBLE: u32 = 1 << 4;
    /// CRC, timeout, or bad PID on the bus
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    /// Host missed the scheduled microframe
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;

    /// PID code field
    pub const PID_SHIFT: u32 = 8;
    pub const PID_OUT: u32 = 0 << PID_SHIFT;
    pub const PID_IN: u32 = 1 << PID_SHIFT;
    pub const PID_SETUP: u32 = 2 << PID_SHIFT;

    /// Error counter: retries before the endpoint halts
    pub const ERROR_COUNTER_SHIFT: u32 = 10;

    /// Interrupt on complete
    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;

    /// Total bytes to transfer; decremented by hardware
    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7fff;

    /// Data toggle (DATA0/DATA1)
    pub const DATA_TOGGLE: u32 = 1 << 31;
}

/// Token PID codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pid {
    Out,
    In,
    Setup,
}

impl Pid {
    const fn encoding(self) -> u32 {
        match self {
            Pid::Out => token::PID_OUT,
            Pid::In => token::PID_IN,
            Pid::Setup => token::PID_SETUP,
        }
    }
}

/// Largest transfer one qTD can describe: five page-aligned 4 KiB pages
pub const MAX_QTD_TRANSFER: usize = 5 * 4096;

const PAGE_SIZE: u32 = 4096;
const PAGE_MASK: u32 = !(PAGE_SIZE - 1);

/// EHCI queue element Transfer Descriptor
#[repr(C, align(32))]
pub struct QueueTd {
    /// Next qTD pointer
    pub next: AtomicU32,
    /// Alternate next qTD pointer (short-packet path)
    pub alt_next: AtomicU32,
    /// Transfer token
    pub token: AtomicU32,
    /// Buffer page pointers
    pub buffers: [AtomicU32; 5],
}

impl QueueTd {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(TERMINATE),
            alt_next: AtomicU32::new(TERMINATE),
            token: AtomicU32::new(0),
            buffers: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    /// Address of this qTD for hardware link pointers
    #[inline]
    pub fn addr(&self) -> u32 {
        self as *const Self as usize as u32
    }

    /// Fill in the token and buffer pages for one bus transaction chain.
    ///
    /// `buffer` may be unaligned; the remaining page pointers cover the
    /// following 4 KiB pages. Zero-length transfers (status stages) carry
    /// no buffer.
    pub fn init_transfer(
        &self,
        pid: Pid,
        buffer: u32,
        len: usize,
        data_toggle: bool,
        ioc: bool,
    ) -> Result<()> {
        if len > MAX_QTD_TRANSFER {
            return Err(UsbError::InvalidParameter);
        }
        if len > 0 {
            let first_page_bytes = (PAGE_SIZE - (buffer & !PAGE_MASK)) as usize;
            if len > first_page_bytes + 4 * PAGE_SIZE as usize {
                return Err(UsbError::InvalidParameter);
            }
        }

        let mut tok = token::STATUS_ACTIVE
            | pid.encoding()
            | 3 << token::ERROR_COUNTER_SHIFT
            | (len as u32) << token::TOTAL_BYTES_SHIFT;
        if data_toggle {
            tok |= token::DATA_TOGGLE;
        }
        if ioc {
            tok |= token::INTERRUPT_ON_COMPLETE;
        }

        if len > 0 {
            self.buffers[0].store(buffer, Ordering::Release);
            let mut page = (buffer & PAGE_MASK) + PAGE_SIZE;
            for bp in self.buffers.iter().skip(1) {
                bp.store(page, Ordering::Release);
                page += PAGE_SIZE;
            }
        } else {
            for bp in &self.buffers {
                bp.store(0, Ordering::Release);
            }
        }

        self.next.store(TERMINATE, Ordering::Release);
        self.alt_next.store(TERMINATE, Ordering::Release);
        self.token.store(tok, Ordering::Release);
        Ok(())
    }

    /// Chain another qTD after this one
    pub fn link_next(&self, qtd_addr: u32) {
        self.next.store(qtd_addr & !0x1f, Ordering::Release);
    }

    /// Next qTD in the chain, `None` at the end
    pub fn next_qtd(&self) -> Option<u32> {
        let next = self.next.load(Ordering::Acquire);
        if next & TERMINATE != 0 {
            None
        } else {
            Some(next & !0x1f)
        }
    }

    /// Whether hardware still owns this descriptor
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Bytes the transfer did not move (token residue)
    pub fn remaining_bytes(&self) -> u32 {
        (self.token.load(Ordering::Acquire) >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK
    }

    /// Decode a completed token into a transfer error, if any.
    ///
    /// A halted endpoint with only the halt bit set is a STALL handshake;
    /// halted with an error status bit is a bus-level failure.
    pub fn error(&self) -> Option<UsbError> {
        let tok = self.token.load(Ordering::Acquire);
        if tok & token::STATUS_HALTED == 0 {
            return None;
        }
        if tok & token::STATUS_DATA_BUFFER_ERROR != 0 {
            Some(UsbError::BufferOverrun)
        } else if tok
            & (token::STATUS_BABBLE
                | token::STATUS_TRANSACTION_ERROR
                | token::STATUS_MISSED_MICROFRAME)
            != 0
        {
            Some(UsbError::TransactionError)
        } else {
            Some(UsbError::Stall)
        }
    }
}

impl PoolItem for QueueTd {
    const NEW: Self = QueueTd::new();

    fn reset(&self) {
        self.next.store(TERMINATE, Ordering::Release);
        self.alt_next.store(TERMINATE, Ordering::Release);
        self.token.store(0, Ordering::Release);
        for bp in &self.buffers {
            bp.store(0, Ordering::Release);
        }
    }
}

const _: () = assert!(core::mem::size_of::<QueueTd>() == 32);
const _: () = assert!(core::mem::align_of::<QueueTd>() == 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_qtd_is_inert() {
        let qtd = QueueTd::new();
        assert!(!qtd.is_active());
        assert!(qtd.next_qtd().is_none());
        assert!(qtd.error().is_none());
    }

    #[test]
    fn test_init_transfer_token() {
        let qtd = QueueTd::new();
        qtd.init_transfer(Pid::In, 0x2000_0000, 512, true, true).unwrap();
        let tok = qtd.token.load(Ordering::Relaxed);
        assert!(qtd.is_active());
        assert_eq!(tok & (3 << token::PID_SHIFT), token::PID_IN);
        assert_eq!(qtd.remaining_bytes(), 512);
        assert_ne!(tok & token::DATA_TOGGLE, 0);
        assert_ne!(tok & token::INTERRUPT_ON_COMPLETE, 0);
    }

    #[test]
    fn test_init_transfer_buffer_pages() {
        let qtd = QueueTd::new();
        qtd.init_transfer(Pid::Out, 0x2000_0100, 8192, false, false)
            .unwrap();
        assert_eq!(qtd.buffers[0].load(Ordering::Relaxed), 0x2000_0100);
        assert_eq!(qtd.buffers[1].load(Ordering::Relaxed), 0x2000_1000);
        assert_eq!(qtd.buffers[2].load(Ordering::Relaxed), 0x2000_2000);
    }

    #[test]
    fn test_init_zero_length_transfer() {
        let qtd = QueueTd::new();
        qtd.init_transfer(Pid::In, 0, 0, true, true).unwrap();
        assert!(qtd.is_active());
        assert_eq!(qtd.remaining_bytes(), 0);
        assert_eq!(qtd.buffers[0].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_init_transfer_rejects_oversize() {
        let qtd = QueueTd::new();
        assert_eq!(
            qtd.init_transfer(Pid::Out, 0x2000_0000, MAX_QTD_TRANSFER + 1, false, false),
            Err(UsbError::InvalidParameter)
        );
        // Unaligned start shrinks what five pages can hold
        assert!(qtd
            .init_transfer(Pid::Out, 0x2000_0ff0, MAX_QTD_TRANSFER, false, false)
            .is_err());
    }

    #[test]
    fn test_error_decode_stall() {
        let qtd = QueueTd::new();
        qtd.token.store(token::STATUS_HALTED, Ordering::Relaxed);
        assert_eq!(qtd.error(), Some(UsbError::Stall));
    }

    #[test]
    fn test_error_decode_transaction_error() {
        let qtd = QueueTd::new();
        qtd.token.store(
            token::STATUS_HALTED | token::STATUS_TRANSACTION_ERROR,
            Ordering::Relaxed,
        );
        assert_eq!(qtd.error(), Some(UsbError::TransactionError));
        qtd.token.store(
            token::STATUS_HALTED | token::STATUS_BABBLE,
            Ordering::Relaxed,
        );
        assert_eq!(qtd.error(), Some(UsbError::TransactionError));
    }

    #[test]
    fn test_error_decode_buffer_error() {
        let qtd = QueueTd::new();
        qtd.token.store(
            token::STATUS_HALTED | token::STATUS_DATA_BUFFER_ERROR,
            Ordering::Relaxed,
        );
        assert_eq!(qtd.error(), Some(UsbError::BufferOverrun));
    }

    #[test]
    fn test_remaining_bytes_after_partial_transfer() {
        let qtd = QueueTd::new();
        qtd.init_transfer(Pid::In, 0x2000_0000, 512, false, false)
            .unwrap();
        // Hardware consumed 200 of 512 bytes and retired the descriptor
        let tok = qtd.token.load(Ordering::Relaxed);
        let done = (tok & !(token::TOTAL_BYTES_MASK << token::TOTAL_BYTES_SHIFT)
            & !token::STATUS_ACTIVE)
            | 312 << token::TOTAL_BYTES_SHIFT;
        qtd.token.store(done, Ordering::Relaxed);
        assert!(!qtd.is_active());
        assert_eq!(qtd.remaining_bytes(), 312);
    }
}
