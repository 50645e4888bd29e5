//! EHCI Queue Head (QH) structure
//!
//! Layout per EHCI Specification Section 3.6. The controller reads and
//! writes these fields by DMA, so everything hardware-visible is an
//! `AtomicU32` and the structure is 32-byte aligned. The words past the
//! transfer overlay are software-only; the controller never touches them.

use core::sync::atomic::{AtomicU32, Ordering};

use super::pool::PoolItem;
use super::{TERMINATE, TYPE_QH};
use crate::error::{Result, UsbError};

/// Endpoint speed encoding for the QH endpoint characteristics word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// 12 Mbit/s
    Full,
    /// 1.5 Mbit/s
    Low,
    /// 480 Mbit/s
    High,
}

impl Speed {
    pub(crate) const fn encoding(self) -> u32 {
        match self {
            Speed::Full => 0,
            Speed::Low => 1,
            Speed::High => 2,
        }
    }
}

/// Endpoint characteristics word (QH word 1) bit definitions
pub mod epchar {
    /// Device address field
    pub const DEVICE_ADDRESS_SHIFT: u32 = 0;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7f;

    /// Endpoint number field
    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xf;

    /// Endpoint speed field
    pub const SPEED_SHIFT: u32 = 12;

    /// Take the data toggle from each incoming qTD, not the overlay
    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;

    /// Head of the asynchronous schedule reclamation list
    pub const HEAD_OF_LIST: u32 = 1 << 15;

    /// Maximum packet length field
    pub const MAX_PACKET_SHIFT: u32 = 16;
    pub const MAX_PACKET_MASK: u32 = 0x7ff;

    /// Control endpoint flag (non-high-speed control endpoints only)
    pub const CONTROL_ENDPOINT: u32 = 1 << 27;

    /// NAK count reload field
    pub const NAK_RELOAD_SHIFT: u32 = 28;
}

/// Endpoint capabilities word (QH word 2) bit definitions
pub mod epcaps {
    /// Interrupt schedule mask
    pub const UFRAME_SMASK_SHIFT: u32 = 0;

    /// High-bandwidth multiplier (must be 1..=3)
    pub const MULT_SHIFT: u32 = 30;
}

/// EHCI Queue Head
#[repr(C, align(32))]
pub struct QueueHead {
    /// Horizontal link pointer to the next QH in the schedule
    pub hlp: AtomicU32,
    /// Endpoint characteristics
    pub epchar: AtomicU32,
    /// Endpoint capabilities
    pub epcaps: AtomicU32,
    /// Current qTD pointer (written by hardware)
    pub current_qtd: AtomicU32,

    // Transfer overlay, EHCI Section 3.6.3
    /// Next qTD pointer
    pub next_qtd: AtomicU32,
    /// Alternate next qTD pointer
    pub alt_next_qtd: AtomicU32,
    /// Overlay token (status of the transfer in progress)
    pub token: AtomicU32,
    /// Overlay buffer page pointers
    pub buffers: [AtomicU32; 5],
    /// Extended buffer pointers (64-bit controllers only; always zero here)
    pub ext_buffers: [AtomicU32; 5],

    /// Software: owning endpoint slot index plus one, zero when unbound
    pub owner: AtomicU32,
    _reserved: [u32; 3],
}

impl QueueHead {
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            hlp: AtomicU32::new(TERMINATE),
            epchar: ZERO,
            epcaps: ZERO,
            current_qtd: ZERO,
            next_qtd: AtomicU32::new(TERMINATE),
            alt_next_qtd: AtomicU32::new(TERMINATE),
            token: ZERO,
            buffers: [ZERO; 5],
            ext_buffers: [ZERO; 5],
            owner: ZERO,
            _reserved: [0; 3],
        }
    }

    /// Address of this QH for hardware link pointers
    #[inline]
    pub fn addr(&self) -> u32 {
        self as *const Self as usize as u32
    }

    /// Program the endpoint characteristics and capabilities words.
    pub fn init_endpoint(
        &self,
        device_addr: u8,
        ep_num: u8,
        max_packet: u16,
        speed: Speed,
        is_control: bool,
    ) -> Result<()> {
        if device_addr > 127 {
            return Err(UsbError::InvalidParameter);
        }
        if ep_num > 15 {
            return Err(UsbError::InvalidParameter);
        }
        if max_packet == 0 || max_packet > 1024 {
            return Err(UsbError::InvalidParameter);
        }

        let mut chars = (device_addr as u32) << epchar::DEVICE_ADDRESS_SHIFT
            | (ep_num as u32) << epchar::ENDPOINT_NUMBER_SHIFT
            | speed.encoding() << epchar::SPEED_SHIFT
            | (max_packet as u32) << epchar::MAX_PACKET_SHIFT
            | 3 << epchar::NAK_RELOAD_SHIFT;

        if is_control {
            // Control transfers carry the toggle in each qTD
            chars |= epchar::DATA_TOGGLE_CONTROL;
            if !matches!(speed, Speed::High) {
                chars |= epchar::CONTROL_ENDPOINT;
            }
        }

        self.epchar.store(chars, Ordering::Release);
        self.epcaps
            .store(1 << epcaps::MULT_SHIFT, Ordering::Release);
        Ok(())
    }

    /// Mark this QH as the head of the asynchronous reclamation list
    pub fn set_head_of_list(&self) {
        self.epchar
            .fetch_or(epchar::HEAD_OF_LIST, Ordering::AcqRel);
    }

    /// Point the horizontal link at another QH
    pub fn link_to(&self, qh_addr: u32) {
        self.hlp.store((qh_addr & !0x1f) | TYPE_QH, Ordering::Release);
    }

    /// Terminate the horizontal link
    pub fn unlink(&self) {
        self.hlp.store(TERMINATE, Ordering::Release);
    }

    /// Hand a qTD chain to the overlay for execution
    pub fn link_qtd(&self, qtd_addr: u32) {
        self.alt_next_qtd.store(TERMINATE, Ordering::Release);
        self.token.store(0, Ordering::Release);
        self.next_qtd.store(qtd_addr & !0x1f, Ordering::Release);
    }

    /// First qTD of the pending chain, `None` when the queue is empty
    pub fn first_qtd(&self) -> Option<u32> {
        let next = self.next_qtd.load(Ordering::Acquire);
        if next & TERMINATE != 0 {
            None
        } else {
            Some(next & !0x1f)
        }
    }

    /// Next QH in the schedule, `None` at the end of the chain
    pub fn next_qh(&self) -> Option<u32> {
        let hlp = self.hlp.load(Ordering::Acquire);
        if hlp & TERMINATE != 0 {
            None
        } else {
            Some(hlp & !0x1f)
        }
    }

    /// Overlay token of the transfer in progress
    pub fn overlay_token(&self) -> u32 {
        self.token.load(Ordering::Acquire)
    }
}

impl PoolItem for QueueHead {
    const NEW: Self = QueueHead::new();

    fn reset(&self) {
        self.hlp.store(TERMINATE, Ordering::Release);
        self.epchar.store(0, Ordering::Release);
        self.epcaps.store(0, Ordering::Release);
        self.current_qtd.store(0, Ordering::Release);
        self.next_qtd.store(TERMINATE, Ordering::Release);
        self.alt_next_qtd.store(TERMINATE, Ordering::Release);
        self.token.store(0, Ordering::Release);
        for bp in &self.buffers {
            bp.store(0, Ordering::Release);
        }
        for bp in &self.ext_buffers {
            bp.store(0, Ordering::Release);
        }
        self.owner.store(0, Ordering::Release);
    }
}

// Hardware contract: 48-byte descriptor padded to three cache-line-sized slots
const _: () = assert!(core::mem::size_of::<QueueHead>() == 96);
const _: () = assert!(core::mem::align_of::<QueueHead>() == 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_qh_is_terminated() {
        let qh = QueueHead::new();
        assert!(qh.next_qh().is_none());
        assert!(qh.first_qtd().is_none());
    }

    #[test]
    fn test_init_endpoint_encoding() {
        let qh = QueueHead::new();
        qh.init_endpoint(5, 1, 64, Speed::High, false).unwrap();
        let chars = qh.epchar.load(Ordering::Relaxed);
        assert_eq!(chars & epchar::DEVICE_ADDRESS_MASK, 5);
        assert_eq!(
            (chars >> epchar::ENDPOINT_NUMBER_SHIFT) & epchar::ENDPOINT_NUMBER_MASK,
            1
        );
        assert_eq!((chars >> epchar::MAX_PACKET_SHIFT) & epchar::MAX_PACKET_MASK, 64);
        assert_eq!((chars >> epchar::SPEED_SHIFT) & 0x3, Speed::High.encoding());
        assert_eq!(chars & epchar::DATA_TOGGLE_CONTROL, 0);
    }

    #[test]
    fn test_init_control_endpoint_full_speed() {
        let qh = QueueHead::new();
        qh.init_endpoint(0, 0, 8, Speed::Full, true).unwrap();
        let chars = qh.epchar.load(Ordering::Relaxed);
        assert_ne!(chars & epchar::DATA_TOGGLE_CONTROL, 0);
        assert_ne!(chars & epchar::CONTROL_ENDPOINT, 0);
    }

    #[test]
    fn test_init_control_endpoint_high_speed() {
        let qh = QueueHead::new();
        qh.init_endpoint(1, 0, 64, Speed::High, true).unwrap();
        let chars = qh.epchar.load(Ordering::Relaxed);
        assert_ne!(chars & epchar::DATA_TOGGLE_CONTROL, 0);
        // The C bit is only for split transactions
        assert_eq!(chars & epchar::CONTROL_ENDPOINT, 0);
    }

    #[test]
    fn test_init_endpoint_rejects_bad_params() {
        let qh = QueueHead::new();
        assert!(qh.init_endpoint(128, 0, 64, Speed::High, false).is_err());
        assert!(qh.init_endpoint(0, 16, 64, Speed::High, false).is_err());
        assert!(qh.init_endpoint(0, 0, 0, Speed::High, false).is_err());
        assert!(qh.init_endpoint(0, 0, 2048, Speed::High, false).is_err());
    }

    #[test]
    fn test_link_and_unlink() {
        let qh = QueueHead::new();
        qh.link_to(0x1000_0040);
        assert_eq!(qh.next_qh(), Some(0x1000_0040));
        assert_eq!(qh.hlp.load(Ordering::Relaxed) & TYPE_QH, TYPE_QH);
        qh.unlink();
        assert!(qh.next_qh().is_none());
    }

    #[test]
    fn test_link_qtd_resets_overlay() {
        let qh = QueueHead::new();
        qh.token.store(0xdead, Ordering::Relaxed);
        qh.link_qtd(0x2000_0020);
        assert_eq!(qh.first_qtd(), Some(0x2000_0020));
        assert_eq!(qh.overlay_token(), 0);
    }

    #[test]
    fn test_reset_clears_owner() {
        let qh = QueueHead::new();
        qh.owner.store(3, Ordering::Relaxed);
        qh.link_to(0x4000);
        PoolItem::reset(&qh);
        assert_eq!(qh.owner.load(Ordering::Relaxed), 0);
        assert!(qh.next_qh().is_none());
    }
}
