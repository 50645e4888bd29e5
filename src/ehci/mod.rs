//! EHCI (Enhanced Host Controller Interface) data structures and registers
//!
//! Register bit definitions follow the EHCI Specification Section 2; the
//! queue structures in [`qh`] and [`qtd`] follow Section 3. All register
//! traffic goes through [`crate::hw::UsbHw`].

pub mod pool;
pub mod qh;
pub mod qtd;
pub mod queue;

pub use pool::{DescriptorPool, QhHandle, QtdHandle};
pub use qh::{QueueHead, Speed};
pub use qtd::{Pid, QueueTd};

use crate::error::{Result, UsbError};
use bitflags::bitflags;

/// Number of root hub ports on the SAMA5 UHPHS
pub const MAX_ROOT_PORTS: u8 = 3;

/// Type-safe root hub port identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortId(u8);

impl PortId {
    /// Create a new port ID, validating range
    pub const fn new(port: u8) -> Result<Self> {
        if port >= MAX_ROOT_PORTS {
            Err(UsbError::InvalidParameter)
        } else {
            Ok(Self(port))
        }
    }

    /// Port index for array access
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw port number
    #[inline(always)]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<usize> for PortId {
    type Error = UsbError;

    fn try_from(port: usize) -> Result<Self> {
        if port >= MAX_ROOT_PORTS as usize {
            Err(UsbError::InvalidParameter)
        } else {
            Ok(Self(port as u8))
        }
    }
}

bitflags! {
    /// USBCMD register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop: 1 = run, 0 = halt
        const RUN_STOP = 1 << 0;
        /// Host controller reset
        const HC_RESET = 1 << 1;
        /// Periodic schedule enable
        const PERIODIC_SCHEDULE_ENABLE = 1 << 4;
        /// Asynchronous schedule enable
        const ASYNC_SCHEDULE_ENABLE = 1 << 5;
        /// Interrupt on async advance doorbell
        const ASYNC_ADVANCE_DOORBELL = 1 << 6;
    }
}

bitflags! {
    /// USBSTS register bits
    ///
    /// The low six bits are write-1-to-clear interrupt status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// Transfer completed with IOC set
        const USB_INTERRUPT = 1 << 0;
        /// Transfer completed with error
        const USB_ERROR_INTERRUPT = 1 << 1;
        /// Port change detect
        const PORT_CHANGE_DETECT = 1 << 2;
        /// Frame list rollover
        const FRAME_LIST_ROLLOVER = 1 << 3;
        /// Host system error (bus fault during DMA)
        const HOST_SYSTEM_ERROR = 1 << 4;
        /// Interrupt on async advance
        const ASYNC_ADVANCE = 1 << 5;
        /// Host controller halted
        const HC_HALTED = 1 << 12;
        /// Periodic schedule status
        const PERIODIC_SCHEDULE_STATUS = 1 << 14;
        /// Asynchronous schedule status
        const ASYNC_SCHEDULE_STATUS = 1 << 15;

        /// All write-1-to-clear interrupt bits
        const ALL_INTERRUPTS = Self::USB_INTERRUPT.bits()
            | Self::USB_ERROR_INTERRUPT.bits()
            | Self::PORT_CHANGE_DETECT.bits()
            | Self::FRAME_LIST_ROLLOVER.bits()
            | Self::HOST_SYSTEM_ERROR.bits()
            | Self::ASYNC_ADVANCE.bits();
    }
}

bitflags! {
    /// USBINTR register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbIntr: u32 {
        const USB_INTERRUPT = 1 << 0;
        const USB_ERROR = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const FRAME_LIST_ROLLOVER = 1 << 3;
        const HOST_SYSTEM_ERROR = 1 << 4;
        const ASYNC_ADVANCE = 1 << 5;
    }
}

bitflags! {
    /// PORTSC register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        /// Current connect status (RO)
        const CURRENT_CONNECT_STATUS = 1 << 0;
        /// Connect status change (W1C)
        const CONNECT_STATUS_CHANGE = 1 << 1;
        /// Port enabled (RO/RW)
        const PORT_ENABLED = 1 << 2;
        /// Port enable change (W1C)
        const PORT_ENABLE_CHANGE = 1 << 3;
        /// Over-current active (RO)
        const OVER_CURRENT_ACTIVE = 1 << 4;
        /// Over-current change (W1C)
        const OVER_CURRENT_CHANGE = 1 << 5;
        /// Force port resume
        const FORCE_PORT_RESUME = 1 << 6;
        /// Suspend
        const SUSPEND = 1 << 7;
        /// Port reset
        const PORT_RESET = 1 << 8;
        /// Line status (RO, bits 11:10)
        const LINE_STATUS_MASK = 0b11 << 10;
        /// K-state on D+/D-: a low-speed device is attached
        const LINE_STATUS_K_STATE = 0b01 << 10;
        /// Port power
        const PORT_POWER = 1 << 12;
        /// Port owner (1 = companion controller)
        const PORT_OWNER = 1 << 13;

        /// All write-1-to-clear change bits
        const ALL_CHANGES = Self::CONNECT_STATUS_CHANGE.bits()
            | Self::PORT_ENABLE_CHANGE.bits()
            | Self::OVER_CURRENT_CHANGE.bits();
    }
}

impl PortSc {
    /// Whether the attached device signals low speed (K-state before reset)
    pub fn is_low_speed(self) -> bool {
        (self & PortSc::LINE_STATUS_MASK) == PortSc::LINE_STATUS_K_STATE
    }
}

/// Link pointer terminate bit: the chain ends here
pub const TERMINATE: u32 = 1;

/// Link pointer type field for a queue head
pub const TYPE_QH: u32 = 1 << 1;

/// Timeout and delay constants
pub mod timeouts {
    /// Max wait for HC_HALTED after clearing RUN_STOP (EHCI: one microframe)
    pub const HALT_TIMEOUT_US: u32 = 1_000;
    /// Poll step while waiting for the controller to halt
    pub const HALT_POLL_US: u32 = 1;
    /// Max wait for HC_RESET to self-clear
    pub const RESET_TIMEOUT_US: u32 = 1_000_000;
    /// Poll step while waiting for reset completion
    pub const RESET_POLL_US: u32 = 5;
    /// Max wait for a schedule enable/disable to take effect
    pub const SCHEDULE_TIMEOUT_US: u32 = 100_000;
    /// Debounce delay after connect, before asserting port reset
    pub const PORT_SETTLE_MS: u32 = 100;
    /// Port reset assertion time (USB 2.0 requires at least 10 ms)
    pub const PORT_RESET_MS: u32 = 50;
    /// Recovery time after port reset before the device must answer
    pub const PORT_RECOVERY_MS: u32 = 200;
    /// Wait for port power to stabilize at initialization
    pub const POWER_STABLE_MS: u32 = 50;
    /// Deadline for a control transfer to complete
    pub const CONTROL_TIMEOUT_US: u32 = 1_000_000;
    /// Deadline for a bulk or interrupt transfer to complete
    pub const TRANSFER_TIMEOUT_US: u32 = 1_000_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_id_validation() {
        assert!(PortId::new(0).is_ok());
        assert!(PortId::new(2).is_ok());
        assert_eq!(PortId::new(3), Err(UsbError::InvalidParameter));
    }

    #[test]
    fn test_usbcmd_bits() {
        assert_eq!(UsbCmd::RUN_STOP.bits(), 0x0000_0001);
        assert_eq!(UsbCmd::HC_RESET.bits(), 0x0000_0002);
        assert_eq!(UsbCmd::ASYNC_SCHEDULE_ENABLE.bits(), 0x0000_0020);
    }

    #[test]
    fn test_usbsts_bits() {
        assert_eq!(UsbSts::HC_HALTED.bits(), 0x0000_1000);
        assert_eq!(UsbSts::PORT_CHANGE_DETECT.bits(), 0x0000_0004);
        assert_eq!(UsbSts::HOST_SYSTEM_ERROR.bits(), 0x0000_0010);
        assert_eq!(UsbSts::ALL_INTERRUPTS.bits(), 0x0000_003f);
    }

    #[test]
    fn test_portsc_low_speed_detect() {
        let k = PortSc::CURRENT_CONNECT_STATUS | PortSc::LINE_STATUS_K_STATE;
        assert!(k.is_low_speed());
        let j = PortSc::from_bits_retain(PortSc::CURRENT_CONNECT_STATUS.bits() | (0b10 << 10));
        assert!(!j.is_low_speed());
        assert!(!PortSc::CURRENT_CONNECT_STATUS.is_low_speed());
    }

    #[test]
    fn test_portsc_change_bits_are_w1c_set() {
        assert_eq!(PortSc::ALL_CHANGES.bits(), (1 << 1) | (1 << 3) | (1 << 5));
    }
}
