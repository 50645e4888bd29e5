//! Endpoint bookkeeping for the host controller driver

use crate::ehci::Speed;
use crate::error::{Result, UsbError};

/// Transfer direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    In,
    Out,
}

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Endpoint description supplied by class drivers at allocation time
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    /// Assigned USB function address of the device (0..=127)
    pub device_addr: u8,
    /// Endpoint number (0..=15)
    pub number: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// Maximum packet size in bytes
    pub max_packet: u16,
    /// Polling interval for interrupt endpoints, in frames
    pub interval: u8,
}

impl EndpointDescriptor {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.device_addr > 127 || self.number > 15 {
            return Err(UsbError::InvalidParameter);
        }
        if self.max_packet == 0 || self.max_packet > 1024 {
            return Err(UsbError::InvalidParameter);
        }
        Ok(())
    }
}

/// Opaque handle to an allocated endpoint slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointId(pub(crate) usize);

/// Driver-private endpoint state, guarded by the host's exclusive lock
pub(crate) struct EndpointState {
    pub device_addr: u8,
    pub number: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub max_packet: u16,
    pub speed: Speed,
    /// DATA0/DATA1 toggle carried across bulk and interrupt transfers
    pub toggle: bool,
}

impl EndpointState {
    pub fn control_default() -> Self {
        Self {
            device_addr: 0,
            number: 0,
            direction: Direction::Out,
            kind: TransferKind::Control,
            max_packet: 8,
            speed: Speed::Full,
            toggle: false,
        }
    }

    pub fn from_descriptor(desc: &EndpointDescriptor, speed: Speed) -> Self {
        Self {
            device_addr: desc.device_addr,
            number: desc.number,
            direction: desc.direction,
            kind: desc.kind,
            max_packet: desc.max_packet,
            speed,
            toggle: false,
        }
    }

    /// Advance the data toggle after a completed transfer of `len` bytes.
    pub fn advance_toggle(&mut self, len: usize) {
        let mps = self.max_packet as usize;
        let mut packets = len.div_ceil(mps);
        // A zero-length transfer still moves one packet
        if packets == 0 {
            packets = 1;
        }
        if packets % 2 == 1 {
            self.toggle = !self.toggle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_desc() -> EndpointDescriptor {
        EndpointDescriptor {
            device_addr: 3,
            number: 2,
            direction: Direction::In,
            kind: TransferKind::Bulk,
            max_packet: 512,
            interval: 0,
        }
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(bulk_desc().validate().is_ok());
        let mut bad = bulk_desc();
        bad.device_addr = 128;
        assert!(bad.validate().is_err());
        let mut bad = bulk_desc();
        bad.number = 16;
        assert!(bad.validate().is_err());
        let mut bad = bulk_desc();
        bad.max_packet = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_toggle_advances_per_odd_packet_count() {
        let mut ep = EndpointState::from_descriptor(&bulk_desc(), Speed::High);
        assert!(!ep.toggle);
        // 512 bytes = one packet
        ep.advance_toggle(512);
        assert!(ep.toggle);
        // 1024 bytes = two packets, toggle unchanged
        ep.advance_toggle(1024);
        assert!(ep.toggle);
        // 100 bytes = one short packet
        ep.advance_toggle(100);
        assert!(!ep.toggle);
        // Zero-length packet still toggles
        ep.advance_toggle(0);
        assert!(ep.toggle);
    }
}
