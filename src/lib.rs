#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! EHCI USB host driver for Atmel SAMA5 microcontrollers
//!
//! Drives the UHPHS high-speed host port: controller reset and bring-up,
//! root hub connect detection, device enumeration handoff, and control,
//! bulk, and interrupt transfers through the asynchronous schedule. The
//! crate also carries the register-level SPI master driver shared by
//! SAM-family boards.
//!
//! # Core components
//!
//! - [`host`] - the host controller driver context and its operations
//! - [`ehci`] - queue head / transfer descriptor structures, descriptor
//!   pools, and schedule traversal
//! - [`hw`] - the hardware access seam ([`hw::UsbHw`]) and the SAMA5
//!   MMIO backend
//! - [`spi`] - SPI controller driver core
//!
//! All blocking waits are bounded counted-delay polls through the
//! hardware seam, so the driver runs unmodified against mock hardware
//! in tests.

#[cfg(feature = "defmt")]
use defmt as _;

pub mod ehci;
pub mod error;
pub mod host;
pub mod hw;
pub mod spi;
pub mod sync;

pub use ehci::{PortId, Speed};
pub use error::{Result, UsbError};
pub use host::endpoint::{Direction, EndpointDescriptor, EndpointId, TransferKind};
pub use host::{ClassHandle, EhciHost, EnumerationDelegate, HostConnection, SetupPacket};
pub use hw::{Reg, Sama5Hw, UsbHw};
