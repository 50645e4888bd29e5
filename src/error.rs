//! USB host error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB host driver errors
///
/// Transfer failures map EHCI qTD status bits onto a small taxonomy: a
/// halted endpoint with no error status is a STALL handshake, halted with
/// babble/transaction-error/missed-microframe status is a bus-level
/// transaction failure, and a data buffer error is an overrun. A transfer
/// that never completes within its deadline surfaces as [`UsbError::Nak`]
/// (retry-eligible); register-level waits that expire surface as
/// [`UsbError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Port has no connected device
    NoDevice,
    /// Transfer NAKed or still pending at its deadline (retryable)
    Nak,
    /// Endpoint returned a STALL handshake
    Stall,
    /// Bus-level transaction failure (CRC, babble, data toggle, missed microframe)
    TransactionError,
    /// Data buffer overrun or underrun
    BufferOverrun,
    /// A bounded register or completion wait expired
    Timeout,
    /// Host controller raised the system-error interrupt
    HostSystemError,
    /// Descriptor, buffer, or endpoint pool exhausted
    NoResources,
    /// Parameter out of range (address, endpoint number, packet size, length)
    InvalidParameter,
    /// Operation violates the driver's usage contract
    InvalidState,
    /// Request not supported by this driver
    Unsupported,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "No device connected"),
            Self::Nak => write!(f, "Transfer NAKed"),
            Self::Stall => write!(f, "Endpoint stalled"),
            Self::TransactionError => write!(f, "Bus transaction error"),
            Self::BufferOverrun => write!(f, "Data buffer overrun"),
            Self::Timeout => write!(f, "Timeout"),
            Self::HostSystemError => write!(f, "Host system error"),
            Self::NoResources => write!(f, "No resources available"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::Unsupported => write!(f, "Unsupported operation"),
        }
    }
}
