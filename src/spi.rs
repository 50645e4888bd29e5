//! SAM SPI controller driver core
//!
//! Register-level transaction sequencing for the SAM SPI block in
//! master mode: chip-select programming, baud divisor and mode setup,
//! and the polled byte exchange loop. Hardware access goes through the
//! [`SpiHw`] seam, mirroring the USB side of the crate.

use bitflags::bitflags;

/// SPI driver result type
pub type SpiResult<T> = core::result::Result<T, SpiError>;

/// SPI controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiError {
    /// Chip select, frequency, or word size out of range
    InvalidParameter,
    /// A shift-register wait expired
    Timeout,
}

/// SPI controller registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiReg {
    /// Control register
    Cr,
    /// Mode register
    Mr,
    /// Receive data register
    Rdr,
    /// Transmit data register
    Tdr,
    /// Status register
    Sr,
    /// Chip select register, one per chip select line
    Csr(u8),
}

/// Low-level SPI register access
pub trait SpiHw {
    fn read_reg(&self, reg: SpiReg) -> u32;
    fn write_reg(&self, reg: SpiReg, value: u32);
    fn delay_us(&self, us: u32);
}

bitflags! {
    /// CR register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpiCr: u32 {
        const SPIEN = 1 << 0;
        const SPIDIS = 1 << 1;
        const SWRST = 1 << 7;
        const LASTXFER = 1 << 24;
    }
}

bitflags! {
    /// MR register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpiMr: u32 {
        /// Master mode
        const MSTR = 1 << 0;
        /// Variable peripheral select
        const PS = 1 << 1;
        /// Mode fault detection disabled
        const MODFDIS = 1 << 4;
        /// Local loopback
        const LLB = 1 << 7;
    }
}

bitflags! {
    /// SR register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpiSr: u32 {
        /// Receive data register full
        const RDRF = 1 << 0;
        /// Transmit data register empty
        const TDRE = 1 << 1;
        /// Overrun error
        const OVRES = 1 << 3;
        /// Transmission registers empty
        const TXEMPTY = 1 << 9;
        /// SPI enabled
        const SPIENS = 1 << 16;
    }
}

/// CSR field layout
pub mod csr {
    /// Clock polarity
    pub const CPOL: u32 = 1 << 0;
    /// Clock phase (inverted sense: NCPHA = !CPHA)
    pub const NCPHA: u32 = 1 << 1;
    /// Bits per transfer, field value is `bits - 8`
    pub const BITS_SHIFT: u32 = 4;
    pub const BITS_MASK: u32 = 0xf << BITS_SHIFT;
    /// Serial clock baud rate divisor
    pub const SCBR_SHIFT: u32 = 8;
    pub const SCBR_MASK: u32 = 0xff << SCBR_SHIFT;
    /// Delay before SPCK
    pub const DLYBS_SHIFT: u32 = 16;
    /// Delay between consecutive transfers
    pub const DLYBCT_SHIFT: u32 = 24;
}

/// TDR field layout
mod tdr {
    pub const PCS_SHIFT: u32 = 16;
    pub const LASTXFER: u32 = 1 << 24;
}

/// SPI bus modes (CPOL/CPHA combinations)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiMode {
    /// CPOL=0, CPHA=0
    Mode0,
    /// CPOL=0, CPHA=1
    Mode1,
    /// CPOL=1, CPHA=0
    Mode2,
    /// CPOL=1, CPHA=1
    Mode3,
}

impl SpiMode {
    /// CSR CPOL/NCPHA encoding. NCPHA is the inverse of CPHA.
    const fn csr_bits(self) -> u32 {
        match self {
            SpiMode::Mode0 => csr::NCPHA,
            SpiMode::Mode1 => 0,
            SpiMode::Mode2 => csr::CPOL | csr::NCPHA,
            SpiMode::Mode3 => csr::CPOL,
        }
    }
}

/// Fixed-peripheral-select encoding for a chip select number.
///
/// The PCS field uses a "first zero" encoding: cs0 = 0b0000,
/// cs1 = 0b0001, cs2 = 0b0011, cs3 = 0b0111.
pub const fn cs_to_pcs(cs: u8) -> u32 {
    (1 << cs) - 1
}

/// Number of chip select lines
const NUM_CS: u8 = 4;

const SCBR_MIN: u32 = 8;
const SCBR_MAX: u32 = 254;

/// Longest wait on a shift-register flag per word
const WORD_TIMEOUT_US: u32 = 10_000;
const WORD_POLL_US: u32 = 1;

/// SPI bus in master mode with one active chip select
///
/// Frequency and mode programming is cached so back-to-back transfers
/// to the same device skip redundant CSR writes.
pub struct SpiBus<H: SpiHw> {
    hw: H,
    clock_hz: u32,
    cs: u8,
    requested_hz: u32,
    actual_hz: u32,
    mode: Option<SpiMode>,
    bits: Option<u8>,
}

impl<H: SpiHw> SpiBus<H> {
    /// Reset the controller and enable master mode.
    pub fn new(hw: H, clock_hz: u32) -> Self {
        hw.write_reg(SpiReg::Cr, SpiCr::SPIDIS.bits());
        // Errata: software reset must be written twice
        hw.write_reg(SpiReg::Cr, SpiCr::SWRST.bits());
        hw.write_reg(SpiReg::Cr, SpiCr::SWRST.bits());
        hw.write_reg(SpiReg::Mr, (SpiMr::MSTR | SpiMr::MODFDIS).bits());
        hw.write_reg(SpiReg::Cr, SpiCr::SPIEN.bits());
        Self {
            hw,
            clock_hz,
            cs: 0,
            requested_hz: 0,
            actual_hz: 0,
            mode: None,
            bits: None,
        }
    }

    /// Select the device on chip select `cs` for following transfers.
    pub fn select(&mut self, cs: u8) -> SpiResult<()> {
        if cs >= NUM_CS {
            return Err(SpiError::InvalidParameter);
        }
        if cs != self.cs {
            self.cs = cs;
            // Cached settings belong to the previous device
            self.requested_hz = 0;
            self.actual_hz = 0;
            self.mode = None;
            self.bits = None;
        }
        Ok(())
    }

    /// Program the serial clock for the selected device.
    ///
    /// The divisor is clamped to the hardware range and rounded up to
    /// an even value. Returns the actual frequency achieved.
    pub fn set_frequency(&mut self, hz: u32) -> SpiResult<u32> {
        if hz == 0 {
            return Err(SpiError::InvalidParameter);
        }
        if hz == self.requested_hz {
            return Ok(self.actual_hz);
        }

        let mut scbr = self.clock_hz / hz;
        if scbr < SCBR_MIN {
            scbr = SCBR_MIN;
        } else if scbr > SCBR_MAX {
            scbr = SCBR_MAX;
        }
        if scbr & 1 != 0 {
            scbr = (scbr + 1) & !1;
        }

        // 0.5 us before SPCK, and inter-transfer gap in 32-cycle units
        let dlybs = (self.clock_hz / 500_000).min(0xff);
        let dlybct = (self.clock_hz / 200_000 / 32).min(0xff);

        let reg = SpiReg::Csr(self.cs);
        let mut val = self.hw.read_reg(reg);
        val &= !(csr::SCBR_MASK | (0xff << csr::DLYBS_SHIFT) | (0xff << csr::DLYBCT_SHIFT));
        val |= scbr << csr::SCBR_SHIFT | dlybs << csr::DLYBS_SHIFT | dlybct << csr::DLYBCT_SHIFT;
        self.hw.write_reg(reg, val);

        self.requested_hz = hz;
        self.actual_hz = self.clock_hz / scbr;
        Ok(self.actual_hz)
    }

    /// Program clock polarity and phase for the selected device.
    pub fn set_mode(&mut self, mode: SpiMode) {
        if self.mode == Some(mode) {
            return;
        }
        let reg = SpiReg::Csr(self.cs);
        let mut val = self.hw.read_reg(reg);
        val &= !(csr::CPOL | csr::NCPHA);
        val |= mode.csr_bits();
        self.hw.write_reg(reg, val);
        self.mode = Some(mode);
    }

    /// Program the word size for the selected device (8..=16 bits).
    pub fn set_bits(&mut self, nbits: u8) -> SpiResult<()> {
        if !(8..=16).contains(&nbits) {
            return Err(SpiError::InvalidParameter);
        }
        if self.bits == Some(nbits) {
            return Ok(());
        }
        let reg = SpiReg::Csr(self.cs);
        let mut val = self.hw.read_reg(reg);
        val &= !csr::BITS_MASK;
        val |= ((nbits - 8) as u32) << csr::BITS_SHIFT;
        self.hw.write_reg(reg, val);
        self.bits = Some(nbits);
        Ok(())
    }

    /// Drain the shift registers: wait for the transmitter to empty,
    /// then discard any pending receive data.
    pub fn flush(&self) -> SpiResult<()> {
        self.wait_sr(SpiSr::TXEMPTY)?;
        while self.sr().contains(SpiSr::RDRF) {
            let _ = self.hw.read_reg(SpiReg::Rdr);
        }
        Ok(())
    }

    /// Full-duplex transfer: clock out `tx` while capturing the same
    /// number of bytes into `rx`.
    pub fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> SpiResult<()> {
        if tx.len() != rx.len() {
            return Err(SpiError::InvalidParameter);
        }
        let last = tx.len().saturating_sub(1);
        for (i, (out, in_)) in tx.iter().zip(rx.iter_mut()).enumerate() {
            *in_ = self.exchange_word(*out, i == last)?;
        }
        Ok(())
    }

    /// Transmit only; received bytes are discarded.
    pub fn write(&mut self, tx: &[u8]) -> SpiResult<()> {
        let last = tx.len().saturating_sub(1);
        for (i, out) in tx.iter().enumerate() {
            self.exchange_word(*out, i == last)?;
        }
        Ok(())
    }

    /// Receive only; 0xff filler is clocked out.
    pub fn read(&mut self, rx: &mut [u8]) -> SpiResult<()> {
        let last = rx.len().saturating_sub(1);
        for (i, in_) in rx.iter_mut().enumerate() {
            *in_ = self.exchange_word(0xff, i == last)?;
        }
        Ok(())
    }

    /// Exchange a single byte.
    pub fn send(&mut self, byte: u8) -> SpiResult<u8> {
        self.exchange_word(byte, true)
    }

    fn exchange_word(&self, out: u8, last: bool) -> SpiResult<u8> {
        self.wait_sr(SpiSr::TDRE)?;
        let mut val = out as u32 | cs_to_pcs(self.cs) << tdr::PCS_SHIFT;
        if last {
            val |= tdr::LASTXFER;
        }
        self.hw.write_reg(SpiReg::Tdr, val);
        self.wait_sr(SpiSr::RDRF)?;
        Ok(self.hw.read_reg(SpiReg::Rdr) as u8)
    }

    fn sr(&self) -> SpiSr {
        SpiSr::from_bits_retain(self.hw.read_reg(SpiReg::Sr))
    }

    fn wait_sr(&self, flag: SpiSr) -> SpiResult<()> {
        let mut elapsed = 0;
        while !self.sr().contains(flag) {
            if elapsed >= WORD_TIMEOUT_US {
                return Err(SpiError::Timeout);
            }
            self.hw.delay_us(WORD_POLL_US);
            elapsed += WORD_POLL_US;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use heapless::Vec;

    #[derive(Default)]
    struct MockState {
        csr: [u32; 4],
        tdr_log: Vec<u32, 32>,
        csr_writes: usize,
        rx_script: Vec<u32, 32>,
        rx_next: usize,
        sr_script: Vec<u32, 32>,
        sr_next: usize,
        /// Status register reads as all-zero forever
        stuck: bool,
    }

    struct MockSpi {
        state: RefCell<MockState>,
    }

    impl MockSpi {
        fn new() -> Self {
            Self {
                state: RefCell::new(MockState::default()),
            }
        }
    }

    impl SpiHw for MockSpi {
        fn read_reg(&self, reg: SpiReg) -> u32 {
            let mut s = self.state.borrow_mut();
            match reg {
                SpiReg::Csr(n) => s.csr[n as usize],
                SpiReg::Rdr => {
                    let i = s.rx_next;
                    s.rx_next += 1;
                    s.rx_script.get(i).copied().unwrap_or(0)
                }
                SpiReg::Sr => {
                    if s.stuck {
                        0
                    } else if s.sr_next < s.sr_script.len() {
                        let v = s.sr_script[s.sr_next];
                        s.sr_next += 1;
                        v
                    } else {
                        // Idle and ready
                        (SpiSr::TDRE | SpiSr::RDRF | SpiSr::TXEMPTY).bits()
                    }
                }
                _ => 0,
            }
        }

        fn write_reg(&self, reg: SpiReg, value: u32) {
            let mut s = self.state.borrow_mut();
            match reg {
                SpiReg::Csr(n) => {
                    s.csr[n as usize] = value;
                    s.csr_writes += 1;
                }
                SpiReg::Tdr => {
                    let _ = s.tdr_log.push(value);
                }
                _ => {}
            }
        }

        fn delay_us(&self, _us: u32) {}
    }

    #[test]
    fn test_pcs_encoding() {
        assert_eq!(cs_to_pcs(0), 0b0000);
        assert_eq!(cs_to_pcs(1), 0b0001);
        assert_eq!(cs_to_pcs(2), 0b0011);
        assert_eq!(cs_to_pcs(3), 0b0111);
    }

    #[test]
    fn test_set_frequency_divisor() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        // 84 MHz / 10 MHz = 8.4 -> divisor 8, actual 10.5 MHz
        let actual = bus.set_frequency(10_000_000).unwrap();
        assert_eq!(actual, 84_000_000 / 8);
        let csr0 = bus.hw.state.borrow().csr[0];
        assert_eq!((csr0 & csr::SCBR_MASK) >> csr::SCBR_SHIFT, 8);
    }

    #[test]
    fn test_set_frequency_clamps_and_rounds() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        // Divisor would be 4: clamp to the minimum of 8
        bus.set_frequency(21_000_000).unwrap();
        assert_eq!(
            (bus.hw.state.borrow().csr[0] & csr::SCBR_MASK) >> csr::SCBR_SHIFT,
            8
        );
        // Divisor 9.33 -> 9, odd, round up to 10
        bus.set_frequency(9_000_000).unwrap();
        assert_eq!(
            (bus.hw.state.borrow().csr[0] & csr::SCBR_MASK) >> csr::SCBR_SHIFT,
            10
        );
        // Very low frequency clamps to the maximum divisor
        bus.set_frequency(1000).unwrap();
        assert_eq!(
            (bus.hw.state.borrow().csr[0] & csr::SCBR_MASK) >> csr::SCBR_SHIFT,
            SCBR_MAX
        );
    }

    #[test]
    fn test_set_frequency_is_cached() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        bus.set_frequency(10_000_000).unwrap();
        let writes = bus.hw.state.borrow().csr_writes;
        bus.set_frequency(10_000_000).unwrap();
        assert_eq!(bus.hw.state.borrow().csr_writes, writes);
    }

    #[test]
    fn test_mode_encoding_table() {
        assert_eq!(SpiMode::Mode0.csr_bits(), csr::NCPHA);
        assert_eq!(SpiMode::Mode1.csr_bits(), 0);
        assert_eq!(SpiMode::Mode2.csr_bits(), csr::CPOL | csr::NCPHA);
        assert_eq!(SpiMode::Mode3.csr_bits(), csr::CPOL);
    }

    #[test]
    fn test_set_mode_preserves_other_csr_fields() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        bus.set_frequency(10_000_000).unwrap();
        bus.set_mode(SpiMode::Mode3);
        let csr0 = bus.hw.state.borrow().csr[0];
        assert_eq!(csr0 & (csr::CPOL | csr::NCPHA), csr::CPOL);
        assert_eq!((csr0 & csr::SCBR_MASK) >> csr::SCBR_SHIFT, 8);
    }

    #[test]
    fn test_set_mode_is_cached() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        bus.set_mode(SpiMode::Mode0);
        let writes = bus.hw.state.borrow().csr_writes;
        bus.set_mode(SpiMode::Mode0);
        assert_eq!(bus.hw.state.borrow().csr_writes, writes);
        bus.set_mode(SpiMode::Mode1);
        assert_eq!(bus.hw.state.borrow().csr_writes, writes + 1);
    }

    #[test]
    fn test_select_invalidates_cache() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        bus.set_mode(SpiMode::Mode0);
        bus.select(2).unwrap();
        let writes = bus.hw.state.borrow().csr_writes;
        bus.set_mode(SpiMode::Mode0);
        // Reprogrammed for the new chip select
        assert_eq!(bus.hw.state.borrow().csr_writes, writes + 1);
        assert!(bus.select(4).is_err());
    }

    #[test]
    fn test_transfer_sequencing() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        bus.select(1).unwrap();
        {
            let mut s = bus.hw.state.borrow_mut();
            let _ = s.rx_script.push(0xa0);
            let _ = s.rx_script.push(0xa1);
            let _ = s.rx_script.push(0xa2);
        }
        let tx = [0x01, 0x02, 0x03];
        let mut rx = [0u8; 3];
        bus.transfer(&tx, &mut rx).unwrap();
        assert_eq!(rx, [0xa0, 0xa1, 0xa2]);

        let log = bus.hw.state.borrow().tdr_log.clone();
        assert_eq!(log.len(), 3);
        // Every word carries the PCS for chip select 1
        for word in &log {
            assert_eq!((word >> 16) & 0xf, cs_to_pcs(1));
        }
        // Only the final word ends the chip select assertion
        assert_eq!(log[0] & tdr::LASTXFER, 0);
        assert_eq!(log[1] & tdr::LASTXFER, 0);
        assert_ne!(log[2] & tdr::LASTXFER, 0);
        assert_eq!(log[0] & 0xff, 0x01);
    }

    #[test]
    fn test_transfer_length_mismatch() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        let mut rx = [0u8; 2];
        assert_eq!(
            bus.transfer(&[1, 2, 3], &mut rx).unwrap_err(),
            SpiError::InvalidParameter
        );
    }

    #[test]
    fn test_read_clocks_filler() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        let mut rx = [0u8; 2];
        bus.read(&mut rx).unwrap();
        let log = bus.hw.state.borrow().tdr_log.clone();
        assert_eq!(log[0] & 0xff, 0xff);
        assert_eq!(log[1] & 0xff, 0xff);
    }

    #[test]
    fn test_exchange_times_out_when_stuck() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        bus.hw.state.borrow_mut().stuck = true;
        assert_eq!(bus.send(0x55).unwrap_err(), SpiError::Timeout);
        // No word was ever handed to the transmitter
        assert!(bus.hw.state.borrow().tdr_log.is_empty());
    }

    #[test]
    fn test_set_bits_field() {
        let mut bus = SpiBus::new(MockSpi::new(), 84_000_000);
        bus.set_bits(16).unwrap();
        let csr0 = bus.hw.state.borrow().csr[0];
        assert_eq!((csr0 & csr::BITS_MASK) >> csr::BITS_SHIFT, 8);
        assert!(bus.set_bits(7).is_err());
        assert!(bus.set_bits(17).is_err());
    }

    #[test]
    fn test_flush_drains_receiver() {
        let bus = SpiBus::new(MockSpi::new(), 84_000_000);
        {
            let mut s = bus.hw.state.borrow_mut();
            // Transmitter empty, two words pending in the receiver
            let _ = s.sr_script.push((SpiSr::TXEMPTY | SpiSr::RDRF).bits());
            let _ = s.sr_script.push((SpiSr::TXEMPTY | SpiSr::RDRF).bits());
            let _ = s.sr_script.push((SpiSr::TXEMPTY | SpiSr::RDRF).bits());
            let _ = s.sr_script.push(SpiSr::TXEMPTY.bits());
        }
        bus.flush().unwrap();
        assert_eq!(bus.hw.state.borrow().rx_next, 2);
    }
}
