//! Hardware access seam for the EHCI host controller
//!
//! All register traffic, delays, and cache maintenance go through the
//! [`UsbHw`] trait so the driver core stays independent of the memory map.
//! [`Sama5Hw`] is the MMIO backend for the SAMA5 UHPHS high-speed port;
//! tests substitute a mock.

use core::cell::Cell;

/// EHCI operational registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reg {
    /// USB command register
    UsbCmd,
    /// USB status register (mix of RO and write-1-to-clear bits)
    UsbSts,
    /// Interrupt enable register
    UsbIntr,
    /// Frame index register
    FrIndex,
    /// Periodic frame list base address
    PeriodicListBase,
    /// Asynchronous schedule list address
    AsyncListAddr,
    /// Configure flag (port routing)
    ConfigFlag,
    /// Port status/control, one per root hub port
    PortSc(u8),
}

/// Low-level hardware access used by the EHCI driver
///
/// Implementations must make `write_reg` observable by the controller
/// before the call returns (barriers on real hardware).
pub trait UsbHw {
    /// Read an operational register
    fn read_reg(&self, reg: Reg) -> u32;

    /// Write an operational register
    fn write_reg(&self, reg: Reg, value: u32);

    /// Busy-wait for at least `us` microseconds of wall-clock time
    fn delay_us(&self, us: u32);

    /// Busy-wait for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32) {
        for _ in 0..ms {
            self.delay_us(1000);
        }
    }

    /// Write back a dirty cache region so the controller sees it
    fn dcache_clean(&self, addr: usize, len: usize);

    /// Discard a cache region so the CPU re-reads controller-written data
    fn dcache_invalidate(&self, addr: usize, len: usize);

    /// Gate on the controller's peripheral and UTMI clocks
    fn enable_clocks(&self) {}

    /// Drive or drop VBUS on all root hub ports
    fn drive_vbus(&self, _on: bool) {}

    /// Unmask the controller interrupt at the interrupt controller
    fn enable_irq(&self) {}
}

/// Register-access trace that coalesces repeated identical accesses
///
/// Logging every poll iteration of a status register would flood the
/// trace output, so consecutive identical accesses are counted and
/// flushed as a single repeat-count message when a different access
/// arrives.
pub struct RegMonitor {
    last: Cell<Option<(Reg, u32, bool)>>,
    repeats: Cell<u32>,
}

impl RegMonitor {
    pub const fn new() -> Self {
        Self {
            last: Cell::new(None),
            repeats: Cell::new(0),
        }
    }

    /// Record one register access.
    ///
    /// Returns `Some(n)` when this access differs from the previous one
    /// and the previous access had been silently repeated `n` times.
    pub fn observe(&self, reg: Reg, value: u32, write: bool) -> Option<u32> {
        let access = (reg, value, write);
        if self.last.get() == Some(access) {
            self.repeats.set(self.repeats.get() + 1);
            return None;
        }

        let flushed = match self.repeats.get() {
            0 => None,
            n => Some(n),
        };

        #[cfg(feature = "defmt")]
        {
            if let Some(n) = flushed {
                defmt::trace!("[repeats {=u32} more times]", n);
            }
            if write {
                defmt::trace!("{} <- {=u32:#010x}", reg, value);
            } else {
                defmt::trace!("{} -> {=u32:#010x}", reg, value);
            }
        }

        self.last.set(Some(access));
        self.repeats.set(0);
        flushed
    }
}

impl Default for RegMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// SAMA5 UHPHS EHCI capability register block
const SAM_EHCI_BASE: u32 = 0x0070_0000;
/// Operational registers follow the capability block (CAPLENGTH = 0x10)
const SAM_EHCI_OFFSET: u32 = 0x10;

const EHCI_USBCMD_OFFSET: u32 = 0x00;
const EHCI_USBSTS_OFFSET: u32 = 0x04;
const EHCI_USBINTR_OFFSET: u32 = 0x08;
const EHCI_FRINDEX_OFFSET: u32 = 0x0c;
const EHCI_PERIODICLISTBASE_OFFSET: u32 = 0x14;
const EHCI_ASYNCLISTADDR_OFFSET: u32 = 0x18;
const EHCI_CONFIGFLAG_OFFSET: u32 = 0x40;
const EHCI_PORTSC_OFFSET: u32 = 0x44;

const CACHE_LINE_SIZE: usize = 32;

/// MMIO backend for the UHPHS high-speed host port
///
/// Cache maintenance and barriers go through the Cortex-M SCB line
/// operations, so this backend fits M-profile parts carrying the
/// peripheral. Boards with A-profile cores implement [`UsbHw`] with
/// their own cache and barrier primitives instead.
pub struct Sama5Hw {
    op_base: u32,
    cycles_per_us: u32,
    #[cfg(feature = "reg-log")]
    monitor: RegMonitor,
}

impl Sama5Hw {
    /// Create the MMIO backend.
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access to the UHPHS register
    /// block and pass the correct CPU core frequency for delay timing.
    pub unsafe fn new(cpu_hz: u32) -> Self {
        Self {
            op_base: SAM_EHCI_BASE + SAM_EHCI_OFFSET,
            cycles_per_us: cpu_hz / 1_000_000,
            #[cfg(feature = "reg-log")]
            monitor: RegMonitor::new(),
        }
    }

    fn addr(&self, reg: Reg) -> u32 {
        let offset = match reg {
            Reg::UsbCmd => EHCI_USBCMD_OFFSET,
            Reg::UsbSts => EHCI_USBSTS_OFFSET,
            Reg::UsbIntr => EHCI_USBINTR_OFFSET,
            Reg::FrIndex => EHCI_FRINDEX_OFFSET,
            Reg::PeriodicListBase => EHCI_PERIODICLISTBASE_OFFSET,
            Reg::AsyncListAddr => EHCI_ASYNCLISTADDR_OFFSET,
            Reg::ConfigFlag => EHCI_CONFIGFLAG_OFFSET,
            Reg::PortSc(n) => EHCI_PORTSC_OFFSET + 4 * n as u32,
        };
        self.op_base + offset
    }
}

impl UsbHw for Sama5Hw {
    fn read_reg(&self, reg: Reg) -> u32 {
        let ptr = self.addr(reg) as *const u32;
        cortex_m::asm::dmb();
        // Safety: `addr` only produces addresses inside the register block
        // this instance claimed at construction.
        let value = unsafe { core::ptr::read_volatile(ptr) };
        cortex_m::asm::dmb();
        #[cfg(feature = "reg-log")]
        self.monitor.observe(reg, value, false);
        value
    }

    fn write_reg(&self, reg: Reg, value: u32) {
        #[cfg(feature = "reg-log")]
        self.monitor.observe(reg, value, true);
        let ptr = self.addr(reg) as *mut u32;
        cortex_m::asm::dmb();
        // Safety: see `read_reg`.
        unsafe { core::ptr::write_volatile(ptr, value) };
        cortex_m::asm::dsb();
    }

    fn delay_us(&self, us: u32) {
        cortex_m::asm::delay(us.saturating_mul(self.cycles_per_us));
    }

    fn dcache_clean(&self, addr: usize, len: usize) {
        const SCB_DCCMVAC: *mut u32 = 0xE000_EF68 as *mut u32;
        let start = addr & !(CACHE_LINE_SIZE - 1);
        let end = addr + len;
        cortex_m::asm::dsb();
        let mut line = start;
        while line < end {
            // Safety: cache maintenance by MVA, architecturally defined.
            unsafe { core::ptr::write_volatile(SCB_DCCMVAC, line as u32) };
            line += CACHE_LINE_SIZE;
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn dcache_invalidate(&self, addr: usize, len: usize) {
        const SCB_DCIMVAC: *mut u32 = 0xE000_EF5C as *mut u32;
        let start = addr & !(CACHE_LINE_SIZE - 1);
        let end = addr + len;
        cortex_m::asm::dsb();
        let mut line = start;
        while line < end {
            // Safety: cache maintenance by MVA, architecturally defined.
            unsafe { core::ptr::write_volatile(SCB_DCIMVAC, line as u32) };
            line += CACHE_LINE_SIZE;
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
}
