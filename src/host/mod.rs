//! EHCI host controller driver
//!
//! [`EhciHost`] owns the controller: descriptor pools, endpoint table,
//! buffer pools, and root hub state. Structural state lives behind one
//! coarse exclusive lock; the interrupt path never takes that lock and
//! communicates through atomics and completion signals only. Blocking
//! operations release the lock before waiting and re-acquire it to
//! harvest results.

pub mod buffers;
pub mod endpoint;

use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::ehci::{
    queue, timeouts, DescriptorPool, Pid, PortId, PortSc, QhHandle, QtdHandle, QueueHead, QueueTd,
    Speed, UsbCmd, UsbIntr, UsbSts, MAX_ROOT_PORTS,
};
use crate::error::{Result, UsbError};
use crate::hw::{Reg, UsbHw};
use crate::sync::{Completion, Exclusive};

use buffers::{BufferId, BufferPool, IoBufferId, IoBufferPool};
use endpoint::{Direction, EndpointDescriptor, EndpointId, EndpointState, TransferKind};

/// Pool and table sizing
pub mod config {
    /// Queue heads: one per root hub port plus transfer overhead
    pub const QH_POOL_SIZE: usize = 8;
    /// Transfer descriptors: up to three per active control transfer
    pub const QTD_POOL_SIZE: usize = 24;
    /// Endpoint table size, slot 0 reserved for EP0
    pub const ENDPOINT_SLOTS: usize = 8;
    /// 128-byte descriptor buffers
    pub const DESCRIPTOR_BUFFERS: usize = 16;
}

/// Completion-wait poll slice
const COMPLETION_SLICE_US: u32 = 1_000;

/// Standard USB SETUP packet
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Direction bit of `bmRequestType`
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn get_descriptor(desc_type: u8, desc_index: u8, length: u16) -> Self {
        Self {
            request_type: 0x80,
            request: 0x06,
            value: (desc_type as u16) << 8 | desc_index as u16,
            index: 0,
            length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: 0x00,
            request: 0x05,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(config: u8) -> Self {
        Self {
            request_type: 0x00,
            request: 0x09,
            value: config as u16,
            index: 0,
            length: 0,
        }
    }
}

const _: () = assert!(size_of::<SetupPacket>() == 8);

/// Opaque token for the class driver bound to a root hub port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClassHandle(pub u32);

/// Enumeration collaborator: walks the newly reset device through
/// address assignment and configuration, returning a handle for the
/// class driver it bound.
pub trait EnumerationDelegate<H: UsbHw, const NPORTS: usize> {
    fn enumerate(
        &mut self,
        host: &EhciHost<H, NPORTS>,
        port: PortId,
        speed: Speed,
        funcaddr: u8,
    ) -> Result<ClassHandle>;
}

/// Per-port root hub state, written from interrupt context
struct RootHubPort {
    connected: AtomicBool,
    lowspeed: AtomicBool,
    /// Bound class handle plus one; zero when no class is bound
    class: AtomicU32,
}

impl RootHubPort {
    const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            lowspeed: AtomicBool::new(false),
            class: AtomicU32::new(0),
        }
    }
}

/// Per-endpoint wake channel, posted from interrupt context
struct EpSignal {
    pending: AtomicBool,
    complete: Completion,
}

impl EpSignal {
    const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            complete: Completion::new(),
        }
    }
}

/// Structural state guarded by the exclusive lock
struct Shared {
    qh_pool: DescriptorPool<QueueHead, { config::QH_POOL_SIZE }>,
    qtd_pool: DescriptorPool<QueueTd, { config::QTD_POOL_SIZE }>,
    desc_bufs: BufferPool<{ config::DESCRIPTOR_BUFFERS }>,
    io_bufs: IoBufferPool,
    endpoints: [Option<EndpointState>; config::ENDPOINT_SLOTS],
}

/// A submitted qTD chain and its owning QH
struct Chain {
    qh: QhHandle,
    qtds: heapless::Vec<QtdHandle, 3>,
}

/// EHCI host controller driver context
pub struct EhciHost<H: UsbHw, const NPORTS: usize = 3> {
    hw: H,
    shared: Exclusive<Shared>,
    rh_event: Completion,
    fatal: AtomicBool,
    ports: [RootHubPort; NPORTS],
    signals: [EpSignal; config::ENDPOINT_SLOTS],
    ctrl_pending: AtomicBool,
}

impl<H: UsbHw, const NPORTS: usize> EhciHost<H, NPORTS> {
    /// The type admits any port count; the controller has three. A
    /// wider `NPORTS` would let [`EhciHost::wait`] observe a port that
    /// `PortId` cannot name, so it is rejected at compile time.
    const PORTS_IN_RANGE: () = assert!(
        NPORTS <= MAX_ROOT_PORTS as usize,
        "NPORTS exceeds the root hub port count"
    );

    /// Bring up the controller: clocks, reset, run, port power, and
    /// interrupt configuration. The connected state of every port is
    /// seeded from PORTSC so devices present at boot are reported by
    /// the first [`EhciHost::wait`].
    pub fn initialize(hw: H) -> Result<Self> {
        let () = Self::PORTS_IN_RANGE;
        hw.enable_clocks();

        const NONE_EP: Option<EndpointState> = None;
        let mut endpoints = [NONE_EP; config::ENDPOINT_SLOTS];
        endpoints[0] = Some(EndpointState::control_default());

        const PORT: RootHubPort = RootHubPort::new();
        const SIGNAL: EpSignal = EpSignal::new();
        let host = Self {
            hw,
            shared: Exclusive::new(Shared {
                qh_pool: DescriptorPool::new(),
                qtd_pool: DescriptorPool::new(),
                desc_bufs: BufferPool::new(),
                io_bufs: IoBufferPool::new(),
                endpoints,
            }),
            rh_event: Completion::new(),
            fatal: AtomicBool::new(false),
            ports: [PORT; NPORTS],
            signals: [SIGNAL; config::ENDPOINT_SLOTS],
            ctrl_pending: AtomicBool::new(false),
        };

        host.reset()?;

        // Mask interrupts and clear any stale status before running
        host.hw.write_reg(Reg::UsbIntr, 0);
        host.hw
            .write_reg(Reg::UsbSts, UsbSts::ALL_INTERRUPTS.bits());
        host.hw.write_reg(Reg::FrIndex, 0);
        // No periodic schedule: interrupt endpoints run on the
        // asynchronous schedule instead
        host.hw.write_reg(Reg::PeriodicListBase, 0);
        host.hw.write_reg(Reg::UsbCmd, UsbCmd::RUN_STOP.bits());

        // Route all root hub ports to this controller
        host.hw.write_reg(Reg::ConfigFlag, 1);
        host.hw.drive_vbus(true);

        for n in 0..NPORTS {
            let reg = Reg::PortSc(n as u8);
            let sc = host.hw.read_reg(reg);
            host.hw
                .write_reg(reg, (sc & !PortSc::ALL_CHANGES.bits()) | PortSc::PORT_POWER.bits());
        }
        host.hw.delay_ms(timeouts::POWER_STABLE_MS);

        for (n, port) in host.ports.iter().enumerate() {
            let sc = PortSc::from_bits_retain(host.hw.read_reg(Reg::PortSc(n as u8)));
            port.connected
                .store(sc.contains(PortSc::CURRENT_CONNECT_STATUS), Ordering::Release);
            port.lowspeed.store(sc.is_low_speed(), Ordering::Release);
        }

        host.hw.write_reg(
            Reg::UsbIntr,
            (UsbIntr::USB_INTERRUPT
                | UsbIntr::USB_ERROR
                | UsbIntr::PORT_CHANGE
                | UsbIntr::HOST_SYSTEM_ERROR)
                .bits(),
        );
        host.hw.enable_irq();

        Ok(host)
    }

    /// Restricted handle for the application's connect/enumerate loop.
    pub fn connection(&self) -> HostConnection<'_, H, NPORTS> {
        HostConnection { host: self }
    }

    /// Reset the host controller.
    ///
    /// The controller must be halted before HC_RESET is set; a running
    /// schedule makes the reset outcome undefined. Both waits are
    /// bounded and fail with `Timeout` rather than hanging on dead
    /// hardware.
    pub fn reset(&self) -> Result<()> {
        self.hw.write_reg(Reg::UsbCmd, 0);
        self.wait_usbsts(
            UsbSts::HC_HALTED,
            UsbSts::HC_HALTED,
            timeouts::HALT_TIMEOUT_US,
            timeouts::HALT_POLL_US,
        )?;

        self.hw.write_reg(Reg::UsbCmd, UsbCmd::HC_RESET.bits());
        let mut elapsed = 0;
        loop {
            if self.hw.read_reg(Reg::UsbCmd) & UsbCmd::HC_RESET.bits() == 0 {
                return Ok(());
            }
            if elapsed >= timeouts::RESET_TIMEOUT_US {
                return Err(UsbError::Timeout);
            }
            self.hw.delay_us(timeouts::RESET_POLL_US);
            elapsed += timeouts::RESET_POLL_US;
        }
    }

    /// Block until some port's connect state differs from `expected`.
    ///
    /// Returns the changed port. Each transition is reported once: the
    /// caller folds the result into its own expectation array before
    /// waiting again.
    pub fn wait(&self, expected: &[bool; NPORTS]) -> PortId {
        loop {
            if let Some(port) = self.changed_port(expected) {
                return port;
            }
            self.rh_event.wait(&self.hw);
        }
    }

    /// [`EhciHost::wait`] with a deadline.
    pub fn wait_timeout(&self, expected: &[bool; NPORTS], timeout_us: u32) -> Result<PortId> {
        let mut elapsed = 0;
        loop {
            if let Some(port) = self.changed_port(expected) {
                return Ok(port);
            }
            if elapsed >= timeout_us {
                return Err(UsbError::Timeout);
            }
            let _ = self
                .rh_event
                .wait_timeout(&self.hw, COMPLETION_SLICE_US.min(timeout_us - elapsed));
            elapsed += COMPLETION_SLICE_US;
        }
    }

    fn changed_port(&self, expected: &[bool; NPORTS]) -> Option<PortId> {
        for (n, port) in self.ports.iter().enumerate() {
            if port.connected.load(Ordering::Acquire) != expected[n] {
                return PortId::try_from(n).ok();
            }
        }
        None
    }

    /// Reset and enumerate the device on `port`.
    ///
    /// Fails fast with `NoDevice` when nothing is connected, before any
    /// port register is touched. Otherwise: debounce delay, port reset
    /// with the USB-mandated assertion and recovery times, then hand
    /// off to the enumeration delegate. The returned class handle stays
    /// bound to the port until [`EhciHost::disconnect`].
    pub fn enumerate<D>(&self, port: PortId, delegate: &mut D) -> Result<ClassHandle>
    where
        D: EnumerationDelegate<H, NPORTS>,
    {
        let idx = port.index();
        if idx >= NPORTS {
            return Err(UsbError::InvalidParameter);
        }
        if !self.ports[idx].connected.load(Ordering::Acquire) {
            return Err(UsbError::NoDevice);
        }

        // Let the connection debounce before resetting
        self.hw.delay_ms(timeouts::PORT_SETTLE_MS);
        if !self.ports[idx].connected.load(Ordering::Acquire) {
            return Err(UsbError::NoDevice);
        }

        let reg = Reg::PortSc(port.value());
        let sc = self.hw.read_reg(reg);
        self.hw.write_reg(
            reg,
            (sc & !PortSc::ALL_CHANGES.bits() & !PortSc::PORT_ENABLED.bits())
                | PortSc::PORT_RESET.bits(),
        );
        self.hw.delay_ms(timeouts::PORT_RESET_MS);

        let sc = self.hw.read_reg(reg);
        self.hw
            .write_reg(reg, sc & !PortSc::ALL_CHANGES.bits() & !PortSc::PORT_RESET.bits());

        let mut elapsed = 0;
        while self.hw.read_reg(reg) & PortSc::PORT_RESET.bits() != 0 {
            if elapsed >= timeouts::SCHEDULE_TIMEOUT_US {
                return Err(UsbError::Timeout);
            }
            self.hw.delay_us(timeouts::RESET_POLL_US);
            elapsed += timeouts::RESET_POLL_US;
        }

        // Recovery time before the device must answer on the bus
        self.hw.delay_ms(timeouts::PORT_RECOVERY_MS);

        let sc = PortSc::from_bits_retain(self.hw.read_reg(reg));
        let speed = if sc.contains(PortSc::PORT_ENABLED) {
            Speed::High
        } else if self.ports[idx].lowspeed.load(Ordering::Acquire) {
            Speed::Low
        } else {
            Speed::Full
        };

        // EP0 starts at address 0 with the default packet size
        let mps = if matches!(speed, Speed::High) { 64 } else { 8 };
        self.ep0_configure(self.ep0(), 0, mps, speed)?;

        let funcaddr = port.value() + 1;
        let class = delegate.enumerate(self, port, speed, funcaddr)?;
        self.ports[idx].class.store(class.0 + 1, Ordering::Release);
        Ok(class)
    }

    /// The shared control endpoint handle.
    pub fn ep0(&self) -> EndpointId {
        EndpointId(0)
    }

    /// Class handle bound to `port` by a previous enumeration.
    pub fn class_of(&self, port: PortId) -> Option<ClassHandle> {
        let raw = self.ports.get(port.index())?.class.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(ClassHandle(raw - 1))
        }
    }

    /// The device on `port` is gone; unbind its class driver.
    pub fn disconnect(&self, port: PortId) -> Result<()> {
        let idx = port.index();
        if idx >= NPORTS {
            return Err(UsbError::InvalidParameter);
        }
        self.ports[idx].class.store(0, Ordering::Release);
        Ok(())
    }

    /// Retarget a control endpoint after SET_ADDRESS or once the real
    /// max packet size is known from the device descriptor.
    pub fn ep0_configure(
        &self,
        ep: EndpointId,
        funcaddr: u8,
        max_packet: u16,
        speed: Speed,
    ) -> Result<()> {
        if funcaddr > 127 || max_packet == 0 || max_packet > 1024 {
            return Err(UsbError::InvalidParameter);
        }
        let mut shared = self.shared.lock(&self.hw);
        let state = shared.endpoints[ep.0].as_mut().ok_or(UsbError::InvalidState)?;
        if !matches!(state.kind, TransferKind::Control) {
            return Err(UsbError::InvalidParameter);
        }
        state.device_addr = funcaddr;
        state.max_packet = max_packet;
        state.speed = speed;
        state.toggle = false;
        Ok(())
    }

    /// Allocate an endpoint slot for a class driver.
    pub fn ep_alloc(&self, desc: &EndpointDescriptor, speed: Speed) -> Result<EndpointId> {
        desc.validate()?;
        let mut shared = self.shared.lock(&self.hw);
        // Slot 0 is EP0
        for i in 1..config::ENDPOINT_SLOTS {
            if shared.endpoints[i].is_none() {
                shared.endpoints[i] = Some(EndpointState::from_descriptor(desc, speed));
                return Ok(EndpointId(i));
            }
        }
        Err(UsbError::NoResources)
    }

    /// Release an endpoint slot. The endpoint must be idle.
    pub fn ep_free(&self, ep: EndpointId) -> Result<()> {
        if ep.0 == 0 || ep.0 >= config::ENDPOINT_SLOTS {
            return Err(UsbError::InvalidParameter);
        }
        if self.signals[ep.0].pending.load(Ordering::Acquire) {
            debug_assert!(false, "freeing endpoint with a transfer in flight");
            return Err(UsbError::InvalidState);
        }
        let mut shared = self.shared.lock(&self.hw);
        if shared.endpoints[ep.0].take().is_none() {
            return Err(UsbError::InvalidState);
        }
        Ok(())
    }

    /// Allocate a 128-byte descriptor buffer.
    pub fn alloc(&self) -> Result<BufferId> {
        self.shared.lock(&self.hw).desc_bufs.allocate()
    }

    /// Free a descriptor buffer.
    pub fn free(&self, id: BufferId) -> Result<()> {
        self.shared.lock(&self.hw).desc_bufs.release(id)
    }

    /// Run `f` over a descriptor buffer's contents.
    pub fn with_buffer<R>(&self, id: BufferId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut shared = self.shared.lock(&self.hw);
        f(shared.desc_bufs.get_mut(id))
    }

    /// Allocate an I/O buffer of at least `size` bytes.
    pub fn io_alloc(&self, size: usize) -> Result<IoBufferId> {
        self.shared.lock(&self.hw).io_bufs.allocate(size)
    }

    /// Free an I/O buffer.
    pub fn io_free(&self, id: IoBufferId) -> Result<()> {
        self.shared.lock(&self.hw).io_bufs.release(id)
    }

    /// Run `f` over an I/O buffer's contents.
    pub fn with_io_buffer<R>(&self, id: IoBufferId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut shared = self.shared.lock(&self.hw);
        f(shared.io_bufs.get_mut(id))
    }

    /// IN control transfer: SETUP, IN data stage, OUT status stage.
    ///
    /// Returns the number of bytes the device actually sent. Only one
    /// control transfer may be in flight at a time.
    pub fn ctrl_in(
        &self,
        ep: EndpointId,
        setup: &SetupPacket,
        buffer: &mut [u8],
    ) -> Result<usize> {
        if !setup.is_in() || buffer.len() < setup.length as usize {
            return Err(UsbError::InvalidParameter);
        }
        self.ctrl_transfer(ep, setup, buffer.as_mut_ptr() as usize, setup.length as usize, Direction::In)
    }

    /// OUT control transfer: SETUP, optional OUT data stage, IN status
    /// stage.
    pub fn ctrl_out(&self, ep: EndpointId, setup: &SetupPacket, buffer: &[u8]) -> Result<()> {
        if setup.is_in() || buffer.len() < setup.length as usize {
            return Err(UsbError::InvalidParameter);
        }
        self.ctrl_transfer(ep, setup, buffer.as_ptr() as usize, setup.length as usize, Direction::Out)
            .map(|_| ())
    }

    fn ctrl_transfer(
        &self,
        ep: EndpointId,
        setup: &SetupPacket,
        buffer_addr: usize,
        len: usize,
        dir: Direction,
    ) -> Result<usize> {
        if ep.0 >= config::ENDPOINT_SLOTS {
            return Err(UsbError::InvalidParameter);
        }
        if self.ctrl_pending.swap(true, Ordering::AcqRel) {
            debug_assert!(false, "concurrent control transfer");
            return Err(UsbError::InvalidState);
        }
        let result = self.ctrl_transfer_locked_out(ep, setup, buffer_addr, len, dir);
        self.ctrl_pending.store(false, Ordering::Release);
        result
    }

    fn ctrl_transfer_locked_out(
        &self,
        ep: EndpointId,
        setup: &SetupPacket,
        buffer_addr: usize,
        len: usize,
        dir: Direction,
    ) -> Result<usize> {
        let setup_addr = setup as *const SetupPacket as usize;
        let chain = {
            let mut shared = self.shared.lock(&self.hw);
            let chain = self.build_control_chain(
                &mut shared,
                ep,
                setup_addr as u32,
                buffer_addr as u32,
                len,
                dir,
            )?;

            // Everything the controller will DMA must be in memory
            self.hw.dcache_clean(setup_addr, size_of::<SetupPacket>());
            if len > 0 {
                self.hw.dcache_clean(buffer_addr, len);
            }

            self.signals[ep.0].complete.reset();
            self.signals[ep.0].pending.store(true, Ordering::Release);
            let submitted = self
                .flush_chain(&shared, &chain)
                .and_then(|()| self.enable_async_schedule(shared.qh_pool.addr_of(chain.qh)));
            if let Err(e) = submitted {
                for h in &chain.qtds {
                    let _ = shared.qtd_pool.release(*h);
                }
                let _ = shared.qh_pool.release(chain.qh);
                self.signals[ep.0].pending.store(false, Ordering::Release);
                return Err(e);
            }
            chain
        };

        let wait = self.wait_chain_complete(
            ep,
            &chain,
            timeouts::CONTROL_TIMEOUT_US,
            UsbError::Timeout,
        );

        // Data stage residue must be read before the chain is retired
        let moved = if wait.is_ok() && len > 0 {
            let shared = self.shared.lock(&self.hw);
            // The data stage is the second qTD of three
            let data = shared.qtd_pool.get(chain.qtds[1]);
            len - data.remaining_bytes() as usize
        } else {
            0
        };

        self.retire_chain(ep, chain);
        wait?;

        if matches!(dir, Direction::In) && moved > 0 {
            self.hw.dcache_invalidate(buffer_addr, len);
        }
        Ok(moved)
    }

    fn build_control_chain(
        &self,
        shared: &mut Shared,
        ep: EndpointId,
        setup_addr: u32,
        buffer_addr: u32,
        len: usize,
        dir: Direction,
    ) -> Result<Chain> {
        let (funcaddr, epno, mps, speed) = {
            let state = shared.endpoints[ep.0].as_ref().ok_or(UsbError::InvalidState)?;
            if !matches!(state.kind, TransferKind::Control) {
                return Err(UsbError::InvalidParameter);
            }
            (state.device_addr, state.number, state.max_packet, state.speed)
        };

        let qh = shared.qh_pool.allocate()?;
        let mut qtds: heapless::Vec<QtdHandle, 3> = heapless::Vec::new();

        let mut claim_qtd = |shared: &mut Shared, qtds: &mut heapless::Vec<QtdHandle, 3>| {
            match shared.qtd_pool.allocate() {
                Ok(h) => {
                    let _ = qtds.push(h);
                    Ok(h)
                }
                Err(e) => Err(e),
            }
        };

        let built: Result<()> = (|| {
            let setup_qtd = claim_qtd(shared, &mut qtds)?;
            shared.qtd_pool.get(setup_qtd).init_transfer(
                Pid::Setup,
                setup_addr,
                size_of::<SetupPacket>(),
                false,
                false,
            )?;

            let mut prev = setup_qtd;
            if len > 0 {
                let data_qtd = claim_qtd(shared, &mut qtds)?;
                let pid = match dir {
                    Direction::In => Pid::In,
                    Direction::Out => Pid::Out,
                };
                shared
                    .qtd_pool
                    .get(data_qtd)
                    .init_transfer(pid, buffer_addr, len, true, false)?;
                shared
                    .qtd_pool
                    .get(prev)
                    .link_next(shared.qtd_pool.addr_of(data_qtd));
                prev = data_qtd;
            }

            // Status stage runs opposite to the data stage, always DATA1
            let status_qtd = claim_qtd(shared, &mut qtds)?;
            let status_pid = match (len > 0, dir) {
                (true, Direction::In) => Pid::Out,
                _ => Pid::In,
            };
            shared
                .qtd_pool
                .get(status_qtd)
                .init_transfer(status_pid, 0, 0, true, true)?;
            shared
                .qtd_pool
                .get(prev)
                .link_next(shared.qtd_pool.addr_of(status_qtd));

            let qh_ref = shared.qh_pool.get(qh);
            qh_ref.init_endpoint(funcaddr, epno, mps, speed, true)?;
            qh_ref.owner.store(ep.0 as u32 + 1, Ordering::Release);
            qh_ref.set_head_of_list();
            qh_ref.link_to(shared.qh_pool.addr_of(qh));
            qh_ref.link_qtd(shared.qtd_pool.addr_of(qtds[0]));
            Ok(())
        })();

        if let Err(e) = built {
            for h in qtds {
                let _ = shared.qtd_pool.release(h);
            }
            let _ = shared.qh_pool.release(qh);
            return Err(e);
        }
        Ok(Chain { qh, qtds })
    }

    /// Bulk or interrupt transfer on an allocated endpoint.
    ///
    /// Direction comes from the endpoint. Returns bytes moved; a
    /// transfer that is still NAKed at its deadline fails with
    /// `Nak` and may be retried. Interrupt endpoints are polled on the
    /// asynchronous schedule; the periodic schedule stays disabled.
    pub fn transfer(&self, ep: EndpointId, buffer: &mut [u8]) -> Result<usize> {
        if ep.0 == 0 || ep.0 >= config::ENDPOINT_SLOTS {
            return Err(UsbError::InvalidParameter);
        }
        if buffer.is_empty() || buffer.len() > crate::ehci::qtd::MAX_QTD_TRANSFER {
            return Err(UsbError::InvalidParameter);
        }
        if self.signals[ep.0].pending.swap(true, Ordering::AcqRel) {
            debug_assert!(false, "endpoint already has a transfer in flight");
            return Err(UsbError::InvalidState);
        }

        let result = self.transfer_pending_held(ep, buffer);
        self.signals[ep.0].pending.store(false, Ordering::Release);
        result
    }

    fn transfer_pending_held(&self, ep: EndpointId, buffer: &mut [u8]) -> Result<usize> {
        let buffer_addr = buffer.as_ptr() as usize;
        let len = buffer.len();

        let (chain, dir) = {
            let mut shared = self.shared.lock(&self.hw);
            let (funcaddr, epno, mps, speed, dirn, toggle, kind) = {
                let state = shared.endpoints[ep.0].as_ref().ok_or(UsbError::InvalidState)?;
                (
                    state.device_addr,
                    state.number,
                    state.max_packet,
                    state.speed,
                    state.direction,
                    state.toggle,
                    state.kind,
                )
            };
            match kind {
                TransferKind::Bulk | TransferKind::Interrupt => {}
                TransferKind::Isochronous => return Err(UsbError::Unsupported),
                TransferKind::Control => return Err(UsbError::InvalidParameter),
            }

            let qh = shared.qh_pool.allocate()?;
            let qtd = match shared.qtd_pool.allocate() {
                Ok(h) => h,
                Err(e) => {
                    let _ = shared.qh_pool.release(qh);
                    return Err(e);
                }
            };

            let built: Result<()> = (|| {
                let pid = match dirn {
                    Direction::In => Pid::In,
                    Direction::Out => Pid::Out,
                };
                shared
                    .qtd_pool
                    .get(qtd)
                    .init_transfer(pid, buffer_addr as u32, len, toggle, true)?;

                let qh_ref = shared.qh_pool.get(qh);
                qh_ref.init_endpoint(funcaddr, epno, mps, speed, false)?;
                // Per-transfer QHs: software tracks the toggle, so the
                // controller must take it from the qTD
                qh_ref
                    .epchar
                    .fetch_or(crate::ehci::qh::epchar::DATA_TOGGLE_CONTROL, Ordering::AcqRel);
                qh_ref.owner.store(ep.0 as u32 + 1, Ordering::Release);
                qh_ref.set_head_of_list();
                qh_ref.link_to(shared.qh_pool.addr_of(qh));
                qh_ref.link_qtd(shared.qtd_pool.addr_of(qtd));
                Ok(())
            })();
            if let Err(e) = built {
                let _ = shared.qtd_pool.release(qtd);
                let _ = shared.qh_pool.release(qh);
                return Err(e);
            }

            let mut qtds = heapless::Vec::new();
            let _ = qtds.push(qtd);
            let chain = Chain { qh, qtds };

            self.hw.dcache_clean(buffer_addr, len);
            self.signals[ep.0].complete.reset();
            let submitted = self
                .flush_chain(&shared, &chain)
                .and_then(|()| self.enable_async_schedule(shared.qh_pool.addr_of(chain.qh)));
            if let Err(e) = submitted {
                for h in &chain.qtds {
                    let _ = shared.qtd_pool.release(*h);
                }
                let _ = shared.qh_pool.release(chain.qh);
                return Err(e);
            }
            (chain, dirn)
        };

        let wait = self.wait_chain_complete(
            ep,
            &chain,
            timeouts::TRANSFER_TIMEOUT_US,
            UsbError::Nak,
        );

        let moved = if wait.is_ok() {
            let shared = self.shared.lock(&self.hw);
            let qtd = shared.qtd_pool.get(chain.qtds[0]);
            len - qtd.remaining_bytes() as usize
        } else {
            0
        };

        self.retire_chain(ep, chain);
        wait?;

        {
            let mut shared = self.shared.lock(&self.hw);
            if let Some(state) = shared.endpoints[ep.0].as_mut() {
                state.advance_toggle(moved);
            }
        }

        if matches!(dir, Direction::In) {
            self.hw.dcache_invalidate(buffer_addr, len);
        }
        Ok(moved)
    }

    /// Interrupt service routine body. Never blocks and never takes the
    /// exclusive lock; it acknowledges status, updates port state, and
    /// wakes waiters through completion signals.
    pub fn on_interrupt(&self) {
        let sts = UsbSts::from_bits_retain(self.hw.read_reg(Reg::UsbSts));
        let ack = sts & UsbSts::ALL_INTERRUPTS;
        if !ack.is_empty() {
            self.hw.write_reg(Reg::UsbSts, ack.bits());
        }

        if sts.contains(UsbSts::HOST_SYSTEM_ERROR) {
            self.fatal.store(true, Ordering::Release);
            // Wake everything so waiters can observe the fault
            self.rh_event.post();
            for sig in &self.signals {
                sig.complete.post();
            }
            return;
        }

        if sts.contains(UsbSts::PORT_CHANGE_DETECT) {
            for (n, port) in self.ports.iter().enumerate() {
                let reg = Reg::PortSc(n as u8);
                let sc = PortSc::from_bits_retain(self.hw.read_reg(reg));
                if sc.contains(PortSc::CONNECT_STATUS_CHANGE) {
                    // Acknowledge only this change bit
                    self.hw.write_reg(
                        reg,
                        (sc.bits() & !PortSc::ALL_CHANGES.bits())
                            | PortSc::CONNECT_STATUS_CHANGE.bits(),
                    );
                    port.connected
                        .store(sc.contains(PortSc::CURRENT_CONNECT_STATUS), Ordering::Release);
                    port.lowspeed.store(sc.is_low_speed(), Ordering::Release);
                    self.rh_event.post();
                }
            }
        }

        if sts.intersects(UsbSts::USB_INTERRUPT | UsbSts::USB_ERROR_INTERRUPT) {
            for sig in &self.signals {
                if sig.pending.load(Ordering::Acquire) {
                    sig.complete.post();
                }
            }
        }
    }

    fn wait_usbsts(
        &self,
        mask: UsbSts,
        expected: UsbSts,
        timeout_us: u32,
        poll_us: u32,
    ) -> Result<()> {
        let mut elapsed = 0;
        loop {
            let sts = UsbSts::from_bits_retain(self.hw.read_reg(Reg::UsbSts));
            if sts.contains(UsbSts::HOST_SYSTEM_ERROR) {
                self.fatal.store(true, Ordering::Release);
                return Err(UsbError::HostSystemError);
            }
            if sts & mask == expected {
                return Ok(());
            }
            if elapsed >= timeout_us {
                return Err(UsbError::Timeout);
            }
            self.hw.delay_us(poll_us);
            elapsed += poll_us;
        }
    }

    fn enable_async_schedule(&self, qh_addr: u32) -> Result<()> {
        self.hw.write_reg(Reg::AsyncListAddr, qh_addr);
        let cmd = self.hw.read_reg(Reg::UsbCmd);
        self.hw
            .write_reg(Reg::UsbCmd, cmd | UsbCmd::ASYNC_SCHEDULE_ENABLE.bits());
        self.wait_usbsts(
            UsbSts::ASYNC_SCHEDULE_STATUS,
            UsbSts::ASYNC_SCHEDULE_STATUS,
            timeouts::SCHEDULE_TIMEOUT_US,
            timeouts::RESET_POLL_US,
        )
    }

    fn disable_async_schedule(&self) {
        let cmd = self.hw.read_reg(Reg::UsbCmd);
        self.hw
            .write_reg(Reg::UsbCmd, cmd & !UsbCmd::ASYNC_SCHEDULE_ENABLE.bits());
        let _ = self.wait_usbsts(
            UsbSts::ASYNC_SCHEDULE_STATUS,
            UsbSts::empty(),
            timeouts::SCHEDULE_TIMEOUT_US,
            timeouts::RESET_POLL_US,
        );
    }

    /// Write back a freshly built chain. At submission time the whole
    /// chain is still reachable from the QH overlay, so the generic
    /// queue walk covers every descriptor.
    fn flush_chain(&self, shared: &Shared, chain: &Chain) -> Result<()> {
        queue::qh_flush(&self.hw, &shared.qtd_pool, shared.qh_pool.get(chain.qh))
    }

    /// Invalidate a submitted chain before inspecting hardware-written
    /// status. Walks the recorded handles, not the overlay: the
    /// controller advances the overlay past retired qTDs.
    fn refresh_chain(&self, shared: &Shared, chain: &Chain) {
        let qh = shared.qh_pool.get(chain.qh);
        self.hw
            .dcache_invalidate(qh as *const QueueHead as usize, size_of::<QueueHead>());
        for &h in &chain.qtds {
            let qtd = shared.qtd_pool.get(h);
            self.hw
                .dcache_invalidate(qtd as *const QueueTd as usize, size_of::<QueueTd>());
        }
    }

    /// Poll a submitted chain until its final qTD retires, an error
    /// status appears, the host faults, or the deadline passes.
    fn wait_chain_complete(
        &self,
        ep: EndpointId,
        chain: &Chain,
        timeout_us: u32,
        timeout_err: UsbError,
    ) -> Result<()> {
        let last = chain.qtds[chain.qtds.len() - 1];
        let mut elapsed = 0;
        loop {
            if self.fatal.load(Ordering::Acquire) {
                return Err(UsbError::HostSystemError);
            }
            {
                let shared = self.shared.lock(&self.hw);
                self.refresh_chain(&shared, chain);
                for &h in &chain.qtds {
                    if let Some(e) = shared.qtd_pool.get(h).error() {
                        return Err(e);
                    }
                }
                if !shared.qtd_pool.get(last).is_active() {
                    return Ok(());
                }
            }
            if elapsed >= timeout_us {
                return Err(timeout_err);
            }
            let _ = self.signals[ep.0]
                .complete
                .wait_timeout(&self.hw, COMPLETION_SLICE_US);
            elapsed += COMPLETION_SLICE_US;
        }
    }

    /// Take the chain off the hardware schedule and return its
    /// descriptors to the pools.
    fn retire_chain(&self, ep: EndpointId, chain: Chain) {
        self.disable_async_schedule();
        let mut shared = self.shared.lock(&self.hw);
        for h in &chain.qtds {
            let _ = shared.qtd_pool.release(*h);
        }
        shared.qh_pool.get(chain.qh).unlink();
        let _ = shared.qh_pool.release(chain.qh);
        self.signals[ep.0].pending.store(false, Ordering::Release);
    }
}

/// Restricted view handed to the application: connect detection and
/// enumeration only.
pub struct HostConnection<'a, H: UsbHw, const NPORTS: usize> {
    host: &'a EhciHost<H, NPORTS>,
}

impl<'a, H: UsbHw, const NPORTS: usize> HostConnection<'a, H, NPORTS> {
    /// See [`EhciHost::wait`].
    pub fn wait(&self, expected: &[bool; NPORTS]) -> PortId {
        self.host.wait(expected)
    }

    /// See [`EhciHost::wait_timeout`].
    pub fn wait_timeout(&self, expected: &[bool; NPORTS], timeout_us: u32) -> Result<PortId> {
        self.host.wait_timeout(expected, timeout_us)
    }

    /// See [`EhciHost::enumerate`].
    pub fn enumerate<D>(&self, port: PortId, delegate: &mut D) -> Result<ClassHandle>
    where
        D: EnumerationDelegate<H, NPORTS>,
    {
        self.host.enumerate(port, delegate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_layout() {
        let setup = SetupPacket::get_descriptor(0x01, 0, 18);
        assert!(setup.is_in());
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.length, 18);
    }

    #[test]
    fn test_setup_packet_set_address_is_out() {
        let setup = SetupPacket::set_address(5);
        assert!(!setup.is_in());
        assert_eq!(setup.value, 5);
        assert_eq!(setup.length, 0);
    }
}
