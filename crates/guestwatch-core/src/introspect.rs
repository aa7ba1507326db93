use std::{cell::RefCell, rc::Rc, time::Duration};

use crate::{
    event::{Event, OnCleared},
    DriverError, Pa, Va,
};

/// A guest domain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

/// A virtual CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(pub u16);

/// A guest process identifier. [`KERNEL_PID`] addresses the kernel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub i32);

/// The process id used for kernel-space accesses.
pub const KERNEL_PID: Pid = Pid(0);

/// A second-level address translation (altp2m) view identifier.
///
/// View 0 is the hypervisor's default view with normal permissions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct View(pub u16);

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// x86-64 vCPU register state, as exposed by the introspection library.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr3: u64,
}

/// The introspection-library contract for one live guest.
///
/// All runtime objects share a handle to one implementation through
/// `Rc<dyn Introspect>` and are driven from a single thread. Methods map
/// one-to-one onto the primitives the hypervisor-facing library exposes;
/// failures surface as opaque [`DriverError`]s which the runtime wraps
/// with typed context.
pub trait Introspect {
    /// The id of the introspected domain.
    fn domain_id(&self) -> DomainId;

    /// The number of virtual CPUs of the guest.
    fn vcpu_count(&self) -> u32;

    /// Pauses the guest.
    fn pause(&self) -> Result<(), DriverError>;

    /// Resumes the guest.
    fn resume(&self) -> Result<(), DriverError>;

    /// Reads the register state of one vCPU.
    fn registers(&self, vcpu: VcpuId) -> Result<Registers, DriverError>;

    /// Writes the register state of one vCPU.
    fn set_registers(&self, vcpu: VcpuId, regs: &Registers) -> Result<(), DriverError>;

    /// Resolves a kernel symbol to its virtual address.
    fn symbol_to_va(&self, symbol: &str) -> Result<Va, DriverError>;

    /// Resolves a named structure-field offset from the kernel layout.
    fn offset_of(&self, name: &str) -> Result<u64, DriverError>;

    /// Translates a kernel virtual address to a physical address.
    fn kernel_to_pa(&self, va: Va) -> Result<Pa, DriverError>;

    /// Reads `buf.len()` bytes at `va` in the address space of `pid`.
    ///
    /// A short read is a failure.
    fn read_va(&self, va: Va, pid: Pid, buf: &mut [u8]) -> Result<(), DriverError>;

    /// Writes `buf` at `va` in the address space of `pid`.
    ///
    /// A partial write is a failure.
    fn write_va(&self, va: Va, pid: Pid, buf: &[u8]) -> Result<(), DriverError>;

    /// Registers an event with the hypervisor.
    ///
    /// The event's kind describes what to intercept; its callback is
    /// invoked from [`listen`] with the event filled in.
    ///
    /// [`listen`]: Introspect::listen
    fn register_event(&self, event: Rc<RefCell<Event>>) -> Result<(), DriverError>;

    /// Requests the hypervisor to clear a registered event.
    ///
    /// `done` runs once the event is confirmed cleared; if deliveries are
    /// still pending for the event, the confirmation is deferred until
    /// they have been handled.
    fn clear_event(
        &self,
        event: Rc<RefCell<Event>>,
        done: Option<OnCleared>,
    ) -> Result<(), DriverError>;

    /// The number of events that have occurred but not been handled yet.
    fn events_pending(&self) -> Result<u64, DriverError>;

    /// Waits up to `timeout` for events and dispatches any that arrive to
    /// their callbacks. Returning without having dispatched anything is
    /// not a failure.
    fn listen(&self, timeout: Duration) -> Result<(), DriverError>;

    /// Creates a new SLAT view.
    fn create_view(&self) -> Result<View, DriverError>;

    /// Destroys a SLAT view.
    fn destroy_view(&self, view: View) -> Result<(), DriverError>;

    /// Switches the whole domain to a SLAT view.
    fn switch_view(&self, view: View) -> Result<(), DriverError>;

    /// Turns the domain's alternate-view machinery on or off.
    fn set_view_domain_state(&self, enabled: bool) -> Result<(), DriverError>;
}

/// The per-domain altp2m parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltP2mMode {
    /// Alternate views are unavailable.
    Disabled,
    /// Alternate views are driven by an external monitor.
    External,
    /// The restricted in-guest flavor. Cannot be upgraded without a
    /// guest reboot.
    Limited,
}

/// Entry point of the hypervisor control interface.
///
/// Covers altp2m enablement only; everything else the runtime needs goes
/// through [`Introspect`].
pub trait ControlPlane {
    /// Opens a control handle.
    fn open(&self) -> Result<Box<dyn ControlHandle>, DriverError>;
}

/// An open hypervisor control handle.
pub trait ControlHandle {
    /// Reads the per-domain altp2m parameter.
    fn altp2m_mode(&self, domain: DomainId) -> Result<AltP2mMode, DriverError>;

    /// Writes the per-domain altp2m parameter.
    fn set_altp2m_mode(&self, domain: DomainId, mode: AltP2mMode) -> Result<(), DriverError>;

    /// Closes the handle. Dropping without closing is tolerated but logged
    /// by the owner.
    fn close(&mut self) -> Result<(), DriverError>;
}
