use std::{
    cell::{Cell, RefCell},
    collections::{btree_map::Entry, BTreeMap},
    rc::Rc,
};

use guestwatch_core::{
    mem, DriverError, EmulInsn, Error as CoreError, Event, EventData, EventKind, InterruptEvent,
    Introspect, Response, Sentinel, Va, VcpuId, View,
};
use once_cell::sync::Lazy;

/// The single-byte x86 software breakpoint instruction (INT3).
pub const BREAKPOINT_OPCODE: u8 = 0xCC;

static REGISTRY_SENTINEL: Lazy<Sentinel> = Lazy::new(Sentinel::next);

/// Per-hit callback of a breakpoint, invoked inline from the capture-all
/// INT3 handler with the delivered event.
pub type OnHit = Box<dyn FnMut(&dyn Introspect, &mut Event)>;

/// An error of the breakpoint registry.
#[derive(Debug, thiserror::Error)]
pub enum BreakpointError {
    /// A breakpoint already exists at the target address.
    #[error("a breakpoint at {addr} is already set")]
    AlreadySet {
        /// The contested address.
        addr: Va,
    },

    /// The capture-all INT3 event is already registered.
    #[error("the breakpoint event is already registered")]
    EventAlreadyRegistered,

    /// The capture-all INT3 event is not registered.
    #[error("the breakpoint event is not registered")]
    EventNotRegistered,

    /// Registering the capture-all INT3 event failed.
    #[error("failed to register the breakpoint event (are events enabled for this guest?)")]
    EventRegistration {
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// Some breakpoints could not be disabled; every one was attempted.
    #[error("{} breakpoint(s) could not be disabled", errors.len())]
    DisableAll {
        /// The collected write failures.
        errors: Vec<CoreError>,
    },
}

/// A software breakpoint on one kernel instruction.
///
/// Enabling injects [`BREAKPOINT_OPCODE`] after saving the first 15 bytes
/// at the target; the saved bytes double as the instruction the
/// hypervisor emulates on a hit, so the guest never observes the
/// injected byte executing. Disabling restores the first byte bit-exactly.
///
/// The breakpoint does not serialize against the event loop. Disable it
/// only while the guest is paused and the queue drained (a
/// `schedule_pause` callback), or the capture-all handler may see a hit
/// for an already-disabled site.
pub struct Breakpoint {
    vm: Rc<dyn Introspect>,
    addr: Va,
    saved: Cell<EmulInsn>,
    enabled: Cell<bool>,
    on_hit: RefCell<OnHit>,
}

impl Breakpoint {
    fn new(vm: Rc<dyn Introspect>, addr: Va, on_hit: OnHit) -> Rc<Self> {
        Rc::new(Self {
            vm,
            addr,
            saved: Cell::new(EmulInsn::default()),
            enabled: Cell::new(false),
            on_hit: RefCell::new(on_hit),
        })
    }

    /// The target kernel virtual address.
    pub fn addr(&self) -> Va {
        self.addr
    }

    /// Whether the INT3 byte is currently injected.
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Saves the original instruction bytes and injects the breakpoint.
    pub fn enable(&self) -> Result<(), CoreError> {
        let mut insn = EmulInsn::default();
        mem::read_kva(self.vm.as_ref(), self.addr, &mut insn.bytes)?;
        self.saved.set(insn);
        mem::write_u8(self.vm.as_ref(), self.addr, BREAKPOINT_OPCODE)?;
        self.enabled.set(true);
        tracing::debug!(addr = %self.addr, "breakpoint enabled");
        Ok(())
    }

    /// Restores the original first byte if the breakpoint is enabled.
    /// Idempotent.
    pub fn disable(&self) -> Result<(), CoreError> {
        if !self.enabled.get() {
            return Ok(());
        }
        mem::write_u8(self.vm.as_ref(), self.addr, self.saved.get().bytes[0])?;
        self.enabled.set(false);
        tracing::debug!(addr = %self.addr, "breakpoint disabled");
        Ok(())
    }
}

impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Breakpoint")
            .field("addr", &self.addr)
            .field("enabled", &self.enabled.get())
            .finish_non_exhaustive()
    }
}

impl Drop for Breakpoint {
    fn drop(&mut self) {
        if let Err(err) = self.disable() {
            tracing::warn!(addr = %self.addr, %err, "failed to disable breakpoint on drop");
        }
    }
}

struct Inner {
    bps: BTreeMap<Va, Rc<Breakpoint>>,
    event: Option<Rc<RefCell<Event>>>,
}

/// Owner of the software breakpoints of one guest.
///
/// Registers a single capture-all INT3 event and dispatches hits to the
/// breakpoint set on the faulting address; interrupts that match no
/// enabled breakpoint are reinjected so the guest handles its own INT3s.
pub struct BreakpointRegistry {
    vm: Rc<dyn Introspect>,
    inner: Rc<RefCell<Inner>>,
}

impl BreakpointRegistry {
    /// Creates an empty registry for one guest.
    pub fn new(vm: Rc<dyn Introspect>) -> Self {
        Self {
            vm,
            inner: Rc::new(RefCell::new(Inner {
                bps: BTreeMap::new(),
                event: None,
            })),
        }
    }

    /// Registers the capture-all INT3 event.
    ///
    /// Must be called exactly once before any hit can be observed.
    pub fn register_event(&self) -> Result<(), BreakpointError> {
        let mut inner = self.inner.borrow_mut();
        if inner.event.is_some() {
            return Err(BreakpointError::EventAlreadyRegistered);
        }

        let event = Rc::new(RefCell::new(Event {
            kind: EventKind::Interrupt(InterruptEvent::default()),
            slat: View(0),
            vcpu: VcpuId(0),
            data: Some(EventData::new(
                *REGISTRY_SENTINEL,
                Rc::downgrade(&self.inner),
            )),
            callback: on_int3,
        }));

        self.vm
            .register_event(Rc::clone(&event))
            .map_err(|source| BreakpointError::EventRegistration { source })?;

        tracing::debug!("breakpoint event registered");
        inner.event = Some(event);
        Ok(())
    }

    /// Requests the hypervisor to clear the capture-all INT3 event.
    ///
    /// The event is released once the hypervisor confirms the clear; with
    /// deliveries still pending, that happens after they drain. Does not
    /// disable breakpoints first; see [`disable_all`].
    ///
    /// [`disable_all`]: BreakpointRegistry::disable_all
    pub fn unregister_event(&self) -> Result<(), BreakpointError> {
        let event = self
            .inner
            .borrow_mut()
            .event
            .take()
            .ok_or(BreakpointError::EventNotRegistered)?;

        tracing::debug!("clearing breakpoint event");
        if let Err(err) = self.vm.clear_event(event, Some(on_event_cleared)) {
            tracing::warn!(%err, "failed to clear the breakpoint event");
        }
        Ok(())
    }

    /// Whether the capture-all INT3 event is registered.
    pub fn is_event_registered(&self) -> bool {
        self.inner.borrow().event.is_some()
    }

    /// Inserts a new, disabled breakpoint at `addr`.
    ///
    /// Fails with [`BreakpointError::AlreadySet`] when a breakpoint for
    /// the address exists.
    pub fn set_breakpoint(
        &self,
        addr: Va,
        on_hit: OnHit,
    ) -> Result<Rc<Breakpoint>, BreakpointError> {
        match self.inner.borrow_mut().bps.entry(addr) {
            Entry::Occupied(_) => Err(BreakpointError::AlreadySet { addr }),
            Entry::Vacant(slot) => {
                let bp = Breakpoint::new(Rc::clone(&self.vm), addr, on_hit);
                slot.insert(Rc::clone(&bp));
                Ok(bp)
            }
        }
    }

    /// Disables and removes the breakpoint at `addr`, returning it.
    ///
    /// A disable failure leaves the breakpoint in place. Pause the event
    /// loop before making this change.
    pub fn unset_breakpoint(&self, addr: Va) -> Result<Option<Rc<Breakpoint>>, CoreError> {
        let bp = match self.inner.borrow().bps.get(&addr) {
            Some(bp) => Rc::clone(bp),
            None => return Ok(None),
        };
        bp.disable()?;
        self.inner.borrow_mut().bps.remove(&addr);
        Ok(Some(bp))
    }

    /// Disables every breakpoint, attempting all of them and collecting
    /// write failures into [`BreakpointError::DisableAll`].
    pub fn disable_all(&self) -> Result<(), BreakpointError> {
        tracing::debug!("disabling all breakpoints");
        let bps: Vec<_> = self.inner.borrow().bps.values().cloned().collect();

        let mut errors = Vec::new();
        for bp in bps {
            if let Err(err) = bp.disable() {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BreakpointError::DisableAll { errors })
        }
    }

    /// The registered breakpoints, in address order.
    pub fn breakpoints(&self) -> Vec<Rc<Breakpoint>> {
        self.inner.borrow().bps.values().cloned().collect()
    }
}

impl Drop for BreakpointRegistry {
    fn drop(&mut self) {
        let registered = self.inner.borrow().event.is_some();
        if registered {
            if let Err(err) = self.unregister_event() {
                tracing::warn!(%err, "failed to unregister the breakpoint event on drop");
            }
        }
    }
}

/// The capture-all INT3 handler.
fn on_int3(vm: &dyn Introspect, event: &mut Event) -> Response {
    let inner = match EventData::recover::<RefCell<Inner>>(*REGISTRY_SENTINEL, event) {
        Ok(inner) => inner,
        Err(err) => {
            tracing::error!(%err, "interrupt event with a foreign envelope");
            if let Some(int) = event.interrupt_mut() {
                int.reinject = true;
            }
            return Response::empty();
        }
    };

    let gla = match event.interrupt() {
        Some(int) => int.gla,
        None => {
            tracing::error!("breakpoint handler received a non-interrupt event");
            return Response::empty();
        }
    };

    let bp = match inner.borrow().bps.get(&gla) {
        Some(bp) => Rc::clone(bp),
        None => {
            // The injected byte was not ours; let the guest handle it.
            if let Some(int) = event.interrupt_mut() {
                int.reinject = true;
            }
            return Response::empty();
        }
    };

    if !bp.is_enabled() {
        // Correct only because breakpoints are disabled exclusively while
        // the guest is paused and the queue drained: a hit observed here
        // predates the disablement and belongs to the guest now.
        if let Some(int) = event.interrupt_mut() {
            int.reinject = true;
        }
        return Response::empty();
    }

    if let Some(int) = event.interrupt_mut() {
        int.reinject = false;
    }

    {
        let mut on_hit = bp.on_hit.borrow_mut();
        (on_hit.as_mut())(vm, &mut *event);
    }

    // Point the hypervisor at the saved bytes so the original instruction
    // runs in place of the injected one.
    if let Some(int) = event.interrupt_mut() {
        int.emul_insn = Some(bp.saved.get());
    }
    Response::SET_EMUL_INSN
}

fn on_event_cleared(_vm: &dyn Introspect, _event: &mut Event, cleared: bool) {
    if cleared {
        tracing::debug!("breakpoint event cleared");
    } else {
        tracing::warn!("hypervisor failed to clear the breakpoint event");
    }
}
