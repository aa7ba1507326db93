use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::{Rc, Weak},
};

use guestwatch_core::{
    AltP2mMode, ControlHandle, ControlPlane, DriverError, Event, EventData, EventKind, Gfn,
    Introspect, MemAccess, MemoryEvent, Response, Sentinel, SinglestepEvent, Va, VcpuId, View,
};
use once_cell::sync::Lazy;

use crate::emitter::{Emitter, ListenerId};

static MEM_EVENT_SENTINEL: Lazy<Sentinel> = Lazy::new(Sentinel::next);
static ACTIVE_TABLE_SENTINEL: Lazy<Sentinel> = Lazy::new(Sentinel::next);

/// Listener keys of one [`MemEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemEventKey {
    /// Fires when the guest touches the restricted frame, before the
    /// access retires.
    Before,
    /// Fires after the instruction retired under the relaxed view.
    After,
    /// Fires once the hypervisor has confirmed the event cleared.
    Unregistered,
}

/// Listener keys of the [`MemEventRegistry`] itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistryKey {
    /// A memory event has been unregistered and removed from the
    /// registry. Carries the freed frame number.
    MemEventUnregistered,
}

type BoxError = Box<dyn std::error::Error>;

/// A listener on a memory event's keys.
pub type MemEventListener = dyn Fn(&dyn Introspect, &mut Event) -> Result<(), BoxError>;

/// A listener on the registry's keys.
pub type RegistryListener = dyn Fn(&dyn Introspect, Gfn) -> Result<(), BoxError>;

/// The step of [`MemEventRegistry::init`] an initialization failure
/// occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryInitOp {
    /// The double-initialization check.
    ReinitCheck,
    /// Opening the hypervisor control handle.
    ControlOpen,
    /// Reading the per-domain altp2m parameter.
    AltP2mGet,
    /// Writing the per-domain altp2m parameter.
    AltP2mSet,
    /// Enabling the alternate-view domain state.
    SlatDomainState,
    /// Creating the trap view.
    SlatCreate,
    /// Switching the domain to the trap view.
    SlatSwitch,
}

/// An error of the memory-event subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MemEventError {
    /// Registering the memory event with the hypervisor failed.
    #[error(
        "failed to register the memory event (are events enabled for this guest, \
         or is another memory event already on this frame?)"
    )]
    Registration {
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// Clearing the memory event failed.
    #[error("failed to unregister the memory event")]
    Unregistration {
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// A memory event already exists for the frame.
    #[error("a memory event is already registered on frame {gfn}")]
    FrameAlreadyRegistered {
        /// The contested frame.
        gfn: Gfn,
    },

    /// Registry initialization failed.
    #[error("memory event registry initialization failed ({op:?}): {msg}")]
    RegistryInit {
        /// The initialization step that failed.
        op: RegistryInitOp,
        /// What went wrong.
        msg: &'static str,
        /// The underlying primitive failure, when one exists.
        source: Option<DriverError>,
    },

    /// Registering the catch-all single-step event failed.
    #[error(
        "failed to register the single-step event (are events enabled for this \
         guest, or is another single-step user active?)"
    )]
    SinglestepRegistration {
        /// The underlying primitive failure.
        source: DriverError,
    },
}

/// Per-vCPU slots naming the memory event currently mid-step.
///
/// Attached (through the envelope) to the catch-all single-step event;
/// the slots are non-owning, the registry's frame map owns the events.
struct ActiveTable {
    slots: RefCell<Vec<Option<Weak<MemEvent>>>>,
}

impl ActiveTable {
    fn new(vcpus: u32) -> Rc<Self> {
        Rc::new(Self {
            slots: RefCell::new(vec![None; vcpus as usize]),
        })
    }

    fn set_active(&self, vcpu: VcpuId, event: &Rc<MemEvent>) {
        self.slots.borrow_mut()[vcpu.0 as usize] = Some(Rc::downgrade(event));
    }

    fn set_done(&self, vcpu: VcpuId) {
        self.slots.borrow_mut()[vcpu.0 as usize] = None;
    }

    fn active(&self, vcpu: VcpuId) -> Option<Rc<MemEvent>> {
        self.slots
            .borrow()
            .get(vcpu.0 as usize)?
            .as_ref()?
            .upgrade()
    }

    /// Frames of events still mid-step, for teardown diagnostics.
    fn mid_step_frames(&self) -> Vec<Gfn> {
        self.slots
            .borrow()
            .iter()
            .flatten()
            .filter_map(|weak| weak.upgrade())
            .map(|event| event.gfn())
            .collect()
    }
}

/// A memory-access event on one guest frame.
///
/// Created and owned by the [`MemEventRegistry`]; at most one exists per
/// frame. Each intercepted access fires [`MemEventKey::Before`], then the
/// instruction transparently retires under the relaxed view while
/// single-stepping, then [`MemEventKey::After`] fires and the vCPU
/// returns to the trap view.
pub struct MemEvent {
    vm: Rc<dyn Introspect>,
    gfn: Gfn,
    okay: View,
    trap: View,
    active: Rc<ActiveTable>,
    event: Rc<RefCell<Event>>,
    registered: Cell<bool>,
    pending_unregister: Cell<bool>,
    listeners: Emitter<MemEventKey, MemEventListener>,
}

impl MemEvent {
    fn new(
        vm: Rc<dyn Introspect>,
        okay: View,
        trap: View,
        active: Rc<ActiveTable>,
        gfn: Gfn,
        access: MemAccess,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<MemEvent>| {
            let event = Event {
                kind: EventKind::Memory(MemoryEvent {
                    gfn,
                    gla: Va(0),
                    in_access: access,
                    out_access: MemAccess::empty(),
                }),
                slat: trap,
                vcpu: VcpuId(0),
                data: Some(EventData::new(*MEM_EVENT_SENTINEL, weak.clone())),
                callback: on_access,
            };
            Self {
                vm,
                gfn,
                okay,
                trap,
                active,
                event: Rc::new(RefCell::new(event)),
                registered: Cell::new(false),
                pending_unregister: Cell::new(false),
                listeners: Emitter::new(),
            }
        })
    }

    /// The frame this event intercepts.
    pub fn gfn(&self) -> Gfn {
        self.gfn
    }

    /// Whether the event is registered with the hypervisor.
    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    /// Registers a permanent listener.
    pub fn on(
        &self,
        key: MemEventKey,
        label: impl Into<std::borrow::Cow<'static, str>>,
        listener: Rc<MemEventListener>,
    ) -> ListenerId {
        self.listeners.on(key, label, listener)
    }

    /// Registers a one-shot listener.
    pub fn once(
        &self,
        key: MemEventKey,
        label: impl Into<std::borrow::Cow<'static, str>>,
        listener: Rc<MemEventListener>,
    ) -> ListenerId {
        self.listeners.once(key, label, listener)
    }

    /// Removes one listener, or all listeners for `key`.
    pub fn off(&self, key: MemEventKey, id: Option<ListenerId>) -> bool {
        self.listeners.off(key, id)
    }

    /// Schedules asynchronous unregistration.
    ///
    /// The actual clear happens on the next single-step for this event;
    /// [`MemEventKey::Unregistered`] fires once the hypervisor confirms.
    pub fn schedule_unregister(&self) {
        self.pending_unregister.set(true);
    }

    /// Registers the event; the trap view's permission on the frame
    /// becomes restricted as soon as the hypervisor accepts.
    fn register(&self) -> Result<(), MemEventError> {
        tracing::debug!(gfn = %self.gfn, trap = %self.trap, "registering memory event");
        self.vm
            .register_event(Rc::clone(&self.event))
            .map_err(|source| MemEventError::Registration { source })?;
        self.registered.set(true);
        Ok(())
    }

    /// Requests the hypervisor to clear the event. Idempotent.
    fn unregister_now(&self, vm: &dyn Introspect) -> Result<(), MemEventError> {
        if !self.registered.get() {
            return Ok(());
        }
        tracing::debug!(gfn = %self.gfn, "unregistering memory event");
        self.registered.set(false);
        // Make sure the clear operates on the trap view, where the
        // restriction lives.
        self.event.borrow_mut().slat = self.trap;
        vm.clear_event(Rc::clone(&self.event), Some(on_cleared))
            .map_err(|source| MemEventError::Unregistration { source })
    }

    /// Best-effort clear for the drop path; no confirmation callback, the
    /// object is going away.
    fn try_unregister(&self) {
        if !self.registered.get() {
            return;
        }
        self.registered.set(false);
        self.event.borrow_mut().slat = self.trap;
        if let Err(err) = self.vm.clear_event(Rc::clone(&self.event), None) {
            tracing::debug!(gfn = %self.gfn, %err, "failed to clear memory event on drop");
        }
    }
}

impl std::fmt::Debug for MemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemEvent")
            .field("gfn", &self.gfn)
            .field("registered", &self.registered.get())
            .field("pending_unregister", &self.pending_unregister.get())
            .finish_non_exhaustive()
    }
}

impl Drop for MemEvent {
    fn drop(&mut self) {
        self.try_unregister();
    }
}

/// The before-access handler, registered per memory event.
fn on_access(vm: &dyn Introspect, event: &mut Event) -> Response {
    let me = match EventData::recover::<MemEvent>(*MEM_EVENT_SENTINEL, event) {
        Ok(me) => me,
        Err(err) => {
            tracing::error!(%err, "memory event with a foreign envelope");
            return Response::empty();
        }
    };

    let vcpu = event.vcpu;
    me.listeners
        .emit_with(MemEventKey::Before, |l| l(vm, &mut *event));

    // The instruction now retires under the relaxed view with
    // single-stepping armed; the catch-all handler finishes the exchange.
    me.active.set_active(vcpu, &me);
    event.slat = me.okay;
    Response::SET_SLAT | Response::TOGGLE_SINGLESTEP
}

/// The after-access handler, registered once as the catch-all
/// single-step event of the registry.
fn on_singlestep(vm: &dyn Introspect, event: &mut Event) -> Response {
    let table = match EventData::recover::<ActiveTable>(*ACTIVE_TABLE_SENTINEL, event) {
        Ok(table) => table,
        Err(err) => {
            tracing::error!(%err, "single-step event with a foreign envelope");
            return Response::empty();
        }
    };

    let vcpu = event.vcpu;
    let me = match table.active(vcpu) {
        Some(me) => me,
        None => {
            // A step this subsystem did not arm. No other single-step
            // user is supported on the domain; shed it.
            tracing::error!(vcpu = vcpu.0, "single-step event with no active memory event");
            return Response::TOGGLE_SINGLESTEP;
        }
    };

    me.listeners
        .emit_with(MemEventKey::After, |l| l(vm, &mut *event));
    table.set_done(vcpu);

    if me.pending_unregister.get() {
        if let Err(err) = me.unregister_now(vm) {
            tracing::warn!(gfn = %me.gfn, %err, "failed to unregister memory event");
        }
        // Resume without trapping this frame again.
        return Response::TOGGLE_SINGLESTEP;
    }

    event.slat = me.trap;
    Response::SET_SLAT | Response::TOGGLE_SINGLESTEP
}

/// Runs once the hypervisor confirms a memory event cleared.
fn on_cleared(vm: &dyn Introspect, event: &mut Event, cleared: bool) {
    if !cleared {
        tracing::warn!("hypervisor failed to clear a memory event");
    }
    let me = match EventData::recover::<MemEvent>(*MEM_EVENT_SENTINEL, event) {
        Ok(me) => me,
        Err(err) => {
            tracing::error!(%err, "cleared memory event with a foreign envelope");
            return;
        }
    };

    let heard = me
        .listeners
        .emit_with(MemEventKey::Unregistered, |l| l(vm, &mut *event));
    if heard == 0 {
        tracing::warn!(
            gfn = %me.gfn,
            "nobody is listening for the memory event unregistration; \
             the registry is expected to listen and drop the event"
        );
    }
}

/// Owner of the memory events of one guest.
///
/// [`init`] sets up the machinery once: a hypervisor control handle,
/// altp2m in external mode, a catch-all single-step event, and a second
/// SLAT view (the *trap* view) the domain is switched to. The default
/// view (id 0) is kept untouched as the *okay* view; only the trap view's
/// permissions ever differ.
///
/// [`init`]: MemEventRegistry::init
pub struct MemEventRegistry {
    vm: Rc<dyn Introspect>,
    control_plane: Box<dyn ControlPlane>,
    control: RefCell<Option<Box<dyn ControlHandle>>>,
    okay: Cell<View>,
    trap: Cell<View>,
    ss_event: RefCell<Option<Rc<RefCell<Event>>>>,
    active: Rc<ActiveTable>,
    frames: Rc<RefCell<BTreeMap<Gfn, Rc<MemEvent>>>>,
    listeners: Rc<Emitter<RegistryKey, RegistryListener>>,
}

impl MemEventRegistry {
    /// Creates an uninitialized registry for one guest.
    pub fn new(vm: Rc<dyn Introspect>, control_plane: Box<dyn ControlPlane>) -> Self {
        let active = ActiveTable::new(vm.vcpu_count());
        Self {
            vm,
            control_plane,
            control: RefCell::new(None),
            okay: Cell::new(View(0)),
            trap: Cell::new(View(0)),
            ss_event: RefCell::new(None),
            active,
            frames: Rc::new(RefCell::new(BTreeMap::new())),
            listeners: Rc::new(Emitter::new()),
        }
    }

    /// Prepares the guest for memory events.
    ///
    /// In order: rejects double initialization, opens the control handle,
    /// registers the catch-all single-step event on all vCPUs, enables
    /// altp2m for the domain (a guest stuck in the limited flavor needs a
    /// reboot), and creates and switches to the trap view.
    pub fn init(&self) -> Result<(), MemEventError> {
        if self.control.borrow().is_some() {
            return Err(MemEventError::RegistryInit {
                op: RegistryInitOp::ReinitCheck,
                msg: "the registry is already initialized",
                source: None,
            });
        }

        let control = self.control_plane.open().map_err(|source| {
            MemEventError::RegistryInit {
                op: RegistryInitOp::ControlOpen,
                msg: "failed to open the hypervisor control handle \
                      (is altp2m enabled on the hypervisor command line?)",
                source: Some(source),
            }
        })?;
        *self.control.borrow_mut() = Some(control);

        self.register_singlestep()?;
        self.enable_altp2m()?;
        self.create_trap_view()
    }

    /// Registers the catch-all single-step event on every vCPU, initially
    /// not stepping.
    fn register_singlestep(&self) -> Result<(), MemEventError> {
        let vcpus = self.vm.vcpu_count();
        let vcpu_mask = if vcpus >= u64::BITS {
            u64::MAX
        } else {
            (1u64 << vcpus) - 1
        };

        let event = Rc::new(RefCell::new(Event {
            kind: EventKind::Singlestep(SinglestepEvent {
                gla: Va(0),
                gfn: Gfn(0),
                vcpu_mask,
                enable_on_register: false,
            }),
            slat: View(0),
            vcpu: VcpuId(0),
            data: Some(EventData::new(
                *ACTIVE_TABLE_SENTINEL,
                Rc::downgrade(&self.active),
            )),
            callback: on_singlestep,
        }));

        self.vm
            .register_event(Rc::clone(&event))
            .map_err(|source| MemEventError::SinglestepRegistration { source })?;

        *self.ss_event.borrow_mut() = Some(event);
        Ok(())
    }

    /// Moves the domain's altp2m parameter to the external flavor and
    /// flips the domain state on.
    fn enable_altp2m(&self) -> Result<(), MemEventError> {
        let domain = self.vm.domain_id();

        {
            let control = self.control.borrow();
            let Some(control) = control.as_deref() else {
                return Err(MemEventError::RegistryInit {
                    op: RegistryInitOp::AltP2mGet,
                    msg: "the control handle is gone",
                    source: None,
                });
            };

            let mode = control.altp2m_mode(domain).map_err(|source| {
                MemEventError::RegistryInit {
                    op: RegistryInitOp::AltP2mGet,
                    msg: "failed to read the altp2m parameter",
                    source: Some(source),
                }
            })?;

            match mode {
                AltP2mMode::Limited => {
                    // The parameter can only be set once per guest boot.
                    return Err(MemEventError::RegistryInit {
                        op: RegistryInitOp::AltP2mSet,
                        msg: "altp2m is set to the limited flavor, reboot the guest",
                        source: None,
                    });
                }
                AltP2mMode::Disabled => {
                    control
                        .set_altp2m_mode(domain, AltP2mMode::External)
                        .map_err(|source| MemEventError::RegistryInit {
                            op: RegistryInitOp::AltP2mSet,
                            msg: "failed to set the altp2m parameter \
                                  (is altp2m enabled on the hypervisor command line?)",
                            source: Some(source),
                        })?;
                }
                AltP2mMode::External => {}
            }
        }

        self.vm.set_view_domain_state(true).map_err(|source| {
            MemEventError::RegistryInit {
                op: RegistryInitOp::SlatDomainState,
                msg: "failed to enable the alternate-view domain state, \
                      try rebooting the guest",
                source: Some(source),
            }
        })
    }

    /// Creates the trap view and switches the domain to it.
    fn create_trap_view(&self) -> Result<(), MemEventError> {
        let trap = self
            .vm
            .create_view()
            .map_err(|source| MemEventError::RegistryInit {
                op: RegistryInitOp::SlatCreate,
                msg: "failed to create the trap view",
                source: Some(source),
            })?;

        // The hypervisor default view keeps normal permissions.
        self.okay.set(View(0));
        self.trap.set(trap);
        tracing::debug!(%trap, "created trap view");

        self.vm
            .switch_view(trap)
            .map_err(|source| MemEventError::RegistryInit {
                op: RegistryInitOp::SlatSwitch,
                msg: "failed to switch the domain to the trap view",
                source: Some(source),
            })
    }

    /// The relaxed view (the hypervisor default).
    pub fn okay_view(&self) -> View {
        self.okay.get()
    }

    /// The restricted view observed frames trap on.
    pub fn trap_view(&self) -> View {
        self.trap.get()
    }

    /// Registers an R/W memory event on `gfn`.
    ///
    /// The trap view's permission on the frame becomes restricted as soon
    /// as the hypervisor accepts the registration. Fails with
    /// [`MemEventError::FrameAlreadyRegistered`] if the frame already has
    /// an event.
    pub fn register_for_gfn(&self, gfn: Gfn) -> Result<Rc<MemEvent>, MemEventError> {
        let me = {
            let mut frames = self.frames.borrow_mut();
            if frames.contains_key(&gfn) {
                return Err(MemEventError::FrameAlreadyRegistered { gfn });
            }
            let me = MemEvent::new(
                Rc::clone(&self.vm),
                self.okay.get(),
                self.trap.get(),
                Rc::clone(&self.active),
                gfn,
                MemAccess::R | MemAccess::W,
            );
            frames.insert(gfn, Rc::clone(&me));
            me
        };

        if let Err(err) = me.register() {
            self.frames.borrow_mut().remove(&gfn);
            return Err(err);
        }
        Ok(me)
    }

    /// Schedules the memory event on `gfn` for unregistration.
    ///
    /// Returns false when no event is registered on the frame. The
    /// removal happens later, once the hypervisor confirms the frame is
    /// no longer trapped; the registry then emits
    /// [`RegistryKey::MemEventUnregistered`].
    pub fn unregister_for_gfn(&self, gfn: Gfn) -> bool {
        let me = match self.frames.borrow().get(&gfn) {
            Some(me) => Rc::clone(me),
            None => return false,
        };

        let frames = Rc::downgrade(&self.frames);
        let listeners = Rc::clone(&self.listeners);
        let remove: Rc<MemEventListener> = Rc::new(move |vm: &dyn Introspect, _: &mut Event| {
            if let Some(frames) = frames.upgrade() {
                if frames.borrow_mut().remove(&gfn).is_none() {
                    tracing::warn!(
                        %gfn,
                        "memory event was already removed from the registry"
                    );
                }
            }
            listeners.emit_with(RegistryKey::MemEventUnregistered, |l| l(vm, gfn));
            Ok(())
        });
        me.once(MemEventKey::Unregistered, "registry:remove-frame", remove);

        me.schedule_unregister();
        true
    }

    /// The memory event registered on `gfn`, if any.
    pub fn for_gfn(&self, gfn: Gfn) -> Option<Rc<MemEvent>> {
        self.frames.borrow().get(&gfn).cloned()
    }

    /// Registers a permanent listener on the registry.
    pub fn on(
        &self,
        key: RegistryKey,
        label: impl Into<std::borrow::Cow<'static, str>>,
        listener: Rc<RegistryListener>,
    ) -> ListenerId {
        self.listeners.on(key, label, listener)
    }

    /// Registers a one-shot listener on the registry.
    pub fn once(
        &self,
        key: RegistryKey,
        label: impl Into<std::borrow::Cow<'static, str>>,
        listener: Rc<RegistryListener>,
    ) -> ListenerId {
        self.listeners.once(key, label, listener)
    }

    /// Removes one registry listener, or all for `key`.
    pub fn off(&self, key: RegistryKey, id: Option<ListenerId>) -> bool {
        self.listeners.off(key, id)
    }
}

impl Drop for MemEventRegistry {
    fn drop(&mut self) {
        tracing::debug!("tearing down the memory event registry");

        if let Some(mut control) = self.control.borrow_mut().take() {
            if let Err(err) = control.close() {
                tracing::debug!(%err, "failed to close the control handle");
            }
        }

        if let Err(err) = self.vm.switch_view(self.okay.get()) {
            tracing::debug!(%err, "failed to switch back to the okay view");
        }

        let trap = self.trap.get();
        if trap != View(0) {
            if let Err(err) = self.vm.destroy_view(trap) {
                tracing::debug!(%trap, %err, "failed to destroy the trap view");
            }
            self.trap.set(View(0));
        }

        if let Some(event) = self.ss_event.borrow_mut().take() {
            if let Err(err) = self.vm.clear_event(event, None) {
                tracing::debug!(%err, "failed to clear the single-step event");
            }
        }

        for gfn in self.active.mid_step_frames() {
            tracing::warn!(
                %gfn,
                "registry destroyed while a memory event is mid-step; \
                 a single-step event is still owed"
            );
        }
        for (gfn, me) in self.frames.borrow().iter() {
            if me.is_registered() {
                tracing::warn!(
                    %gfn,
                    "registry destroyed with a registered memory event; \
                     unregister all memory events before dropping the registry"
                );
            }
        }
    }
}
