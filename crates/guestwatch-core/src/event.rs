use std::{
    any::Any,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{Error, Gfn, Introspect, Va, VcpuId, View};

/// The longest possible x86-64 instruction, in bytes.
pub const MAX_INSN_LEN: usize = 15;

bitflags::bitflags! {
    /// Guest-physical memory access types, used both as an interception
    /// mask when registering a memory event and to describe the access
    /// that actually occurred.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct MemAccess: u8 {
        /// Read access.
        const R = 1 << 0;
        /// Write access.
        const W = 1 << 1;
        /// Execute access.
        const X = 1 << 2;
    }
}

impl std::fmt::Display for MemAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Self::R) { 'r' } else { '-' },
            if self.contains(Self::W) { 'w' } else { '-' },
            if self.contains(Self::X) { 'x' } else { '-' },
        )
    }
}

bitflags::bitflags! {
    /// Flags a handler returns to the hypervisor in response to an event.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Response: u8 {
        /// Apply the view stored in [`Event::slat`] to the event's vCPU
        /// when the handler returns.
        const SET_SLAT = 1 << 0;
        /// Toggle single-step mode on the event's vCPU.
        const TOGGLE_SINGLESTEP = 1 << 1;
        /// Execute the instruction stored in the interrupt variant's
        /// emulation buffer instead of the trapped one.
        const SET_EMUL_INSN = 1 << 2;
    }
}

/// A buffer the hypervisor executes in place of a trapped instruction.
///
/// Holds the original bytes a breakpoint replaced; only the leading
/// instruction is consumed by the emulator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmulInsn {
    /// Raw instruction bytes.
    pub bytes: [u8; MAX_INSN_LEN],
}

/// Payload of an intercepted memory access.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryEvent {
    /// Frame the event is registered on / the access hit.
    pub gfn: Gfn,
    /// Linear address of the access (filled at delivery).
    pub gla: Va,
    /// Access types being intercepted (set at registration).
    pub in_access: MemAccess,
    /// The access that occurred (filled at delivery).
    pub out_access: MemAccess,
}

/// Payload of an intercepted interrupt (INT3).
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptEvent {
    /// Linear address of the trapping instruction.
    pub gla: Va,
    /// Frame of the trapping instruction.
    pub gfn: Gfn,
    /// When set, the hypervisor delivers the interrupt to the guest as if
    /// it had not been observed.
    pub reinject: bool,
    /// Instruction to emulate when the response carries
    /// [`Response::SET_EMUL_INSN`].
    pub emul_insn: Option<EmulInsn>,
}

/// Payload of a single-step completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinglestepEvent {
    /// Linear address of the retired instruction.
    pub gla: Va,
    /// Frame of the retired instruction.
    pub gfn: Gfn,
    /// Bitmask of vCPUs to intercept on (set at registration).
    pub vcpu_mask: u64,
    /// Whether stepping starts as soon as the event is registered.
    pub enable_on_register: bool,
}

/// Payload of a monitored-register write.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterEvent {
    /// New value written to the register.
    pub new_value: u64,
    /// Previous value of the register.
    pub old_value: u64,
}

/// Payload of a CPUID interception.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuIdEvent {
    /// CPUID leaf (EAX).
    pub leaf: u32,
    /// CPUID subleaf (ECX).
    pub subleaf: u32,
}

/// Payload of a debug exception interception.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugEvent {
    /// Linear address of the trapping instruction.
    pub gla: Va,
    /// When set, the exception is handed back to the guest.
    pub reinject: bool,
}

/// Payload of a descriptor-table access interception.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorAccessEvent {
    /// Linear address of the access.
    pub gla: Va,
}

/// Payload of a domain lifecycle notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct DomainWatchEvent {
    /// Whether the domain is shutting down.
    pub shutting_down: bool,
}

/// What an event intercepts, and the payload delivered when it fires.
///
/// Polymorphism over event kinds is a tagged variant, not a class
/// hierarchy; handlers match on the variant they registered for and treat
/// anything else as misrouted.
#[derive(Debug, Clone, Copy)]
pub enum EventKind {
    /// R/W/X access to a monitored guest frame.
    Memory(MemoryEvent),
    /// Software interrupt (INT3).
    Interrupt(InterruptEvent),
    /// Single-step completion.
    Singlestep(SinglestepEvent),
    /// Monitored register write.
    Register(RegisterEvent),
    /// CPUID execution.
    CpuId(CpuIdEvent),
    /// Debug exception.
    Debug(DebugEvent),
    /// Guest-initiated request.
    GuestRequest,
    /// Privileged call.
    PrivilegedCall,
    /// Descriptor-table access.
    DescriptorAccess(DescriptorAccessEvent),
    /// Emulation failure notice.
    FailedEmulation,
    /// Domain lifecycle notice.
    DomainWatch(DomainWatchEvent),
    /// Unrecognized event.
    Invalid,
}

/// An event handler.
///
/// Handlers are plain functions; they recover their owning object through
/// the event's [`EventData`] envelope, mutate the event to communicate the
/// next view / reinject decision / emulation bytes, and return the
/// response flags.
pub type EventFn = fn(&dyn Introspect, &mut Event) -> Response;

/// Callback invoked once the hypervisor confirms a cleared event.
///
/// `cleared` is false when the clear request itself failed.
pub type OnCleared = fn(&dyn Introspect, &mut Event, cleared: bool);

/// An event as registered with, and delivered by, the hypervisor.
pub struct Event {
    /// What to intercept, and the delivered payload.
    pub kind: EventKind,
    /// View the event is registered on; handlers store the next view here
    /// before returning [`Response::SET_SLAT`].
    pub slat: View,
    /// vCPU the delivery occurred on (filled at delivery).
    pub vcpu: VcpuId,
    /// Envelope for recovering the owning object inside a handler.
    pub data: Option<EventData>,
    /// The handler.
    pub callback: EventFn,
}

impl Event {
    /// The memory payload, if this is a memory event.
    pub fn memory(&self) -> Option<&MemoryEvent> {
        match &self.kind {
            EventKind::Memory(m) => Some(m),
            _ => None,
        }
    }

    /// Mutable access to the memory payload.
    pub fn memory_mut(&mut self) -> Option<&mut MemoryEvent> {
        match &mut self.kind {
            EventKind::Memory(m) => Some(m),
            _ => None,
        }
    }

    /// The interrupt payload, if this is an interrupt event.
    pub fn interrupt(&self) -> Option<&InterruptEvent> {
        match &self.kind {
            EventKind::Interrupt(i) => Some(i),
            _ => None,
        }
    }

    /// Mutable access to the interrupt payload.
    pub fn interrupt_mut(&mut self) -> Option<&mut InterruptEvent> {
        match &mut self.kind {
            EventKind::Interrupt(i) => Some(i),
            _ => None,
        }
    }

    /// The single-step payload, if this is a single-step event.
    pub fn singlestep(&self) -> Option<&SinglestepEvent> {
        match &self.kind {
            EventKind::Singlestep(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable access to the single-step payload.
    pub fn singlestep_mut(&mut self) -> Option<&mut SinglestepEvent> {
        match &mut self.kind {
            EventKind::Singlestep(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("slat", &self.slat)
            .field("vcpu", &self.vcpu)
            .field("data", &self.data.as_ref().map(|d| d.sentinel))
            .finish_non_exhaustive()
    }
}

/// A process-unique tag identifying the payload type of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinel(u32);

static NEXT_SENTINEL: AtomicU32 = AtomicU32::new(1);

impl Sentinel {
    /// Allocates a fresh sentinel. Each payload type allocates exactly one
    /// and uses it for every envelope it attaches.
    pub fn next() -> Self {
        Self(NEXT_SENTINEL.fetch_add(1, Ordering::Relaxed))
    }
}

/// The envelope attached to every event the runtime registers.
///
/// Pairs a [`Sentinel`] with a non-owning reference to the payload (the
/// registry or table that owns the event), so that a handler given only
/// the event can recover its owner and reject misrouted deliveries.
pub struct EventData {
    sentinel: Sentinel,
    payload: Weak<dyn Any>,
}

impl EventData {
    /// Creates an envelope for `payload`.
    pub fn new<T: 'static>(sentinel: Sentinel, payload: Weak<T>) -> Self {
        let payload: Weak<dyn Any> = payload;
        Self { sentinel, payload }
    }

    /// The envelope's sentinel.
    pub fn sentinel(&self) -> Sentinel {
        self.sentinel
    }

    /// Recovers the typed payload of an event's envelope.
    ///
    /// Fails with [`Error::EventDataNull`] when the event carries no
    /// envelope (or the payload is gone), and with
    /// [`Error::EventDataSentinel`] when the sentinel does not match.
    pub fn recover<T: 'static>(expected: Sentinel, event: &Event) -> Result<Rc<T>, Error> {
        let data = event.data.as_ref().ok_or(Error::EventDataNull)?;
        if data.sentinel != expected {
            return Err(Error::EventDataSentinel {
                expected,
                found: data.sentinel,
            });
        }
        data.payload
            .upgrade()
            .and_then(|any| any.downcast::<T>().ok())
            .ok_or(Error::EventDataNull)
    }
}
