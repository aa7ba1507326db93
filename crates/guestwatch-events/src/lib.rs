//! Single-threaded event runtime for guest introspection.
//!
//! Builds the reactive half of `guestwatch` on top of the contracts in
//! [`guestwatch_core`]: an event loop that drives the hypervisor's
//! synchronous event API with cooperative pause-and-run checkpoints, a
//! software-breakpoint registry dispatching one capture-all INT3 handler,
//! a memory-access event subsystem built on two SLAT views and a
//! catch-all single-step handler, and a bridge routing POSIX signals into
//! the same listener machinery.
//!
//! Everything here runs on one thread. Event callbacks execute inline in
//! [`EventLoop::bump`]; structural changes (enabling, disabling,
//! registering, unregistering anything that produces traps) go through
//! [`EventLoop::schedule_pause`] so they never race in-flight events.

mod breakpoint;
mod emitter;
mod event_loop;
mod mem_event;
mod signal;

pub use self::{
    breakpoint::{
        Breakpoint, BreakpointError, BreakpointRegistry, OnHit, BREAKPOINT_OPCODE,
    },
    emitter::{Emitter, ListenerId},
    event_loop::{EventLoop, LoopError, LoopFault, PauseCallback, LISTEN_TIMEOUT},
    mem_event::{
        MemEvent, MemEventError, MemEventKey, MemEventListener, MemEventRegistry, RegistryInitOp,
        RegistryKey, RegistryListener,
    },
    signal::{SignalBridge, SignalListener, ANY_SIGNAL},
};
