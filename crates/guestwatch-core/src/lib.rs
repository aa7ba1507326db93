//! Contracts and primitives for guest introspection runtimes.
//!
//! This crate defines the surface the `guestwatch` runtime is built
//! against: the [`Introspect`] trait (one live guest under a Xen-class
//! hypervisor), the [`ControlPlane`] contract for altp2m enablement,
//! typed address arithmetic, the tagged hypervisor event model with its
//! back-recovery envelope, typed guest-memory accessors, and the scoped
//! temporary memory patch.

mod addr;
mod error;
mod event;
mod introspect;
pub mod mem;
mod patch;
mod range;

pub use self::{
    addr::{Gfn, Pa, PageNum, Va, PAGE_SHIFT, PAGE_SIZE},
    error::{DriverError, Error, ReadAccess, Translation, WriteAccess},
    event::{
        CpuIdEvent, DebugEvent, DescriptorAccessEvent, DomainWatchEvent, EmulInsn, Event,
        EventData, EventFn, EventKind, InterruptEvent, MemAccess, MemoryEvent, OnCleared,
        RegisterEvent, Response, Sentinel, SinglestepEvent, MAX_INSN_LEN,
    },
    introspect::{
        AltP2mMode, ControlHandle, ControlPlane, DomainId, Introspect, Pid, Registers, VcpuId,
        View, KERNEL_PID,
    },
    patch::TempPatch,
    range::VirtRange,
};
