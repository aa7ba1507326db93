use std::{
    cell::{Cell, RefCell},
    ptr,
    rc::Rc,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
    time::Duration,
};

use guestwatch_core::{DriverError, Introspect};

/// How long one listen call blocks waiting for events.
///
/// Also bounds how long a stop request can go unnoticed.
pub const LISTEN_TIMEOUT: Duration = Duration::from_millis(500);

type BoxError = Box<dyn std::error::Error>;

/// A callback queued through [`EventLoop::schedule_pause`].
///
/// Runs after the guest has been paused and the event queue drained. The
/// loop does not resume the guest afterwards; the callback arranges
/// resumption (or requests a stop).
pub type PauseCallback = Box<dyn FnOnce() -> Result<(), BoxError>>;

/// A terminal failure of the event loop.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// The listen primitive failed.
    #[error("failed to listen for events")]
    Listen {
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// Pausing the guest, or listening while draining the queue for a
    /// pause request, failed.
    #[error("failed to pause the event loop")]
    Pause {
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// The pending-event count could not be queried.
    #[error("failed to get the number of pending events")]
    GetPending {
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// A stop was requested while draining for a pause request; the pause
    /// callback did not run.
    #[error("the event loop is stopping")]
    Stopping,

    /// The pause callback failed.
    #[error("the pause callback failed")]
    PauseCallback {
        /// The error the callback returned.
        source: BoxError,
    },

    /// Another pause request is already queued or running.
    #[error("a pause request is already in flight")]
    PausePending,

    /// [`EventLoop::bump`] was called after a terminal error.
    #[error("bump called after a terminal error")]
    BumpAfterError,
}

/// The kind of a stored terminal error, queryable after `bump` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFault {
    /// See [`LoopError::Listen`].
    Listen,
    /// See [`LoopError::Pause`].
    Pause,
    /// See [`LoopError::GetPending`].
    GetPending,
    /// See [`LoopError::Stopping`].
    Stopping,
    /// See [`LoopError::PauseCallback`].
    PauseCallback,
}

impl LoopError {
    /// The storable kind of this error; `None` for the non-terminal
    /// request failures.
    fn fault(&self) -> Option<LoopFault> {
        match self {
            Self::Listen { .. } => Some(LoopFault::Listen),
            Self::Pause { .. } => Some(LoopFault::Pause),
            Self::GetPending { .. } => Some(LoopFault::GetPending),
            Self::Stopping => Some(LoopFault::Stopping),
            Self::PauseCallback { .. } => Some(LoopFault::PauseCallback),
            Self::PausePending | Self::BumpAfterError => None,
        }
    }
}

/// One-shot slot for the stop reason. First writer wins.
///
/// Kept lock-free so [`EventLoop::stop`] is callable from a signal
/// handler. The pointer is published before the length; a handler that
/// interrupts the gap observes an empty reason, never a torn one, and the
/// loop is single-threaded otherwise.
struct StopSlot {
    ptr: AtomicPtr<u8>,
    len: AtomicUsize,
}

impl StopSlot {
    const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    fn request(&self, who: &'static str) -> bool {
        let claimed = self
            .ptr
            .compare_exchange(
                ptr::null_mut(),
                who.as_ptr() as *mut u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            self.len.store(who.len(), Ordering::Release);
        }
        claimed
    }

    fn get(&self) -> Option<&'static str> {
        let ptr = self.ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        let len = self.len.load(Ordering::Acquire);
        // The pointer only ever comes from a `&'static str` in `request`.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        Some(unsafe { std::str::from_utf8_unchecked(bytes) })
    }
}

/// The single-threaded event loop for one guest.
///
/// [`bump`] drives the hypervisor's synchronous event API until a stop is
/// requested or a terminal error occurs. Structural changes to the trap
/// machinery are serialized against in-flight events through
/// [`schedule_pause`]: the loop pauses the guest, drains the queue, and
/// only then runs the queued callback. Events that have already been
/// raised by the guest are otherwise indistinguishable from ones induced
/// by the change itself.
///
/// [`bump`]: EventLoop::bump
/// [`schedule_pause`]: EventLoop::schedule_pause
pub struct EventLoop {
    vm: Rc<dyn Introspect>,
    pending_pause: RefCell<Option<(PauseCallback, &'static str)>>,
    pause_in_flight: Cell<bool>,
    fault: Cell<Option<LoopFault>>,
    stop: StopSlot,
    guest_paused: Cell<bool>,
}

impl EventLoop {
    /// Creates a loop bound to one guest.
    pub fn new(vm: Rc<dyn Introspect>) -> Self {
        Self {
            vm,
            pending_pause: RefCell::new(None),
            pause_in_flight: Cell::new(false),
            fault: Cell::new(None),
            stop: StopSlot::new(),
            guest_paused: Cell::new(false),
        }
    }

    /// Runs the loop until a stop is requested or a terminal error occurs.
    ///
    /// Per iteration: a queued pause request is handled first; otherwise
    /// one listen call with [`LISTEN_TIMEOUT`] dispatches pending events
    /// inline on this thread. The first terminal error is stored and
    /// returned; a clean stop returns `Ok`.
    pub fn bump(&self) -> Result<(), LoopError> {
        if self.fault.get().is_some() {
            return Err(LoopError::BumpAfterError);
        }
        tracing::debug!("bumping the event loop");

        loop {
            if let Some(who) = self.stop.get() {
                tracing::debug!(who, "event loop stopping");
                return Ok(());
            }

            let pending = self.pending_pause.borrow_mut().take();
            match pending {
                Some((callback, who)) => {
                    tracing::debug!(who, "handling pause request");
                    self.pause_in_flight.set(true);
                    let result = self.handle_pause(callback);
                    self.pause_in_flight.set(false);
                    if let Err(err) = result {
                        return Err(self.fail(err));
                    }
                }
                None => {
                    if let Err(source) = self.vm.listen(LISTEN_TIMEOUT) {
                        return Err(self.fail(LoopError::Listen { source }));
                    }
                }
            }
        }
    }

    /// Pauses the guest, drains the event queue, and invokes `callback`.
    fn handle_pause(&self, callback: PauseCallback) -> Result<(), LoopError> {
        self.vm
            .pause()
            .map_err(|source| LoopError::Pause { source })?;
        self.guest_paused.set(true);

        loop {
            let pending = self
                .vm
                .events_pending()
                .map_err(|source| LoopError::GetPending { source })?;
            if pending == 0 {
                break;
            }
            tracing::debug!(pending, "draining events before the pause callback");
            self.vm
                .listen(LISTEN_TIMEOUT)
                .map_err(|source| LoopError::Pause { source })?;
        }

        if self.stop.get().is_some() {
            // Someone requested a stop while we were draining; the
            // callback must not run.
            return Err(LoopError::Stopping);
        }

        callback().map_err(|source| LoopError::PauseCallback { source })
    }

    /// Records the first terminal error.
    fn fail(&self, err: LoopError) -> LoopError {
        if self.fault.get().is_none() {
            self.fault.set(err.fault());
        }
        err
    }

    /// Queues `callback` to run inside the loop once the guest is paused
    /// and the event queue drained.
    ///
    /// `who` names the requester for diagnostics. Fails with
    /// [`LoopError::PausePending`] while another pause request is queued
    /// or running; only one may be in flight.
    pub fn schedule_pause(
        &self,
        callback: PauseCallback,
        who: &'static str,
    ) -> Result<(), LoopError> {
        if self.pause_in_flight.get() || self.pending_pause.borrow().is_some() {
            return Err(LoopError::PausePending);
        }
        tracing::debug!(who, "pause requested");
        *self.pending_pause.borrow_mut() = Some((callback, who));
        Ok(())
    }

    /// Requests the loop to stop. The first request wins; later ones are
    /// ignored. Takes effect within one listen timeout.
    ///
    /// Callable from code running inside [`bump`] or from a signal
    /// handler: it only writes the stop slot.
    ///
    /// [`bump`]: EventLoop::bump
    pub fn stop(&self, who: &'static str) {
        self.stop.request(who);
    }

    /// Who requested the stop, if anyone.
    pub fn stop_requested_by(&self) -> Option<&'static str> {
        self.stop.get()
    }

    /// Whether a terminal error has been stored.
    pub fn has_error(&self) -> bool {
        self.fault.get().is_some()
    }

    /// The kind of the stored terminal error, if any. The full error was
    /// returned by the failing [`bump`] call.
    ///
    /// [`bump`]: EventLoop::bump
    pub fn error_kind(&self) -> Option<LoopFault> {
        self.fault.get()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // A pause callback that stopped the loop may have left the guest
        // paused. Unpausing a running domain is harmless.
        if self.guest_paused.get() {
            if let Err(err) = self.vm.resume() {
                tracing::warn!(%err, "failed to resume the guest on loop drop");
            }
        }
    }
}
