use std::{borrow::Cow, cell::Cell, convert::Infallible, io, rc::Rc};

use crate::emitter::{Emitter, ListenerId};

/// The listener key meaning "any signal".
pub const ANY_SIGNAL: i32 = 0;

/// A signal listener. Runs inside the signal handler, so it is limited to
/// async-signal-safe work; the canonical listener calls
/// [`EventLoop::stop`], which only writes an atomic slot.
///
/// [`EventLoop::stop`]: crate::EventLoop::stop
pub type SignalListener = dyn Fn(i32);

thread_local! {
    static BRIDGE: SignalBridge = SignalBridge {
        listeners: Emitter::new(),
        installed: Cell::new(false),
        busy: Cell::new(false),
    };
}

/// Routes POSIX signals into the emitter machinery.
///
/// A singleton on the loop thread (the runtime is single-threaded by
/// contract). [`install`] hooks HUP, TERM, INT and ALRM; a caught signal
/// dispatches to the [`ANY_SIGNAL`] listeners and then to the listeners
/// of its own number, from inside the handler. Install and subscribe
/// before the first loop bump.
///
/// [`install`]: SignalBridge::install
pub struct SignalBridge {
    listeners: Emitter<i32, SignalListener>,
    installed: Cell<bool>,
    // Set while the listener table is being mutated or a delivery is in
    // progress; a signal landing in that window is dropped rather than
    // re-entering the table.
    busy: Cell<bool>,
}

impl SignalBridge {
    /// Grants access to the thread's bridge.
    pub fn with<R>(f: impl FnOnce(&SignalBridge) -> R) -> R {
        BRIDGE.with(f)
    }

    /// Installs the process signal handlers. Idempotent.
    pub fn install(&self) -> io::Result<()> {
        if self.installed.get() {
            return Ok(());
        }

        for signal in [libc::SIGHUP, libc::SIGTERM, libc::SIGINT, libc::SIGALRM] {
            // SAFETY: a zeroed sigaction with the fields below filled in
            // is a valid argument, and `handle_signal` is async-signal-safe
            // within the limits documented on `SignalListener`.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = handle_signal as libc::sighandler_t;
                action.sa_flags = 0;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }

        self.installed.set(true);
        tracing::debug!("signal handlers installed");
        Ok(())
    }

    /// Registers a permanent listener for `signal` ([`ANY_SIGNAL`] for
    /// every signal).
    pub fn on(
        &self,
        signal: i32,
        label: impl Into<Cow<'static, str>>,
        listener: Rc<SignalListener>,
    ) -> ListenerId {
        self.guarded(|| self.listeners.on(signal, label, listener))
    }

    /// Registers a one-shot listener for `signal`.
    pub fn once(
        &self,
        signal: i32,
        label: impl Into<Cow<'static, str>>,
        listener: Rc<SignalListener>,
    ) -> ListenerId {
        self.guarded(|| self.listeners.once(signal, label, listener))
    }

    /// Removes one listener, or all listeners for `signal`.
    pub fn off(&self, signal: i32, id: Option<ListenerId>) -> bool {
        self.guarded(|| self.listeners.off(signal, id))
    }

    fn guarded<R>(&self, f: impl FnOnce() -> R) -> R {
        self.busy.set(true);
        let result = f();
        self.busy.set(false);
        result
    }

    fn deliver(&self, signal: i32) {
        if self.busy.get() {
            // The signal interrupted a table mutation on this thread;
            // delivering now would re-enter it.
            return;
        }
        self.busy.set(true);
        self.listeners.emit_with(ANY_SIGNAL, |l| {
            l(signal);
            Ok::<(), Infallible>(())
        });
        if signal != ANY_SIGNAL {
            self.listeners.emit_with(signal, |l| {
                l(signal);
                Ok::<(), Infallible>(())
            });
        }
        self.busy.set(false);
    }
}

extern "C" fn handle_signal(signal: libc::c_int) {
    BRIDGE.with(|bridge| bridge.deliver(signal));
}
