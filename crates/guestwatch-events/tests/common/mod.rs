//! A scripted in-process guest backend for the integration tests.
//!
//! Simulates enough of a Xen-class hypervisor to exercise the runtime end
//! to end: page-granular memory behind a kernel mapping, a symbol table,
//! registered events, per-vCPU views and single-step arming, and a
//! scripted stream of instruction fetches and memory accesses. An INT3
//! event is only delivered when the byte at the executed address really
//! is `0xCC`, so breakpoint injection and restoration are observable in
//! the fake memory.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use guestwatch_core::{
    AltP2mMode, ControlHandle, ControlPlane, DomainId, DriverError, Event, EventKind, Gfn,
    Introspect, MemAccess, OnCleared, Pa, PageNum, Pid, Registers, Response, Va, VcpuId, View,
    PAGE_SIZE,
};

/// Call at the top of a test to see the runtime's tracing output under
/// `cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One step of the scripted guest.
pub enum GuestOp {
    /// A vCPU executes the instruction at `va`.
    Exec { vcpu: VcpuId, va: Va },
    /// A vCPU performs a data access at `va`.
    Access {
        vcpu: VcpuId,
        va: Va,
        access: MemAccess,
    },
    /// Several steps happen before any event is handled.
    Batch(Vec<GuestOp>),
    /// A POSIX signal is raised on the listening thread.
    Raise(i32),
}

enum Delivery {
    Int3 { vcpu: VcpuId, gla: Va, gfn: Gfn },
    Mem {
        vcpu: VcpuId,
        gfn: Gfn,
        gla: Va,
        access: MemAccess,
    },
    Step { vcpu: VcpuId, gla: Va, gfn: Gfn },
}

pub struct FakeXen {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    mapping: RefCell<HashMap<PageNum, Gfn>>,
    symbols: RefCell<HashMap<String, Va>>,
    offsets: RefCell<HashMap<String, u64>>,
    vcpus: u32,
    paused: Cell<bool>,

    interrupt_event: RefCell<Option<Rc<RefCell<Event>>>>,
    ss_event: RefCell<Option<Rc<RefCell<Event>>>>,
    mem_events: RefCell<HashMap<Gfn, Rc<RefCell<Event>>>>,

    next_view: Cell<u16>,
    views: RefCell<Vec<u16>>,
    domain_view: Cell<View>,
    vcpu_views: RefCell<Vec<View>>,
    view_state: Cell<bool>,
    stepping: RefCell<Vec<bool>>,

    script: RefCell<VecDeque<GuestOp>>,
    pending: RefCell<VecDeque<Delivery>>,

    /// When set, deliveries produced by a script step wait for the next
    /// listen call instead of being dispatched immediately.
    pub defer_delivery: Cell<bool>,
    pub fail_listen: Cell<bool>,
    pub fail_events_pending: Cell<bool>,
    pub fail_write: Cell<bool>,

    pub reinjected: Cell<u32>,
    pub emulated: Cell<u32>,
}

impl FakeXen {
    pub fn new(vcpus: u32) -> Rc<Self> {
        Rc::new(Self {
            pages: RefCell::new(HashMap::new()),
            mapping: RefCell::new(HashMap::new()),
            symbols: RefCell::new(HashMap::new()),
            offsets: RefCell::new(HashMap::new()),
            vcpus,
            paused: Cell::new(false),
            interrupt_event: RefCell::new(None),
            ss_event: RefCell::new(None),
            mem_events: RefCell::new(HashMap::new()),
            next_view: Cell::new(1),
            views: RefCell::new(Vec::new()),
            domain_view: Cell::new(View(0)),
            vcpu_views: RefCell::new(vec![View(0); vcpus as usize]),
            view_state: Cell::new(false),
            stepping: RefCell::new(vec![false; vcpus as usize]),
            script: RefCell::new(VecDeque::new()),
            pending: RefCell::new(VecDeque::new()),
            defer_delivery: Cell::new(false),
            fail_listen: Cell::new(false),
            fail_events_pending: Cell::new(false),
            fail_write: Cell::new(false),
            reinjected: Cell::new(0),
            emulated: Cell::new(0),
        })
    }

    /// Maps a zeroed page of kernel address space.
    pub fn map_page(&self, page: PageNum, gfn: Gfn) {
        self.pages
            .borrow_mut()
            .insert(gfn, vec![0u8; PAGE_SIZE as usize]);
        self.mapping.borrow_mut().insert(page, gfn);
    }

    pub fn define_symbol(&self, name: &str, va: Va) {
        self.symbols.borrow_mut().insert(name.to_string(), va);
    }

    pub fn define_offset(&self, name: &str, offset: u64) {
        self.offsets.borrow_mut().insert(name.to_string(), offset);
    }

    /// Pokes bytes directly into guest memory, bypassing the traced path.
    pub fn poke(&self, va: Va, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            let va = va + i as u64;
            let gfn = self.mapping.borrow()[&va.page_num()];
            self.pages.borrow_mut().get_mut(&gfn).unwrap()[va.page_offset() as usize] = *b;
        }
    }

    /// Peeks one byte of guest memory.
    pub fn peek(&self, va: Va) -> u8 {
        let gfn = self.mapping.borrow()[&va.page_num()];
        self.pages.borrow()[&gfn][va.page_offset() as usize]
    }

    pub fn push_exec(&self, vcpu: u16, va: Va) {
        self.script.borrow_mut().push_back(GuestOp::Exec {
            vcpu: VcpuId(vcpu),
            va,
        });
    }

    pub fn push_access(&self, vcpu: u16, va: Va, access: MemAccess) {
        self.script.borrow_mut().push_back(GuestOp::Access {
            vcpu: VcpuId(vcpu),
            va,
            access,
        });
    }

    pub fn push_batch(&self, ops: Vec<GuestOp>) {
        self.script.borrow_mut().push_back(GuestOp::Batch(ops));
    }

    pub fn push_raise(&self, signal: i32) {
        self.script.borrow_mut().push_back(GuestOp::Raise(signal));
    }

    pub fn script_len(&self) -> usize {
        self.script.borrow().len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    pub fn domain_view(&self) -> View {
        self.domain_view.get()
    }

    pub fn vcpu_view(&self, vcpu: u16) -> View {
        self.vcpu_views.borrow()[vcpu as usize]
    }

    pub fn live_views(&self) -> Vec<u16> {
        self.views.borrow().clone()
    }

    pub fn has_mem_event(&self, gfn: Gfn) -> bool {
        self.mem_events.borrow().contains_key(&gfn)
    }

    pub fn has_ss_event(&self) -> bool {
        self.ss_event.borrow().is_some()
    }

    fn translate(&self, va: Va) -> Result<Pa, DriverError> {
        let gfn = *self
            .mapping
            .borrow()
            .get(&va.page_num())
            .ok_or_else(|| DriverError::msg(format!("unmapped page for {va}")))?;
        Ok(gfn.pa_at(va.page_offset()))
    }

    fn deliver_all(&self) {
        loop {
            let delivery = self.pending.borrow_mut().pop_front();
            match delivery {
                Some(delivery) => self.dispatch(delivery),
                None => break,
            }
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        match delivery {
            Delivery::Int3 { vcpu, gla, gfn } => {
                let event = match self.interrupt_event.borrow().clone() {
                    Some(event) => event,
                    None => return,
                };
                let response = {
                    let mut ev = event.borrow_mut();
                    ev.vcpu = vcpu;
                    if let Some(int) = ev.interrupt_mut() {
                        int.gla = gla;
                        int.gfn = gfn;
                        int.reinject = false;
                        int.emul_insn = None;
                    }
                    (ev.callback)(self, &mut ev)
                };
                let reinject = event.borrow().interrupt().map(|i| i.reinject).unwrap_or(false);
                if reinject {
                    self.reinjected.set(self.reinjected.get() + 1);
                } else if response.contains(Response::SET_EMUL_INSN) {
                    self.emulated.set(self.emulated.get() + 1);
                }
            }
            Delivery::Mem {
                vcpu,
                gfn,
                gla,
                access,
            } => {
                let event = match self.mem_events.borrow().get(&gfn).cloned() {
                    Some(event) => event,
                    None => return,
                };
                let response = {
                    let mut ev = event.borrow_mut();
                    ev.vcpu = vcpu;
                    if let Some(mem) = ev.memory_mut() {
                        mem.gla = gla;
                        mem.out_access = access;
                    }
                    (ev.callback)(self, &mut ev)
                };
                self.apply_response(vcpu, &event, response);
                // The access retires under the (possibly relaxed) view;
                // with single-stepping armed the step event follows.
                if self.stepping.borrow()[vcpu.0 as usize] {
                    self.pending
                        .borrow_mut()
                        .push_back(Delivery::Step { vcpu, gla, gfn });
                }
            }
            Delivery::Step { vcpu, gla, gfn } => {
                let event = match self.ss_event.borrow().clone() {
                    Some(event) => event,
                    None => return,
                };
                let response = {
                    let mut ev = event.borrow_mut();
                    ev.vcpu = vcpu;
                    if let Some(step) = ev.singlestep_mut() {
                        step.gla = gla;
                        step.gfn = gfn;
                    }
                    (ev.callback)(self, &mut ev)
                };
                self.apply_response(vcpu, &event, response);
            }
        }
    }

    fn apply_response(&self, vcpu: VcpuId, event: &Rc<RefCell<Event>>, response: Response) {
        if response.contains(Response::SET_SLAT) {
            let next = event.borrow().slat;
            self.vcpu_views.borrow_mut()[vcpu.0 as usize] = next;
        }
        if response.contains(Response::TOGGLE_SINGLESTEP) {
            let mut stepping = self.stepping.borrow_mut();
            let slot = &mut stepping[vcpu.0 as usize];
            *slot = !*slot;
        }
    }

    fn simulate(&self, op: GuestOp) {
        match op {
            GuestOp::Exec { vcpu, va } => {
                let pa = match self.translate(va) {
                    Ok(pa) => pa,
                    Err(_) => return,
                };
                let byte = self.pages.borrow()[&pa.gfn()][pa.frame_offset() as usize];
                if byte == 0xCC && self.interrupt_event.borrow().is_some() {
                    self.pending.borrow_mut().push_back(Delivery::Int3 {
                        vcpu,
                        gla: va,
                        gfn: pa.gfn(),
                    });
                }
            }
            GuestOp::Access { vcpu, va, access } => {
                let gfn = match self.translate(va) {
                    Ok(pa) => pa.gfn(),
                    Err(_) => return,
                };
                let view = self.vcpu_views.borrow()[vcpu.0 as usize];
                let trapped = match self.mem_events.borrow().get(&gfn) {
                    Some(event) => {
                        let ev = event.borrow();
                        let monitored = ev
                            .memory()
                            .map(|m| m.in_access.intersects(access))
                            .unwrap_or(false);
                        monitored && ev.slat == view
                    }
                    None => false,
                };
                if trapped {
                    self.pending.borrow_mut().push_back(Delivery::Mem {
                        vcpu,
                        gfn,
                        gla: va,
                        access,
                    });
                }
            }
            GuestOp::Batch(ops) => {
                for op in ops {
                    self.simulate(op);
                }
            }
            GuestOp::Raise(signal) => unsafe {
                libc::raise(signal);
            },
        }
    }
}

impl Introspect for FakeXen {
    fn domain_id(&self) -> DomainId {
        DomainId(7)
    }

    fn vcpu_count(&self) -> u32 {
        self.vcpus
    }

    fn pause(&self) -> Result<(), DriverError> {
        self.paused.set(true);
        Ok(())
    }

    fn resume(&self) -> Result<(), DriverError> {
        self.paused.set(false);
        Ok(())
    }

    fn registers(&self, _vcpu: VcpuId) -> Result<Registers, DriverError> {
        Ok(Registers::default())
    }

    fn set_registers(&self, _vcpu: VcpuId, _regs: &Registers) -> Result<(), DriverError> {
        Ok(())
    }

    fn symbol_to_va(&self, symbol: &str) -> Result<Va, DriverError> {
        self.symbols
            .borrow()
            .get(symbol)
            .copied()
            .ok_or_else(|| DriverError::msg(format!("unknown symbol {symbol}")))
    }

    fn offset_of(&self, name: &str) -> Result<u64, DriverError> {
        self.offsets
            .borrow()
            .get(name)
            .copied()
            .ok_or_else(|| DriverError::msg(format!("unknown offset {name}")))
    }

    fn kernel_to_pa(&self, va: Va) -> Result<Pa, DriverError> {
        self.translate(va)
    }

    fn read_va(&self, va: Va, _pid: Pid, buf: &mut [u8]) -> Result<(), DriverError> {
        for (i, slot) in buf.iter_mut().enumerate() {
            let pa = self.translate(va + i as u64)?;
            *slot = self.pages.borrow()[&pa.gfn()][pa.frame_offset() as usize];
        }
        Ok(())
    }

    fn write_va(&self, va: Va, _pid: Pid, buf: &[u8]) -> Result<(), DriverError> {
        if self.fail_write.get() {
            return Err(DriverError::msg("write failure injected"));
        }
        for (i, b) in buf.iter().enumerate() {
            let pa = self.translate(va + i as u64)?;
            self.pages.borrow_mut().get_mut(&pa.gfn()).unwrap()[pa.frame_offset() as usize] = *b;
        }
        Ok(())
    }

    fn register_event(&self, event: Rc<RefCell<Event>>) -> Result<(), DriverError> {
        let kind = event.borrow().kind;
        match kind {
            EventKind::Interrupt(_) => {
                let mut slot = self.interrupt_event.borrow_mut();
                if slot.is_some() {
                    return Err(DriverError::msg("an interrupt event is already registered"));
                }
                *slot = Some(event);
            }
            EventKind::Singlestep(_) => {
                let mut slot = self.ss_event.borrow_mut();
                if slot.is_some() {
                    return Err(DriverError::msg("a single-step event is already registered"));
                }
                *slot = Some(event);
            }
            EventKind::Memory(mem) => {
                let mut events = self.mem_events.borrow_mut();
                if events.contains_key(&mem.gfn) {
                    return Err(DriverError::msg(format!(
                        "a memory event is already registered on {}",
                        mem.gfn
                    )));
                }
                events.insert(mem.gfn, event);
            }
            _ => return Err(DriverError::msg("unsupported event kind")),
        }
        Ok(())
    }

    fn clear_event(
        &self,
        event: Rc<RefCell<Event>>,
        done: Option<OnCleared>,
    ) -> Result<(), DriverError> {
        let mut found = false;

        let is_current = |slot: &RefCell<Option<Rc<RefCell<Event>>>>| {
            slot.borrow()
                .as_ref()
                .map(|cur| Rc::ptr_eq(cur, &event))
                .unwrap_or(false)
        };

        if is_current(&self.interrupt_event) {
            *self.interrupt_event.borrow_mut() = None;
            found = true;
        } else if is_current(&self.ss_event) {
            *self.ss_event.borrow_mut() = None;
            found = true;
        } else {
            let gfn = self
                .mem_events
                .borrow()
                .iter()
                .find(|(_, cur)| Rc::ptr_eq(cur, &event))
                .map(|(gfn, _)| *gfn);
            if let Some(gfn) = gfn {
                self.mem_events.borrow_mut().remove(&gfn);
                found = true;
            }
        }

        if !found {
            return Err(DriverError::msg("event is not registered"));
        }

        if let Some(done) = done {
            let mut ev = event.borrow_mut();
            done(self, &mut ev, true);
        }
        Ok(())
    }

    fn events_pending(&self) -> Result<u64, DriverError> {
        if self.fail_events_pending.get() {
            return Err(DriverError::msg("pending-count failure injected"));
        }
        Ok(self.pending.borrow().len() as u64)
    }

    fn listen(&self, _timeout: Duration) -> Result<(), DriverError> {
        if self.fail_listen.get() {
            return Err(DriverError::msg("listen failure injected"));
        }

        if !self.pending.borrow().is_empty() {
            self.deliver_all();
            return Ok(());
        }

        if self.paused.get() {
            return Ok(());
        }

        let op = self.script.borrow_mut().pop_front();
        if let Some(op) = op {
            self.simulate(op);
            if !self.defer_delivery.get() {
                self.deliver_all();
            }
        }
        Ok(())
    }

    fn create_view(&self) -> Result<View, DriverError> {
        let id = self.next_view.get();
        self.next_view.set(id + 1);
        self.views.borrow_mut().push(id);
        Ok(View(id))
    }

    fn destroy_view(&self, view: View) -> Result<(), DriverError> {
        if view == View(0) {
            return Ok(());
        }
        let mut views = self.views.borrow_mut();
        match views.iter().position(|&v| v == view.0) {
            Some(index) => {
                views.remove(index);
                Ok(())
            }
            None => Err(DriverError::msg("view not found")),
        }
    }

    fn switch_view(&self, view: View) -> Result<(), DriverError> {
        if view != View(0) && !self.views.borrow().contains(&view.0) {
            return Err(DriverError::msg("view not found"));
        }
        self.domain_view.set(view);
        for slot in self.vcpu_views.borrow_mut().iter_mut() {
            *slot = view;
        }
        Ok(())
    }

    fn set_view_domain_state(&self, enabled: bool) -> Result<(), DriverError> {
        self.view_state.set(enabled);
        Ok(())
    }
}

/// Observable state of the fake control plane.
pub struct FakeControlState {
    pub mode: Cell<AltP2mMode>,
    pub opened: Cell<u32>,
    pub closed: Cell<u32>,
}

impl FakeControlState {
    pub fn new(mode: AltP2mMode) -> Rc<Self> {
        Rc::new(Self {
            mode: Cell::new(mode),
            opened: Cell::new(0),
            closed: Cell::new(0),
        })
    }
}

pub struct FakeControl(pub Rc<FakeControlState>);

impl ControlPlane for FakeControl {
    fn open(&self) -> Result<Box<dyn ControlHandle>, DriverError> {
        self.0.opened.set(self.0.opened.get() + 1);
        Ok(Box::new(FakeControlHandle(Rc::clone(&self.0))))
    }
}

struct FakeControlHandle(Rc<FakeControlState>);

impl ControlHandle for FakeControlHandle {
    fn altp2m_mode(&self, _domain: DomainId) -> Result<AltP2mMode, DriverError> {
        Ok(self.0.mode.get())
    }

    fn set_altp2m_mode(&self, _domain: DomainId, mode: AltP2mMode) -> Result<(), DriverError> {
        self.0.mode.set(mode);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.0.closed.set(self.0.closed.get() + 1);
        Ok(())
    }
}
