//! Deterministic single-CPU machine for host tests.
//!
//! Resources are plain counters. A context switch releases the table lock,
//! runs the next hook queued with [`MockMachine::on_switch`] in place of
//! "the other side", then takes the lock back. A process that comes back
//! runnable is treated as picked again by the scheduler.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::{SchedConfig, KERNEL_STACK_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs::FileRef;
use crate::kernel::{Kernel, TableGuard};
use crate::machine::{AddressSpace, KernelStack, Machine};
use crate::memory::mmap::{Region, RegionTable};
use crate::process::{ProcessId, ProcessState};
use crate::scheduler::context::Context;

type Hook = Box<dyn FnOnce(&Kernel<MockMachine>) + Send>;

/// Guard against a test that keeps switching with nobody to wake it.
const MAX_SWITCHES: usize = 10_000;

pub struct MockMachine {
    depth: AtomicUsize,
    intena: AtomicBool,
    enabled: AtomicBool,
    clock: AtomicU64,
    next_handle: AtomicU64,
    live_stacks: AtomicUsize,
    live_spaces: AtomicUsize,
    active: AtomicU64,
    switches: AtomicUsize,
    fail_stack: AtomicBool,
    fail_copy: AtomicBool,
    fail_populate: AtomicBool,
    populated: Mutex<Vec<(usize, usize, Option<String>)>>,
    unmapped: Mutex<Vec<(usize, usize)>>,
    locked_work: Mutex<Vec<&'static str>>,
    hooks: Mutex<VecDeque<Hook>>,
}

impl MockMachine {
    pub fn new() -> Self {
        MockMachine {
            depth: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            next_handle: AtomicU64::new(1),
            live_stacks: AtomicUsize::new(0),
            live_spaces: AtomicUsize::new(0),
            active: AtomicU64::new(0),
            switches: AtomicUsize::new(0),
            fail_stack: AtomicBool::new(false),
            fail_copy: AtomicBool::new(false),
            fail_populate: AtomicBool::new(false),
            populated: Mutex::new(Vec::new()),
            unmapped: Mutex::new(Vec::new()),
            locked_work: Mutex::new(Vec::new()),
            hooks: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue `hook` to run at the next context switch.
    pub fn on_switch<F>(&self, hook: F)
    where
        F: FnOnce(&Kernel<MockMachine>) + Send + 'static,
    {
        self.hooks.lock().push_back(Box::new(hook));
    }

    pub fn advance(&self, units: u64) {
        self.clock.fetch_add(units, Ordering::SeqCst);
    }

    pub fn fail_stack(&self, fail: bool) {
        self.fail_stack.store(fail, Ordering::SeqCst);
    }

    pub fn fail_copy(&self, fail: bool) {
        self.fail_copy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_populate(&self, fail: bool) {
        self.fail_populate.store(fail, Ordering::SeqCst);
    }

    pub fn live_stacks(&self) -> usize {
        self.live_stacks.load(Ordering::SeqCst)
    }

    pub fn live_spaces(&self) -> usize {
        self.live_spaces.load(Ordering::SeqCst)
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    /// Root of the user address space currently active, if any.
    pub fn active_space(&self) -> Option<u64> {
        match self.active.load(Ordering::SeqCst) {
            0 => None,
            root => Some(root),
        }
    }

    /// Populated regions as (start, length, backing file path).
    pub fn populated(&self) -> Vec<(usize, usize, Option<String>)> {
        self.populated.lock().clone()
    }

    pub fn unmapped(&self) -> Vec<(usize, usize)> {
        self.unmapped.lock().clone()
    }

    /// Page-table and stack work the kernel asked for while holding an
    /// interrupt-masking lock.
    pub fn locked_work(&self) -> Vec<&'static str> {
        self.locked_work.lock().clone()
    }

    fn work(&self, what: &'static str) {
        if self.off_depth() > 0 {
            self.locked_work.lock().push(what);
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MockMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for MockMachine {
    fn cpu_id(&self) -> usize {
        0
    }

    fn push_off(&self) {
        let was_on = self.enabled.swap(false, Ordering::SeqCst);
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.intena.store(was_on, Ordering::SeqCst);
        }
    }

    fn pop_off(&self) {
        if self.enabled.load(Ordering::SeqCst) {
            panic!("pop_off - interruptible");
        }
        let depth = self.depth.load(Ordering::SeqCst);
        if depth == 0 {
            panic!("pop_off");
        }
        self.depth.store(depth - 1, Ordering::SeqCst);
        if depth == 1 && self.intena.load(Ordering::SeqCst) {
            self.enabled.store(true, Ordering::SeqCst);
        }
    }

    fn off_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn intena(&self) -> bool {
        self.intena.load(Ordering::SeqCst)
    }

    fn set_intena(&self, on: bool) {
        self.intena.store(on, Ordering::SeqCst);
    }

    fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn alloc_kernel_stack(&self) -> Option<KernelStack> {
        if self.fail_stack.load(Ordering::SeqCst) {
            return None;
        }
        self.live_stacks.fetch_add(1, Ordering::SeqCst);
        Some(KernelStack::new(self.handle() << 20, KERNEL_STACK_SIZE))
    }

    fn free_kernel_stack(&self, _stack: KernelStack) {
        self.live_stacks.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_init_space(&self) -> Option<AddressSpace> {
        self.live_spaces.fetch_add(1, Ordering::SeqCst);
        Some(AddressSpace::new(self.handle()))
    }

    fn copy_address_space(
        &self,
        _parent: &AddressSpace,
        _size: usize,
        _regions: &RegionTable,
    ) -> Option<AddressSpace> {
        self.work("copy_address_space");
        if self.fail_copy.load(Ordering::SeqCst) {
            return None;
        }
        self.live_spaces.fetch_add(1, Ordering::SeqCst);
        Some(AddressSpace::new(self.handle()))
    }

    fn free_address_space(&self, _space: AddressSpace, _size: usize, _regions: &RegionTable) {
        self.live_spaces.fetch_sub(1, Ordering::SeqCst);
    }

    fn resize(&self, _space: &AddressSpace, _old: usize, new: usize) -> Option<usize> {
        self.work("resize");
        Some(new)
    }

    fn populate(
        &self,
        _space: &AddressSpace,
        region: &Region,
        backing: Option<&FileRef>,
    ) -> KernelResult<()> {
        self.work("populate");
        if self.fail_populate.load(Ordering::SeqCst) {
            return Err(KernelError::OutOfMemory);
        }
        let path = backing.map(|file| file.lock().path.clone());
        self.populated.lock().push((region.addr, region.length, path));
        Ok(())
    }

    fn unmap_range(&self, _space: &AddressSpace, addr: usize, len: usize) {
        self.work("unmap_range");
        self.unmapped.lock().push((addr, len));
    }

    fn activate_user(&self, space: &AddressSpace, _stack: &KernelStack) {
        self.active.store(space.root(), Ordering::SeqCst);
    }

    fn activate_kernel(&self) {
        self.active.store(0, Ordering::SeqCst);
    }

    fn first_context(&self, stack: &KernelStack) -> Context {
        Context::resume_at(0x1000, stack.top())
    }

    fn fork_context(&self, _parent: &KernelStack, child: &KernelStack) -> Context {
        self.work("fork_context");
        Context::resume_at(0x2000, child.top())
    }

    unsafe fn switch<'a>(
        &self,
        kernel: &'a Kernel<Self>,
        guard: TableGuard<'a, Self>,
        _from: *mut Context,
        _to: *const Context,
    ) -> TableGuard<'a, Self> {
        if self.switches.fetch_add(1, Ordering::SeqCst) >= MAX_SWITCHES {
            panic!("mock: runaway context switching");
        }
        drop(guard);

        let hook = self.hooks.lock().pop_front();
        if let Some(hook) = hook {
            hook(kernel);
        }

        let mut table = kernel.lock();
        if let Some(slot) = table.current(self.cpu_id()) {
            if table.slot(slot).state == ProcessState::Runnable {
                let now = self.now();
                let p = table.slot_mut(slot);
                p.state = ProcessState::Running;
                p.initial_runtime = now;
            }
        }
        table
    }
}

pub fn boot_with(config: SchedConfig) -> (Kernel<MockMachine>, ProcessId) {
    let kernel = Kernel::new(MockMachine::new(), config);
    let init = kernel.userinit();
    (kernel, init)
}

/// A kernel with the bootstrap process created but not yet running.
pub fn boot() -> (Kernel<MockMachine>, ProcessId) {
    boot_with(SchedConfig::default())
}

/// Make the scheduler's next pick current on CPU 0. Returns its slot.
pub fn dispatch(k: &Kernel<MockMachine>) -> usize {
    let mut table = k.lock();
    k.dispatch(0, &mut table).expect("nothing runnable")
}

pub fn slot_of(k: &Kernel<MockMachine>, pid: ProcessId) -> usize {
    k.lock().find(pid).expect("no such pid")
}

/// Run `f` with `pid` as CPU 0's current process, then put the previous
/// one back.
pub fn as_current<R>(k: &Kernel<MockMachine>, pid: ProcessId, f: impl FnOnce() -> R) -> R {
    let previous = {
        let mut table = k.lock();
        let slot = table.find(pid).expect("no such pid");
        table.cpus[0].current.replace(slot)
    };
    let result = f();
    k.lock().cpus[0].current = previous;
    result
}

/// Fork a child of the bootstrap process.
pub fn spawn_child(k: &Kernel<MockMachine>) -> ProcessId {
    let init = {
        let table = k.lock();
        let slot = table.init_slot().expect("no init");
        table.slot(slot).pid
    };
    as_current(k, init, || k.fork().expect("fork"))
}
