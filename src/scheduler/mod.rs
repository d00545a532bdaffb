//! Fair-share scheduler.
//!
//! Every CPU runs [`Kernel::scheduler`]. Each round it picks the runnable
//! process with the least virtual runtime and gives it a quantum
//! proportional to its weight. A process gives the CPU back through
//! [`Kernel::sched`] (by yielding, sleeping or exiting), which charges the
//! time it ran before switching back to the loop.

pub mod context;
pub mod weights;

use crate::kernel::{Kernel, TableGuard};
use crate::machine::Machine;
use crate::process::{ProcessState, ProcessTable};
use context::Context;

impl<M: Machine> Kernel<M> {
    /// Per-CPU scheduler loop. Never returns.
    pub fn scheduler(&self) -> ! {
        {
            let mut table = self.lock();
            let cpu = self.machine().cpu_id();
            table.cpus[cpu].current = None;
        }
        log::info!("scheduler: cpu {} online", self.machine().cpu_id());

        loop {
            // Let devices interrupt so a sleeping process can be woken.
            self.machine().enable_interrupts();
            if !self.run_next() {
                self.machine().idle();
            }
        }
    }

    /// Run one scheduling round; false when nothing was runnable.
    pub(crate) fn run_next(&self) -> bool {
        let mut table = self.lock();
        let cpu = self.machine().cpu_id();
        let slot = match self.dispatch(cpu, &mut table) {
            Some(slot) => slot,
            None => return false,
        };

        {
            let p = table.slot(slot);
            match (p.address_space.as_ref(), p.kernel_stack.as_ref()) {
                (Some(space), Some(stack)) => self.machine().activate_user(space, stack),
                _ => panic!("run_next: pid {} has no address space", p.pid),
            }
        }

        let from = &mut table.cpus[cpu].scheduler as *mut Context;
        let to = &table.slot(slot).context as *const Context;
        // The process now owns the lock and hands it back through `sched`.
        let mut table = unsafe { self.machine().switch(self, table, from, to) };

        self.machine().activate_kernel();
        table.cpus[cpu].current = None;
        true
    }

    /// Pick the next process for `cpu`, size its quantum and mark it
    /// running.
    pub(crate) fn dispatch(&self, cpu: usize, table: &mut ProcessTable) -> Option<usize> {
        if let Some(slot) = table.cpus[cpu].current {
            panic!("dispatch: cpu {} still runs slot {}", cpu, slot);
        }
        let pick = table.pick_next(self.config().slice_basis)?;
        let now = self.machine().now();

        let p = table.slot_mut(pick.slot);
        p.time_slice = self.config().time_slice(p.nice.weight(), pick.total_weight);
        p.state = ProcessState::Running;
        p.initial_runtime = now;
        log::trace!(
            "dispatch: cpu {} pid {} vruntime {} slice {}",
            cpu,
            p.pid,
            p.vruntime,
            p.time_slice
        );

        table.cpus[cpu].current = Some(pick.slot);
        Some(pick.slot)
    }

    /// Switch from the current process back to this CPU's scheduler loop.
    ///
    /// The caller holds only the table lock and has already moved the
    /// process out of `Running`. The time it ran is charged here.
    pub(crate) fn sched<'a>(&'a self, mut table: TableGuard<'a, M>) -> TableGuard<'a, M> {
        let machine = self.machine();
        let cpu = machine.cpu_id();
        let slot = match table.current(cpu) {
            Some(slot) => slot,
            None => panic!("sched"),
        };
        if machine.off_depth() != 1 {
            panic!("sched locks");
        }
        if table.slot(slot).state == ProcessState::Running {
            panic!("sched running");
        }
        if machine.interrupts_enabled() {
            panic!("sched interruptible");
        }

        table.slot_mut(slot).charge(machine.now());

        let intena = machine.intena();
        let from = &mut table.slot_mut(slot).context as *mut Context;
        let to = &table.cpus[cpu].scheduler as *const Context;
        let table = unsafe { machine.switch(self, table, from, to) };
        machine.set_intena(intena);
        table
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&self) {
        let mut table = self.lock();
        let slot = match table.current(self.machine().cpu_id()) {
            Some(slot) => slot,
            None => return,
        };
        table.slot_mut(slot).state = ProcessState::Runnable;
        drop(self.sched(table));
    }

    /// Whether the current process has used up its quantum.
    pub fn should_preempt(&self) -> bool {
        let table = self.lock();
        let now = self.machine().now();
        match table.current(self.machine().cpu_id()) {
            Some(slot) => {
                let p = table.slot(slot);
                p.state == ProcessState::Running
                    && now.saturating_sub(p.initial_runtime) >= p.time_slice
            }
            None => false,
        }
    }
}
