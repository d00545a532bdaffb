//! The kernel instance: the process table, its lock, the tick counter, and
//! the machine underneath.
//!
//! Operations are spread over the subsystem modules as `impl Kernel` blocks:
//! allocation and lifecycle in `process`, the scheduler loop in `scheduler`,
//! regions in `memory`, ticks in `clock`.

use crate::config::SchedConfig;
use crate::machine::Machine;
use crate::process::ProcessTable;
use crate::sync::{IrqGuard, IrqMutex};

/// The process table locked, interrupts masked on this CPU.
pub type TableGuard<'a, M> = IrqGuard<'a, ProcessTable, M>;

pub struct Kernel<M: Machine> {
    table: IrqMutex<ProcessTable>,
    pub(crate) ticks: IrqMutex<u64>,
    machine: M,
    config: SchedConfig,
}

impl<M: Machine> Kernel<M> {
    pub fn new(machine: M, config: SchedConfig) -> Self {
        Kernel {
            table: IrqMutex::new(ProcessTable::new()),
            ticks: IrqMutex::new(0),
            machine,
            config,
        }
    }

    /// Acquire the process table lock.
    pub fn lock(&self) -> TableGuard<'_, M> {
        self.table.lock(&self.machine)
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Release the table lock handed over by the scheduler to a process
    /// that runs for the first time.
    ///
    /// # Safety
    /// Only the first-run trampoline of a freshly dispatched process may
    /// call this.
    pub unsafe fn release_inherited_lock(&self) {
        unsafe { self.table.force_unlock(&self.machine) };
    }

    /// Pick up the table lock on the far side of a context switch.
    ///
    /// # Safety
    /// The context switched away from must have forgotten its guard.
    pub unsafe fn adopt_lock(&self) -> TableGuard<'_, M> {
        unsafe { self.table.adopt(&self.machine) }
    }

    /// Slot of the process running on this CPU.
    pub fn current_slot(&self) -> Option<usize> {
        let table = self.lock();
        table.current(self.machine.cpu_id())
    }
}
