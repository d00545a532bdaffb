//! Timer ticks.
//!
//! CPU 0's timer interrupt advances the tick counter. Processes sleep on
//! [`Channel::Ticks`] to wait for a number of ticks to pass.

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::process::Channel;

impl<M: Machine> Kernel<M> {
    /// Count one timer tick and wake tick sleepers.
    pub fn timer_tick(&self) {
        let mut ticks = self.ticks.lock(self.machine());
        *ticks += 1;
        self.wakeup(Channel::Ticks);
    }

    /// Ticks since boot.
    pub fn uptime(&self) -> u64 {
        *self.ticks.lock(self.machine())
    }

    /// Sleep for `n` ticks. Fails if the process is killed meanwhile.
    pub fn sleep_ticks(&self, n: u64) -> KernelResult<()> {
        let mut ticks = self.ticks.lock(self.machine());
        let start = *ticks;
        while *ticks - start < n {
            if self.killed() {
                return Err(KernelError::Killed);
            }
            ticks = self.sleep(Channel::Ticks, &self.ticks, ticks);
        }
        Ok(())
    }
}
