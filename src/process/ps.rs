use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use super::{ProcessId, ProcessState};
use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::scheduler::weights::Nice;

/// One line of a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsRow {
    pub name: String,
    pub pid: ProcessId,
    pub state: ProcessState,
    pub nice: Nice,
    /// Run time divided by the process's weight, rounded.
    pub normalized_runtime: u64,
    pub runtime: u64,
    pub vruntime: u64,
}

/// Snapshot of the scheduler-relevant processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsReport {
    pub ticks: u64,
    pub rows: Vec<PsRow>,
}

impl fmt::Display for PsReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{:<16} {:>5} {:<9} {:>8} {:>14} {:>10} {:>10} tick {}",
            "name", "pid", "state", "priority", "runtime/weight", "runtime", "vruntime", self.ticks
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<16} {:>5} {:<9} {:>8} {:>14} {:>10} {:>10}",
                row.name,
                row.pid,
                row.state,
                row.nice,
                row.normalized_runtime,
                row.runtime,
                row.vruntime
            )?;
        }
        Ok(())
    }
}

impl<M: Machine> Kernel<M> {
    /// List sleeping, runnable and running processes, or only `pid` when
    /// given. The listing is also written to the log.
    pub fn ps(&self, pid: Option<ProcessId>) -> PsReport {
        let ticks = self.uptime();
        let table = self.lock();
        let rows = table
            .iter()
            .filter(|p| {
                matches!(
                    p.state,
                    ProcessState::Sleeping | ProcessState::Runnable | ProcessState::Running
                )
            })
            .filter(|p| pid.map_or(true, |pid| p.pid == pid))
            .map(|p| PsRow {
                name: p.name.clone(),
                pid: p.pid,
                state: p.state,
                nice: p.nice,
                normalized_runtime: p.normalized_runtime(),
                runtime: p.runtime,
                vruntime: p.vruntime,
            })
            .collect();
        drop(table);

        let report = PsReport { ticks, rows };
        log::info!("\n{}", report);
        report
    }
}
