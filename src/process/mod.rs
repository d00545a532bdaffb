//! Process table.
//!
//! A fixed arena of [`NPROC`] slots. Slots are reused across process
//! lifetimes; relations between processes (parent links, the per-CPU current
//! process) are slot indices, never pointers. Everything in here is guarded
//! by the kernel's table lock.

pub mod lifecycle;
pub mod ps;
pub mod sleep;

use alloc::string::String;
use alloc::vec::Vec;
use core::array;
use core::fmt;

use crate::config::{SliceBasis, NCPU, NOFILE, NPROC};
use crate::fs::{DirRef, FileRef};
use crate::machine::{AddressSpace, KernelStack};
use crate::memory::mmap::RegionTable;
use crate::scheduler::context::Context;
use crate::scheduler::weights::{scaled_runtime, Nice};
pub use sleep::Channel;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// Marks a slot that holds no process.
    pub const NONE: ProcessId = ProcessId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state machine.
///
/// ```text
/// Free -> Embryo -> Runnable <-> Running -> Zombie -> Free
///                      ^            |
///                      +- Sleeping <+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Free,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Free => "UNUSED",
            ProcessState::Embryo => "EMBRYO",
            ProcessState::Sleeping => "SLEEPING",
            ProcessState::Runnable => "RUNNABLE",
            ProcessState::Running => "RUNNING",
            ProcessState::Zombie => "ZOMBIE",
        };
        f.write_str(name)
    }
}

/// One process record.
pub struct Process {
    pub pid: ProcessId,
    pub state: ProcessState,
    pub nice: Nice,
    pub vruntime: u64,
    /// Total real run time.
    pub runtime: u64,
    /// Clock stamp when the current run started.
    pub initial_runtime: u64,
    /// Clock stamp when the last run ended.
    pub actual_runtime: u64,
    /// Length of the last run.
    pub delta_runtime: u64,
    pub time_slice: u64,
    /// Slot of the parent.
    pub parent: Option<usize>,
    pub kernel_stack: Option<KernelStack>,
    pub address_space: Option<AddressSpace>,
    /// Bytes of user memory.
    pub size: usize,
    pub context: Context,
    pub regions: RegionTable,
    pub open_files: [Option<FileRef>; NOFILE],
    pub cwd: Option<DirRef>,
    pub name: String,
    pub killed: bool,
    pub channel: Option<Channel>,
}

impl Process {
    fn unused() -> Self {
        Process {
            pid: ProcessId::NONE,
            state: ProcessState::Free,
            nice: Nice::DEFAULT,
            vruntime: 0,
            runtime: 0,
            initial_runtime: 0,
            actual_runtime: 0,
            delta_runtime: 0,
            time_slice: 0,
            parent: None,
            kernel_stack: None,
            address_space: None,
            size: 0,
            context: Context::empty(),
            regions: RegionTable::new(),
            open_files: array::from_fn(|_| None),
            cwd: None,
            name: String::new(),
            killed: false,
            channel: None,
        }
    }

    /// Charge the run that ended at `now`.
    pub(crate) fn charge(&mut self, now: u64) {
        self.actual_runtime = now;
        self.delta_runtime = now.saturating_sub(self.initial_runtime);
        self.runtime += self.delta_runtime;
        self.vruntime += scaled_runtime(self.delta_runtime, self.nice.weight());
        self.initial_runtime = now;
    }

    /// Run time in units of the process's own weight, rounded.
    pub fn normalized_runtime(&self) -> u64 {
        let weight = self.nice.weight();
        (self.runtime + weight / 2) / weight
    }
}

/// Per-CPU scheduling record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cpu {
    /// Slot running on this CPU.
    pub current: Option<usize>,
    /// Where `sched` switches to: the CPU's scheduler loop.
    pub scheduler: Context,
}

/// Result of a scheduling scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pick {
    pub slot: usize,
    /// Divisor for the chosen process's quantum.
    pub total_weight: u64,
}

pub struct ProcessTable {
    pub(crate) slots: Vec<Process>,
    pub(crate) cpus: [Cpu; NCPU],
    next_pid: u64,
    /// Slot of the bootstrap process, the adopter of orphans.
    pub(crate) init: Option<usize>,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            slots: (0..NPROC).map(|_| Process::unused()).collect(),
            cpus: [Cpu::default(); NCPU],
            next_pid: 1,
            init: None,
        }
    }

    pub fn slot(&self, slot: usize) -> &Process {
        &self.slots[slot]
    }

    pub fn slot_mut(&mut self, slot: usize) -> &mut Process {
        &mut self.slots[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter()
    }

    /// Slot of the live process `pid`.
    pub fn find(&self, pid: ProcessId) -> Option<usize> {
        self.slots
            .iter()
            .position(|p| p.state != ProcessState::Free && p.pid == pid)
    }

    pub fn current(&self, cpu: usize) -> Option<usize> {
        self.cpus[cpu].current
    }

    pub fn init_slot(&self) -> Option<usize> {
        self.init
    }

    pub fn count(&self, state: ProcessState) -> usize {
        self.slots.iter().filter(|p| p.state == state).count()
    }

    pub(crate) fn next_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Runnable slot with the least vruntime; the first in slot order wins
    /// ties.
    pub fn pick_next(&self, basis: SliceBasis) -> Option<Pick> {
        let mut best: Option<usize> = None;
        let mut runnable_weight = 0;
        let mut scan_weight = 0;

        for (i, p) in self.slots.iter().enumerate() {
            if p.state != ProcessState::Runnable {
                continue;
            }
            let weight = p.nice.weight();
            runnable_weight += weight;
            match best {
                None => {
                    best = Some(i);
                    scan_weight = weight;
                }
                Some(b) if p.vruntime < self.slots[b].vruntime => {
                    best = Some(i);
                    scan_weight += weight;
                }
                Some(_) => {}
            }
        }

        let total_weight = match basis {
            SliceBasis::Runnable => runnable_weight,
            SliceBasis::ScanOrder => scan_weight,
        };
        best.map(|slot| Pick { slot, total_weight })
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
