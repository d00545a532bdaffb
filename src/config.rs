//! Kernel configuration constants.
//!
//! Compile-time limits for the process core, plus the runtime knobs of the
//! fair-share scheduler.

/// Maximum number of processes (process table slots).
pub const NPROC: usize = 64;

/// Maximum number of CPUs running the scheduler loop.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Mapped regions per process.
pub const MAX_MMAPS: usize = 64;

/// Page size (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Size of each process's kernel stack (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Base quantum split among competing processes, in clock units.
pub const BASE_SLICE: u64 = 10_000;

/// Niceness a process starts with.
pub const DEFAULT_NICE: u8 = 20;

/// Weight of niceness 20; vruntime advances at wall-clock speed at this weight.
pub const NICE_0_WEIGHT: u64 = 1024;

/// Set of processes whose weights divide the base quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceBasis {
    /// Every runnable process, the chosen one included.
    Runnable,
    /// Only the candidates that lowered the running minimum during the
    /// selection scan, the first candidate included. Depends on slot order.
    ScanOrder,
}

/// Runtime scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Quantum shared by the competing set.
    pub base_slice: u64,
    /// Which weights make up the divisor.
    pub slice_basis: SliceBasis,
}

impl SchedConfig {
    /// Quantum for a process of `weight` competing against `total_weight`.
    pub fn time_slice(&self, weight: u64, total_weight: u64) -> u64 {
        if total_weight == 0 {
            return self.base_slice;
        }
        self.base_slice * weight / total_weight
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            base_slice: BASE_SLICE,
            slice_basis: SliceBasis::Runnable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lone_process_gets_whole_quantum() {
        let config = SchedConfig::default();
        assert_eq!(config.time_slice(1024, 1024), BASE_SLICE);
    }

    #[test]
    fn test_slice_is_proportional() {
        let config = SchedConfig::default();
        assert_eq!(config.time_slice(1024, 4096), 2500);
        assert_eq!(config.time_slice(3072, 4096), 7500);
    }

    #[test]
    fn test_zero_divisor_falls_back_to_base() {
        let config = SchedConfig::default();
        assert_eq!(config.time_slice(1024, 0), BASE_SLICE);
    }
}
