//! Process core of the AtomicOS teaching kernel.
//!
//! A fixed table of process records under one interrupt-masking lock, a
//! fair-share scheduler driven by virtual runtime, channel sleep/wakeup, the
//! fork/exit/wait/kill lifecycle and per-process mapped regions. Hardware is
//! reached through [`machine::Machine`]; `arch` implements it for bare-metal
//! x86_64 and the tests drive a mock.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod machine;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod sync;
pub mod syscalls;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;

#[cfg(test)]
mod testing;

pub use config::SchedConfig;
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use machine::Machine;
pub use process::{ProcessId, ProcessState};
