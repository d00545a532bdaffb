use core::fmt;

/// Recoverable failures of the process core.
///
/// The syscall layer turns every variant into `-1`; invariant violations
/// are not represented here, they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    NoFreeSlot,
    OutOfMemory,
    NoSuchProcess,
    NoCurrentProcess,
    NoChildren,
    Killed,
    InvalidArgument,
    RegionTableFull,
    NoFit,
    NotMapped,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::NoFreeSlot => write!(f, "Process table full"),
            KernelError::OutOfMemory => write!(f, "Out of memory"),
            KernelError::NoSuchProcess => write!(f, "No such process"),
            KernelError::NoCurrentProcess => write!(f, "No process running on this CPU"),
            KernelError::NoChildren => write!(f, "No child processes"),
            KernelError::Killed => write!(f, "Process was killed"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::RegionTableFull => write!(f, "Too many mapped regions"),
            KernelError::NoFit => write!(f, "No gap fits the requested range"),
            KernelError::NotMapped => write!(f, "Address is not mapped"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
