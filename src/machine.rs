//! The hardware the process core runs on.
//!
//! Everything the core needs but does not define goes through [`Machine`]:
//! interrupt masking, the clock, kernel stacks, address spaces, populating
//! mapped regions, and the context switch itself.

use core::ops::Deref;

use crate::error::KernelResult;
use crate::fs::FileRef;
use crate::kernel::{Kernel, TableGuard};
use crate::memory::mmap::{Region, RegionTable};
use crate::scheduler::context::Context;

/// A kernel stack owned by one process record.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelStack {
    base: u64,
    size: usize,
}

impl KernelStack {
    pub fn new(base: u64, size: usize) -> Self {
        KernelStack { base, size }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Highest usable address, 16-byte aligned.
    pub fn top(&self) -> u64 {
        (self.base + self.size as u64) & !0xF
    }

    pub(crate) fn alias(&self) -> Alias<KernelStack> {
        Alias(KernelStack::new(self.base, self.size))
    }
}

/// A user address space, identified by the physical address of its root
/// page table (the CR3 value on x86_64).
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: u64,
}

impl AddressSpace {
    pub fn new(root: u64) -> Self {
        AddressSpace { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub(crate) fn alias(&self) -> Alias<AddressSpace> {
        Alias(AddressSpace::new(self.root))
    }
}

/// A second handle on a resource that stays owned by its process record.
///
/// Lets machine work run with the table unlocked. It only derefs, so it can
/// never be given back through a `free_*`. The owner must stay installed
/// until the alias is dropped.
pub(crate) struct Alias<T>(T);

impl<T> Deref for Alias<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Collaborators the process core depends on.
///
/// Handles ([`KernelStack`], [`AddressSpace`]) are not `Clone`: whoever holds
/// one owns the resource and must give it back through the matching `free_*`.
pub trait Machine: Sized + Sync {
    /// Index of the executing CPU. Only meaningful with interrupts off.
    fn cpu_id(&self) -> usize;

    /// Disable interrupts, counting nesting; the first level remembers
    /// whether they were on.
    fn push_off(&self);
    /// Undo one `push_off`, re-enabling interrupts at depth zero if they
    /// were on before.
    fn pop_off(&self);
    /// Current `push_off` nesting depth on this CPU.
    fn off_depth(&self) -> usize;
    fn interrupts_enabled(&self) -> bool;
    fn enable_interrupts(&self);
    /// Interrupt state saved by the outermost `push_off`.
    fn intena(&self) -> bool;
    fn set_intena(&self, on: bool);

    /// Monotonic clock used for runtime accounting.
    fn now(&self) -> u64;

    fn alloc_kernel_stack(&self) -> Option<KernelStack>;
    fn free_kernel_stack(&self, stack: KernelStack);

    /// Fresh address space holding the bootstrap program in its first page.
    fn create_init_space(&self) -> Option<AddressSpace>;
    /// Duplicate `size` bytes of user memory plus the populated pages of
    /// `regions`.
    fn copy_address_space(
        &self,
        parent: &AddressSpace,
        size: usize,
        regions: &RegionTable,
    ) -> Option<AddressSpace>;
    fn free_address_space(&self, space: AddressSpace, size: usize, regions: &RegionTable);
    /// Grow or shrink user memory from `old` to `new` bytes; returns the new
    /// size.
    fn resize(&self, space: &AddressSpace, old: usize, new: usize) -> Option<usize>;

    /// Back `region` with pages: zero-filled when anonymous, read from
    /// `backing` otherwise.
    fn populate(
        &self,
        space: &AddressSpace,
        region: &Region,
        backing: Option<&FileRef>,
    ) -> KernelResult<()>;
    /// Release whatever pages back `[addr, addr + len)`.
    fn unmap_range(&self, space: &AddressSpace, addr: usize, len: usize);

    /// Run on the user's page table with `stack` as the kernel entry stack.
    fn activate_user(&self, space: &AddressSpace, stack: &KernelStack);
    /// Back to the kernel-only page table.
    fn activate_kernel(&self);

    /// Context that starts the bootstrap process at the beginning of its
    /// first page.
    fn first_context(&self, stack: &KernelStack) -> Context;
    /// Context for a fork child: copies the parent's trap frame onto
    /// `child` so the child returns from the syscall with 0.
    fn fork_context(&self, parent: &KernelStack, child: &KernelStack) -> Context;

    /// Suspend the context saved into `from` and resume `to`.
    ///
    /// The table lock travels with the switch: `guard` stays locked while
    /// the other side runs, and the returned guard is the lock as held again
    /// once something switches back to `from`.
    ///
    /// # Safety
    /// `from` and `to` must point at contexts inside `kernel`'s table that
    /// stay valid until the switch returns.
    unsafe fn switch<'a>(
        &self,
        kernel: &'a Kernel<Self>,
        guard: TableGuard<'a, Self>,
        from: *mut Context,
        to: *const Context,
    ) -> TableGuard<'a, Self>;

    /// Idle hint for a scheduler that found nothing to run.
    fn idle(&self) {}
}
