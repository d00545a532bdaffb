//! Process creation and teardown: the bootstrap process, fork, exit, wait,
//! kill, and the per-process queries that go with them.

use alloc::string::String;
use core::{array, mem};

use super::{Channel, Process, ProcessId, ProcessState};
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::fs::{Dentry, File};
use crate::kernel::{Kernel, TableGuard};
use crate::machine::{AddressSpace, KernelStack, Machine};
use crate::process::sleep::wakeup_locked;
use crate::scheduler::weights::Nice;

fn stack_of(p: &Process) -> &KernelStack {
    match p.kernel_stack.as_ref() {
        Some(stack) => stack,
        None => panic!("pid {} has no kernel stack", p.pid),
    }
}

impl<M: Machine> Kernel<M> {
    /// Claim a free slot and give it a pid and a kernel stack.
    ///
    /// The stack is allocated with the table unlocked; the slot is already
    /// `Embryo` by then so nobody else can claim it.
    pub(crate) fn allocate(&self) -> KernelResult<usize> {
        let slot = {
            let mut table = self.lock();
            let slot = table
                .iter()
                .position(|p| p.state == ProcessState::Free)
                .ok_or(KernelError::NoFreeSlot)?;
            let pid = table.next_pid();
            let p = table.slot_mut(slot);
            *p = Process::unused();
            p.pid = pid;
            p.state = ProcessState::Embryo;
            slot
        };

        match self.machine().alloc_kernel_stack() {
            Some(stack) => {
                self.lock().slot_mut(slot).kernel_stack = Some(stack);
                Ok(slot)
            }
            None => {
                let mut table = self.lock();
                let p = table.slot_mut(slot);
                log::warn!("allocate: no kernel stack for pid {}", p.pid);
                *p = Process::unused();
                Err(KernelError::OutOfMemory)
            }
        }
    }

    /// Give an `Embryo` slot back after a failed creation.
    fn release_embryo(&self, mut table: TableGuard<'_, M>, slot: usize) {
        let stack = table.slot_mut(slot).kernel_stack.take();
        *table.slot_mut(slot) = Process::unused();
        drop(table);
        if let Some(stack) = stack {
            self.machine().free_kernel_stack(stack);
        }
    }

    /// Create the bootstrap process, the ancestor of every other process.
    pub fn userinit(&self) -> ProcessId {
        let slot = match self.allocate() {
            Ok(slot) => slot,
            Err(e) => panic!("userinit: {}", e),
        };
        let space = match self.machine().create_init_space() {
            Some(space) => space,
            None => panic!("userinit: out of memory"),
        };

        let mut table = self.lock();
        table.init = Some(slot);
        let context = self.machine().first_context(stack_of(table.slot(slot)));

        let p = table.slot_mut(slot);
        p.address_space = Some(space);
        p.size = PAGE_SIZE;
        p.context = context;
        p.name = String::from("initcode");
        p.cwd = Some(Dentry::root());
        for fd in p.open_files.iter_mut().take(3) {
            *fd = Some(File::new_console());
        }
        p.state = ProcessState::Runnable;

        log::info!("userinit: pid {} in slot {}", p.pid, slot);
        p.pid
    }

    /// Duplicate the current process. The child returns 0 from the syscall;
    /// the parent gets the child's pid.
    ///
    /// Only the parent changes its own memory and nobody else touches an
    /// `Embryo`, so the copy runs with the table unlocked.
    pub fn fork(&self) -> KernelResult<ProcessId> {
        let parent = self.current_slot().ok_or(KernelError::NoCurrentProcess)?;
        let child = self.allocate()?;

        let (space, size, regions, parent_stack, child_stack) = {
            let table = self.lock();
            let p = table.slot(parent);
            (
                p.address_space.as_ref().map(AddressSpace::alias),
                p.size,
                p.regions.clone(),
                stack_of(p).alias(),
                stack_of(table.slot(child)).alias(),
            )
        };

        let copied =
            space.and_then(|space| self.machine().copy_address_space(&space, size, &regions));
        let space = match copied {
            Some(space) => space,
            None => {
                let table = self.lock();
                log::warn!("fork: could not copy address space of pid {}", table.slot(parent).pid);
                self.release_embryo(table, child);
                return Err(KernelError::OutOfMemory);
            }
        };
        let context = self.machine().fork_context(&parent_stack, &child_stack);

        let mut table = self.lock();
        let p = table.slot(parent);
        let vruntime = p.vruntime;
        let time_slice = p.time_slice;
        let name = p.name.clone();
        let open_files = p.open_files.clone();
        let cwd = p.cwd.clone();

        let c = table.slot_mut(child);
        c.address_space = Some(space);
        c.size = size;
        c.context = context;
        c.vruntime = vruntime;
        c.time_slice = time_slice;
        c.name = name;
        c.regions = regions;
        c.open_files = open_files;
        c.cwd = cwd;
        c.parent = Some(parent);
        c.state = ProcessState::Runnable;

        let pid = c.pid;
        log::debug!("fork: slot {} -> pid {}", parent, pid);
        Ok(pid)
    }

    /// Terminate the current process. It stays a zombie until its parent
    /// calls [`Kernel::wait`].
    pub fn exit(&self) -> ! {
        let slot = match self.current_slot() {
            Some(slot) => slot,
            None => panic!("exit"),
        };
        let table = self.exit_slot(slot);
        let _table = self.sched(table);
        panic!("zombie exit");
    }

    /// Everything `exit` does short of giving up the CPU. Returns with the
    /// table locked and `slot` a zombie.
    pub(crate) fn exit_slot(&self, slot: usize) -> TableGuard<'_, M> {
        let mut table = self.lock();
        if table.init == Some(slot) {
            panic!("init exiting");
        }

        // Closing a file may take other locks; do it with the table unlocked.
        let p = table.slot_mut(slot);
        let files = mem::replace(&mut p.open_files, array::from_fn(|_| None));
        let cwd = p.cwd.take();
        drop(table);
        drop(files);
        drop(cwd);

        let mut table = self.lock();
        if let Some(parent) = table.slot(slot).parent {
            wakeup_locked(&mut table, Channel::Child(parent));
        }

        let init = table.init;
        let mut orphaned_zombie = false;
        for p in table.slots.iter_mut() {
            if p.state != ProcessState::Free && p.parent == Some(slot) {
                p.parent = init;
                orphaned_zombie |= p.state == ProcessState::Zombie;
            }
        }
        if let (true, Some(init)) = (orphaned_zombie, init) {
            wakeup_locked(&mut table, Channel::Child(init));
        }

        let p = table.slot_mut(slot);
        p.state = ProcessState::Zombie;
        log::debug!("exit: pid {}", p.pid);
        table
    }

    /// Wait for a child to exit and reclaim it. Returns the child's pid.
    pub fn wait(&self) -> KernelResult<ProcessId> {
        let mut table = self.lock();
        let me = table
            .current(self.machine().cpu_id())
            .ok_or(KernelError::NoCurrentProcess)?;

        loop {
            let mut have_kids = false;
            let mut zombie = None;
            for (i, p) in table.iter().enumerate() {
                if p.state == ProcessState::Free || p.parent != Some(me) {
                    continue;
                }
                have_kids = true;
                if p.state == ProcessState::Zombie {
                    zombie = Some(i);
                    break;
                }
            }

            if let Some(child) = zombie {
                let p = table.slot_mut(child);
                let pid = p.pid;
                let stack = p.kernel_stack.take();
                let space = p.address_space.take();
                let size = p.size;
                let regions = mem::take(&mut p.regions);
                *p = Process::unused();
                drop(table);

                if let Some(stack) = stack {
                    self.machine().free_kernel_stack(stack);
                }
                if let Some(space) = space {
                    self.machine().free_address_space(space, size, &regions);
                }
                log::debug!("wait: reaped pid {}", pid);
                return Ok(pid);
            }

            if !have_kids {
                return Err(KernelError::NoChildren);
            }
            if table.slot(me).killed {
                return Err(KernelError::Killed);
            }
            table = self.sleep_locked(Channel::Child(me), table);
        }
    }

    /// Ask `pid` to terminate. It notices at its next return to user
    /// space; a sleeping target is woken so that it gets there.
    pub fn kill(&self, pid: ProcessId) -> KernelResult<()> {
        let mut table = self.lock();
        let slot = table.find(pid).ok_or(KernelError::NoSuchProcess)?;
        let p = table.slot_mut(slot);
        p.killed = true;
        if p.state == ProcessState::Sleeping {
            p.state = ProcessState::Runnable;
        }
        log::debug!("kill: pid {}", pid);
        Ok(())
    }

    /// Whether the current process has been killed.
    pub fn killed(&self) -> bool {
        let table = self.lock();
        table
            .current(self.machine().cpu_id())
            .map_or(false, |slot| table.slot(slot).killed)
    }

    pub fn getpid(&self) -> KernelResult<ProcessId> {
        let table = self.lock();
        let slot = table
            .current(self.machine().cpu_id())
            .ok_or(KernelError::NoCurrentProcess)?;
        Ok(table.slot(slot).pid)
    }

    pub fn getpname(&self, pid: ProcessId) -> KernelResult<String> {
        let table = self.lock();
        let slot = table.find(pid).ok_or(KernelError::NoSuchProcess)?;
        let name = table.slot(slot).name.clone();
        log::info!("{}", name);
        Ok(name)
    }

    pub fn getnice(&self, pid: ProcessId) -> KernelResult<Nice> {
        let table = self.lock();
        let slot = table.find(pid).ok_or(KernelError::NoSuchProcess)?;
        Ok(table.slot(slot).nice)
    }

    pub fn setnice(&self, pid: ProcessId, nice: Nice) -> KernelResult<()> {
        let mut table = self.lock();
        let slot = table.find(pid).ok_or(KernelError::NoSuchProcess)?;
        table.slot_mut(slot).nice = nice;
        Ok(())
    }

    /// Grow (or with a negative `delta`, shrink) the current process's user
    /// memory. Returns the size before the change.
    pub fn grow(&self, delta: isize) -> KernelResult<usize> {
        let (slot, old, space) = {
            let table = self.lock();
            let slot = table
                .current(self.machine().cpu_id())
                .ok_or(KernelError::NoCurrentProcess)?;
            let p = table.slot(slot);
            (slot, p.size, p.address_space.as_ref().map(AddressSpace::alias))
        };

        let new = if delta >= 0 {
            old.checked_add(delta as usize)
        } else {
            old.checked_sub(delta.unsigned_abs())
        }
        .ok_or(KernelError::InvalidArgument)?;

        if new != old {
            let space = space.ok_or(KernelError::OutOfMemory)?;
            let size = self
                .machine()
                .resize(&space, old, new)
                .ok_or(KernelError::OutOfMemory)?;
            self.lock().slot_mut(slot).size = size;
        }
        Ok(old)
    }
}
