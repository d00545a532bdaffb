//! Memory mapping for processes.
//!
//! Placement and bookkeeping live in [`mmap`]; this module ties a region
//! table to the current process and to the machine that backs the pages.

pub mod mmap;

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::machine::{AddressSpace, Machine};
use mmap::{MapFlags, Protection, Region};

/// Round `addr` up to a page boundary, `None` on overflow.
pub fn page_round_up(addr: usize) -> Option<usize> {
    addr.checked_add(PAGE_SIZE - 1).map(|a| a & !(PAGE_SIZE - 1))
}

pub fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

impl<M: Machine> Kernel<M> {
    /// Map `length` bytes into the current process at or above `addr`.
    ///
    /// Anonymous mappings ignore `fd`; file mappings need it to name an
    /// open file. With [`MapFlags::POPULATE`] the pages are backed before
    /// returning. Returns the start of the new region.
    pub fn map(
        &self,
        addr: usize,
        length: usize,
        prot: Protection,
        flags: MapFlags,
        fd: Option<usize>,
        offset: usize,
    ) -> KernelResult<usize> {
        let mut table = self.lock();
        let slot = table
            .current(self.machine().cpu_id())
            .ok_or(KernelError::NoCurrentProcess)?;
        let p = table.slot_mut(slot);

        let anonymous = flags.contains(MapFlags::ANONYMOUS);
        let backing = if anonymous {
            None
        } else {
            let fd = fd.ok_or(KernelError::InvalidArgument)?;
            let file = p.open_files.get(fd).and_then(|f| f.clone());
            Some(file.ok_or(KernelError::InvalidArgument)?)
        };

        let (index, target) = p.regions.place(addr, length)?;
        let region = Region {
            addr: target,
            length,
            prot,
            flags,
            fd: if anonymous { None } else { fd },
            offset,
        };
        p.regions.insert(index, region);
        let pid = p.pid;
        let space = p.address_space.as_ref().map(AddressSpace::alias);
        drop(table);

        // The inserted region keeps the range reserved while it is backed.
        if flags.contains(MapFlags::POPULATE) {
            let populated = match space {
                Some(space) => self.machine().populate(&space, &region, backing.as_ref()),
                None => Err(KernelError::OutOfMemory),
            };
            if let Err(e) = populated {
                let mut table = self.lock();
                let regions = &mut table.slot_mut(slot).regions;
                let found = regions.iter().position(|r| r.addr == target);
                if let Some(index) = found {
                    regions.remove_at(index);
                }
                log::warn!("mmap: pid {} could not populate {:#x}: {}", pid, target, e);
                return Err(e);
            }
        }

        log::debug!("mmap: pid {} mapped {:#x}+{:#x}", pid, target, length);
        Ok(target)
    }

    /// Unmap part or all of one region of the current process; see
    /// [`mmap::RegionTable::unmap`].
    pub fn unmap(&self, addr: usize, length: usize) -> KernelResult<()> {
        let (pid, start, len, space) = {
            let mut table = self.lock();
            let slot = table
                .current(self.machine().cpu_id())
                .ok_or(KernelError::NoCurrentProcess)?;
            let p = table.slot_mut(slot);
            let (start, len) = p.regions.unmap(addr, length)?;
            (p.pid, start, len, p.address_space.as_ref().map(AddressSpace::alias))
        };

        if let Some(space) = space {
            self.machine().unmap_range(&space, start, len);
        }
        log::debug!("munmap: pid {} unmapped {:#x}+{:#x}", pid, start, len);
        Ok(())
    }
}
