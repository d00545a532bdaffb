//! Per-process table of mapped regions.
//!
//! Regions are kept sorted by address. Their page-rounded extents never
//! overlap, and a table never holds more than [`MAX_MMAPS`] of them.

use alloc::vec::Vec;
use bitflags::bitflags;

use super::{page_round_down, page_round_up};
use crate::config::MAX_MMAPS;
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Access rights of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// How a mapping is backed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Zero-filled memory, no file behind it.
        const ANONYMOUS = 1 << 0;
        /// Back the pages right away instead of on first touch.
        const POPULATE = 1 << 1;
    }
}

/// One mapped range of a process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Page-aligned start.
    pub addr: usize,
    pub length: usize,
    pub prot: Protection,
    pub flags: MapFlags,
    /// Descriptor of the backing file; `None` when anonymous.
    pub fd: Option<usize>,
    /// Offset into the backing file of `addr`.
    pub offset: usize,
}

impl Region {
    /// First address past the region, rounded up to a page.
    pub fn end(&self) -> usize {
        page_round_up(self.addr + self.length).unwrap_or(usize::MAX)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionTable {
    regions: Vec<Region>,
}

impl RegionTable {
    pub const fn new() -> Self {
        RegionTable { regions: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.regions.len() >= MAX_MMAPS
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    /// Find room for `length` bytes at `addr` rounded up to a page.
    ///
    /// Returns the index the region belongs at and its start address. A
    /// request above the last region is appended; otherwise the first gap
    /// (the one below the first region, then those between neighbours)
    /// whose bounds strictly enclose the request is taken. The gap's upper
    /// bound is compared against the unrounded end of the request.
    pub fn place(&self, addr: usize, length: usize) -> KernelResult<(usize, usize)> {
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if self.is_full() {
            return Err(KernelError::RegionTableFull);
        }
        let target = page_round_up(addr).ok_or(KernelError::InvalidArgument)?;
        let end = target.checked_add(length).ok_or(KernelError::InvalidArgument)?;
        page_round_up(end).ok_or(KernelError::InvalidArgument)?;

        let last = match self.regions.last() {
            Some(last) => last,
            None => return Ok((0, target)),
        };
        if target > last.end() {
            return Ok((self.regions.len(), target));
        }

        let mut floor: Option<usize> = None;
        for (i, region) in self.regions.iter().enumerate() {
            let above_floor = floor.map_or(true, |f| target > f);
            if above_floor && region.addr > end {
                return Ok((i, target));
            }
            floor = Some(region.end());
        }
        Err(KernelError::NoFit)
    }

    /// Insert at an index obtained from [`RegionTable::place`].
    pub fn insert(&mut self, index: usize, region: Region) {
        debug_assert!(!self.is_full());
        self.regions.insert(index, region);
    }

    pub fn remove_at(&mut self, index: usize) -> Region {
        self.regions.remove(index)
    }

    /// Drop `[addr, addr + length)` rounded out to pages from the region
    /// holding `addr`; `length == 0` drops that whole region.
    ///
    /// Returns the page-aligned range that is no longer mapped.
    pub fn unmap(&mut self, addr: usize, length: usize) -> KernelResult<(usize, usize)> {
        let start = page_round_down(addr);
        let index = self
            .regions
            .iter()
            .position(|r| r.contains(start))
            .ok_or(KernelError::NotMapped)?;
        let region = self.regions[index];
        let (rs, re) = (region.addr, region.end());

        if length == 0 {
            self.regions.remove(index);
            return Ok((rs, re - rs));
        }

        let end = addr
            .checked_add(length)
            .and_then(page_round_up)
            .ok_or(KernelError::InvalidArgument)?;
        if end > re {
            return Err(KernelError::NotMapped);
        }
        let data_end = rs + region.length;

        match (start == rs, end == re) {
            (true, true) => {
                self.regions.remove(index);
            }
            (true, false) => {
                let r = &mut self.regions[index];
                r.addr = end;
                r.length = data_end - end;
                r.offset += end - rs;
            }
            (false, true) => {
                self.regions[index].length = start - rs;
            }
            (false, false) => {
                if self.is_full() {
                    return Err(KernelError::RegionTableFull);
                }
                let tail = Region {
                    addr: end,
                    length: data_end - end,
                    offset: region.offset + (end - rs),
                    ..region
                };
                self.regions[index].length = start - rs;
                self.regions.insert(index + 1, tail);
            }
        }
        Ok((start, end - start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    const P: usize = PAGE_SIZE;

    fn anon(table: &mut RegionTable, addr: usize, length: usize) -> KernelResult<usize> {
        let (index, target) = table.place(addr, length)?;
        table.insert(
            index,
            Region {
                addr: target,
                length,
                prot: Protection::READ | Protection::WRITE,
                flags: MapFlags::ANONYMOUS,
                fd: None,
                offset: 0,
            },
        );
        Ok(target)
    }

    fn starts(table: &RegionTable) -> Vec<usize> {
        table.iter().map(|r| r.addr).collect()
    }

    #[test]
    fn test_first_mapping_rounds_up() {
        let mut table = RegionTable::new();
        assert_eq!(anon(&mut table, 0x1001, 100), Ok(0x2000));
        assert_eq!(table.get(0).unwrap().end(), 0x3000);
    }

    #[test]
    fn test_disjoint_mappings_stay_sorted() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, P).unwrap();
        anon(&mut table, 0x20000, P).unwrap();
        anon(&mut table, 0x15000, P).unwrap();
        anon(&mut table, 0x1000, P).unwrap();
        assert_eq!(starts(&table), vec![0x1000, 0x10000, 0x15000, 0x20000]);
    }

    #[test]
    fn test_overlap_is_rejected() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, 2 * P).unwrap();
        anon(&mut table, 0x20000, P).unwrap();
        assert_eq!(anon(&mut table, 0x11000, P), Err(KernelError::NoFit));
        assert_eq!(anon(&mut table, 0x1f000, 2 * P), Err(KernelError::NoFit));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_touching_neighbours_is_rejected() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, P).unwrap();
        // Directly after the last region is not strictly above it.
        assert_eq!(anon(&mut table, 0x11000, P), Err(KernelError::NoFit));
        // Ending exactly where the next region starts.
        assert_eq!(anon(&mut table, 0xf000, P), Err(KernelError::NoFit));
        assert_eq!(anon(&mut table, 0xe000, P), Ok(0xe000));
    }

    #[test]
    fn test_partial_page_below_neighbour() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, P).unwrap();
        anon(&mut table, 0x20000, P).unwrap();
        assert_eq!(table.place(0x1f000, P / 2), Ok((1, 0x1f000)));
        assert_eq!(anon(&mut table, 0x1f000, P / 2), Ok(0x1f000));
        assert_eq!(starts(&table), vec![0x10000, 0x1f000, 0x20000]);
        assert_eq!(table.get(1).unwrap().end(), 0x20000);
    }

    #[test]
    fn test_zero_length_is_invalid() {
        let table = RegionTable::new();
        assert_eq!(table.place(0x1000, 0), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_overflowing_request_is_invalid() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x1000, P).unwrap();
        assert_eq!(table.place(usize::MAX - 10, P), Err(KernelError::InvalidArgument));
        assert_eq!(table.place(0x8000, usize::MAX), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_table_capacity() {
        let mut table = RegionTable::new();
        for i in 0..MAX_MMAPS {
            anon(&mut table, (2 * i + 1) * P, P).unwrap();
        }
        assert!(table.is_full());
        assert_eq!(
            anon(&mut table, 0x1000_0000, P),
            Err(KernelError::RegionTableFull)
        );
    }

    #[test]
    fn test_unmap_whole_region() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, 3 * P).unwrap();
        assert_eq!(table.unmap(0x11234, 0), Ok((0x10000, 3 * P)));
        assert!(table.is_empty());
        assert_eq!(table.unmap(0x10000, 0), Err(KernelError::NotMapped));
    }

    #[test]
    fn test_unmap_exact_range() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, 2 * P).unwrap();
        assert_eq!(table.unmap(0x10000, 2 * P), Ok((0x10000, 2 * P)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_unmap_prefix_advances_offset() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, 4 * P).unwrap();
        assert_eq!(table.unmap(0x10000, P), Ok((0x10000, P)));
        let r = table.get(0).unwrap();
        assert_eq!((r.addr, r.length, r.offset), (0x11000, 3 * P, P));
    }

    #[test]
    fn test_unmap_suffix() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, 4 * P).unwrap();
        assert_eq!(table.unmap(0x12000, 2 * P), Ok((0x12000, 2 * P)));
        let r = table.get(0).unwrap();
        assert_eq!((r.addr, r.length, r.end()), (0x10000, 2 * P, 0x12000));
    }

    #[test]
    fn test_unmap_middle_splits() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, 4 * P).unwrap();
        assert_eq!(table.unmap(0x11000, P), Ok((0x11000, P)));
        assert_eq!(table.len(), 2);
        let (head, tail) = (table.get(0).unwrap(), table.get(1).unwrap());
        assert_eq!((head.addr, head.length), (0x10000, P));
        assert_eq!((tail.addr, tail.length, tail.offset), (0x12000, 2 * P, 2 * P));
    }

    #[test]
    fn test_split_needs_a_free_entry() {
        let mut table = RegionTable::new();
        for i in 0..MAX_MMAPS {
            anon(&mut table, (4 * i + 1) * P, 3 * P).unwrap();
        }
        assert_eq!(table.unmap(2 * P, P), Err(KernelError::RegionTableFull));
        assert_eq!(table.len(), MAX_MMAPS);
    }

    #[test]
    fn test_unmap_past_region_end_fails() {
        let mut table = RegionTable::new();
        anon(&mut table, 0x10000, P).unwrap();
        assert_eq!(table.unmap(0x10000, 2 * P), Err(KernelError::NotMapped));
        assert_eq!(table.len(), 1);
    }
}
