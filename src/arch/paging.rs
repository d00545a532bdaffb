//! Physical frames and per-process page tables.
//!
//! The boot code identity-maps the first GiB through P4 entry 0, so a
//! physical address is also a kernel virtual address. User memory lives at
//! [`USER_BASE`] and above; every user table shares entry 0 with the kernel
//! table and owns the rest.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::mapper::TranslateResult;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::fs::FileRef;
use crate::machine::AddressSpace;
use crate::memory::mmap::{Protection, Region, RegionTable};

/// Lowest user virtual address: the start of P4 entry 1.
pub const USER_BASE: usize = 0x80_0000_0000;

/// Frames below this hold the kernel image and boot structures.
const FRAME_FLOOR: u64 = 0x0100_0000;
/// End of the identity map.
const FRAME_CEILING: u64 = 0x4000_0000;

/// P4 entries owned by user tables.
const USER_P4: core::ops::Range<usize> = 1..256;

/// Frames from the boot memory map, handed out in order, plus the ones
/// given back.
pub struct Frames {
    areas: Vec<(u64, u64)>,
    area: usize,
    next: u64,
    free: Vec<PhysFrame>,
}

impl Frames {
    fn new() -> Self {
        Frames {
            areas: Vec::new(),
            area: 0,
            next: 0,
            free: Vec::new(),
        }
    }

    /// Add a usable physical range, clipped to the frames we may hand out.
    pub fn add_area(&mut self, start: u64, end: u64) {
        let start = start.max(FRAME_FLOOR).next_multiple_of(PAGE_SIZE as u64);
        let end = end.min(FRAME_CEILING) & !(PAGE_SIZE as u64 - 1);
        if start < end {
            self.areas.push((start, end));
            if self.areas.len() == 1 {
                self.next = start;
            }
        }
    }

    pub fn deallocate(&mut self, frame: PhysFrame) {
        self.free.push(frame);
    }
}

unsafe impl FrameAllocator<Size4KiB> for Frames {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(frame) = self.free.pop() {
            return Some(frame);
        }
        while let Some(&(_, end)) = self.areas.get(self.area) {
            if self.next < end {
                let frame = PhysFrame::containing_address(PhysAddr::new(self.next));
                self.next += PAGE_SIZE as u64;
                return Some(frame);
            }
            self.area += 1;
            if let Some(&(start, _)) = self.areas.get(self.area) {
                self.next = start;
            }
        }
        None
    }
}

lazy_static! {
    pub static ref FRAMES: Mutex<Frames> = Mutex::new(Frames::new());
}

/// Run `f` on the frame allocator. Page-table work runs with the process
/// table unlocked, so the allocator masks interrupts itself.
pub fn with_frames<R>(f: impl FnOnce(&mut Frames) -> R) -> R {
    without_interrupts(|| f(&mut FRAMES.lock()))
}

/// Root of the table the kernel booted on.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    let (frame, _) = Cr3::read();
    KERNEL_ROOT.store(frame.start_address().as_u64(), Ordering::SeqCst);
}

fn table_at(frame: PhysFrame) -> &'static mut PageTable {
    unsafe { &mut *(frame.start_address().as_u64() as *mut PageTable) }
}

fn root_frame(space: &AddressSpace) -> PhysFrame {
    PhysFrame::containing_address(PhysAddr::new(space.root()))
}

fn mapper(space: &AddressSpace) -> OffsetPageTable<'static> {
    unsafe { OffsetPageTable::new(table_at(root_frame(space)), VirtAddr::new(0)) }
}

fn zeroed_frame(frames: &mut Frames) -> Option<PhysFrame> {
    let frame = frames.allocate_frame()?;
    unsafe { core::ptr::write_bytes(frame.start_address().as_u64() as *mut u8, 0, PAGE_SIZE) };
    Some(frame)
}

fn page(addr: usize) -> Page {
    Page::containing_address(VirtAddr::new(addr as u64))
}

fn user_flags(prot: Protection) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if prot.contains(Protection::WRITE) {
        flags |= PageTableFlags::WRITABLE;
    }
    flags
}

/// New table sharing the kernel's half, nothing mapped for user space.
pub fn new_space() -> Option<AddressSpace> {
    let frame = with_frames(zeroed_frame)?;
    let kernel = table_at(PhysFrame::containing_address(PhysAddr::new(
        KERNEL_ROOT.load(Ordering::SeqCst),
    )));
    let table = table_at(frame);
    for i in (0..512).filter(|i| !USER_P4.contains(i)) {
        table[i] = kernel[i].clone();
    }
    Some(AddressSpace::new(frame.start_address().as_u64()))
}

/// Map one zeroed page at `addr` and return its frame.
fn map_zeroed(
    space: &AddressSpace,
    frames: &mut Frames,
    addr: usize,
    flags: PageTableFlags,
) -> Option<PhysFrame> {
    let frame = zeroed_frame(frames)?;
    let mapped = unsafe { mapper(space).map_to(page(addr), frame, flags, frames) };
    match mapped {
        Ok(flush) => {
            flush.ignore();
            Some(frame)
        }
        Err(_) => {
            frames.deallocate(frame);
            None
        }
    }
}

fn unmap_pages(space: &AddressSpace, frames: &mut Frames, start: usize, end: usize) {
    let mut mapper = mapper(space);
    for addr in (start..end).step_by(PAGE_SIZE) {
        if let Ok((frame, flush)) = mapper.unmap(page(addr)) {
            flush.flush();
            frames.deallocate(frame);
        }
    }
}

/// Address space for the bootstrap process: `code` copied into one page at
/// [`USER_BASE`].
pub fn init_space(code: &[u8]) -> Option<AddressSpace> {
    let space = new_space()?;
    let flags = user_flags(Protection::READ | Protection::WRITE);
    let frame = match with_frames(|frames| map_zeroed(&space, frames, USER_BASE, flags)) {
        Some(frame) => frame,
        None => {
            free_space(space);
            return None;
        }
    };
    let len = code.len().min(PAGE_SIZE);
    unsafe {
        core::ptr::copy_nonoverlapping(
            code.as_ptr(),
            frame.start_address().as_u64() as *mut u8,
            len,
        )
    };
    Some(space)
}

/// Copy every mapped page of `[start, end)` from `parent` into `child`.
fn copy_pages(
    parent: &AddressSpace,
    child: &AddressSpace,
    frames: &mut Frames,
    start: usize,
    end: usize,
) -> Option<()> {
    let source = mapper(parent);
    for addr in (start..end).step_by(PAGE_SIZE) {
        let (phys, flags) = match source.translate(VirtAddr::new(addr as u64)) {
            TranslateResult::Mapped { frame, flags, .. } => (frame.start_address(), flags),
            _ => continue,
        };
        let frame = map_zeroed(child, frames, addr, flags)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys.as_u64() as *const u8,
                frame.start_address().as_u64() as *mut u8,
                PAGE_SIZE,
            )
        };
    }
    Some(())
}

pub fn copy_space(parent: &AddressSpace, size: usize, regions: &RegionTable) -> Option<AddressSpace> {
    let child = new_space()?;
    let copied = with_frames(|frames| {
        copy_pages(parent, &child, frames, USER_BASE, USER_BASE + size).and_then(|()| {
            regions.iter().filter(|r| r.addr >= USER_BASE).try_for_each(|r| {
                let end = crate::memory::page_round_up(r.end())?;
                copy_pages(parent, &child, frames, r.addr, end)
            })
        })
    });
    if copied.is_none() {
        free_space(child);
        return None;
    }
    Some(child)
}

/// Release every user page, every user page table and the root.
pub fn free_space(space: AddressSpace) {
    with_frames(|frames| {
        let p4 = table_at(root_frame(&space));
        for i in USER_P4 {
            free_table(frames, &p4[i], 3);
        }
        frames.deallocate(root_frame(&space));
    });
}

fn free_table(frames: &mut Frames, entry: &PageTableEntry, level: u8) {
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return;
    }
    let frame = PhysFrame::containing_address(entry.addr());
    if level > 0 {
        let table = table_at(frame);
        for child in table.iter() {
            free_table(frames, child, level - 1);
        }
    }
    frames.deallocate(frame);
}

/// Grow or shrink the program break from `old` to `new` bytes above
/// [`USER_BASE`].
pub fn resize(space: &AddressSpace, old: usize, new: usize) -> Option<usize> {
    let old_end = crate::memory::page_round_up(USER_BASE + old)?;
    let new_end = crate::memory::page_round_up(USER_BASE + new)?;
    with_frames(|frames| {
        if new_end < old_end {
            unmap_pages(space, frames, new_end, old_end);
            return Some(new);
        }
        let flags = user_flags(Protection::READ | Protection::WRITE);
        for addr in (old_end..new_end).step_by(PAGE_SIZE) {
            if map_zeroed(space, frames, addr, flags).is_none() {
                unmap_pages(space, frames, old_end, addr);
                return None;
            }
        }
        Some(new)
    })
}

/// Back every page of `region`, reading from `backing` when given.
pub fn populate(space: &AddressSpace, region: &Region, backing: Option<&FileRef>) -> KernelResult<()> {
    if region.addr < USER_BASE {
        return Err(KernelError::InvalidArgument);
    }
    let end = crate::memory::page_round_up(region.end()).ok_or(KernelError::InvalidArgument)?;
    let flags = user_flags(region.prot);
    for addr in (region.addr..end).step_by(PAGE_SIZE) {
        let frame = match with_frames(|frames| map_zeroed(space, frames, addr, flags)) {
            Some(frame) => frame,
            None => {
                with_frames(|frames| unmap_pages(space, frames, region.addr, addr));
                return Err(KernelError::OutOfMemory);
            }
        };
        if let Some(file) = backing {
            let dest = unsafe {
                core::slice::from_raw_parts_mut(frame.start_address().as_u64() as *mut u8, PAGE_SIZE)
            };
            let offset = region.offset + (addr - region.addr);
            file.lock().read_at(offset, dest);
        }
    }
    Ok(())
}

pub fn unmap(space: &AddressSpace, addr: usize, len: usize) {
    if addr < USER_BASE {
        return;
    }
    let end = match crate::memory::page_round_up(addr.saturating_add(len)) {
        Some(end) => end,
        None => return,
    };
    with_frames(|frames| unmap_pages(space, frames, addr, end));
}

pub fn activate(space: &AddressSpace) {
    unsafe { Cr3::write(root_frame(space), Cr3Flags::empty()) };
}

pub fn activate_kernel() {
    let frame = PhysFrame::containing_address(PhysAddr::new(KERNEL_ROOT.load(Ordering::SeqCst)));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}
