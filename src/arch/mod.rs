//! Bare-metal x86_64 machine: the kernel instance, boot, and the hardware
//! behind [`Machine`].

pub mod gdt;
pub mod paging;
pub mod serial;
pub mod trap;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use lazy_static::lazy_static;
use linked_list_allocator::LockedHeap;
use x86_64::instructions::interrupts;

use crate::config::{SchedConfig, KERNEL_STACK_SIZE, NCPU, PAGE_SIZE};
use crate::error::KernelResult;
use crate::fs::FileRef;
use crate::kernel::{Kernel, TableGuard};
use crate::machine::{AddressSpace, KernelStack, Machine};
use crate::memory::mmap::{Region, RegionTable};
use crate::scheduler::context::{switch_context, Context};
use paging::USER_BASE;
use trap::TrapFrame;

/// The bootstrap program: `yield` forever.
///
/// ```text
/// 1: mov rax, 28
///    int 0x80
///    jmp 1b
/// ```
const INITCODE: [u8; 11] = [0x48, 0xc7, 0xc0, 0x1c, 0x00, 0x00, 0x00, 0xcd, 0x80, 0xeb, 0xf5];

/// Kernel heap, inside the identity-mapped image.
const HEAP_SIZE: usize = 4 * 1024 * 1024;
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Clock units are 1024 TSC cycles.
const TSC_SHIFT: u32 = 10;

pub struct BareMetal {
    depth: [AtomicUsize; NCPU],
    intena: [AtomicBool; NCPU],
}

impl BareMetal {
    fn new() -> Self {
        BareMetal {
            depth: [const { AtomicUsize::new(0) }; NCPU],
            intena: [const { AtomicBool::new(false) }; NCPU],
        }
    }
}

impl Machine for BareMetal {
    fn cpu_id(&self) -> usize {
        let apic_id = unsafe { core::arch::x86_64::__cpuid(1) }.ebx >> 24;
        apic_id as usize % NCPU
    }

    fn push_off(&self) {
        let was_on = interrupts::are_enabled();
        interrupts::disable();
        let cpu = self.cpu_id();
        if self.depth[cpu].fetch_add(1, Ordering::SeqCst) == 0 {
            self.intena[cpu].store(was_on, Ordering::SeqCst);
        }
    }

    fn pop_off(&self) {
        if interrupts::are_enabled() {
            panic!("pop_off - interruptible");
        }
        let cpu = self.cpu_id();
        let depth = self.depth[cpu].load(Ordering::SeqCst);
        if depth == 0 {
            panic!("pop_off");
        }
        self.depth[cpu].store(depth - 1, Ordering::SeqCst);
        if depth == 1 && self.intena[cpu].load(Ordering::SeqCst) {
            interrupts::enable();
        }
    }

    fn off_depth(&self) -> usize {
        self.depth[self.cpu_id()].load(Ordering::SeqCst)
    }

    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn intena(&self) -> bool {
        self.intena[self.cpu_id()].load(Ordering::SeqCst)
    }

    fn set_intena(&self, on: bool) {
        self.intena[self.cpu_id()].store(on, Ordering::SeqCst);
    }

    fn now(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() >> TSC_SHIFT }
    }

    fn alloc_kernel_stack(&self) -> Option<KernelStack> {
        let mut stack = Vec::new();
        stack.try_reserve_exact(KERNEL_STACK_SIZE).ok()?;
        stack.resize(KERNEL_STACK_SIZE, 0u8);
        let base = Box::into_raw(stack.into_boxed_slice()) as *mut u8 as u64;
        Some(KernelStack::new(base, KERNEL_STACK_SIZE))
    }

    fn free_kernel_stack(&self, stack: KernelStack) {
        let raw = core::ptr::slice_from_raw_parts_mut(stack.base() as *mut u8, stack.size());
        drop(unsafe { Box::from_raw(raw) });
    }

    fn create_init_space(&self) -> Option<AddressSpace> {
        paging::init_space(&INITCODE)
    }

    fn copy_address_space(
        &self,
        parent: &AddressSpace,
        size: usize,
        regions: &RegionTable,
    ) -> Option<AddressSpace> {
        paging::copy_space(parent, size, regions)
    }

    fn free_address_space(&self, space: AddressSpace, _size: usize, _regions: &RegionTable) {
        paging::free_space(space);
    }

    fn resize(&self, space: &AddressSpace, old: usize, new: usize) -> Option<usize> {
        paging::resize(space, old, new)
    }

    fn populate(
        &self,
        space: &AddressSpace,
        region: &Region,
        backing: Option<&FileRef>,
    ) -> KernelResult<()> {
        paging::populate(space, region, backing)
    }

    fn unmap_range(&self, space: &AddressSpace, addr: usize, len: usize) {
        paging::unmap(space, addr, len);
    }

    fn activate_user(&self, space: &AddressSpace, stack: &KernelStack) {
        gdt::set_kernel_stack(stack.top());
        paging::activate(space);
    }

    fn activate_kernel(&self) {
        paging::activate_kernel();
    }

    fn first_context(&self, stack: &KernelStack) -> Context {
        let frame = TrapFrame::on_stack(stack.top());
        unsafe {
            frame.write(TrapFrame {
                rip: USER_BASE as u64,
                cs: u64::from(gdt::user_code_selector().0),
                rflags: 0x202,
                rsp: (USER_BASE + PAGE_SIZE) as u64,
                ss: u64::from(gdt::user_data_selector().0),
                ..TrapFrame::default()
            })
        };
        Context::resume_at(trap::fork_trampoline as usize as u64, frame as u64)
    }

    fn fork_context(&self, parent: &KernelStack, child: &KernelStack) -> Context {
        let frame = TrapFrame::on_stack(child.top());
        unsafe { frame.write(TrapFrame::on_stack(parent.top()).read()) };
        Context::resume_at(trap::fork_trampoline as usize as u64, frame as u64)
    }

    unsafe fn switch<'a>(
        &self,
        kernel: &'a Kernel<Self>,
        guard: TableGuard<'a, Self>,
        from: *mut Context,
        to: *const Context,
    ) -> TableGuard<'a, Self> {
        // The lock stays held across the switch; whoever switches back to
        // `from` has forgotten its own guard the same way.
        core::mem::forget(guard);
        unsafe {
            switch_context(from, to);
            kernel.adopt_lock()
        }
    }

    fn idle(&self) {
        x86_64::instructions::hlt();
    }
}

lazy_static! {
    pub static ref KERNEL: Kernel<BareMetal> = Kernel::new(BareMetal::new(), SchedConfig::default());
}

/// Entered from the multiboot2 boot stub with the boot information address.
#[no_mangle]
pub extern "C" fn kernel_main(multiboot_info_addr: usize) -> ! {
    unsafe {
        let heap = &raw mut HEAP;
        ALLOCATOR.lock().init(heap as *mut u8, HEAP_SIZE);
    }
    serial::init();
    gdt::init();
    trap::init();
    paging::init();

    let boot_info = match unsafe { multiboot2::BootInformation::load(multiboot_info_addr as *const _) } {
        Ok(info) => info,
        Err(e) => panic!("boot: bad multiboot2 information: {:?}", e),
    };
    let memory_map = match boot_info.memory_map_tag() {
        Some(tag) => tag,
        None => panic!("boot: no memory map"),
    };
    paging::with_frames(|frames| {
        for area in memory_map.memory_areas() {
            if multiboot2::MemoryAreaType::from(area.typ()) == multiboot2::MemoryAreaType::Available {
                frames.add_area(area.start_address(), area.end_address());
            }
        }
    });
    log::info!("boot: memory map loaded");

    KERNEL.userinit();
    KERNEL.scheduler()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();
    log::error!("{}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
