//! Interrupt descriptor table, the int 0x80 system call gate, and the
//! trap frame shared by system calls and freshly created processes.

use core::arch::naked_asm;
use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::{PrivilegeLevel, VirtAddr};

use super::{gdt, KERNEL};
use crate::machine::Machine;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const SYSCALL_VECTOR: usize = 0x80;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

/// Registers saved on the kernel stack by [`syscall_entry`], in stack order,
/// followed by the frame the CPU pushed on the way in.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub rcx: u64,
    pub rbx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Where the trap frame of a process sits on its kernel stack.
    pub fn on_stack(top: u64) -> *mut TrapFrame {
        (top - core::mem::size_of::<TrapFrame>() as u64) as *mut TrapFrame
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(syscall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
    unsafe { PICS.lock().initialize() };
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    log::error!("EXCEPTION: PAGE FAULT at {:?} ({:?})", Cr2::read(), error_code);
    panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}",
        stack_frame
    );
}

extern "x86-interrupt" fn timer_interrupt_handler(stack_frame: InterruptStackFrame) {
    if KERNEL.machine().cpu_id() == 0 {
        KERNEL.timer_tick();
    }
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    let from_user = stack_frame.code_segment & 3 == 3;
    if from_user && KERNEL.killed() {
        KERNEL.exit();
    }
    if KERNEL.should_preempt() {
        KERNEL.yield_now();
    }
}

/// The int 0x80 gate, entered from ring 3 with the syscall number in RAX
/// and arguments in RDI, RSI, RDX, R10, R8, R9. The result goes back in RAX.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",
        // syscall_trap(frame, number)
        "mov rdi, rsp",
        "mov rsi, rax",
        // 5 words from the CPU plus 14 pushed leave RSP 8 off alignment.
        "sub rsp, 8",
        "call {trap}",
        "add rsp, 8",
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        trap = sym syscall_trap,
    );
}

extern "C" fn syscall_trap(frame: &TrapFrame, number: u64) -> i64 {
    // The gate masked interrupts; a system call may sleep.
    x86_64::instructions::interrupts::enable();
    let args = [frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9].map(|a| a as i64);
    let result = crate::syscalls::dispatch(&*KERNEL, number, args);
    if KERNEL.killed() {
        KERNEL.exit();
    }
    x86_64::instructions::interrupts::disable();
    result
}

/// First code a new process runs. Entered by the context switch with RSP
/// at the process's trap frame; leaves to user space with RAX = 0.
#[unsafe(naked)]
pub extern "C" fn fork_trampoline() {
    naked_asm!(
        "sub rsp, 8",
        "call {forkret}",
        "add rsp, 8",
        "xor rax, rax",
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        forkret = sym forkret,
    );
}

extern "C" fn forkret() {
    // The scheduler switched here holding the table lock.
    unsafe { KERNEL.release_inherited_lock() };
}
