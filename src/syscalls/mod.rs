//! System call surface of the process core.
//!
//! Arguments arrive as raw integers already fetched by the trap layer.
//! Each `sys_*` function checks them, calls into the kernel, and folds the
//! result into the single integer returned to user space: `-1` for any
//! error.

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::memory::mmap::{MapFlags, Protection};
use crate::process::ProcessId;
use crate::scheduler::weights::Nice;

/// Syscall numbers (passed in RAX from userland).
pub const SYS_FORK: u64 = 1;
pub const SYS_EXIT: u64 = 2;
pub const SYS_WAIT: u64 = 3;
pub const SYS_KILL: u64 = 6;
pub const SYS_GETPID: u64 = 11;
pub const SYS_SBRK: u64 = 12;
pub const SYS_SLEEP: u64 = 13;
pub const SYS_UPTIME: u64 = 14;
pub const SYS_GETPNAME: u64 = 22;
pub const SYS_GETNICE: u64 = 23;
pub const SYS_SETNICE: u64 = 24;
pub const SYS_PS: u64 = 25;
pub const SYS_MMAP: u64 = 26;
pub const SYS_MUNMAP: u64 = 27;
pub const SYS_YIELD: u64 = 28;

/// Central syscall dispatcher, called from the trap handler with the
/// syscall number and its six argument registers.
pub fn dispatch<M: Machine>(k: &Kernel<M>, number: u64, args: [i64; 6]) -> i64 {
    match number {
        SYS_FORK => sys_fork(k),
        SYS_EXIT => sys_exit(k),
        SYS_WAIT => sys_wait(k),
        SYS_KILL => sys_kill(k, args[0]),
        SYS_GETPID => sys_getpid(k),
        SYS_SBRK => sys_sbrk(k, args[0]),
        SYS_SLEEP => sys_sleep(k, args[0]),
        SYS_UPTIME => sys_uptime(k),
        SYS_GETPNAME => sys_getpname(k, args[0]),
        SYS_GETNICE => sys_getnice(k, args[0]),
        SYS_SETNICE => sys_setnice(k, args[0], args[1]),
        SYS_PS => sys_ps(k, args[0]),
        SYS_MMAP => sys_mmap(k, args[0], args[1], args[2], args[3], args[4], args[5]),
        SYS_MUNMAP => sys_munmap(k, args[0], args[1]),
        SYS_YIELD => sys_yield(k),
        _ => {
            log::warn!("syscall: unknown number {}", number);
            -1
        }
    }
}

fn ret(result: KernelResult<i64>) -> i64 {
    match result {
        Ok(value) => value,
        Err(e) => {
            log::debug!("syscall: {}", e);
            -1
        }
    }
}

/// A user-supplied pid; zero and negative values name no process.
fn pid_arg(pid: i64) -> Option<ProcessId> {
    if pid > 0 {
        Some(ProcessId(pid as u64))
    } else {
        None
    }
}

pub fn sys_fork<M: Machine>(k: &Kernel<M>) -> i64 {
    ret(k.fork().map(|pid| pid.as_u64() as i64))
}

pub fn sys_exit<M: Machine>(k: &Kernel<M>) -> ! {
    k.exit()
}

pub fn sys_wait<M: Machine>(k: &Kernel<M>) -> i64 {
    ret(k.wait().map(|pid| pid.as_u64() as i64))
}

pub fn sys_kill<M: Machine>(k: &Kernel<M>, pid: i64) -> i64 {
    match pid_arg(pid) {
        Some(pid) => ret(k.kill(pid).map(|()| 0)),
        None => -1,
    }
}

pub fn sys_getpid<M: Machine>(k: &Kernel<M>) -> i64 {
    ret(k.getpid().map(|pid| pid.as_u64() as i64))
}

pub fn sys_sbrk<M: Machine>(k: &Kernel<M>, n: i64) -> i64 {
    let delta = match isize::try_from(n) {
        Ok(delta) => delta,
        Err(_) => return -1,
    };
    ret(k.grow(delta).map(|old| old as i64))
}

pub fn sys_sleep<M: Machine>(k: &Kernel<M>, ticks: i64) -> i64 {
    if ticks < 0 {
        return -1;
    }
    ret(k.sleep_ticks(ticks as u64).map(|()| 0))
}

pub fn sys_uptime<M: Machine>(k: &Kernel<M>) -> i64 {
    k.uptime() as i64
}

pub fn sys_getpname<M: Machine>(k: &Kernel<M>, pid: i64) -> i64 {
    match pid_arg(pid) {
        Some(pid) => ret(k.getpname(pid).map(|_| 0)),
        None => -1,
    }
}

pub fn sys_getnice<M: Machine>(k: &Kernel<M>, pid: i64) -> i64 {
    match pid_arg(pid) {
        Some(pid) => ret(k.getnice(pid).map(|nice| nice.get() as i64)),
        None => -1,
    }
}

pub fn sys_setnice<M: Machine>(k: &Kernel<M>, pid: i64, value: i64) -> i64 {
    let (pid, nice) = match (pid_arg(pid), Nice::try_from(value)) {
        (Some(pid), Ok(nice)) => (pid, nice),
        _ => return -1,
    };
    ret(k.setnice(pid, nice).map(|()| 0))
}

pub fn sys_ps<M: Machine>(k: &Kernel<M>, pid: i64) -> i64 {
    let filter = if pid == 0 {
        None
    } else {
        Some(ProcessId(pid as u64))
    };
    k.ps(filter);
    0
}

/// `fd < 0` asks for an anonymous mapping whatever `flags` says.
pub fn sys_mmap<M: Machine>(
    k: &Kernel<M>,
    addr: i64,
    length: i64,
    prot: i64,
    flags: i64,
    fd: i64,
    offset: i64,
) -> i64 {
    if addr < 0 || length <= 0 || offset < 0 {
        return -1;
    }
    let prot = Protection::from_bits_truncate(prot as u32);
    let mut flags = MapFlags::from_bits_truncate(flags as u32);
    let fd = if fd < 0 {
        flags.insert(MapFlags::ANONYMOUS);
        None
    } else {
        Some(fd as usize)
    };
    ret(k
        .map(addr as usize, length as usize, prot, flags, fd, offset as usize)
        .map(|addr| addr as i64))
}

/// With `length == 0` the whole region holding `addr` goes.
pub fn sys_munmap<M: Machine>(k: &Kernel<M>, addr: i64, length: i64) -> i64 {
    if addr < 0 || length < 0 {
        return -1;
    }
    ret(k.unmap(addr as usize, length as usize).map(|()| 0))
}

pub fn sys_yield<M: Machine>(k: &Kernel<M>) -> i64 {
    k.yield_now();
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NPROC, PAGE_SIZE};
    use crate::testing::{boot, dispatch};

    fn call<M: Machine>(k: &Kernel<M>, number: u64, a: &[i64]) -> i64 {
        let mut args = [0i64; 6];
        args[..a.len()].copy_from_slice(a);
        super::dispatch(k, number, args)
    }

    #[test]
    fn test_unknown_number() {
        let (k, _) = boot();
        assert_eq!(call(&k, 999, &[]), -1);
    }

    #[test]
    fn test_setnice_rejects_out_of_range() {
        let (k, init) = boot();
        let pid = init.as_u64() as i64;
        assert_eq!(call(&k, SYS_SETNICE, &[pid, 7]), 0);
        assert_eq!(call(&k, SYS_SETNICE, &[pid, 40]), -1);
        assert_eq!(call(&k, SYS_SETNICE, &[pid, -1]), -1);
        assert_eq!(call(&k, SYS_GETNICE, &[pid]), 7);
        assert_eq!(call(&k, SYS_SETNICE, &[99, 5]), -1);
        assert_eq!(call(&k, SYS_GETNICE, &[0]), -1);
    }

    #[test]
    fn test_fork_wait_cycle() {
        let (k, _) = boot();
        dispatch(&k);
        assert_eq!(call(&k, SYS_WAIT, &[]), -1);
        let child = call(&k, SYS_FORK, &[]);
        assert_eq!(child, 2);
        assert_eq!(call(&k, SYS_GETPID, &[]), 1);
        assert_eq!(call(&k, SYS_GETPNAME, &[child]), 0);
        assert_eq!(call(&k, SYS_GETPNAME, &[50]), -1);

        let slot = crate::testing::slot_of(&k, ProcessId(child as u64));
        drop(k.exit_slot(slot));
        assert_eq!(call(&k, SYS_WAIT, &[]), child);
        assert_eq!(call(&k, SYS_GETNICE, &[child]), -1);
    }

    #[test]
    fn test_fork_fails_when_table_is_full() {
        let (k, _) = boot();
        dispatch(&k);
        for _ in 1..NPROC {
            assert!(call(&k, SYS_FORK, &[]) > 0);
        }
        assert_eq!(call(&k, SYS_FORK, &[]), -1);
    }

    #[test]
    fn test_kill_validates_pid() {
        let (k, init) = boot();
        assert_eq!(call(&k, SYS_KILL, &[0]), -1);
        assert_eq!(call(&k, SYS_KILL, &[-3]), -1);
        assert_eq!(call(&k, SYS_KILL, &[12]), -1);
        assert_eq!(call(&k, SYS_KILL, &[init.as_u64() as i64]), 0);
    }

    #[test]
    fn test_mmap_and_munmap() {
        let (k, _) = boot();
        dispatch(&k);
        let page = PAGE_SIZE as i64;
        let rw = (Protection::READ | Protection::WRITE).bits() as i64;

        assert_eq!(call(&k, SYS_MMAP, &[0x10000, page, rw, 0, -1, 0]), 0x10000);
        assert_eq!(call(&k, SYS_MMAP, &[0x10000, page, rw, 0, -1, 0]), -1);
        assert_eq!(call(&k, SYS_MMAP, &[0x20000, 0, rw, 0, -1, 0]), -1);
        assert_eq!(call(&k, SYS_MMAP, &[0x20000, page, rw, 0, -1, -4]), -1);
        assert_eq!(call(&k, SYS_MMAP, &[0x30001, page, rw, 0, -1, 0]), 0x31000);

        assert_eq!(call(&k, SYS_MUNMAP, &[0x10000]), 0);
        assert_eq!(call(&k, SYS_MUNMAP, &[0x10000]), -1);
        assert_eq!(call(&k, SYS_MUNMAP, &[0x31000, page]), 0);
        assert_eq!(call(&k, SYS_MUNMAP, &[-1]), -1);
    }

    #[test]
    fn test_sbrk_returns_old_size() {
        let (k, _) = boot();
        dispatch(&k);
        let page = PAGE_SIZE as i64;
        assert_eq!(call(&k, SYS_SBRK, &[page]), page);
        assert_eq!(call(&k, SYS_SBRK, &[0]), 2 * page);
        assert_eq!(call(&k, SYS_SBRK, &[-10 * page]), -1);
    }

    #[test]
    fn test_clock_calls() {
        let (k, _) = boot();
        dispatch(&k);
        k.timer_tick();
        assert_eq!(call(&k, SYS_UPTIME, &[]), 1);
        assert_eq!(call(&k, SYS_SLEEP, &[-1]), -1);
        assert_eq!(call(&k, SYS_SLEEP, &[0]), 0);
    }

    #[test]
    fn test_ps_and_yield() {
        let (k, _) = boot();
        dispatch(&k);
        assert_eq!(call(&k, SYS_PS, &[0]), 0);
        assert_eq!(call(&k, SYS_PS, &[77]), 0);
        assert_eq!(call(&k, SYS_YIELD, &[]), 0);
        assert_eq!(k.machine().switches(), 1);
    }
}
