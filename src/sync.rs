//! Interrupt-masking spin lock.
//!
//! Holding a lock with interrupts on would deadlock the moment an interrupt
//! handler on the same CPU wants it, so every acquisition goes through the
//! machine's `push_off`, and every release through `pop_off`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use spin::Mutex;

use crate::machine::Machine;

pub struct IrqMutex<T> {
    lock: Mutex<()>,
    data: UnsafeCell<T>,
}

// The spin lock serializes every access to `data`.
unsafe impl<T: Send> Sync for IrqMutex<T> {}
unsafe impl<T: Send> Send for IrqMutex<T> {}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        IrqMutex {
            lock: Mutex::new(()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock<'a, M: Machine>(&'a self, machine: &'a M) -> IrqGuard<'a, T, M> {
        machine.push_off();
        core::mem::forget(self.lock.lock());
        IrqGuard { mutex: self, machine }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Take over a lock that is already held, without touching the
    /// interrupt nesting count.
    ///
    /// # Safety
    /// The lock must be held by a guard that was forgotten on the stack we
    /// switched away from, and nobody else may build a guard for it.
    pub unsafe fn adopt<'a, M: Machine>(&'a self, machine: &'a M) -> IrqGuard<'a, T, M> {
        IrqGuard { mutex: self, machine }
    }

    /// Release a lock whose guard lives on another, suspended, stack.
    ///
    /// # Safety
    /// The caller must be the logical owner of the lock: the context that
    /// was switched to while the lock was held.
    pub unsafe fn force_unlock<M: Machine>(&self, machine: &M) {
        unsafe { self.lock.force_unlock() };
        machine.pop_off();
    }
}

pub struct IrqGuard<'a, T, M: Machine> {
    mutex: &'a IrqMutex<T>,
    machine: &'a M,
}

impl<'a, T, M: Machine> Deref for IrqGuard<'a, T, M> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T, M: Machine> DerefMut for IrqGuard<'a, T, M> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T, M: Machine> Drop for IrqGuard<'a, T, M> {
    fn drop(&mut self) {
        // Unlock before interrupts can come back on.
        unsafe { self.mutex.lock.force_unlock() };
        self.machine.pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMachine;

    #[test]
    fn test_lock_masks_interrupts() {
        let machine = MockMachine::new();
        machine.enable_interrupts();
        let lock = IrqMutex::new(5u32);
        {
            let guard = lock.lock(&machine);
            assert_eq!(*guard, 5);
            assert!(!machine.interrupts_enabled());
            assert_eq!(machine.off_depth(), 1);
        }
        assert!(machine.interrupts_enabled());
        assert_eq!(machine.off_depth(), 0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_nested_locks_restore_on_last_release() {
        let machine = MockMachine::new();
        machine.enable_interrupts();
        let a = IrqMutex::new(());
        let b = IrqMutex::new(());
        let ga = a.lock(&machine);
        let gb = b.lock(&machine);
        assert_eq!(machine.off_depth(), 2);
        drop(ga);
        assert!(!machine.interrupts_enabled());
        drop(gb);
        assert!(machine.interrupts_enabled());
    }

    #[test]
    fn test_adopted_guard_releases_once() {
        let machine = MockMachine::new();
        let lock = IrqMutex::new(1u32);
        core::mem::forget(lock.lock(&machine));
        assert!(lock.is_locked());
        {
            let mut guard = unsafe { lock.adopt(&machine) };
            *guard += 1;
            assert_eq!(machine.off_depth(), 1);
        }
        assert!(!lock.is_locked());
        assert_eq!(machine.off_depth(), 0);
        assert_eq!(*lock.lock(&machine), 2);
    }
}
