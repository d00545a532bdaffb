//! Channel-based blocking.
//!
//! A sleeper and a waker agree on a [`Channel`]. The sleeper's state change
//! and the waker's scan both happen under the table lock, and the sleeper
//! takes the table lock before letting go of its own lock, so a wakeup sent
//! after the sleeper checked its condition is never lost.

use crate::kernel::{Kernel, TableGuard};
use crate::machine::Machine;
use crate::process::ProcessState;
use crate::sync::{IrqGuard, IrqMutex};

/// What a sleeping process waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// A parent in `wait`, keyed by its slot.
    Child(usize),
    /// The tick counter.
    Ticks,
    /// Any other kernel object, keyed by its address.
    Address(usize),
}

impl Channel {
    pub fn of<T>(object: &T) -> Channel {
        Channel::Address(object as *const T as usize)
    }
}

impl<M: Machine> Kernel<M> {
    /// Atomically release `held` and sleep on `channel`; `lock` is acquired
    /// again before returning.
    pub fn sleep<'a, T>(
        &'a self,
        channel: Channel,
        lock: &'a IrqMutex<T>,
        held: IrqGuard<'a, T, M>,
    ) -> IrqGuard<'a, T, M> {
        let table = self.lock();
        drop(held);
        let table = self.sleep_locked(channel, table);
        drop(table);
        lock.lock(self.machine())
    }

    /// Sleep on `channel` when the caller's lock is the table lock itself.
    pub(crate) fn sleep_locked<'a>(
        &'a self,
        channel: Channel,
        mut table: TableGuard<'a, M>,
    ) -> TableGuard<'a, M> {
        let slot = match table.current(self.machine().cpu_id()) {
            Some(slot) => slot,
            None => panic!("sleep"),
        };

        let p = table.slot_mut(slot);
        p.channel = Some(channel);
        p.state = ProcessState::Sleeping;

        let mut table = self.sched(table);

        table.slot_mut(slot).channel = None;
        table
    }

    /// Make every process sleeping on `channel` runnable.
    pub fn wakeup(&self, channel: Channel) {
        let mut table = self.lock();
        wakeup_locked(&mut table, channel);
    }
}

pub(crate) fn wakeup_locked(table: &mut crate::process::ProcessTable, channel: Channel) {
    for p in table.slots.iter_mut() {
        if p.state == ProcessState::Sleeping && p.channel == Some(channel) {
            p.state = ProcessState::Runnable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{boot, dispatch, spawn_child};

    #[test]
    fn test_wakeup_only_matching_channel() {
        let (k, _init) = boot();
        let a = spawn_child(&k);
        let b = spawn_child(&k);
        {
            let mut table = k.lock();
            let sa = table.find(a).unwrap();
            let sb = table.find(b).unwrap();
            table.slot_mut(sa).state = ProcessState::Sleeping;
            table.slot_mut(sa).channel = Some(Channel::Address(1));
            table.slot_mut(sb).state = ProcessState::Sleeping;
            table.slot_mut(sb).channel = Some(Channel::Address(2));
        }

        k.wakeup(Channel::Address(1));

        let table = k.lock();
        assert_eq!(table.slot(table.find(a).unwrap()).state, ProcessState::Runnable);
        assert_eq!(table.slot(table.find(b).unwrap()).state, ProcessState::Sleeping);
    }

    #[test]
    fn test_wakeup_wakes_every_waiter() {
        let (k, _init) = boot();
        let kids = [spawn_child(&k), spawn_child(&k), spawn_child(&k)];
        {
            let mut table = k.lock();
            for pid in kids {
                let slot = table.find(pid).unwrap();
                table.slot_mut(slot).state = ProcessState::Sleeping;
                table.slot_mut(slot).channel = Some(Channel::Ticks);
            }
        }
        k.wakeup(Channel::Ticks);
        let table = k.lock();
        for pid in kids {
            assert_eq!(table.slot(table.find(pid).unwrap()).state, ProcessState::Runnable);
        }
    }

    #[test]
    fn test_sleep_releases_and_reacquires_caller_lock() {
        let (k, init) = boot();
        dispatch(&k);
        let lock = IrqMutex::new(7u32);
        let chan = Channel::of(&lock);

        // While we are asleep the lock must be free and we must be Sleeping.
        k.machine().on_switch(move |k| {
            {
                let table = k.lock();
                let slot = table.find(init).unwrap();
                assert_eq!(table.slot(slot).state, ProcessState::Sleeping);
                assert_eq!(table.slot(slot).channel, Some(chan));
            }
            k.wakeup(chan);
        });

        let held = lock.lock(k.machine());
        let held = k.sleep(chan, &lock, held);
        assert_eq!(*held, 7);
        drop(held);

        let table = k.lock();
        let slot = table.find(init).unwrap();
        assert_eq!(table.slot(slot).channel, None);
    }

    #[test]
    fn test_lock_is_free_while_asleep() {
        let (k, _init) = boot();
        dispatch(&k);
        let lock = std::sync::Arc::new(IrqMutex::new(()));
        let observed = lock.clone();
        let chan = Channel::Address(0x42);
        k.machine().on_switch(move |k| {
            assert!(!observed.is_locked());
            k.wakeup(chan);
        });
        let held = lock.lock(k.machine());
        drop(k.sleep(chan, &lock, held));
    }
}
