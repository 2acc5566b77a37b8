/*
 * Recursive Mutex (spec.md §4.8)
 *
 * A thin wrapper around [`Mutex`] that lets the owning thread re-enter
 * without deadlocking itself, up to [`RECURSIVE_MUTEX_MAX_DEPTH`]. Only
 * the outermost `unlock` actually releases the underlying mutex and
 * wakes a waiter.
 */

use crate::config::RECURSIVE_MUTEX_MAX_DEPTH;
use crate::error::{KernelError, KernelResult};
use crate::ipc::mutex::Mutex;
use crate::ipc::WaitOrder;

pub struct RecursiveMutex {
    mutex: Mutex,
    depth: spin::Mutex<u32>,
}

impl RecursiveMutex {
    pub const fn new(order: WaitOrder) -> Self {
        RecursiveMutex { mutex: Mutex::new(order), depth: spin::Mutex::new(0) }
    }

    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    pub fn depth(&self) -> u32 {
        *self.depth.lock()
    }

    pub fn is_valid(&self) -> bool {
        self.mutex.is_valid()
    }

    /// spec.md §4.6 "Delete(ipc)". Delegates to the underlying [`Mutex`];
    /// also resets the recursion depth, since a deleted object no longer
    /// has an owner to unwind nested locks for.
    pub fn delete(&self) {
        self.mutex.delete();
        *self.depth.lock() = 0;
    }

    /// spec.md §4.8 "Lock". A re-entrant call from the current owner
    /// just bumps the depth counter; everyone else blocks exactly as on
    /// a plain [`Mutex`].
    pub fn lock(&self, timeout_ticks: Option<u32>) -> KernelResult {
        let me = crate::sched::current().expect("lock() with no current thread");
        if self.mutex.owner() == Some(me) {
            let mut depth = self.depth.lock();
            if *depth >= RECURSIVE_MUTEX_MAX_DEPTH {
                return Err(KernelError::GenericError);
            }
            *depth += 1;
            return Ok(());
        }
        self.mutex.lock(timeout_ticks)?;
        *self.depth.lock() = 1;
        Ok(())
    }

    pub fn try_lock(&self) -> KernelResult {
        self.lock(Some(0))
    }

    /// spec.md §4.8 "Unlock". Errors if the caller is not the current
    /// owner at any depth.
    pub fn unlock(&self) -> KernelResult {
        let me = crate::sched::current().expect("unlock() with no current thread");
        if self.mutex.owner() != Some(me) {
            return Err(KernelError::GenericError);
        }
        let remaining = {
            let mut depth = self.depth.lock();
            *depth -= 1;
            *depth
        };
        if remaining == 0 { self.mutex.unlock() } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lock_unlock_stays_balanced() {
        let _serial = crate::thread::test_serial_guard();
        crate::thread::reset_and_spawn_ready(10);
        crate::sched::reschedule();
        let m = RecursiveMutex::new(WaitOrder::Priority);
        m.lock(None).unwrap();
        m.lock(None).unwrap();
        assert_eq!(m.depth(), 2);
        m.unlock().unwrap();
        assert!(m.is_locked(), "still held after only one of two unlocks");
        m.unlock().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn unlock_past_depth_zero_is_rejected() {
        let _serial = crate::thread::test_serial_guard();
        crate::thread::reset_and_spawn_ready(10);
        crate::sched::reschedule();
        let m = RecursiveMutex::new(WaitOrder::Priority);
        assert_eq!(m.unlock(), Err(KernelError::GenericError));
    }

    #[test]
    fn delete_invalidates_and_resets_depth() {
        let _serial = crate::thread::test_serial_guard();
        crate::thread::reset_and_spawn_ready(10);
        crate::sched::reschedule();
        let m = RecursiveMutex::new(WaitOrder::Priority);
        m.lock(None).unwrap();
        m.lock(None).unwrap();
        assert_eq!(m.depth(), 2);

        m.delete();
        assert!(!m.is_valid());
        assert_eq!(m.depth(), 0);
        assert_eq!(m.try_lock(), Err(KernelError::Deleted));
    }
}
