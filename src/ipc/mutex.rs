/*
 * Mutex with Priority Inheritance (spec.md §4.7)
 *
 * A single-level inheritance scheme: when a higher-priority thread
 * blocks on a mutex held by a lower-priority owner, the owner is
 * boosted to the blocker's priority for as long as it holds the lock,
 * and restored on unlock. Only the immediate owner is boosted — if that
 * owner is itself blocked on a second mutex, the second mutex's owner is
 * not transitively boosted (spec.md §9 "priority inheritance boundary").
 * Unlock hands the lock directly to the next waiter rather than
 * releasing it for a fresh race.
 */

use crate::config::MAX_THREADS;
use crate::error::{KernelError, KernelResult};
use crate::ipc::WaitOrder;
use crate::list::ListHead;
use crate::thread::{
    priority as thread_priority, suspend_current_onto, suspend_current_onto_sorted, ThreadArena, ThreadId, ThreadStatus, WaiterListOwner,
    THREADS,
};

struct Inner {
    valid: bool,
    owner: Option<ThreadId>,
    owner_original_priority: Option<u8>,
    order: WaitOrder,
    waiters: ListHead,
}

pub struct Mutex {
    inner: spin::Mutex<Inner>,
}

impl Mutex {
    pub const fn new(order: WaitOrder) -> Self {
        Mutex { inner: spin::Mutex::new(Inner { valid: true, owner: None, owner_original_priority: None, order, waiters: ListHead::new() }) }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().owner.is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.lock().owner
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().valid
    }

    /// spec.md §4.6 "Delete(ipc)". Idempotent. Does not attempt to restore
    /// the holder's boosted priority — spec.md §4.6 only specifies waking
    /// waiters and invalidating the object, not unwinding an in-progress
    /// boost, and the holder is still free to `unlock()` (which will itself
    /// restore its priority and then discover the object invalid).
    pub fn delete(&self) {
        let mut inner = self.inner.lock();
        if !inner.valid {
            return;
        }
        inner.valid = false;
        inner.owner = None;
        inner.owner_original_priority = None;
        let mut woken: heapless::Vec<ThreadId, MAX_THREADS> = heapless::Vec::new();
        {
            let mut arena = THREADS.lock();
            while let Some(raw) = inner.waiters.pop_front(&mut arena) {
                let _ = woken.push(ThreadId(raw));
            }
        }
        drop(inner);
        for id in &woken {
            crate::thread::make_ready(*id);
        }
        if !woken.is_empty() {
            crate::sched::reschedule();
        }
    }

    /// Boost `owner`'s priority to `new_priority` if it is currently
    /// lower (numerically higher) priority. Re-seats it on the ready
    /// list if it is presently runnable; leaves it where it is blocked
    /// otherwise (see the module doc comment on the inheritance
    /// boundary).
    fn boost(owner: ThreadId, new_priority: u8) {
        let mut arena = THREADS.lock();
        if thread_priority(owner) <= new_priority {
            return;
        }
        let status = arena.get(owner).status;
        if status == ThreadStatus::Ready || status == ThreadStatus::Running {
            crate::sched::remove(&mut arena, owner);
            crate::thread::set_priority(&mut arena, owner, new_priority);
            crate::sched::insert(&mut arena, owner, new_priority);
        } else {
            crate::thread::set_priority(&mut arena, owner, new_priority);
        }
    }

    fn restore(owner: ThreadId, original_priority: u8) {
        if thread_priority(owner) == original_priority {
            return;
        }
        let mut arena = THREADS.lock();
        let status = arena.get(owner).status;
        if status == ThreadStatus::Ready || status == ThreadStatus::Running {
            crate::sched::remove(&mut arena, owner);
            crate::thread::set_priority(&mut arena, owner, original_priority);
            crate::sched::insert(&mut arena, owner, original_priority);
        } else {
            crate::thread::set_priority(&mut arena, owner, original_priority);
        }
    }

    /// spec.md §4.7 "Lock". A re-lock from the current owner succeeds
    /// without nesting (this is the non-recursive mutex — see
    /// `recursive_mutex.rs` for a version that actually counts depth).
    pub fn lock(&self, timeout_ticks: Option<u32>) -> KernelResult {
        let me = crate::sched::current().expect("lock() with no current thread");
        let mut inner = self.inner.lock();

        if !inner.valid {
            return Err(KernelError::Deleted);
        }
        if inner.owner.is_none() {
            inner.owner = Some(me);
            inner.owner_original_priority = Some(thread_priority(me));
            return Ok(());
        }
        if inner.owner == Some(me) {
            return Ok(());
        }
        if timeout_ticks == Some(0) {
            return Err(KernelError::Timeout);
        }

        let owner = inner.owner.unwrap();
        let my_priority = thread_priority(me);
        Self::boost(owner, my_priority);

        let owner_ptr = self as *const Mutex as *const dyn WaiterListOwner;
        {
            let mut arena = THREADS.lock();
            match inner.order {
                WaitOrder::Fifo => suspend_current_onto(&mut arena, me, &mut inner.waiters, Some(owner_ptr)),
                WaitOrder::Priority => {
                    let priorities: [u8; MAX_THREADS] = core::array::from_fn(|i| arena.get(ThreadId(i)).current_priority);
                    suspend_current_onto_sorted(&mut arena, me, &mut inner.waiters, Some(owner_ptr), |existing| my_priority < priorities[existing]);
                }
            }
        }
        if let Some(ticks) = timeout_ticks {
            crate::timer::start_thread_timer(me, ticks);
        }
        drop(inner);
        crate::sched::reschedule();

        let mut arena = THREADS.lock();
        if !arena.link(me.0).is_unlinked() {
            let mut inner = self.inner.lock();
            inner.waiters.remove(&mut arena, me.0);
            return Err(KernelError::Timeout);
        }
        if !self.inner.lock().valid {
            return Err(KernelError::Deleted);
        }
        // Resumed via unlock()'s hand-off: ownership fields were already
        // assigned to `me` there.
        Ok(())
    }

    pub fn try_lock(&self) -> KernelResult {
        self.lock(Some(0))
    }

    /// spec.md §4.7 "Unlock". Errors if the caller does not currently
    /// own the mutex.
    pub fn unlock(&self) -> KernelResult {
        let me = crate::sched::current().expect("unlock() with no current thread");
        let mut inner = self.inner.lock();
        if inner.owner != Some(me) {
            return Err(KernelError::GenericError);
        }

        if let Some(original) = inner.owner_original_priority {
            Self::restore(me, original);
        }

        let woken = {
            let mut arena = THREADS.lock();
            inner.waiters.pop_front(&mut arena).map(ThreadId)
        };
        let next_owner = match woken {
            Some(next) => {
                inner.owner = Some(next);
                inner.owner_original_priority = Some(thread_priority(next));
                Some(next)
            }
            None => {
                inner.owner = None;
                inner.owner_original_priority = None;
                None
            }
        };
        drop(inner);
        if let Some(next) = next_owner {
            crate::thread::make_ready(next);
        }
        crate::sched::reschedule();
        Ok(())
    }
}

impl WaiterListOwner for Mutex {
    fn unlink_waiter(&self, arena: &mut ThreadArena, id: ThreadId) {
        let mut inner = self.inner.lock();
        if inner.waiters.iter(arena).any(|n| n == id.0) {
            inner.waiters.remove(arena, id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_round_trips() {
        let _serial = crate::thread::test_serial_guard();
        crate::thread::reset_and_spawn_ready(10);
        crate::sched::reschedule();
        let m = Mutex::new(WaitOrder::Priority);
        m.lock(None).unwrap();
        assert!(m.is_locked());
        m.unlock().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn relocking_from_the_owner_succeeds_without_nesting() {
        let _serial = crate::thread::test_serial_guard();
        crate::thread::reset_and_spawn_ready(10);
        crate::sched::reschedule();
        let m = Mutex::new(WaitOrder::Priority);
        m.lock(None).unwrap();
        assert_eq!(m.lock(Some(0)), Ok(()));
        assert!(m.is_locked(), "still owned by the same thread after the re-lock");
    }

    #[test]
    fn unlock_from_a_non_owner_is_rejected() {
        let _serial = crate::thread::test_serial_guard();
        crate::thread::reset_and_spawn_ready(10);
        crate::sched::reschedule();
        let m = Mutex::new(WaitOrder::Priority);
        assert_eq!(m.unlock(), Err(KernelError::GenericError));
    }

    /// spec.md §8 scenario 5 / law "Priority inheritance": a lower-priority
    /// holder's `current_priority` rises to match a higher-priority
    /// blocker for as long as the blocker waits, and drops back to its
    /// original value on release. `boost`/`restore` are exactly the two
    /// halves `lock`/`unlock` call on the real blocking path (see the
    /// module doc comment on why this test drives them directly instead
    /// of a real `lock(None)` call — there is no real preemption to
    /// resume into on the host, see `port::MockPort`).
    #[test]
    fn boost_raises_holder_priority_and_restore_reverts_it() {
        let _serial = crate::thread::test_serial_guard();
        let mut low_id = None;
        crate::thread::with_fresh_arena(|arena| {
            low_id = Some(crate::thread::test_alloc(arena, 10));
        });
        let low = low_id.unwrap();
        assert_eq!(thread_priority(low), 10);

        Mutex::boost(low, 3);
        assert_eq!(thread_priority(low), 3, "holder should inherit the higher (numerically lower) blocker priority");

        Mutex::boost(low, 7);
        assert_eq!(thread_priority(low), 3, "a second, lower-priority blocker must not un-boost an existing higher boost");

        Mutex::restore(low, 10);
        assert_eq!(thread_priority(low), 10, "releasing the mutex restores the holder's original priority");
    }

    /// spec.md §4.6 "Delete(ipc)": waiters wake and the object rejects
    /// further `lock`/`unlock` calls with `Deleted`.
    #[test]
    fn delete_wakes_waiters_and_invalidates_the_object() {
        use crate::thread::{suspend_current_onto, ThreadStatus, THREADS};

        let _serial = crate::thread::test_serial_guard();
        let caller = crate::thread::reset_and_spawn_ready(10);
        crate::sched::reschedule();
        assert_eq!(crate::sched::current(), Some(caller));

        let m = Mutex::new(WaitOrder::Fifo);
        let waiter = {
            let mut arena = THREADS.lock();
            let mut inner = m.inner.lock();
            let t = crate::thread::test_alloc(&mut arena, 20);
            arena.get_mut(t).status = ThreadStatus::Suspend;
            suspend_current_onto(&mut arena, t, &mut inner.waiters, None);
            t
        };

        m.delete();
        assert_eq!(THREADS.lock().get(waiter).status, ThreadStatus::Ready);
        assert!(!m.is_valid());
        assert_eq!(m.try_lock(), Err(KernelError::Deleted));

        m.delete();
    }
}
