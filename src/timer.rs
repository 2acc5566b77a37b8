/*
 * Software Timers (spec.md §4.5, §3 "Timer control block")
 *
 * Every timer — a thread's sleep/IPC-timeout alarm as well as a
 * user-created periodic/one-shot timer — lives in a fixed arena and is
 * tracked on exactly one of two deadline-sorted lists: `current` for
 * deadlines that have not yet wrapped past `u32::MAX` relative to the
 * tick counter, `overflow` for ones that have. When the tick counter
 * itself wraps, the two lists swap roles (spec.md §3 "current/overflow
 * list swap on tick-counter wraparound", §4.5). Only one level of
 * sorted list is implemented (`config::TIMER_LIST_LEVELS == 1`); there is
 * no generalized timer wheel.
 */

use crate::config::MAX_TIMERS;
use crate::error::{KernelError, KernelResult};
use crate::list::{Link, ListHead, NodeId, NodeStore};
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub usize);

/// A fired timer either wakes the thread that owns it (sleep / IPC
/// timeout) or invokes a user callback. The two are mutually exclusive
/// per timer.
pub type TimerCallback = extern "C" fn(TimerId, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    OneShot,
    Periodic,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Unused,
    Idle,
    Active,
}

struct TimerControlBlock {
    status: Status,
    kind: Kind,
    deadline: u32,
    period: u32,
    owner_thread: Option<ThreadId>,
    callback: Option<TimerCallback>,
    arg: usize,
    link: Link,
}

impl TimerControlBlock {
    const EMPTY: TimerControlBlock = TimerControlBlock {
        status: Status::Unused,
        kind: Kind::OneShot,
        deadline: 0,
        period: 0,
        owner_thread: None,
        callback: None,
        arg: 0,
        link: Link::UNLINKED,
    };
}

struct TimerArena {
    slots: [TimerControlBlock; MAX_TIMERS],
}

impl TimerArena {
    const fn new() -> Self {
        TimerArena { slots: [TimerControlBlock::EMPTY; MAX_TIMERS] }
    }

    fn alloc_slot(&mut self) -> KernelResult<TimerId> {
        self.slots
            .iter()
            .position(|t| t.status == Status::Unused)
            .map(TimerId)
            .ok_or(KernelError::GenericError)
    }
}

impl NodeStore for TimerArena {
    fn link(&self, id: NodeId) -> Link {
        self.slots[id].link
    }
    fn set_link(&mut self, id: NodeId, link: Link) {
        self.slots[id].link = link;
    }
}

/// Everything the tick handler needs behind one lock, so "scheduler's
/// lock before timer's lock" (see `thread.rs`) stays a single acquire.
struct TimerInner {
    arena: TimerArena,
    tick: u32,
    current: ListHead,
    overflow: ListHead,
}

impl TimerInner {
    const fn new() -> Self {
        TimerInner { arena: TimerArena::new(), tick: 0, current: ListHead::new(), overflow: ListHead::new() }
    }

    /// Insert `id` (already filled in except `link`) into whichever list
    /// its deadline belongs on, ordered ascending by deadline so the
    /// earliest-firing timer is always at the front.
    fn schedule(&mut self, id: TimerId, deadline: u32) {
        self.arena.slots[id.0].deadline = deadline;
        self.arena.slots[id.0].status = Status::Active;
        // Snapshot deadlines so the ordering closure below does not need
        // to borrow `self.arena` while `insert_sorted_by` also borrows it
        // mutably for linking.
        let deadlines: [u32; MAX_TIMERS] = core::array::from_fn(|i| self.arena.slots[i].deadline);
        if deadline < self.tick {
            self.overflow.insert_sorted_by(&mut self.arena, id.0, |existing| deadline < deadlines[existing]);
        } else {
            self.current.insert_sorted_by(&mut self.arena, id.0, |existing| deadline < deadlines[existing]);
        }
    }

    fn unschedule(&mut self, id: TimerId) {
        if self.arena.slots[id.0].status != Status::Active {
            return;
        }
        if !self.arena.link(id.0).is_unlinked() {
            let list = if self.arena.slots[id.0].deadline < self.tick { &mut self.overflow } else { &mut self.current };
            list.remove(&mut self.arena, id.0);
        }
        self.arena.slots[id.0].status = Status::Idle;
    }
}

static TIMER: spin::Mutex<TimerInner> = spin::Mutex::new(TimerInner::new());

pub fn init() {
    let mut t = TIMER.lock();
    *t = TimerInner::new();
}

/// Pre-allocates an inactive one-shot timer bound to `owner`, used by
/// thread creation to back `sleep`/IPC-timeout without a per-call
/// allocation (spec.md §4.4 "Create" creates the thread's wake timer up
/// front).
pub fn create_thread_wake_timer(owner: ThreadId) -> TimerId {
    let mut t = TIMER.lock();
    let id = t.arena.alloc_slot().expect("timer arena exhausted");
    let slot = &mut t.arena.slots[id.0];
    slot.status = Status::Idle;
    slot.kind = Kind::OneShot;
    slot.owner_thread = Some(owner);
    slot.callback = None;
    slot.link = Link::UNLINKED;
    id
}

/// Arms the thread's wake timer to fire `ticks` from now. Looks the
/// timer id up via the thread arena (spec.md §4.4 "Sleep"); `ticks == 0`
/// is treated as "fire on the very next tick".
pub fn start_thread_timer(owner: ThreadId, ticks: u32) {
    let timer_id = {
        let arena = crate::thread::THREADS.lock();
        arena.get(owner).timer_id().expect("thread has no wake timer")
    };
    let mut t = TIMER.lock();
    let deadline = t.tick.wrapping_add(ticks);
    t.schedule(timer_id, deadline);
}

/// spec.md §4.5 "Create" — a user software timer. `period_ticks == 0`
/// makes it one-shot; any other value makes it periodic with that
/// period. Created idle; call [`start`] to arm it.
pub fn create(callback: TimerCallback, arg: usize, period_ticks: u32) -> KernelResult<TimerId> {
    let mut t = TIMER.lock();
    let id = t.arena.alloc_slot()?;
    let slot = &mut t.arena.slots[id.0];
    slot.status = Status::Idle;
    slot.kind = if period_ticks == 0 { Kind::OneShot } else { Kind::Periodic };
    slot.period = period_ticks;
    slot.owner_thread = None;
    slot.callback = Some(callback);
    slot.arg = arg;
    slot.link = Link::UNLINKED;
    Ok(id)
}

/// spec.md §4.5 "Start(ticks)". Arms (or re-arms) `id` to first fire
/// `ticks` from now.
pub fn start(id: TimerId, ticks: u32) -> KernelResult {
    let mut t = TIMER.lock();
    if t.arena.slots[id.0].status == Status::Unused {
        return Err(KernelError::Deleted);
    }
    t.unschedule(id);
    let deadline = t.tick.wrapping_add(ticks);
    t.schedule(id, deadline);
    Ok(())
}

/// spec.md §4.5 "Stop". Idempotent; returns `true` if the timer had been
/// armed.
pub fn stop(id: TimerId) -> bool {
    let mut t = TIMER.lock();
    if t.arena.slots[id.0].status != Status::Active {
        return false;
    }
    t.unschedule(id);
    true
}

/// spec.md §4.5 "Change period". Takes effect on the timer's next
/// re-arm; does not retroactively shift an already-armed deadline.
pub fn set_period(id: TimerId, period_ticks: u32) -> KernelResult {
    let mut t = TIMER.lock();
    if t.arena.slots[id.0].status == Status::Unused {
        return Err(KernelError::Deleted);
    }
    t.arena.slots[id.0].period = period_ticks;
    t.arena.slots[id.0].kind = if period_ticks == 0 { Kind::OneShot } else { Kind::Periodic };
    Ok(())
}

/// spec.md §4.5 "Delete". Frees the slot for reuse; `id` must not be
/// used again afterwards.
pub fn delete(id: TimerId) -> KernelResult {
    let mut t = TIMER.lock();
    if t.arena.slots[id.0].status == Status::Unused {
        return Err(KernelError::Deleted);
    }
    t.unschedule(id);
    t.arena.slots[id.0] = TimerControlBlock::EMPTY;
    Ok(())
}

pub fn is_active(id: TimerId) -> bool {
    TIMER.lock().arena.slots[id.0].status == Status::Active
}

/// Advances the tick counter by one and fires everything due. Meant to
/// be called from the board's SysTick handler; never reacquires
/// `THREADS` while the timer lock is held (see the module doc comment
/// on lock order) — expired owner-threads are collected here and woken
/// after the lock is dropped.
pub fn tick() {
    let mut woken: heapless::Vec<ThreadId, { crate::config::MAX_TIMERS }> = heapless::Vec::new();
    let mut fired_callbacks: heapless::Vec<(TimerCallback, TimerId, usize), { crate::config::MAX_TIMERS }> =
        heapless::Vec::new();

    {
        let mut t = TIMER.lock();
        let wrapped = t.tick == u32::MAX;
        t.tick = t.tick.wrapping_add(1);
        if wrapped {
            core::mem::swap(&mut t.current, &mut t.overflow);
        }

        while let Some(front) = t.current.front() {
            if t.arena.slots[front].deadline > t.tick {
                break;
            }
            let id = TimerId(front);
            t.current.remove(&mut t.arena, id.0);
            let slot_kind = t.arena.slots[id.0].kind;
            let period = t.arena.slots[id.0].period;
            if slot_kind == Kind::Periodic && period > 0 {
                let next_deadline = t.tick.wrapping_add(period);
                t.schedule(id, next_deadline);
            } else {
                t.arena.slots[id.0].status = Status::Idle;
            }

            if let Some(owner) = t.arena.slots[id.0].owner_thread {
                let _ = woken.push(owner);
            } else if let Some(cb) = t.arena.slots[id.0].callback {
                let _ = fired_callbacks.push((cb, id, t.arena.slots[id.0].arg));
            }
        }
    }

    for owner in woken {
        crate::thread::make_ready(owner);
    }
    for (cb, id, arg) in fired_callbacks {
        cb(id, arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop_callback(_id: TimerId, _arg: usize) {}

    #[test]
    fn one_shot_timer_fires_once_at_deadline() {
        let _serial = crate::thread::test_serial_guard();
        init();
        let id = create(noop_callback, 0, 0).unwrap();
        start(id, 3).unwrap();
        assert!(is_active(id));
        for _ in 0..3 {
            tick();
        }
        assert!(!is_active(id));
    }

    #[test]
    fn periodic_timer_rearms_itself() {
        let _serial = crate::thread::test_serial_guard();
        init();
        let id = create(noop_callback, 0, 2).unwrap();
        start(id, 2).unwrap();
        tick();
        tick();
        assert!(is_active(id), "periodic timer should rearm after firing");
    }

    #[test]
    fn stop_prevents_firing() {
        let _serial = crate::thread::test_serial_guard();
        init();
        let id = create(noop_callback, 0, 0).unwrap();
        start(id, 1).unwrap();
        assert!(stop(id));
        tick();
        assert!(!is_active(id));
        assert!(!stop(id), "stop on an already-idle timer returns false");
    }
}
