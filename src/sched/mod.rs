/*
 * Scheduler (spec.md §4.3)
 *
 * Maintains `NUM_PRIORITIES` ready FIFOs and a bitmap of non-empty ones.
 * The *decision* (which thread should run next, whether a switch is even
 * warranted) is kept separate from *requesting* the CPU port perform one,
 * so the decision logic is host-testable without a real port
 * (SPEC_FULL.md §2.1 "Test tooling"): [`decide_switch`] returns what
 * should happen; [`reschedule`] calls it and, if needed, asks
 * [`crate::port::shared_port`] to request the switch.
 */

use crate::config::NUM_PRIORITIES;
use crate::list::ListHead;
use crate::port::software_bit_scan;
use crate::thread::{sp_cell, ThreadArena, ThreadId, ThreadStatus};

pub struct SchedulerState {
    ready: [ListHead; NUM_PRIORITIES],
    bitmap: u32,
    ready_count: usize,
    current: Option<ThreadId>,
    current_priority: usize,
    suspend_nesting: u32,
}

impl SchedulerState {
    const fn new() -> Self {
        SchedulerState {
            ready: [ListHead::new(); NUM_PRIORITIES],
            bitmap: 0,
            ready_count: 0,
            current: None,
            current_priority: 0,
            suspend_nesting: 0,
        }
    }

    fn highest_ready_priority(&self) -> Option<usize> {
        software_bit_scan(self.bitmap).map(|one_based| (one_based - 1) as usize)
    }
}

static SCHEDULER: spin::Mutex<SchedulerState> = spin::Mutex::new(SchedulerState::new());

/// spec.md §4.3 "init".
pub fn init() {
    let mut s = SCHEDULER.lock();
    *s = SchedulerState::new();
}

/// The thread presently marked `Running`, if scheduling has started.
pub fn current() -> Option<ThreadId> {
    SCHEDULER.lock().current
}

/// spec.md §4.3 "insert(thread)". Caller already holds the thread arena
/// lock (see `thread.rs` module doc for the lock-order convention).
pub fn insert(arena: &mut ThreadArena, id: ThreadId, priority: u8) {
    let mut s = SCHEDULER.lock();
    let p = priority as usize;
    s.ready[p].insert_tail(arena, id.0);
    s.bitmap |= 1u32 << p;
    s.ready_count += 1;
}

/// spec.md §4.3 "remove(thread)". No-op if `id` is not actually on a
/// ready list (e.g. it is blocked on an IPC waiter list instead).
pub fn remove(arena: &mut ThreadArena, id: ThreadId) {
    let mut s = SCHEDULER.lock();
    let priority = arena.get(id).current_priority as usize;
    if s.ready[priority].iter(arena).any(|n| n == id.0) {
        s.ready[priority].remove(arena, id.0);
        if s.ready[priority].is_empty() {
            s.bitmap &= !(1u32 << priority);
        }
        s.ready_count = s.ready_count.saturating_sub(1);
    }
}

/// Decision made by [`switch_decision`]: `None` means "nothing to do"
/// (scheduler-suspended, or the current thread is already the right one).
pub struct SwitchDecision {
    pub prev: Option<ThreadId>,
    pub next: ThreadId,
}

/// spec.md §4.3 "switch" — pure decision, no port interaction. Promotes
/// the new head to `Running` and demotes the old current to `Ready` as a
/// side effect on the arena, exactly as spec.md describes, but leaves
/// actually asking the CPU port to perform the switch to the caller.
fn switch_decision(arena: &mut ThreadArena) -> Option<SwitchDecision> {
    let mut s = SCHEDULER.lock();
    if s.suspend_nesting != 0 {
        return None;
    }
    let priority = s.highest_ready_priority()?;
    let next = ThreadId(s.ready[priority].front()?);
    if s.current == Some(next) {
        return None;
    }

    let prev = s.current;
    if let Some(prev_id) = prev {
        if arena.get(prev_id).status == ThreadStatus::Running {
            arena.get_mut(prev_id).status = ThreadStatus::Ready;
        }
    }
    arena.get_mut(next).status = ThreadStatus::Running;
    s.current = Some(next);
    s.current_priority = priority;
    Some(SwitchDecision { prev, next })
}

/// Ask the CPU port to perform a context switch if [`switch_decision`]
/// says one is warranted. Locks the thread arena itself; do not call
/// while already holding it.
pub fn reschedule() {
    let decision = {
        let mut arena = crate::thread::THREADS.lock();
        switch_decision(&mut arena)
    };
    if let Some(SwitchDecision { prev, next }) = decision {
        let prev_cell = prev.map(sp_cell);
        crate::port::shared_port().request_switch(prev_cell, sp_cell(next));
    }
}

/// spec.md §4.3 "rotate-within-priority" (yield). Moves the current
/// thread to the tail of its own ready list if it is not alone there,
/// then requests a switch.
pub fn yield_now() {
    {
        let mut arena = crate::thread::THREADS.lock();
        let mut s = SCHEDULER.lock();
        if let Some(id) = s.current {
            let priority = arena.get(id).current_priority as usize;
            if s.ready[priority].len() > 1 {
                s.ready[priority].remove(&mut arena, id.0);
                s.ready[priority].insert_tail(&mut arena, id.0);
            }
        }
    }
    reschedule();
}

/// spec.md §4.3 "suspend / resume" — a scheduler-only latch (spec.md §5,
/// §9 "Suspend/resume counter"), distinct from the CPU port's IRQ mask.
/// Interrupts and tick delivery are never delayed by this.
pub fn suspend() {
    SCHEDULER.lock().suspend_nesting += 1;
}

pub fn resume() {
    let should_reschedule = {
        let mut s = SCHEDULER.lock();
        s.suspend_nesting = s.suspend_nesting.saturating_sub(1);
        s.suspend_nesting == 0 && s.ready_count > 0
    };
    if should_reschedule {
        reschedule();
    }
}

/// RAII convenience wrapper around [`suspend`]/[`resume`], used by the
/// byte-pool allocator (spec.md §4.10, §5).
pub struct SchedulerSuspendGuard;

impl SchedulerSuspendGuard {
    pub fn enter() -> Self {
        suspend();
        SchedulerSuspendGuard
    }
}

impl Drop for SchedulerSuspendGuard {
    fn drop(&mut self) {
        resume();
    }
}

/// spec.md §4.3 "start". Chooses the highest-priority ready thread, marks
/// it `Running`, reloads its time slice, and hands control to the CPU
/// port. Never returns. The board must have already readied at least one
/// thread (spec.md: "Starting without any READY thread is a programmer
/// error").
pub fn start() -> ! {
    let next = {
        let mut arena = crate::thread::THREADS.lock();
        let mut s = SCHEDULER.lock();
        let priority = s.highest_ready_priority().expect("scheduler::start() with no ready thread");
        let next = ThreadId(s.ready[priority].front().expect("ready bitmap/list mismatch"));
        let tcb = arena.get_mut(next);
        tcb.status = ThreadStatus::Running;
        tcb.remaining_tick = tcb.init_tick();
        s.current = Some(next);
        s.current_priority = priority;
        next
    };
    crate::port::shared_port().start_first_thread(sp_cell(next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_ready_list_occupancy() {
        crate::thread::with_fresh_arena(|arena| {
            init();
            let t0 = crate::thread::test_alloc(arena, 5);
            let t1 = crate::thread::test_alloc(arena, 5);
            insert(arena, t0, 5);
            insert(arena, t1, 5);
            assert_eq!(SCHEDULER.lock().bitmap & (1 << 5), 1 << 5);
            remove(arena, t0);
            assert_eq!(SCHEDULER.lock().bitmap & (1 << 5), 1 << 5);
            remove(arena, t1);
            assert_eq!(SCHEDULER.lock().bitmap & (1 << 5), 0);
        });
    }

    #[test]
    fn switch_decision_prefers_higher_priority() {
        crate::thread::with_fresh_arena(|arena| {
            init();
            let low = crate::thread::test_alloc(arena, 10);
            let high = crate::thread::test_alloc(arena, 2);
            insert(arena, low, 10);
            insert(arena, high, 2);
            let decision = switch_decision(arena).expect("expected a switch decision");
            assert_eq!(decision.next, high);
        });
    }

    #[test]
    fn switch_decision_is_none_when_current_already_highest() {
        crate::thread::with_fresh_arena(|arena| {
            init();
            let only = crate::thread::test_alloc(arena, 3);
            insert(arena, only, 3);
            let decision = switch_decision(arena).expect("first dispatch");
            assert_eq!(decision.next, only);
            assert!(switch_decision(arena).is_none());
        });
    }
}
