/*
 * Vigil — a fixed-priority preemptive RTOS core for single-core
 * ARM Cortex-M4F-class parts.
 *
 * Module layout mirrors the dependency order in spec.md §2: `list`
 * (leaf primitive) → `port` (CPU contract) → `timer` → `sched` →
 * `thread` → `ipc` → `alloc` (optional) → board/idle (external, not a
 * module this crate provides — see [`idle_loop`]).
 *
 * `#![no_std]` except under `cargo test`, where host unit/integration
 * tests run against `port::MockPort` with `std` available — the same
 * split `rivosinc-hubris`'s `sys/kern` crate draws between its portable
 * scheduler core and its per-architecture (`cfg(target_arch)`) backends,
 * to keep scheduler/thread/IPC logic host-testable without real hardware.
 */

#![cfg_attr(not(test), no_std)]

pub mod alloc;
pub mod config;
pub mod error;
#[cfg(feature = "ipc")]
pub mod ipc;
pub mod list;
pub mod logging;
pub mod port;
pub mod sched;
pub mod thread;
pub mod timer;

pub use error::{KernelError, KernelResult};

/// spec.md §6: "at least one [of static-alloc, dynamic-alloc] must be
/// set". Enforced at compile time rather than at first `create_static`/
/// `create_dynamic` call, since an RTOS image with neither is not a
/// buildable configuration, not a runtime error.
const _ASSERT_AT_LEAST_ONE_ALLOC_PATH: () = {
    assert!(
        config::STATIC_ALLOC_ENABLE || config::DYNAMIC_ALLOC_ENABLE,
        "at least one of the `static-alloc` / `dynamic-alloc` features must be enabled"
    );
};

/// Bring up every kernel subsystem's global state. Call once, before
/// creating any thread, from the board's startup code (spec.md §4.3
/// "init" plus the timer subsystem's own reset — the scheduler cannot
/// usefully start without both).
pub fn kernel_init() {
    sched::init();
    timer::init();
}

/// Hand control to the scheduler. Never returns (spec.md §4.3 "start").
/// The board must have already created and started at least one thread
/// (conventionally the idle thread — spec.md §9 "a faithful port may
/// include only one [allocator]... choose the byte-pool"; similarly here,
/// "Starting without any READY thread is a programmer error").
pub fn kernel_start() -> ! {
    sched::start()
}

/// The kernel's tick entry (spec.md §4.5 "Tick entry"), called once per
/// tick from the platform's periodic timer ISR (spec.md §6 "Tick
/// source"). Order of operations: decrement the running thread's
/// remaining time slice, reloading and rotating within its priority if
/// it just ran out, then let the timer subsystem advance the tick
/// counter (handling wraparound) and fire anything now due. The two
/// halves touch disjoint state, so this ordering and the spec's
/// increment-first ordering are observationally identical; expired
/// timers always see the post-increment tick value either way.
pub fn tick() {
    reload_time_slice_if_expired();
    timer::tick();
}

fn reload_time_slice_if_expired() {
    let Some(current) = sched::current() else { return };
    let ran_out = {
        let mut arena = thread::THREADS.lock();
        let tcb = arena.get_mut(current);
        tcb.remaining_tick = tcb.remaining_tick.saturating_sub(1);
        if tcb.remaining_tick == 0 {
            tcb.remaining_tick = tcb.init_tick();
            true
        } else {
            false
        }
    };
    if ran_out {
        sched::yield_now();
    }
}

/// Convenience body for the board-created idle thread (spec.md §2 item 8
/// "Board/idle (external) — creates an idle thread that runs deferred
/// cleanup"). Thread *creation* is the board's job; this is the loop a
/// board's idle thread entry function calls into, since "reap whatever is
/// on the deferred-termination list, else wait for an interrupt" has no
/// board-specific content. Never returns.
pub fn idle_loop() -> ! {
    loop {
        while thread::reap_one_terminated() {}
        #[cfg(feature = "cortex-m-port")]
        #[cfg(not(test))]
        cortex_m::asm::wfi();
        #[cfg(any(not(feature = "cortex-m-port"), test))]
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod integration {
    //! Whole-kernel smoke tests exercising `kernel_init`/`tick`/`idle_loop`
    //! together, as opposed to each module's own `#[cfg(test)]` unit
    //! tests.
    use super::*;

    #[test]
    fn tick_reloads_slice_and_rotates_round_robin_peers() {
        let _serial = crate::thread::test_serial_guard();
        let mut ids = (None, None);
        thread::with_fresh_arena(|arena| {
            sched::init();
            timer::init();
            let a = thread::test_alloc(arena, 5);
            let b = thread::test_alloc(arena, 5);
            sched::insert(arena, a, 5);
            sched::insert(arena, b, 5);
            ids = (Some(a), Some(b));
        });
        let (a, b) = (ids.0.unwrap(), ids.1.unwrap());

        sched::reschedule();
        assert_eq!(sched::current(), Some(a));

        // `test_alloc` doesn't set `init_tick`/`remaining_tick` (they
        // default to 0), so the very first tick already "runs out".
        tick();
        assert_eq!(sched::current(), Some(b), "round-robin peer should take over once `a`'s slice is spent");
    }

    #[test]
    fn idle_loop_drains_every_pending_termination() {
        let _serial = crate::thread::test_serial_guard();
        let mut ids = (None, None);
        thread::with_fresh_arena(|arena| {
            sched::init();
            timer::init();
            ids = (Some(thread::test_alloc(arena, 5)), Some(thread::test_alloc(arena, 5)));
        });
        let (t0, t1) = (ids.0.unwrap(), ids.1.unwrap());
        thread::delete(t0).unwrap();
        thread::delete(t1).unwrap();

        assert!(thread::reap_one_terminated());
        assert_eq!(thread::status(t0), thread::ThreadStatus::Deleted);
        assert!(thread::reap_one_terminated());
        assert_eq!(thread::status(t1), thread::ThreadStatus::Deleted);
        assert!(!thread::reap_one_terminated(), "nothing left to reap");
    }
}
