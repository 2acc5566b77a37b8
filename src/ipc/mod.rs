/*
 * Inter-Process Communication Primitives (spec.md §4.6-4.9)
 *
 * Every primitive here blocks the same way: suspend the current thread
 * onto a `ListHead` owned by the object, optionally arm a wake-up timer,
 * drop the object's own lock, and call `sched::reschedule`. On resume,
 * whether the thread is still linked into that same waiter list tells
 * the caller whether it got woken by a signal (unlinked — the signaler
 * already removed it) or by its timeout firing (still linked — the
 * caller removes it itself and reports `KernelError::Timeout`). See
 * `semaphore.rs`, `mutex.rs`, `recursive_mutex.rs`, `queue.rs`.
 */

#[cfg(feature = "ipc-semaphore")]
pub mod semaphore;
#[cfg(feature = "ipc-mutex")]
pub mod mutex;
#[cfg(feature = "ipc-recursive-mutex")]
pub mod recursive_mutex;
#[cfg(feature = "ipc-queue")]
pub mod queue;

/// Ordering used when more than one thread is waiting on the same
/// object. `Fifo` wakes whoever asked first; `Priority` always wakes the
/// highest-priority waiter, breaking ties by arrival order (spec.md §4.6
/// "FIFO or PRIO wait order" — a per-object, creation-time choice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrder {
    Fifo,
    Priority,
}
