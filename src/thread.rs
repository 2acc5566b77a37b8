/*
 * Thread Lifecycle (spec.md §3 "Thread control block", §4.4)
 *
 * Threads live in a fixed-capacity arena (`THREADS`) rather than behind
 * individual heap allocations — the handle/arena resolution of the
 * "cyclic ownership" design note in spec.md §9. A thread's stack pointer
 * is kept in a separate top-level `'static` array (`SP_CELLS`) so the CPU
 * port can be handed a `&'static StackPtrCell` without borrowing through
 * a mutex guard; everything else (status, priorities, list membership,
 * the embedded timer) lives in the arena slot guarded by `THREADS`.
 *
 * Lock order, observed everywhere in this crate: `THREADS` before
 * `scheduler`'s internal lock, `scheduler` before `timer`'s internal
 * lock. Operations that need more than one accept the already-held guards
 * as parameters instead of re-locking internally.
 */

use core::fmt;

use crate::config::*;
use crate::error::{KernelError, KernelResult};
use crate::list::{Link, ListHead, NodeStore};
use crate::port::StackPtrCell;
use crate::timer::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread lifecycle state (spec.md §3 "Lifecycle summary"). `Unused`
/// marks a free arena slot and is not one of the spec's documented
/// states — it is this crate's arena-allocation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Unused,
    Init,
    Ready,
    Running,
    Suspend,
    Terminated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocOrigin {
    Static,
    Dynamic,
}

/// Lets an IPC object (semaphore/mutex/queue) register, on the thread it
/// just suspended, a way to revoke that block later without `thread.rs`
/// needing to name any of those concrete types. `delete()` (spec.md §4.4
/// "removes from its current queue") uses this to unlink a thread that
/// happens to be blocked on a waiter list rather than the ready list,
/// the same way `sched::remove` unlinks one still on the ready list.
/// Implemented by `ipc::semaphore::Semaphore`, `ipc::mutex::Mutex`, and
/// `ipc::queue::Queue`.
pub(crate) trait WaiterListOwner {
    fn unlink_waiter(&self, arena: &mut ThreadArena, id: ThreadId);
}

pub struct ThreadControlBlock {
    pub status: ThreadStatus,
    entry: Option<extern "C" fn(usize)>,
    arg: usize,
    stack_base: usize,
    stack_size: usize,
    pub current_priority: u8,
    pub init_priority: u8,
    pub number_mask: u32,
    init_tick: u32,
    pub remaining_tick: u32,
    timer_id: Option<TimerId>,
    origin: AllocOrigin,
    link: Link,
    /// The IPC object, if any, whose waiter list this thread is currently
    /// parked on while `Suspend`. Set by `suspend_current_onto`/
    /// `suspend_current_onto_sorted`, cleared by `make_ready`. A stale
    /// value (e.g. a thread that later went to sleep instead) is safe to
    /// dereference — kernel IPC objects are never freed out from under a
    /// thread — `unlink_waiter` impls confirm membership before touching
    /// anything, so a stale pointer is just a harmless no-op.
    waiter_owner: Option<*const dyn WaiterListOwner>,
}

// SAFETY: `waiter_owner` is only ever read or written while holding
// `THREADS`, exactly like every other field here; the pointee outlives
// every thread it is ever attached to (see the field's doc comment).
unsafe impl Send for ThreadControlBlock {}

impl ThreadControlBlock {
    /// The time-slice length (in ticks) this thread was created or last
    /// restarted with. Used to reload `remaining_tick` on dispatch.
    pub fn init_tick(&self) -> u32 {
        self.init_tick
    }

    /// The timer backing this thread's `sleep`/IPC-timeout wakeups, if
    /// the thread has been created (every live thread has exactly one).
    pub fn timer_id(&self) -> Option<TimerId> {
        self.timer_id
    }

    const EMPTY: ThreadControlBlock = ThreadControlBlock {
        status: ThreadStatus::Unused,
        entry: None,
        arg: 0,
        stack_base: 0,
        stack_size: 0,
        current_priority: 0,
        init_priority: 0,
        number_mask: 0,
        init_tick: 0,
        remaining_tick: 0,
        timer_id: None,
        origin: AllocOrigin::Static,
        link: Link::UNLINKED,
        waiter_owner: None,
    };
}

pub struct ThreadArena {
    slots: [ThreadControlBlock; MAX_THREADS],
}

impl ThreadArena {
    const fn new() -> Self {
        ThreadArena { slots: [ThreadControlBlock::EMPTY; MAX_THREADS] }
    }

    pub fn get(&self, id: ThreadId) -> &ThreadControlBlock {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: ThreadId) -> &mut ThreadControlBlock {
        &mut self.slots[id.0]
    }

    fn alloc_slot(&mut self) -> KernelResult<ThreadId> {
        self.slots
            .iter()
            .position(|t| t.status == ThreadStatus::Unused)
            .map(ThreadId)
            .ok_or(KernelError::GenericError)
    }
}

impl NodeStore for ThreadArena {
    fn link(&self, id: crate::list::NodeId) -> Link {
        self.slots[id].link
    }
    fn set_link(&mut self, id: crate::list::NodeId, link: Link) {
        self.slots[id].link = link;
    }
}

pub static THREADS: spin::Mutex<ThreadArena> = spin::Mutex::new(ThreadArena::new());

/// Stack-pointer storage, one cell per arena slot, kept as its own
/// top-level static so `&'static StackPtrCell` never has to be carved out
/// of a mutex guard (see module doc comment).
static SP_CELLS: [StackPtrCell; MAX_THREADS] = [const { StackPtrCell::new(0) }; MAX_THREADS];

pub fn sp_cell(id: ThreadId) -> &'static StackPtrCell {
    &SP_CELLS[id.0]
}

/// Deferred-termination list (spec.md §3 "Defunct list / deferred
/// termination"). Finalized by the idle thread, see
/// [`reap_one_terminated`].
pub static TERMINATION_LIST: spin::Mutex<ListHead> = spin::Mutex::new(ListHead::new());

fn init_thread_common(
    entry: extern "C" fn(usize),
    arg: usize,
    stack_base: usize,
    stack_size: usize,
    stack_top: *mut u8,
    priority: u8,
    time_slice_ticks: u32,
    origin: AllocOrigin,
) -> KernelResult<ThreadId> {
    if priority as usize >= NUM_PRIORITIES || time_slice_ticks == 0 {
        return Err(KernelError::Invalid);
    }

    let mut arena = THREADS.lock();
    let id = arena.alloc_slot()?;

    extern "C" fn thread_exit_trampoline() -> ! {
        exit();
    }

    let sp = unsafe {
        crate::port::shared_port().build_initial_stack(stack_top, entry, arg, thread_exit_trampoline)
    };
    unsafe { sp_cell(id).set(sp) };

    let timer_id = crate::timer::create_thread_wake_timer(id);

    let tcb = arena.get_mut(id);
    tcb.status = ThreadStatus::Init;
    tcb.entry = Some(entry);
    tcb.arg = arg;
    tcb.stack_base = stack_base;
    tcb.stack_size = stack_size;
    tcb.current_priority = priority;
    tcb.init_priority = priority;
    tcb.number_mask = 1u32 << priority;
    tcb.init_tick = time_slice_ticks;
    tcb.remaining_tick = time_slice_ticks;
    tcb.timer_id = Some(timer_id);
    tcb.origin = origin;
    tcb.link = Link::UNLINKED;
    tcb.waiter_owner = None;

    Ok(id)
}

/// Create a thread whose stack is caller-provided (`'static` storage the
/// board owns), per spec.md §4.4 "Create (static)". Returns
/// [`KernelError::Null`] for an empty stack, [`KernelError::Invalid`] for
/// an out-of-range priority or zero time slice.
pub fn create_static(
    entry: extern "C" fn(usize),
    arg: usize,
    stack: &'static mut [u8],
    priority: u8,
    time_slice_ticks: u32,
) -> KernelResult<ThreadId> {
    if !STATIC_ALLOC_ENABLE {
        return Err(KernelError::Unsupported);
    }
    if stack.is_empty() {
        return Err(KernelError::Null);
    }
    let stack_base = stack.as_ptr() as usize;
    let stack_size = stack.len();
    let stack_top = unsafe { stack.as_mut_ptr().add(stack.len()) };
    init_thread_common(entry, arg, stack_base, stack_size, stack_top, priority, time_slice_ticks, AllocOrigin::Static)
}

/// Create a thread whose stack is drawn from the default byte pool, per
/// spec.md §4.4 "Create (dynamic)". Releases the stack allocation if the
/// thread arena is full, matching the spec's "releases partial
/// allocations on any failure".
pub fn create_dynamic(
    entry: extern "C" fn(usize),
    arg: usize,
    stack_size: usize,
    priority: u8,
    time_slice_ticks: u32,
) -> KernelResult<ThreadId> {
    if !DYNAMIC_ALLOC_ENABLE {
        return Err(KernelError::Unsupported);
    }
    if stack_size == 0 {
        return Err(KernelError::Null);
    }
    let pool = crate::alloc::bytepool::default_pool();
    let block = pool.alloc(stack_size).ok_or(KernelError::GenericError)?;
    let stack_base = block.as_ptr() as usize;
    let stack_top = unsafe { block.as_ptr().add(stack_size) };

    match init_thread_common(entry, arg, stack_base, stack_size, stack_top, priority, time_slice_ticks, AllocOrigin::Dynamic) {
        Ok(id) => Ok(id),
        Err(e) => {
            pool.free(block);
            Err(e)
        }
    }
}

/// spec.md §4.4 "Startup". Refuses `Deleted` threads.
pub fn startup(id: ThreadId) -> KernelResult {
    let mut arena = THREADS.lock();
    {
        let tcb = arena.get(id);
        if tcb.status == ThreadStatus::Deleted {
            return Err(KernelError::GenericError);
        }
    }
    let tcb = arena.get_mut(id);
    tcb.current_priority = tcb.init_priority;
    tcb.remaining_tick = tcb.init_tick;
    tcb.status = ThreadStatus::Ready;
    let priority = tcb.current_priority;
    crate::sched::insert(&mut arena, id, priority);
    Ok(())
}

/// spec.md §4.4 "Sleep(ticks)". Called on the current thread only.
pub fn sleep(ticks: u32) {
    let id = crate::sched::current().expect("sleep called with no current thread");
    {
        let mut arena = THREADS.lock();
        crate::sched::remove(&mut arena, id);
        let tcb = arena.get_mut(id);
        tcb.status = ThreadStatus::Suspend;
        tcb.waiter_owner = None;
    }
    crate::timer::start_thread_timer(id, ticks);
    crate::sched::reschedule();
}

/// Removes `id` from whatever queue it is on and sets it `Suspend`.
/// Exposed for the IPC layer's suspend-on-wait path (spec.md §4.6); there
/// is no standalone public "suspend a thread" API per spec.md §4.4.
/// `owner`, if given, is recorded so `delete()` can unlink `id` from
/// `waiters` later without knowing which IPC object owns it; pass `None`
/// from test code that parks a thread on a list without going through a
/// real `take`/`lock`/`send`/`receive` call.
pub(crate) fn suspend_current_onto(
    arena: &mut ThreadArena,
    id: ThreadId,
    waiters: &mut ListHead,
    owner: Option<*const dyn WaiterListOwner>,
) {
    crate::sched::remove(arena, id);
    let tcb = arena.get_mut(id);
    tcb.status = ThreadStatus::Suspend;
    tcb.waiter_owner = owner;
    waiters.insert_tail(arena, id.0);
}

/// As [`suspend_current_onto`], but inserts `id` at the position
/// `before_existing` picks out instead of the tail — used for PRIO-mode
/// IPC waiter lists (spec.md §4.6 "FIFO or PRIO wait order").
pub(crate) fn suspend_current_onto_sorted<F>(
    arena: &mut ThreadArena,
    id: ThreadId,
    waiters: &mut ListHead,
    owner: Option<*const dyn WaiterListOwner>,
    before_existing: F,
) where
    F: FnMut(crate::list::NodeId) -> bool,
{
    crate::sched::remove(arena, id);
    let tcb = arena.get_mut(id);
    tcb.status = ThreadStatus::Suspend;
    tcb.waiter_owner = owner;
    waiters.insert_sorted_by(arena, id.0, before_existing);
}

/// spec.md §4.4 "Delete". Idempotent for `Terminated`; errors for
/// `Deleted`.
pub fn delete(id: ThreadId) -> KernelResult {
    let mut arena = THREADS.lock();
    let status = arena.get(id).status;
    if status == ThreadStatus::Terminated {
        return Ok(());
    }
    if status == ThreadStatus::Deleted {
        return Err(KernelError::GenericError);
    }

    match status {
        ThreadStatus::Ready | ThreadStatus::Running => crate::sched::remove(&mut arena, id),
        ThreadStatus::Suspend => {
            // A sleeping thread (no `waiter_owner`) is on no list at all.
            // A thread blocked on an IPC object recorded that object here
            // when it suspended; ask it to unlink `id` from whichever of
            // its own waiter lists actually holds it.
            if let Some(owner_ptr) = arena.get(id).waiter_owner {
                // SAFETY: see `WaiterListOwner`'s doc comment — the
                // pointee outlives every thread it was ever attached to.
                let owner: &dyn WaiterListOwner = unsafe { &*owner_ptr };
                owner.unlink_waiter(&mut arena, id);
                arena.get_mut(id).waiter_owner = None;
            }
        }
        _ => {}
    }

    if let Some(timer_id) = arena.get(id).timer_id {
        crate::timer::stop(timer_id);
    }
    arena.get_mut(id).status = ThreadStatus::Terminated;
    let mut term = TERMINATION_LIST.lock();
    term.insert_tail(&mut arena, id.0);
    Ok(())
}

/// spec.md §4.4 "Restart". Only valid on `Deleted` threads.
pub fn restart(id: ThreadId) -> KernelResult {
    let mut arena = THREADS.lock();
    if arena.get(id).status != ThreadStatus::Deleted {
        return Err(KernelError::GenericError);
    }

    let (entry, arg, stack_base, stack_size, priority, time_slice) = {
        let tcb = arena.get(id);
        (
            tcb.entry.ok_or(KernelError::Invalid)?,
            tcb.arg,
            tcb.stack_base,
            tcb.stack_size,
            tcb.init_priority,
            tcb.init_tick,
        )
    };

    extern "C" fn thread_exit_trampoline() -> ! {
        exit();
    }
    let stack_top = (stack_base + stack_size) as *mut u8;
    let sp = unsafe {
        crate::port::shared_port().build_initial_stack(stack_top, entry, arg, thread_exit_trampoline)
    };
    unsafe { sp_cell(id).set(sp) };

    let tcb = arena.get_mut(id);
    tcb.current_priority = priority;
    tcb.remaining_tick = time_slice;
    tcb.status = ThreadStatus::Ready;
    crate::sched::insert(&mut arena, id, priority);
    Ok(())
}

/// spec.md §4.4 "Exit". Called on the current thread; never returns.
pub fn exit() -> ! {
    let id = crate::sched::current().expect("exit called with no current thread");
    {
        let mut arena = THREADS.lock();
        crate::sched::remove(&mut arena, id);
        if let Some(timer_id) = arena.get(id).timer_id {
            crate::timer::stop(timer_id);
        }
        arena.get_mut(id).status = ThreadStatus::Terminated;
        let mut term = TERMINATION_LIST.lock();
        term.insert_tail(&mut arena, id.0);
    }
    crate::sched::reschedule();
    loop {
        crate::port::shared_port().irq_restore(crate::port::IrqMask(1));
        core::hint::spin_loop();
    }
}

/// The idle thread's cleanup pass: finalize one thread off the
/// deferred-termination list (spec.md §4.4 "Delete" — "the idle thread
/// later finalizes it"). Returns `true` if a thread was reaped.
pub fn reap_one_terminated() -> bool {
    let mut arena = THREADS.lock();
    let mut term = TERMINATION_LIST.lock();
    let Some(raw_id) = term.pop_front(&mut arena) else {
        return false;
    };
    let id = ThreadId(raw_id);
    let (origin, stack_base, stack_size) = {
        let tcb = arena.get(id);
        (tcb.origin, tcb.stack_base, tcb.stack_size)
    };
    if origin == AllocOrigin::Dynamic {
        let pool = crate::alloc::bytepool::default_pool();
        if let Some(ptr) = core::ptr::NonNull::new(stack_base as *mut u8) {
            let _ = stack_size;
            pool.free(ptr);
        }
    }
    arena.get_mut(id).status = ThreadStatus::Deleted;
    true
}

/// spec.md §4.4 "Ctrl" — read status.
pub fn status(id: ThreadId) -> ThreadStatus {
    THREADS.lock().get(id).status
}

/// spec.md §4.4 "Ctrl" — read priority.
pub fn priority(id: ThreadId) -> u8 {
    THREADS.lock().get(id).current_priority
}

/// spec.md §4.4 "Ctrl" — write priority. Updates `number_mask`; the
/// caller (typically the mutex priority-inheritance path) is responsible
/// for invoking scheduling afterwards if needed.
pub fn set_priority(arena: &mut ThreadArena, id: ThreadId, new_priority: u8) {
    let tcb = arena.get_mut(id);
    tcb.current_priority = new_priority;
    tcb.number_mask = 1u32 << new_priority;
}

/// Moves a `Suspend`ed thread back onto the ready list at its current
/// priority: the common second half of every wakeup, whether the thread
/// was asleep, blocked with a timeout, or blocked on an IPC object.
/// Never call this while `THREADS` is already held by the caller (see
/// the module lock-order note).
pub(crate) fn make_ready(id: ThreadId) {
    let mut arena = THREADS.lock();
    let tcb = arena.get_mut(id);
    if tcb.status != ThreadStatus::Suspend {
        return;
    }
    tcb.status = ThreadStatus::Ready;
    tcb.waiter_owner = None;
    let priority = tcb.current_priority;
    crate::sched::insert(&mut arena, id, priority);
}

/// `THREADS`, `sched::SCHEDULER` and `timer::TIMER` are process-wide
/// statics; host test binaries run tests on multiple threads by
/// default, so anything exercising them needs to serialize against every
/// other such test. Acquire this for the duration of any test that
/// touches global kernel state directly (see `with_fresh_arena` below,
/// and the IPC/timer test modules that call it explicitly).
#[cfg(test)]
static TEST_SERIAL: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(test)]
pub(crate) fn test_serial_guard() -> spin::MutexGuard<'static, ()> {
    TEST_SERIAL.lock()
}

/// Used by `sched` tests that want direct `&mut ThreadArena` access for
/// pure (non-relocking) calls like `sched::insert`/`switch_decision`.
/// Holds `THREADS` for the whole closure — do not call anything from
/// inside `f` that locks `THREADS` itself (e.g. `sched::reschedule`,
/// `sched::current`, any IPC `take`/`lock`/`send`), or it deadlocks. IPC
/// tests that need real blocking semantics should use
/// [`reset_and_spawn_ready`] instead, which never holds the lock across
/// a call back into kernel code.
#[cfg(test)]
pub(crate) fn with_fresh_arena<F: FnOnce(&mut ThreadArena)>(f: F) {
    let _serial = test_serial_guard();
    let mut arena = THREADS.lock();
    *arena = ThreadArena::new();
    f(&mut arena);
}

#[cfg(test)]
pub(crate) fn test_alloc(arena: &mut ThreadArena, priority: u8) -> ThreadId {
    let id = arena.alloc_slot().expect("arena full in test");
    let tcb = arena.get_mut(id);
    tcb.status = ThreadStatus::Ready;
    tcb.current_priority = priority;
    tcb.init_priority = priority;
    id
}

/// Resets the thread arena, scheduler, and timer subsystem to a clean
/// state and spawns one `Ready` thread at `priority`, returning its id.
/// Callers still need `sched::reschedule()` (outside any lock) to
/// actually make it `current()`. Unlike [`with_fresh_arena`], no lock is
/// held once this returns, so the caller is free to exercise real
/// blocking IPC calls afterwards.
#[cfg(test)]
pub(crate) fn reset_and_spawn_ready(priority: u8) -> ThreadId {
    *THREADS.lock() = ThreadArena::new();
    crate::sched::init();
    crate::timer::init();
    let mut arena = THREADS.lock();
    let id = test_alloc(&mut arena, priority);
    crate::sched::insert(&mut arena, id, priority);
    id
}
