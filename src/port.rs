/*
 * CPU Port Contract
 *
 * Architecture-specific context save/restore is treated as an external
 * collaborator's problem, not the kernel core's: the core only needs IRQ
 * mask save/restore, a stack-frame builder, a "first switch" entry, and
 * a "normal switch" entry. This module defines that contract as the
 * [`CpuPort`] trait and ships two implementors: [`CortexM4FPort`], the
 * real Cortex-M4F port (feature `cortex-m-port`, following the
 * `cortex_m::peripheral::SCB::set_pendsv` / PRIMASK pattern common to
 * ARM-M Rust RTOS ports), and a test-only `MockPort` that records calls
 * instead of touching real hardware so scheduler/thread logic is
 * host-testable.
 */

use core::sync::atomic::{AtomicBool, Ordering};

/// Opaque storage cell holding a thread's saved stack pointer. The kernel
/// never dereferences the pointer itself — it only ever hands the cell's
/// address to the CPU port.
#[repr(transparent)]
#[derive(Debug)]
pub struct StackPtrCell(core::cell::UnsafeCell<usize>);

unsafe impl Sync for StackPtrCell {}

impl StackPtrCell {
    pub const fn new(sp: usize) -> Self {
        StackPtrCell(core::cell::UnsafeCell::new(sp))
    }

    pub fn get(&self) -> usize {
        unsafe { *self.0.get() }
    }

    /// # Safety
    /// Must only be called by the owning thread or by a CPU port with the
    /// scheduler's normal-switch protocol held: a stack pointer cell
    /// belongs to the scheduler bookkeeping for exactly one thread at a
    /// time.
    pub unsafe fn set(&self, sp: usize) {
        unsafe {
            *self.0.get() = sp;
        }
    }
}

/// Previous IRQ mask, returned by [`CpuPort::irq_disable`] and consumed by
/// [`CpuPort::irq_restore`]. Nesting is lexical: callers must restore in
/// the reverse order they disabled.
#[derive(Debug, Clone, Copy)]
pub struct IrqMask(pub u32);

/// The external CPU-port contract. A board crate either uses
/// [`CortexM4FPort`] as-is or supplies its own implementation (e.g.
/// for a different Cortex-M part or a simulator).
pub trait CpuPort {
    /// Disable interrupts, returning the previous mask.
    fn irq_disable(&self) -> IrqMask;

    /// Restore interrupts to a previously-saved mask.
    fn irq_restore(&self, mask: IrqMask);

    /// Build the initial stack frame for a new thread so that, once
    /// dispatched, execution begins at `entry(arg)` with `exit_fn` as the
    /// return address and the architecture's status register configured
    /// for thumb-mode execution. Returns the initial stack pointer value.
    ///
    /// # Safety
    /// `stack_top` must point one-past-the-end of a writable region at
    /// least large enough to hold one full save frame.
    unsafe fn build_initial_stack(
        &self,
        stack_top: *mut u8,
        entry: extern "C" fn(usize),
        arg: usize,
        exit_fn: extern "C" fn() -> !,
    ) -> usize;

    /// Bootstrap scheduling: switch to thread mode, lazily enable the FPU
    /// context, configure PendSV/SysTick to the lowest exception priority,
    /// and begin running the thread whose stack pointer is stored in
    /// `sp_cell`. Never returns.
    fn start_first_thread(&self, sp_cell: &'static StackPtrCell) -> !;

    /// Request a context switch. `prev_cell` is `None` when there is no
    /// previously-running thread to save (can only happen before the
    /// first switch). Idempotent while a switch is already pending: only
    /// `next_cell` is updated; `prev_cell` is recorded only on the first
    /// request of a still-pending batch.
    fn request_switch(
        &self,
        prev_cell: Option<&'static StackPtrCell>,
        next_cell: &'static StackPtrCell,
    );

    /// One-based find-first-set over `mask`, interpreting bit 0 as the
    /// highest priority when [`crate::config::LOWER_NUMBER_IS_HIGHER_PRIORITY`]
    /// is `true` (LSB-first), or find-last-set otherwise. Returns `None`
    /// for a zero mask.
    fn bit_scan(&self, mask: u32) -> Option<u32> {
        software_bit_scan(mask)
    }
}

/// Portable software fallback for [`CpuPort::bit_scan`]. On Cortex-M4F,
/// `trailing_zeros`/`leading_zeros` already compile to a single `CLZ`
/// (after a bit-reverse for `trailing_zeros`) under LLVM, so this is not
/// merely a slow-path stand-in — it is what `USE_CPU_BITSCAN` effectively
/// selects either way.
pub fn software_bit_scan(mask: u32) -> Option<u32> {
    if mask == 0 {
        return None;
    }
    if crate::config::LOWER_NUMBER_IS_HIGHER_PRIORITY {
        Some(mask.trailing_zeros() + 1)
    } else {
        Some(32 - mask.leading_zeros())
    }
}

/// Pending-switch bookkeeping shared by every `CpuPort` implementation:
/// the "idempotent while pending" rule lives here so real and mock ports
/// don't each re-derive it.
pub struct SwitchRequestState {
    pending: AtomicBool,
}

impl SwitchRequestState {
    pub const fn new() -> Self {
        SwitchRequestState { pending: AtomicBool::new(false) }
    }

    /// Returns `true` if this call is the first request of a new pending
    /// batch (i.e. the caller should record `prev`); `false` if a switch
    /// was already pending (only `next` should be updated).
    pub fn mark_pending(&self) -> bool {
        self.pending.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Called by the PendSV handler once the pending switch has been
    /// serviced.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

#[cfg(feature = "cortex-m-port")]
mod cortex_m4f {
    use super::*;

    /// Real Cortex-M4F CPU port. Context save/restore inside the PendSV
    /// handler is architecture-specific assembly a board crate supplies;
    /// this type provides everything the kernel core calls directly:
    /// PRIMASK save/restore, the initial stack-frame layout, exception-priority configuration,
    /// and the pending-switch bookkeeping the handler consults.
    ///
    /// A board's PendSV handler is responsible for the actual register
    /// save/restore; it calls [`CortexM4FPort::take_pending`] to learn
    /// which two [`StackPtrCell`]s are involved. A minimal handler looks
    /// like:
    ///
    /// ```ignore
    /// #[cortex_m_rt::exception]
    /// unsafe fn PendSV() {
    ///     let (prev, next) = PORT.take_pending();
    ///     core::arch::asm!(
    ///         "mrs r0, psp",
    ///         "stmdb r0!, {{r4-r11}}",      // save callee-saved half
    ///         "str r0, [{prev_sp}]",        // stash outgoing SP
    ///         "ldr r0, [{next_sp}]",        // load incoming SP
    ///         "ldmia r0!, {{r4-r11}}",
    ///         "msr psp, r0",
    ///         prev_sp = in(reg) prev.map_or(core::ptr::null(), |c| c as *const _),
    ///         next_sp = in(reg) next as *const _,
    ///     );
    /// }
    /// ```
    ///
    /// (skips the `prev == None` first-switch case and FPU lazy-stacking
    /// for brevity; a real handler branches on both).
    pub struct CortexM4FPort {
        switch: SwitchRequestState,
        prev_cell: core::cell::UnsafeCell<Option<&'static StackPtrCell>>,
        next_cell: core::cell::UnsafeCell<Option<&'static StackPtrCell>>,
    }

    unsafe impl Sync for CortexM4FPort {}

    impl CortexM4FPort {
        pub const fn new() -> Self {
            CortexM4FPort {
                switch: SwitchRequestState::new(),
                prev_cell: core::cell::UnsafeCell::new(None),
                next_cell: core::cell::UnsafeCell::new(None),
            }
        }

        /// Called by the board's PendSV handler after it has performed the
        /// register save/restore sequence, to clear pending state and
        /// fetch which cells were involved.
        pub fn take_pending(&self) -> (Option<&'static StackPtrCell>, Option<&'static StackPtrCell>) {
            let prev = unsafe { (*self.prev_cell.get()).take() };
            let next = unsafe { (*self.next_cell.get()).take() };
            self.switch.clear();
            (prev, next)
        }
    }

    /// Initial exception return value: thumb bit set, no other flags.
    const INITIAL_XPSR: u32 = 0x0100_0000;

    impl CpuPort for CortexM4FPort {
        fn irq_disable(&self) -> IrqMask {
            let primask = cortex_m::register::primask::read();
            cortex_m::interrupt::disable();
            IrqMask(primask.is_active() as u32)
        }

        fn irq_restore(&self, mask: IrqMask) {
            if mask.0 != 0 {
                unsafe { cortex_m::interrupt::enable() };
            }
        }

        unsafe fn build_initial_stack(
            &self,
            stack_top: *mut u8,
            entry: extern "C" fn(usize),
            arg: usize,
            exit_fn: extern "C" fn() -> !,
        ) -> usize {
            // Cortex-M exception frame, high to low address:
            // xPSR, PC, LR, R12, R3, R2, R1, R0  (hardware-stacked half)
            // then R11..R4 (software-stacked callee-saved half), matching
            // the layout the PendSV handler a board crate writes expects.
            const FRAME_WORDS: usize = 16;
            let sp = (stack_top as usize & !0x7usize) - FRAME_WORDS * 4;
            let frame = sp as *mut u32;
            unsafe {
                // Hardware-stacked frame (popped by `bx lr` / exception
                // return on first dispatch).
                frame.add(8 + 7).write(INITIAL_XPSR);
                frame.add(8 + 6).write(entry as usize as u32); // PC
                frame.add(8 + 5).write(exit_fn as usize as u32); // LR
                frame.add(8 + 4).write(0); // R12
                frame.add(8 + 3).write(0); // R3
                frame.add(8 + 2).write(0); // R2
                frame.add(8 + 1).write(0); // R1
                frame.add(8 + 0).write(arg as u32); // R0 = arg
                // Software-stacked callee-saved registers, zeroed.
                for i in 0..8 {
                    frame.add(i).write(0);
                }
            }
            sp
        }

        fn start_first_thread(&self, sp_cell: &'static StackPtrCell) -> ! {
            unsafe {
                let peripherals = cortex_m::Peripherals::steal();
                let mut scb = peripherals.SCB;
                scb.set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, 0xff);
                scb.set_priority(cortex_m::peripheral::scb::SystemHandler::SysTick, 0xff);
            }
            unsafe { (*self.next_cell.get()) = Some(sp_cell) };
            self.switch.mark_pending();
            cortex_m::peripheral::SCB::set_pendsv();
            cortex_m::interrupt::enable();
            loop {
                cortex_m::asm::wfi();
            }
        }

        fn request_switch(
            &self,
            prev_cell: Option<&'static StackPtrCell>,
            next_cell: &'static StackPtrCell,
        ) {
            let first_of_batch = self.switch.mark_pending();
            unsafe {
                if first_of_batch {
                    (*self.prev_cell.get()) = prev_cell;
                }
                (*self.next_cell.get()) = Some(next_cell);
            }
            cortex_m::peripheral::SCB::set_pendsv();
        }
    }
}

#[cfg(feature = "cortex-m-port")]
pub use cortex_m4f::CortexM4FPort;

/// Test-only CPU port: records requests instead of touching hardware, so
/// scheduler/thread logic can be exercised with `cargo test` on the
/// development host.
#[cfg(any(test, not(feature = "cortex-m-port")))]
pub mod mock {
    use super::*;
    use heapless::Vec as HVec;

    #[derive(Debug, Clone, Copy)]
    pub struct SwitchRequest {
        pub prev: Option<usize>,
        pub next: usize,
    }

    pub struct MockPort {
        switch: SwitchRequestState,
        log: spin::Mutex<HVec<SwitchRequest, 64>>,
    }

    impl MockPort {
        pub const fn new() -> Self {
            MockPort { switch: SwitchRequestState::new(), log: spin::Mutex::new(HVec::new()) }
        }

        /// Drain and return every switch request recorded so far, in
        /// order. Used by scheduler/thread tests to assert on dispatch
        /// decisions.
        pub fn drain_requests(&self) -> HVec<SwitchRequest, 64> {
            let mut guard = self.log.lock();
            let drained = guard.clone();
            guard.clear();
            drained
        }
    }

    impl CpuPort for MockPort {
        fn irq_disable(&self) -> IrqMask {
            IrqMask(0)
        }

        fn irq_restore(&self, _mask: IrqMask) {}

        unsafe fn build_initial_stack(
            &self,
            stack_top: *mut u8,
            _entry: extern "C" fn(usize),
            _arg: usize,
            _exit_fn: extern "C" fn() -> !,
        ) -> usize {
            stack_top as usize
        }

        fn start_first_thread(&self, _sp_cell: &'static StackPtrCell) -> ! {
            loop {
                core::hint::spin_loop();
            }
        }

        fn request_switch(
            &self,
            prev_cell: Option<&'static StackPtrCell>,
            next_cell: &'static StackPtrCell,
        ) {
            let first_of_batch = self.switch.mark_pending();
            let mut guard = self.log.lock();
            if first_of_batch || guard.is_empty() {
                let _ = guard.push(SwitchRequest {
                    prev: prev_cell.map(|c| c.get()),
                    next: next_cell.get(),
                });
            } else if let Some(last) = guard.last_mut() {
                last.next = next_cell.get();
            }
        }
    }
}

#[cfg(any(test, not(feature = "cortex-m-port")))]
pub use mock::MockPort;

#[cfg(all(feature = "cortex-m-port", not(test)))]
pub type ActivePort = CortexM4FPort;

#[cfg(any(not(feature = "cortex-m-port"), test))]
pub type ActivePort = MockPort;

static GLOBAL_PORT: ActivePort = ActivePort::new();

/// The single, build-selected [`CpuPort`] instance every kernel subsystem
/// uses. There is exactly one concrete port type per build (chosen by
/// `cfg`, not `dyn` dispatch) — the idiomatic embedded-Rust shape, since a
/// Cortex-M4F target never needs to swap ports at runtime.
pub fn shared_port() -> &'static ActivePort {
    &GLOBAL_PORT
}
