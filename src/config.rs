/*
 * Kernel Configuration Constants
 *
 * Collects every compile-time tunable under one module rather than
 * scattering `pub const`s at their point of use, because this crate's
 * tunables cut across every subsystem rather than belonging to one.
 *
 * Board crates that need different values should not edit this file;
 * instead build with `RUSTFLAGS` overrides or a `build.rs`-generated
 * `config_override.rs`. None of that plumbing exists yet — these are the
 * shipped defaults.
 */

/// Priority-direction flag: when `true`, a *lower* numeric priority value
/// is *higher* priority (priority 0 preempts priority 1). This is the
/// convention the rest of the crate assumes; flipping it is a
/// documentation exercise, not a supported runtime switch.
pub const LOWER_NUMBER_IS_HIGHER_PRIORITY: bool = true;

/// Maximum number of distinct priority levels. Bounded by the 32-bit ready
/// bitmap.
pub const NUM_PRIORITIES: usize = 32;

/// Whether the CPU port's own bit-scan instruction (CLZ) is used for
/// highest-ready-priority selection, versus the portable
/// `u32::trailing_zeros`/`leading_zeros` fallback. Cortex-M4F has single-
/// cycle CLZ, so the portable fallback already compiles to the same
/// instruction under LLVM — this flag exists to let a `MockPort` force
/// the software path in tests.
pub const USE_CPU_BITSCAN: bool = true;

/// Timer list level count. This crate uses a single sorted list rather
/// than a generalized multi-level skip list.
pub const TIMER_LIST_LEVELS: usize = 1;

/// Tick rate in Hz. Millisecond helpers compute `ticks = ms * rate / 1000`.
pub const TICK_RATE_HZ: u32 = 1000;

/// Convert a millisecond duration to a tick count at [`TICK_RATE_HZ`].
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ((ms as u64 * TICK_RATE_HZ as u64) / 1000) as u32
}

/// Formatted-output buffer size in bytes; output is truncated beyond this.
pub const FMT_BUF_SIZE: usize = 128;

/// Idle thread stack size in bytes.
pub const IDLE_STACK_SIZE: usize = 512;

/// Default time slice (in ticks) for threads that do not specify one.
pub const DEFAULT_TIME_SLICE_TICKS: u32 = 10;

/// Maximum number of threads the fixed thread arena can hold. Static and
/// dynamic thread creation both draw handles from this arena; only the
/// backing storage (stack + TCB) differs.
pub const MAX_THREADS: usize = 32;

/// Maximum number of outstanding software timers (includes one per thread
/// for sleep/IPC-timeout use).
pub const MAX_TIMERS: usize = MAX_THREADS + 16;

/// Recursion ceiling for a recursive mutex (spec.md §4.8: "bounded by an
/// implementation-defined ceiling").
pub const RECURSIVE_MUTEX_MAX_DEPTH: u32 = 64;

/// Size, in bytes, of the default dynamic byte-pool (used when a thread or
/// IPC object is created with the dynamic-allocation path and no explicit
/// pool is given).
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024;

/// Byte-pool allocations and block headers are aligned to this boundary.
pub const POOL_ALIGNMENT: usize = 8;

/// Whether statically-allocated thread/IPC-object creation is compiled in.
/// At least one of `STATIC_ALLOC_ENABLE` / `DYNAMIC_ALLOC_ENABLE` must be
/// `true` (spec.md §6); enforced by `crate::_ASSERT_AT_LEAST_ONE_ALLOC_PATH`.
pub const STATIC_ALLOC_ENABLE: bool = cfg!(feature = "static-alloc");

/// Whether dynamically-allocated (byte-pool backed) thread/IPC-object
/// creation is compiled in.
pub const DYNAMIC_ALLOC_ENABLE: bool = cfg!(feature = "dynamic-alloc");

/// Debug logging enable. Gates the maximum `log` level set at
/// [`crate::logging::init`] time; does not remove log call sites (those
/// are cheap no-ops when filtered by the `log` crate's level check).
pub const DEBUG_LOGGING_ENABLE: bool = true;
