/*
 * Kernel Result Codes
 *
 * A small, flat error taxonomy shared by every kernel call: ok (plain
 * `Result::Ok`), generic-error, timeout, busy, invalid, null, deleted,
 * unsupported.
 */

/// Every fallible kernel operation returns `Result<T, KernelError>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Capacity full, wait timed out, illegal caller — the catch-all the
    /// source collapses most failures into.
    GenericError,
    /// A wait timed out before the resource became available.
    Timeout,
    /// The object is already locked by the calling thread.
    Busy,
    /// Wrong IPC object type, out-of-range argument (priority, size, …).
    Invalid,
    /// A required pointer/handle argument was null/absent.
    Null,
    /// The IPC object was deleted while the caller was waiting on it.
    Deleted,
    /// An unrecognized `ctrl` command.
    Unsupported,
}

/// Convenience alias; most kernel operations return `()` on success.
pub type KernelResult<T = ()> = Result<T, KernelError>;

impl KernelError {
    /// True for [`KernelError::Timeout`] or [`KernelError::GenericError`] —
    /// the pair callers should treat as interchangeable when probing for a
    /// wait-timeout outcome.
    pub fn is_timeout_like(self) -> bool {
        matches!(self, KernelError::Timeout | KernelError::GenericError)
    }
}
