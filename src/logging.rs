/*
 * Formatted Output & Logging (spec.md §6 "Character output", §6
 * "Formatted output", §9 "Non-reentrant formatted output")
 *
 * The board supplies one thing: a byte sink. Everything else — buffering,
 * truncation, the `log` facade — lives here, the same division the
 * teacher (`valibali-cluu`'s `utils/logger.rs`) draws between "logger
 * plumbing" and "where bytes actually go", just retargeted from a fixed
 * x86_64 UART to an arbitrary board-supplied sink.
 *
 * Formatting itself is plain `core::fmt` rather than a hand-rolled `%d %s
 * %c %x %f` parser: `core::fmt::Display`/`Debug` already cover decimal,
 * string, char and hex (`{:x}`) output, and `{:.6}` covers the spec's
 * "six decimal places" for floats, so reimplementing a printf parser
 * would just be the same feature under a different interface. What the
 * spec actually requires operationally — a bounded buffer, truncation
 * instead of a panic or an unbounded write — is what [`CharSink::write_line`]
 * enforces.
 */

use core::fmt::{self, Write as _};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::{DEBUG_LOGGING_ENABLE, FMT_BUF_SIZE};

/// The board's character-output back-end (spec.md §6): one byte at a
/// time, no assumptions about a terminal or a particular transport.
/// Out of scope per spec.md §1 ("the character output back-end … [is]
/// treated as external"); this crate only calls it.
pub trait CharSink: Sync {
    fn write_byte(&self, byte: u8);
}

struct FixedBuf {
    data: [u8; FMT_BUF_SIZE],
    len: usize,
}

impl FixedBuf {
    const fn new() -> Self {
        FixedBuf { data: [0; FMT_BUF_SIZE], len: 0 }
    }
}

impl fmt::Write for FixedBuf {
    /// Writes as many bytes as fit and silently drops the rest — "truncated
    /// at buffer size" (spec.md §6), never a panic, never a blocking grow.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = FMT_BUF_SIZE - self.len;
        let take = room.min(s.len());
        self.data[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Render `args` into a bounded buffer and drain it through `sink` one
/// byte at a time. Used directly by boards that want formatted output
/// without going through the `log` facade, and by [`KernelLogger`] below.
pub fn write_fmt(sink: &dyn CharSink, args: fmt::Arguments<'_>) {
    let mut buf = FixedBuf::new();
    let _ = buf.write_fmt(args);
    for &b in &buf.data[..buf.len] {
        sink.write_byte(b);
    }
}

/// `log::Log` implementation over a single [`CharSink`]. Not
/// reentrant-safe by design (spec.md §9: "the documentation explicitly
/// accepts concurrent garbling" — callers that need serialized output may
/// wrap the sink in their own mutex, but the kernel does not impose one).
struct KernelLogger {
    sink: &'static dyn CharSink,
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        DEBUG_LOGGING_ENABLE && metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        write_fmt(self.sink, format_args!("[{}] {}\n", record.level(), record.args()));
    }

    fn flush(&self) {}
}

/// One process-wide logger instance; `init` below picks which sink it
/// forwards to. `log::set_logger` only accepts a `&'static dyn Log`, so
/// the sink has to be resolved once, at init time, rather than per call.
/// `spin::Once` gives interior-mutable `'static` initialization without
/// `static mut` (the same pattern `port.rs`'s `GLOBAL_PORT` avoids needing,
/// since that one has no runtime-supplied argument).
static LOGGER_STORAGE: spin::Once<KernelLogger> = spin::Once::new();

/// Wire the `log` facade (`log::info!`, `log::warn!`, …) to `sink`. Call
/// once during board bring-up, before starting the scheduler. Calling it
/// more than once is harmless: only the first call's `sink` takes effect.
pub fn init(sink: &'static dyn CharSink) {
    let logger_ref = LOGGER_STORAGE.call_once(|| KernelLogger { sink });
    let _ = log::set_logger(logger_ref);
    log::set_max_level(if DEBUG_LOGGING_ENABLE { LevelFilter::Info } else { LevelFilter::Off });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        bytes: Mutex<std::vec::Vec<u8>>,
    }

    impl CharSink for RecordingSink {
        fn write_byte(&self, byte: u8) {
            self.bytes.lock().unwrap().push(byte);
        }
    }

    #[test]
    fn write_fmt_truncates_past_buffer_size() {
        let sink = RecordingSink { bytes: Mutex::new(std::vec::Vec::new()) };
        let long = "x".repeat(FMT_BUF_SIZE * 4);
        write_fmt(&sink, format_args!("{long}"));
        assert_eq!(sink.bytes.lock().unwrap().len(), FMT_BUF_SIZE);
    }

    #[test]
    fn write_fmt_passes_short_strings_through_untouched() {
        let sink = RecordingSink { bytes: Mutex::new(std::vec::Vec::new()) };
        write_fmt(&sink, format_args!("hello {}", 42));
        assert_eq!(sink.bytes.lock().unwrap().as_slice(), b"hello 42");
    }
}
