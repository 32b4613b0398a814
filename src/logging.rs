//! Central kernel logging with optional in-memory capture for console dump.
//!
//! Records arrive through the `log` facade. Every record is written to the
//! installed [`ConsoleSink`] (serial port or screen, owned by the driver
//! layer); with capture enabled, `target|message` lines are also kept in a
//! fixed buffer that can be dumped per target later.

use core::fmt::{self, Write as _};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, Once};

const CAPTURE_BUF_SIZE: usize = 4 * 1024;

/// Character output provided by the console/serial driver.
pub trait ConsoleSink: Sync {
    fn write_str(&self, s: &str);
}

struct LogState {
    capture_enabled: bool,
    capture_len: usize,
    capture_overflow: bool,
    capture_buf: [u8; CAPTURE_BUF_SIZE],
}

impl LogState {
    const fn new() -> Self {
        Self {
            capture_enabled: false,
            capture_len: 0,
            capture_overflow: false,
            capture_buf: [0; CAPTURE_BUF_SIZE],
        }
    }

    fn captured_text(&self) -> &str {
        let bytes = &self.capture_buf[..self.capture_len];
        match core::str::from_utf8(bytes) {
            Ok(text) => text,
            // A multi-byte character cut off by the buffer end.
            Err(err) => core::str::from_utf8(&bytes[..err.valid_up_to()]).unwrap_or_default(),
        }
    }
}

struct KernelLogger {
    state: Mutex<LogState>,
    sink: Once<&'static dyn ConsoleSink>,
}

static LOGGER: KernelLogger = KernelLogger {
    state: Mutex::new(LogState::new()),
    sink: Once::new(),
};

struct BufferWriter<'a> {
    state: &'a mut LogState,
}

impl fmt::Write for BufferWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self
            .state
            .capture_buf
            .len()
            .saturating_sub(self.state.capture_len);
        let write_len = remaining.min(bytes.len());

        if write_len > 0 {
            let start = self.state.capture_len;
            let end = start + write_len;
            self.state.capture_buf[start..end].copy_from_slice(&bytes[..write_len]);
            self.state.capture_len = end;
        }

        if write_len < bytes.len() {
            self.state.capture_overflow = true;
        }
        Ok(())
    }
}

struct SinkWriter(&'static dyn ConsoleSink);

impl fmt::Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(&sink) = self.sink.get() {
            let _ = writeln!(
                SinkWriter(sink),
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }

        // A trap that logs while the buffer is being written skips capture
        // instead of spinning on the lock it interrupted.
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        if !state.capture_enabled {
            return;
        }
        let mut writer = BufferWriter { state: &mut state };
        let _ = writer.write_str(record.target());
        let _ = writer.write_char('|');
        let _ = fmt::write(&mut writer, *record.args());
        let _ = writer.write_char('\n');
    }

    fn flush(&self) {}
}

/// Installs the kernel logger writing to `sink` and sets the level filter.
///
/// The sink can only be installed once; a second call only adjusts `level`.
pub fn init(sink: &'static dyn ConsoleSink, level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.sink.call_once(|| sink);
    let result = log::set_logger(&LOGGER);
    log::set_max_level(level);
    result
}

/// Enable/disable capture buffer and reset it.
pub fn set_capture_enabled(enabled: bool) {
    let mut state = LOGGER.state.lock();
    state.capture_enabled = enabled;
    state.capture_len = 0;
    state.capture_overflow = false;
}

/// Runs `f` on the captured text and whether it was truncated.
pub fn with_captured<R>(f: impl FnOnce(&str, bool) -> R) -> R {
    let state = LOGGER.state.lock();
    f(state.captured_text(), state.capture_overflow)
}

/// Returns whether a captured line of `target` contains `needle`.
pub fn captured_contains(target: &str, needle: &str) -> bool {
    with_captured(|text, _| {
        captured_lines(text, target).any(|msg| msg.contains(needle))
    })
}

fn captured_lines<'a>(text: &'a str, target: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    text.split('\n').filter_map(move |raw_line| {
        let (line_target, msg) = raw_line.split_once('|')?;
        (line_target == target).then_some(msg)
    })
}

/// Dump captured logs for one target to `sink`.
pub fn print_captured_target(sink: &dyn ConsoleSink, target: &str) {
    with_captured(|text, overflow| {
        if text.is_empty() {
            return;
        }

        sink.write_str("\n--- ");
        sink.write_str(target);
        sink.write_str(" debug ---\n");
        for msg in captured_lines(text, target) {
            sink.write_str(msg);
            sink.write_str("\n");
        }
        if overflow {
            sink.write_str("[... log output truncated ...]\n");
        }
        sink.write_str("--- end ");
        sink.write_str(target);
        sink.write_str(" debug ---\n");
    });
}
