//! Logging infrastructure for CrabEFI
//!
//! Records from the `log` crate are formatted into a fixed-size line buffer
//! and handed to whatever sink the platform registered (serial port, cbmem
//! console, or a capture buffer in tests).

use core::fmt::Write;

use heapless::String;
use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// Longest line emitted in one piece; longer messages are truncated.
const LINE_CAPACITY: usize = 256;

/// Destination for formatted log lines
pub trait LogSink: Sync {
    fn write_line(&self, line: &str);
}

/// Sink-backed logger implementation
struct SinkLogger {
    sink: Mutex<Option<&'static dyn LogSink>>,
}

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let Some(sink) = *self.sink.lock() else {
            return;
        };

        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        // Format: [LEVEL] target: message
        let mut line: String<LINE_CAPACITY> = String::new();
        let _ = write!(line, "[{}] {}: {}", level_str, record.target(), record.args());
        sink.write_line(&line);
    }

    fn flush(&self) {}
}

static LOGGER: SinkLogger = SinkLogger {
    sink: Mutex::new(None),
};

/// Initialize the logging subsystem
///
/// The first call installs the logger; later calls only swap the sink and
/// level, so drivers brought up after a console change keep logging.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) {
    *LOGGER.sink.lock() = Some(sink);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
