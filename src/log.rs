//! Log levels, entries, and sinks.
//!
//! `notice`/`info`/`debug`/`warning`/`err` funnel through a [`Logger`],
//! which filters by a configured [`LogLevel`] floor before handing
//! entries to whatever [`LogSink`] the session was built with.

use std::io::Write;
use std::sync::Arc;

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::position::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    fn color(self) -> Color {
        match self {
            LogLevel::Debug => Color::Ansi256(8),
            LogLevel::Info => Color::Blue,
            LogLevel::Notice => Color::Cyan,
            LogLevel::Warning => Color::Yellow,
            LogLevel::Error => Color::Red,
            LogLevel::Critical | LogLevel::Alert | LogLevel::Emergency => Color::Magenta,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Alert => "alert",
            LogLevel::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub span: Span,
    /// 1-based column of `span.begin` in its source line.
    pub column: usize,
    pub path: Option<String>,
    pub message: String,
}

pub trait LogSink {
    fn push(&self, entry: LogEntry);
}

/// Collects every entry it is given; used by tests that want to assert on
/// what the evaluator logged without touching stderr.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: std::sync::Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("log mutex poisoned").clone()
    }
}

impl LogSink for MemorySink {
    fn push(&self, entry: LogEntry) {
        self.entries.lock().expect("log mutex poisoned").push(entry);
    }
}

/// Colorizes by level and writes to stderr, mirroring the CLI diagnostics
/// rendering this crate's tests and the embedding API's default session
/// use.
pub struct StderrSink {
    stream: std::sync::Mutex<StandardStream>,
}

impl StderrSink {
    pub fn new() -> Self {
        StderrSink { stream: std::sync::Mutex::new(StandardStream::stderr(ColorChoice::Auto)) }
    }
}

impl Default for StderrSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for StderrSink {
    fn push(&self, entry: LogEntry) {
        let mut stream = self.stream.lock().expect("stderr mutex poisoned");
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(entry.level.color())).set_bold(entry.level >= LogLevel::Error);
        let _ = stream.set_color(&spec);
        let _ = write!(stream, "{}: ", entry.level.label());
        let _ = stream.reset();
        match &entry.path {
            Some(path) => {
                let _ = writeln!(stream, "{}:{}:{}: {}", path, entry.span.begin.line, entry.column, entry.message);
            }
            None => {
                let _ = writeln!(stream, "{}", entry.message);
            }
        }
    }
}

pub struct Logger {
    sink: Arc<dyn LogSink>,
    floor: LogLevel,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>, floor: LogLevel) -> Self {
        Logger { sink, floor }
    }

    pub fn log(&self, level: LogLevel, span: Span, column: usize, path: Option<String>, message: impl Into<String>) {
        if level < self.floor {
            return;
        }
        self.sink.push(LogEntry { level, span, column, path, message: message.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    fn span() -> Span {
        Span::point(Position::start())
    }

    #[test]
    fn entries_below_the_floor_are_dropped() {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(sink.clone(), LogLevel::Warning);
        logger.log(LogLevel::Info, span(), 1, None, "quiet");
        logger.log(LogLevel::Error, span(), 1, None, "loud");
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "loud");
    }

    #[test]
    fn levels_order_from_debug_to_emergency() {
        assert!(LogLevel::Debug < LogLevel::Notice);
        assert!(LogLevel::Notice < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Emergency);
    }
}
