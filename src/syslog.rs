/// Logging capability consumed by the control shell.
///
/// The shell only ever talks to a `SysLog`: structured lines go through
/// `write`, prompt-style output through `print_inline`. `TracingLog` is the
/// production sink and forwards structured lines to `tracing`.
use crossterm::cursor::MoveTo;
use crossterm::terminal::{Clear, ClearType};
use crossterm::ExecutableCommand;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

pub const SYSTEM_EVENT: &str = "<SYSTEM_EVENT>";
pub const SYSTEM_MAIN: &str = "<SYSTEM_MAIN>";
pub const SYSTEM_INIT: &str = "<SYSTEM_INIT>";
pub const USER_COMMAND: &str = "<USER_COMMAND>";

/// Severity accepted by the logging capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

pub trait SysLog: Send + Sync {
    /// Write one structured log line.
    fn write(&self, level: Level, category: &str, message: &str);

    /// Print operator-facing text without a trailing newline.
    fn print_inline(&self, level: Level, category: &str, message: &str);

    fn clear_screen(&self);

    /// Flush and stop accepting output. Called once by the service registry.
    fn close(&self) -> std::io::Result<()>;
}

/// `SysLog` backed by the global `tracing` subscriber and stdout.
pub struct TracingLog {
    app: String,
    closed: AtomicBool,
}

impl TracingLog {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        // stdout may be gone (detached terminal); nothing useful to do about it
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

impl SysLog for TracingLog {
    fn write(&self, level: Level, category: &str, message: &str) {
        if self.is_closed() {
            return;
        }
        let app = self.app.as_str();
        match level {
            Level::Info => tracing::info!(app, category, "{message}"),
            Level::Warn => tracing::warn!(app, category, "{message}"),
            Level::Error => tracing::error!(app, category, "{message}"),
            Level::Fatal => tracing::error!(app, category, fatal = true, "{message}"),
        }
    }

    fn print_inline(&self, level: Level, category: &str, message: &str) {
        if self.is_closed() {
            return;
        }
        tracing::trace!(category, level = level.as_str(), "inline output");
        self.emit(message);
    }

    fn clear_screen(&self) {
        if self.is_closed() {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        let cleared = stdout
            .execute(Clear(ClearType::All))
            .and_then(|out| out.execute(MoveTo(0, 0)))
            .map(|_| ());
        if let Err(e) = cleared {
            tracing::debug!(error = %e, "failed to clear screen");
        }
    }

    fn close(&self) -> std::io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(app = %self.app, "log sink closed");
        std::io::stdout().flush()
    }
}
