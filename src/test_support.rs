//! Recording fakes shared by unit tests.

use crate::pool::{ConnectionPool, HostStats, PoolError, PooledConnection, Row};
use crate::syslog::{Level, SysLog};
use std::sync::{Arc, Mutex};

/// Ordered record of lifecycle calls made on fake services.
#[derive(Debug, Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, event: &str) {
        self.0.lock().unwrap().push(event.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Write(Level, String, String),
    Inline(Level, String, String),
    Clear,
}

/// `SysLog` that keeps everything in memory.
#[derive(Default)]
pub struct RecordingLog {
    entries: Mutex<Vec<LogEntry>>,
    trace: Trace,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace(trace: Trace) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            trace,
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.position(|e| match e {
            LogEntry::Write(_, _, m) | LogEntry::Inline(_, _, m) => m.contains(needle),
            LogEntry::Clear => false,
        })
        .is_some()
    }

    pub fn contains_at(&self, level: Level, needle: &str) -> bool {
        self.position(|e| match e {
            LogEntry::Write(l, _, m) | LogEntry::Inline(l, _, m) => {
                *l == level && m.contains(needle)
            }
            LogEntry::Clear => false,
        })
        .is_some()
    }

    /// Index of the first entry whose message contains `needle`.
    pub fn index_of(&self, needle: &str) -> Option<usize> {
        self.position(|e| match e {
            LogEntry::Write(_, _, m) | LogEntry::Inline(_, _, m) => m.contains(needle),
            LogEntry::Clear => false,
        })
    }

    pub fn count_of(&self, needle: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| match e {
                LogEntry::Write(_, _, m) | LogEntry::Inline(_, _, m) => m.contains(needle),
                LogEntry::Clear => false,
            })
            .count()
    }

    pub fn clear_index(&self) -> Option<usize> {
        self.position(|e| *e == LogEntry::Clear)
    }

    fn position(&self, pred: impl Fn(&LogEntry) -> bool) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(pred)
    }
}

impl SysLog for RecordingLog {
    fn write(&self, level: Level, category: &str, message: &str) {
        self.entries.lock().unwrap().push(LogEntry::Write(
            level,
            category.to_string(),
            message.to_string(),
        ));
    }

    fn print_inline(&self, level: Level, category: &str, message: &str) {
        self.entries.lock().unwrap().push(LogEntry::Inline(
            level,
            category.to_string(),
            message.to_string(),
        ));
    }

    fn clear_screen(&self) {
        self.entries.lock().unwrap().push(LogEntry::Clear);
    }

    fn close(&self) -> std::io::Result<()> {
        self.trace.push("logger.close");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    None,
    Initialize,
    Teardown,
    PanicOnTeardown,
}

/// `ConnectionPool` that records lifecycle calls and never hands out connections.
pub struct RecordingPool {
    trace: Trace,
    failure: Failure,
}

impl RecordingPool {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            failure: Failure::None,
        }
    }

    pub fn failing_initialize(trace: Trace) -> Self {
        Self {
            trace,
            failure: Failure::Initialize,
        }
    }

    pub fn failing_teardown(trace: Trace) -> Self {
        Self {
            trace,
            failure: Failure::Teardown,
        }
    }

    pub fn panicking_teardown(trace: Trace) -> Self {
        Self {
            trace,
            failure: Failure::PanicOnTeardown,
        }
    }
}

impl ConnectionPool for RecordingPool {
    fn initialize(&self) -> Result<(), PoolError> {
        if self.failure == Failure::Initialize {
            return Err(PoolError::UnknownHost {
                host: "fake".to_string(),
            });
        }
        self.trace.push("pool.initialize");
        Ok(())
    }

    fn teardown(&self) -> Result<(), PoolError> {
        self.trace.push("pool.teardown");
        match self.failure {
            Failure::Teardown => Err(PoolError::UnknownHost {
                host: "fake".to_string(),
            }),
            Failure::PanicOnTeardown => panic!("pool exploded during teardown"),
            _ => Ok(()),
        }
    }

    fn acquire(&self, _host: &str) -> Option<PooledConnection> {
        None
    }

    fn release(&self, _host: &str, _conn: PooledConnection) {}

    fn query(&self, _conn: &PooledConnection, _sql: &str) -> Result<Vec<Row>, PoolError> {
        Ok(Vec::new())
    }

    fn stats(&self) -> Vec<HostStats> {
        vec![HostStats {
            host: "fake".to_string(),
            idle: 1,
            in_use: 0,
        }]
    }
}
