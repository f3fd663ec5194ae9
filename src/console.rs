/// Interactive command console.
///
/// Prompts, reads one line, dispatches it through the command table, and
/// repeats while the process stays in interactive mode. The read is raced
/// against a caller-supplied fatal watch so a termination request is not
/// stuck behind an operator who never types anything.
use crate::command::{Classified, CommandKind, CommandRecord};
use crate::controller::ProcessMode;
use crate::syslog::{Level, SysLog, USER_COMMAND};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};

pub const PROMPT: &str = "CMD>: ";

/// Handlers behind the commands that do more than steer the console.
pub trait ConsoleDelegate: Send + Sync {
    fn system_info(&self, out: &dyn SysLog);
    fn system_help(&self, out: &dyn SysLog);

    /// Last word on `exit;`. Refusing keeps the console open.
    fn allow_exit(&self, _out: &dyn SysLog) -> bool {
        true
    }
}

/// Why the console returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleExit {
    /// `work;` / `01`.
    Resume,
    /// `exit;` / `04`, accepted by the delegate.
    Exit,
    /// The fatal watch fired while waiting for input.
    Aborted(String),
    /// Input reached end of file or failed.
    InputClosed,
}

pub struct CommandConsole<R> {
    input: R,
    /// Bytes of the line being read. Survives a cancelled read.
    pending: Vec<u8>,
    logger: Arc<dyn SysLog>,
    delegate: Arc<dyn ConsoleDelegate>,
}

impl CommandConsole<BufReader<Stdin>> {
    /// Console reading the controlling terminal.
    pub fn stdin(logger: Arc<dyn SysLog>, delegate: Arc<dyn ConsoleDelegate>) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), logger, delegate)
    }
}

impl<R: AsyncBufRead + Unpin> CommandConsole<R> {
    pub fn new(input: R, logger: Arc<dyn SysLog>, delegate: Arc<dyn ConsoleDelegate>) -> Self {
        Self {
            input,
            pending: Vec::new(),
            logger,
            delegate,
        }
    }

    /// Prompt and dispatch while `mode` is interactive, or until `fatal`
    /// resolves. `work;` flips `mode` back to running.
    ///
    /// `read_until` keeps partial input in `pending` when cancelled, so
    /// abandoning a read for the fatal watch loses no bytes.
    pub async fn run<F: Future<Output = String>>(
        &mut self,
        mode: &mut ProcessMode,
        fatal: F,
    ) -> ConsoleExit {
        tokio::pin!(fatal);
        while *mode == ProcessMode::Interactive {
            self.logger.print_inline(Level::Info, USER_COMMAND, PROMPT);

            let read = tokio::select! {
                reason = &mut fatal => return ConsoleExit::Aborted(reason),
                read = self.input.read_until(b'\n', &mut self.pending) => read,
            };
            match read {
                Ok(0) if self.pending.is_empty() => {
                    self.logger
                        .write(Level::Warn, USER_COMMAND, "command input closed");
                    return ConsoleExit::InputClosed;
                }
                Ok(_) => {}
                Err(e) => {
                    self.logger.write(
                        Level::Error,
                        USER_COMMAND,
                        &format!("failed to read command input: {e}"),
                    );
                    return ConsoleExit::InputClosed;
                }
            }

            let record = CommandRecord::new(take_line(&mut self.pending));
            if let Some(exit) = self.dispatch(&record, mode) {
                return exit;
            }
        }
        ConsoleExit::Resume
    }

    /// Act on one line. `Some` ends the console.
    fn dispatch(&self, record: &CommandRecord, mode: &mut ProcessMode) -> Option<ConsoleExit> {
        let log = self.logger.as_ref();
        tracing::debug!(raw = ?record.raw_input, "command line read");
        log.write(
            Level::Info,
            USER_COMMAND,
            &format!("user entered command: {}", record.normalized),
        );

        match record.classify() {
            Classified::Empty => {
                log.write(Level::Info, USER_COMMAND, "user entered an empty command");
                log.print_inline(Level::Error, USER_COMMAND, "ERR>: command cannot be empty\n");
                None
            }
            Classified::Unknown => {
                log.print_inline(
                    Level::Error,
                    USER_COMMAND,
                    &format!("ERR>: unknown command: {}\n", record.normalized),
                );
                None
            }
            Classified::Known(CommandKind::Work) => {
                *mode = ProcessMode::Running;
                None
            }
            Classified::Known(CommandKind::Info) => {
                self.guarded(CommandKind::Info, |d| d.system_info(log));
                None
            }
            Classified::Known(CommandKind::Help) => {
                self.guarded(CommandKind::Help, |d| d.system_help(log));
                None
            }
            Classified::Known(CommandKind::Exit) => {
                let allowed = self
                    .guarded(CommandKind::Exit, |d| d.allow_exit(log))
                    .unwrap_or(false);
                if allowed {
                    Some(ConsoleExit::Exit)
                } else {
                    log.print_inline(Level::Error, USER_COMMAND, "ERR>: exit refused\n");
                    None
                }
            }
        }
    }

    /// Run a delegate call, turning a panic into a fatal log line.
    fn guarded<T>(
        &self,
        kind: CommandKind,
        call: impl FnOnce(&dyn ConsoleDelegate) -> T,
    ) -> Option<T> {
        let delegate = self.delegate.as_ref();
        match catch_unwind(AssertUnwindSafe(|| call(delegate))) {
            Ok(value) => Some(value),
            Err(_) => {
                self.logger.write(
                    Level::Fatal,
                    USER_COMMAND,
                    &format!("command {} failed with an unexpected error", kind.spec().text),
                );
                None
            }
        }
    }
}

/// Drain one line out of `pending`, without its `\n` or `\r\n`. Bytes that
/// are not UTF-8 are replaced so the line still classifies as unknown.
fn take_line(pending: &mut Vec<u8>) -> String {
    if pending.last() == Some(&b'\n') {
        pending.pop();
        if pending.last() == Some(&b'\r') {
            pending.pop();
        }
    }
    let line = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    line
}
