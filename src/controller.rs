/// Lifecycle controller: the poll loop that owns the process mode.
///
/// ```text
/// Init ──start──▶ Running ◀──work;──┐
///                    │              │
///              EnterInteractive     │
///                    ▼              │
///               Interactive ────────┘
///                    │
///     FatalShutdown / exit;
///                    ▼
///              ShuttingDown ──teardown──▶ Terminated
/// ```
///
/// Signal handlers only raise flags; every reaction happens here, on the
/// controller's own task, once per poll interval.
use crate::console::{CommandConsole, ConsoleExit};
use crate::events::{EventFlags, LifecycleEvent, SignalClass};
use crate::registry::ServiceRegistry;
use crate::syslog::{Level, SysLog, SYSTEM_EVENT, SYSTEM_MAIN, USER_COMMAND};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Running,
    Interactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    Running,
    Interactive,
    ShuttingDown,
    Terminated,
}

/// Why the controller stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator typed `exit;`.
    ExitCommand,
    Fatal(String),
    /// The controller task died; teardown ran from the outside.
    Crashed,
}

impl ExitReason {
    /// Every intentional termination exits 0, including fatal signals.
    /// Monitoring may rely on this, so it is kept as is.
    pub fn exit_code(&self) -> i32 {
        0
    }
}

pub struct LifecycleController {
    poll_interval: Duration,
    registry: Arc<ServiceRegistry>,
    logger: Arc<dyn SysLog>,
    events: EventFlags,
    phase: LifecyclePhase,
    /// Lent to the console while it runs; `work;` flips it back.
    mode: ProcessMode,
    /// Set while the console is open so another interrupt does not reopen it.
    suppress_console: bool,
}

impl LifecycleController {
    pub fn new(
        poll_interval: Duration,
        registry: Arc<ServiceRegistry>,
        logger: Arc<dyn SysLog>,
        events: EventFlags,
    ) -> Self {
        Self {
            poll_interval,
            registry,
            logger,
            events,
            phase: LifecyclePhase::Init,
            mode: ProcessMode::Running,
            suppress_console: false,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    /// Services are up and signals are wired: begin normal operation.
    pub fn start(&mut self) {
        if self.phase == LifecyclePhase::Init {
            self.phase = LifecyclePhase::Running;
            self.logger
                .write(Level::Info, SYSTEM_MAIN, "system running, press Ctrl+C for command mode");
        }
    }

    /// Poll until the process should exit.
    pub async fn run<R: AsyncBufRead + Unpin>(
        &mut self,
        console: &mut CommandConsole<R>,
    ) -> ExitReason {
        self.start();

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the loop waits a full period first.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Some(reason) = self.step(console).await {
                tracing::debug!(phase = ?self.phase(), mode = ?self.mode(), "controller stopped");
                return reason;
            }
        }
    }

    /// Handle everything raised since the previous poll.
    pub async fn step<R: AsyncBufRead + Unpin>(
        &mut self,
        console: &mut CommandConsole<R>,
    ) -> Option<ExitReason> {
        for event in self.events.drain() {
            match event {
                LifecycleEvent::FatalShutdown(reason) => {
                    return Some(self.shutdown(ExitReason::Fatal(reason)));
                }
                LifecycleEvent::Warn(text) => {
                    self.logger.write(Level::Warn, SYSTEM_EVENT, &text);
                }
                LifecycleEvent::EnterInteractive => {
                    self.logger
                        .write(Level::Info, SYSTEM_EVENT, "user pressed Ctrl+C");
                    if self.suppress_console {
                        tracing::debug!("interrupt absorbed, console already open");
                        continue;
                    }
                    if let Some(reason) = self.interact(console).await {
                        return Some(reason);
                    }
                }
            }
        }
        None
    }

    async fn interact<R: AsyncBufRead + Unpin>(
        &mut self,
        console: &mut CommandConsole<R>,
    ) -> Option<ExitReason> {
        self.suppress_console = true;
        self.phase = LifecyclePhase::Interactive;
        self.mode = ProcessMode::Interactive;
        self.logger
            .write(Level::Info, SYSTEM_MAIN, "user entered command mode");

        let watch = watch_fatal(&self.events, Arc::clone(&self.logger), self.poll_interval);
        match console.run(&mut self.mode, watch).await {
            ConsoleExit::Resume | ConsoleExit::InputClosed => {
                self.resume();
                None
            }
            ConsoleExit::Exit => Some(self.shutdown(ExitReason::ExitCommand)),
            ConsoleExit::Aborted(reason) => Some(self.shutdown(ExitReason::Fatal(reason))),
        }
    }

    fn resume(&mut self) {
        // Interrupts that landed after the watch's last poll belong to the
        // console session that just ended.
        if self.events.take(SignalClass::Interrupt) {
            tracing::debug!("interrupt absorbed on resume");
        }
        self.suppress_console = false;
        self.logger
            .write(Level::Info, SYSTEM_MAIN, "user left command mode");
        self.phase = LifecyclePhase::Running;
        self.mode = ProcessMode::Running;
        self.logger.clear_screen();
    }

    /// Tear the services down and finish. Safe to reach from several paths;
    /// the registry makes the teardown itself happen once.
    pub fn shutdown(&mut self, reason: ExitReason) -> ExitReason {
        self.phase = LifecyclePhase::ShuttingDown;
        self.mode = ProcessMode::Running;
        stop_services(&self.registry, self.logger.as_ref(), &reason);
        self.phase = LifecyclePhase::Terminated;
        reason
    }
}

/// Log why the process is stopping, then tear the services down.
///
/// Also the path taken when the controller task itself died and no
/// controller is left to call [`LifecycleController::shutdown`].
pub fn stop_services(registry: &ServiceRegistry, logger: &dyn SysLog, reason: &ExitReason) {
    match reason {
        ExitReason::ExitCommand => logger.write(Level::Info, USER_COMMAND, "user requested exit"),
        ExitReason::Fatal(text) => logger.write(Level::Warn, SYSTEM_EVENT, text),
        ExitReason::Crashed => logger.write(
            Level::Fatal,
            SYSTEM_MAIN,
            "system main thread hit an unexpected error",
        ),
    }
    logger.write(Level::Warn, SYSTEM_MAIN, "system main thread exiting");

    if !registry.teardown_all() {
        tracing::debug!("services already torn down");
    }
}

/// Caller side of a lost single-instance race: warn, give the warning `delay`
/// to reach the operator, then tear everything down.
pub async fn stand_down(
    registry: &ServiceRegistry,
    logger: &dyn SysLog,
    holder_pid: Option<u32>,
    delay: Duration,
) -> ExitReason {
    let holder = holder_pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
    logger.write(
        Level::Warn,
        SYSTEM_MAIN,
        &format!("another instance is already running (pid {holder}), exiting"),
    );
    tokio::time::sleep(delay).await;

    let reason = ExitReason::Fatal("duplicate instance".to_string());
    stop_services(registry, logger, &reason);
    reason
}

/// Resolves with the first fatal reason raised while the console is open.
///
/// Interrupts are absorbed and warnings logged, on the same cadence as the
/// main poll loop.
async fn watch_fatal(events: &EventFlags, logger: Arc<dyn SysLog>, period: Duration) -> String {
    loop {
        tokio::time::sleep(period).await;
        for event in events.drain() {
            match event {
                LifecycleEvent::FatalShutdown(reason) => return reason,
                LifecycleEvent::Warn(text) => logger.write(Level::Warn, SYSTEM_EVENT, &text),
                LifecycleEvent::EnterInteractive => logger.write(
                    Level::Info,
                    SYSTEM_EVENT,
                    "user pressed Ctrl+C, already in command mode",
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppInfoConfig;
    use crate::console::ConsoleDelegate;
    use crate::pool::ConnectionPool;
    use crate::syskit::SystemKit;
    use crate::test_support::{RecordingLog, RecordingPool, Trace};
    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};

    const TICK: Duration = Duration::from_millis(10);

    struct Harness {
        controller: LifecycleController,
        registry: Arc<ServiceRegistry>,
        log: Arc<RecordingLog>,
        events: EventFlags,
        trace: Trace,
    }

    fn harness() -> Harness {
        let trace = Trace::default();
        let log = Arc::new(RecordingLog::with_trace(trace.clone()));
        let registry = Arc::new(ServiceRegistry::new());
        let log_for_registry = Arc::clone(&log);
        let pool_trace = trace.clone();
        registry
            .initialize_with(
                move || Ok(log_for_registry as Arc<dyn SysLog>),
                move || Ok(Arc::new(RecordingPool::new(pool_trace)) as Arc<dyn ConnectionPool>),
            )
            .unwrap();
        let events = EventFlags::new();
        let controller = LifecycleController::new(
            TICK,
            Arc::clone(&registry),
            Arc::clone(&log) as Arc<dyn SysLog>,
            events.clone(),
        );
        Harness {
            controller,
            registry,
            log,
            events,
            trace,
        }
    }

    fn console_for<R: AsyncBufRead + Unpin>(h: &Harness, input: R) -> CommandConsole<R> {
        let delegate = SystemKit::new(AppInfoConfig::default(), Arc::clone(&h.registry));
        CommandConsole::new(
            input,
            Arc::clone(&h.log) as Arc<dyn SysLog>,
            Arc::new(delegate) as Arc<dyn ConsoleDelegate>,
        )
    }

    fn idle_console(h: &Harness) -> (CommandConsole<BufReader<DuplexStream>>, DuplexStream) {
        let (reader, writer) = tokio::io::duplex(256);
        (console_for(h, BufReader::new(reader)), writer)
    }

    #[tokio::test]
    async fn starts_in_init_then_running() {
        let mut h = harness();
        assert_eq!(h.controller.phase(), LifecyclePhase::Init);
        h.controller.start();
        assert_eq!(h.controller.phase(), LifecyclePhase::Running);
        assert_eq!(h.controller.mode(), ProcessMode::Running);
    }

    #[tokio::test]
    async fn step_without_events_does_nothing() {
        let mut h = harness();
        h.controller.start();
        let (mut console, _w) = idle_console(&h);
        assert_eq!(h.controller.step(&mut console).await, None);
        assert_eq!(h.controller.mode(), ProcessMode::Running);
    }

    #[tokio::test]
    async fn interactive_round_trip_transcript() {
        let mut h = harness();
        h.controller.start();
        let mut console = console_for(&h, "help;\n\nWORK;\n".as_bytes());

        h.events.raise(SignalClass::Interrupt);
        assert_eq!(h.controller.step(&mut console).await, None);

        let enter = h.log.index_of("user entered command mode").unwrap();
        let help = h.log.index_of("work;  or 01").unwrap();
        let empty = h.log.index_of("command cannot be empty").unwrap();
        let leave = h.log.index_of("user left command mode").unwrap();
        let clear = h.log.clear_index().unwrap();
        assert!(enter < help, "enter before help");
        assert!(help < empty, "help before empty error");
        assert!(empty < leave, "empty error before leave");
        assert!(leave < clear, "screen cleared after leaving");
        assert_eq!(h.controller.mode(), ProcessMode::Running);
        assert_eq!(h.controller.phase(), LifecyclePhase::Running);
        assert!(!h.registry.is_torn_down());
    }

    #[tokio::test]
    async fn second_interrupt_while_interactive_enters_once() {
        let mut h = harness();
        h.controller.start();
        let (mut console, mut writer) = idle_console(&h);

        h.events.raise(SignalClass::Interrupt);
        h.events.raise(SignalClass::Interrupt);
        let events = h.events.clone();
        let operator = tokio::spawn(async move {
            // Interrupt again while the console is waiting for input
            tokio::time::sleep(TICK * 2).await;
            events.raise(SignalClass::Interrupt);
            tokio::time::sleep(TICK * 3).await;
            events.raise(SignalClass::Interrupt);
            writer.write_all(b"work;\n").await.unwrap();
            writer
        });

        assert_eq!(h.controller.step(&mut console).await, None);
        let _writer = operator.await.unwrap();

        assert_eq!(h.log.count_of("user entered command mode"), 1);
        assert_eq!(h.log.count_of("user left command mode"), 1);
        assert!(!h.events.is_raised(SignalClass::Interrupt));

        // Nothing left over to reopen the console
        assert_eq!(h.controller.step(&mut console).await, None);
        assert_eq!(h.log.count_of("user entered command mode"), 1);
    }

    #[tokio::test]
    async fn exit_command_tears_down_once() {
        let mut h = harness();
        h.controller.start();
        let mut console = console_for(&h, "Exit;\n".as_bytes());

        h.events.raise(SignalClass::Interrupt);
        let reason = h.controller.step(&mut console).await;
        assert_eq!(reason, Some(ExitReason::ExitCommand));
        assert_eq!(h.controller.phase(), LifecyclePhase::Terminated);
        assert!(h.registry.is_torn_down());
        assert_eq!(h.trace.count("pool.teardown"), 1);
        assert_eq!(h.trace.count("logger.close"), 1);
        assert!(h.log.contains("system main thread exiting"));

        // A late fatal path finds nothing left to tear down
        h.controller.shutdown(ExitReason::Fatal("late".to_string()));
        assert_eq!(h.trace.count("pool.teardown"), 1);
        assert_eq!(h.trace.count("logger.close"), 1);
    }

    #[tokio::test]
    async fn fatal_event_shuts_down() {
        let mut h = harness();
        h.controller.start();
        let (mut console, _w) = idle_console(&h);

        h.events.raise(SignalClass::Terminate);
        h.events.raise(SignalClass::Interrupt);
        let reason = h.controller.step(&mut console).await;

        assert!(matches!(reason, Some(ExitReason::Fatal(_))));
        assert_eq!(h.controller.phase(), LifecyclePhase::Terminated);
        assert_eq!(
            h.trace.events(),
            vec!["pool.initialize", "pool.teardown", "logger.close"]
        );
        // Fatal wins over the interrupt raised in the same poll
        assert_eq!(h.log.count_of("user entered command mode"), 0);
    }

    #[tokio::test]
    async fn fatal_while_console_waits_for_input() {
        let mut h = harness();
        h.controller.start();
        let (mut console, _w) = idle_console(&h);

        h.events.raise(SignalClass::Interrupt);
        let events = h.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK * 2).await;
            events.raise(SignalClass::SessionEnd);
        });

        let reason = tokio::time::timeout(Duration::from_secs(5), h.controller.step(&mut console))
            .await
            .expect("fatal event must end the console");
        match reason {
            Some(ExitReason::Fatal(text)) => assert!(text.contains("logoff")),
            other => panic!("expected fatal exit, got {other:?}"),
        }
        assert!(h.registry.is_torn_down());
    }

    #[tokio::test]
    async fn warn_event_is_logged_and_ignored() {
        let mut h = harness();
        h.controller.start();
        let (mut console, _w) = idle_console(&h);

        h.events.raise(SignalClass::Break);
        assert_eq!(h.controller.step(&mut console).await, None);
        assert!(h.log.contains_at(Level::Warn, "Ctrl+Break"));
        assert_eq!(h.controller.phase(), LifecyclePhase::Running);
    }

    #[tokio::test]
    async fn closed_input_returns_to_running() {
        let mut h = harness();
        h.controller.start();
        let mut console = console_for(&h, "".as_bytes());

        h.events.raise(SignalClass::Interrupt);
        assert_eq!(h.controller.step(&mut console).await, None);
        assert_eq!(h.controller.mode(), ProcessMode::Running);
        assert!(h.log.contains("command input closed"));
    }

    #[tokio::test]
    async fn run_loop_exits_on_fatal() {
        let mut h = harness();
        let (mut console, _w) = idle_console(&h);
        let events = h.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK * 3).await;
            events.raise(SignalClass::Terminate);
        });

        let reason = tokio::time::timeout(Duration::from_secs(5), h.controller.run(&mut console))
            .await
            .expect("run must return after a fatal event");
        assert!(matches!(reason, ExitReason::Fatal(_)));
        assert_eq!(reason.exit_code(), 0);
        assert!(h.log.contains("system running"));
        assert!(h.registry.is_torn_down());
    }

    #[tokio::test]
    async fn duplicate_instance_warns_waits_then_tears_down() {
        let h = harness();
        let dir = tempfile::TempDir::new().unwrap();
        let _holder = crate::instance::acquire("APP", dir.path()).unwrap();
        let holder_pid = match crate::instance::acquire("APP", dir.path()) {
            Err(crate::instance::InstanceError::AlreadyRunning { holder_pid, .. }) => holder_pid,
            other => panic!("expected AlreadyRunning, got {other:?}"),
        };

        let delay = Duration::from_millis(30);
        let started = std::time::Instant::now();
        let reason = stand_down(&h.registry, h.log.as_ref(), holder_pid, delay).await;

        assert!(started.elapsed() >= delay);
        assert_eq!(reason.exit_code(), 0);
        let warned = h.log.index_of("another instance is already running").unwrap();
        let exiting = h.log.index_of("system main thread exiting").unwrap();
        assert!(warned < exiting);
        assert!(h.log.contains_at(
            Level::Warn,
            &format!("(pid {})", std::process::id())
        ));
        assert_eq!(
            h.trace.events(),
            vec!["pool.initialize", "pool.teardown", "logger.close"]
        );
        assert!(h.registry.is_torn_down());
    }

    #[test]
    fn crash_path_logs_fatal_then_tears_down() {
        let h = harness();
        stop_services(&h.registry, h.log.as_ref(), &ExitReason::Crashed);

        let crashed = h.log.index_of("unexpected error").unwrap();
        let exiting = h.log.index_of("system main thread exiting").unwrap();
        assert!(crashed < exiting);
        assert!(h.log.contains_at(Level::Fatal, "unexpected error"));
        assert_eq!(
            h.trace.events(),
            vec!["pool.initialize", "pool.teardown", "logger.close"]
        );
    }

    #[test]
    fn every_exit_reason_exits_zero() {
        assert_eq!(ExitReason::ExitCommand.exit_code(), 0);
        assert_eq!(ExitReason::Fatal("x".to_string()).exit_code(), 0);
        assert_eq!(ExitReason::Crashed.exit_code(), 0);
    }
}
