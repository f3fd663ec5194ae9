/// Lifecycle events and the lock-free flags that carry them out of signal context.
///
/// A signal handler may only store `true` into one of the pre-allocated
/// flags. The controller turns set flags into [`LifecycleEvent`]s on its own
/// thread with [`EventFlags::drain`].
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Transition request raised by the signal bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnterInteractive,
    Warn(String),
    FatalShutdown(String),
}

/// OS notification classes the bridge knows how to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalClass {
    /// Ctrl-C: operator wants the command console.
    Interrupt,
    /// Ctrl-Break (Windows consoles only).
    Break,
    /// Terminal closed or process asked to terminate.
    Terminate,
    /// Logoff or system shutdown (Windows consoles only).
    SessionEnd,
}

impl SignalClass {
    #[cfg(any(test, windows))]
    pub const ALL: [SignalClass; 4] = [
        SignalClass::Interrupt,
        SignalClass::Break,
        SignalClass::Terminate,
        SignalClass::SessionEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalClass::Interrupt => "interrupt",
            SignalClass::Break => "break",
            SignalClass::Terminate => "terminate",
            SignalClass::SessionEnd => "session_end",
        }
    }

    /// Event produced when this class has fired.
    pub fn event(&self) -> LifecycleEvent {
        match self {
            SignalClass::Interrupt => LifecycleEvent::EnterInteractive,
            SignalClass::Break => LifecycleEvent::Warn("user pressed Ctrl+Break".to_string()),
            SignalClass::Terminate => LifecycleEvent::FatalShutdown(
                "console window closed or terminated, system shutting down".to_string(),
            ),
            SignalClass::SessionEnd => LifecycleEvent::FatalShutdown(
                "user logoff or system shutdown, system shutting down".to_string(),
            ),
        }
    }
}

/// One flag per [`SignalClass`], shared between the bridge and the controller.
#[derive(Debug, Clone, Default)]
pub struct EventFlags {
    interrupt: Arc<AtomicBool>,
    brk: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
    session_end: Arc<AtomicBool>,
}

impl EventFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag a handler for `class` stores into.
    pub fn flag(&self, class: SignalClass) -> &Arc<AtomicBool> {
        match class {
            SignalClass::Interrupt => &self.interrupt,
            SignalClass::Break => &self.brk,
            SignalClass::Terminate => &self.terminate,
            SignalClass::SessionEnd => &self.session_end,
        }
    }

    /// Mark `class` as fired. Async-signal-safe: a single atomic store.
    #[cfg(any(test, windows))]
    pub fn raise(&self, class: SignalClass) {
        self.flag(class).store(true, Ordering::SeqCst);
    }

    /// Clear `class` and report whether it had fired.
    pub fn take(&self, class: SignalClass) -> bool {
        self.flag(class).swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn is_raised(&self, class: SignalClass) -> bool {
        self.flag(class).load(Ordering::SeqCst)
    }

    /// Consume every fired flag, fatal classes first.
    ///
    /// Repeated signals of one class since the last drain yield one event.
    pub fn drain(&self) -> Vec<LifecycleEvent> {
        [
            SignalClass::SessionEnd,
            SignalClass::Terminate,
            SignalClass::Break,
            SignalClass::Interrupt,
        ]
        .into_iter()
        .filter(|class| self.take(*class))
        .map(|class| class.event())
        .collect()
    }
}
