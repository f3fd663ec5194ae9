/// Signal bridge: OS notifications in, [`EventFlags`] stores out.
///
/// Each platform has exactly one [`SignalBridge`] implementation and
/// [`PlatformSignals`] picks it at build time. Handlers never log, lock or
/// allocate; they store into a pre-allocated flag and return.
///
/// | class      | Unix                      | Windows console          |
/// |------------|---------------------------|--------------------------|
/// | Interrupt  | SIGINT                    | Ctrl-C                   |
/// | Break      | (none)                    | Ctrl-Break               |
/// | Terminate  | SIGHUP, SIGQUIT, SIGTERM  | console close            |
/// | SessionEnd | (none)                    | logoff, shutdown         |
use crate::events::{EventFlags, SignalClass};

pub trait SignalBridge {
    /// Register handlers for every class this platform supports.
    ///
    /// Failures are reported, not returned: the process keeps running without
    /// protection for the failed classes.
    fn install(&mut self, flags: &EventFlags) -> InstallReport;
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<SignalClass>,
    pub failures: Vec<SignalDeliveryFailure>,
}

/// A signal class left without a handler.
#[derive(Debug)]
pub struct SignalDeliveryFailure {
    pub class: SignalClass,
    pub reason: FailureReason,
}

#[derive(Debug)]
pub enum FailureReason {
    /// The platform has no such notification.
    Unsupported,
    Io(std::io::Error),
}

impl SignalDeliveryFailure {
    fn unsupported(class: SignalClass) -> Self {
        Self {
            class,
            reason: FailureReason::Unsupported,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self.reason, FailureReason::Unsupported)
    }
}

impl std::fmt::Display for SignalDeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            FailureReason::Unsupported => {
                write!(f, "{} notifications are not available on this platform", self.class.as_str())
            }
            FailureReason::Io(e) => {
                write!(f, "failed to install {} handler: {}", self.class.as_str(), e)
            }
        }
    }
}

impl std::error::Error for SignalDeliveryFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.reason {
            FailureReason::Io(e) => Some(e),
            FailureReason::Unsupported => None,
        }
    }
}

#[cfg(unix)]
pub type PlatformSignals = unix::UnixSignals;

#[cfg(windows)]
pub type PlatformSignals = windows::WindowsConsole;

#[cfg(unix)]
mod unix {
    use super::{FailureReason, InstallReport, SignalBridge, SignalDeliveryFailure};
    use crate::events::{EventFlags, SignalClass};
    use nix::sys::signal::Signal;
    use signal_hook::SigId;

    const INTERRUPT_SIGNALS: &[Signal] = &[Signal::SIGINT];
    const TERMINATE_SIGNALS: &[Signal] = &[Signal::SIGHUP, Signal::SIGQUIT, Signal::SIGTERM];

    /// Handlers registered through `signal-hook`; each one is a single atomic store.
    #[derive(Default)]
    pub struct UnixSignals {
        registered: Vec<(Signal, SigId)>,
    }

    impl UnixSignals {
        pub fn new() -> Self {
            Self::default()
        }

        fn register_class(
            &mut self,
            flags: &EventFlags,
            class: SignalClass,
            signals: &[Signal],
        ) -> Result<(), std::io::Error> {
            for sig in signals {
                let id = signal_hook::flag::register(*sig as i32, flags.flag(class).clone())?;
                tracing::debug!(signal = sig.as_str(), class = class.as_str(), "signal handler registered");
                self.registered.push((*sig, id));
            }
            Ok(())
        }
    }

    impl SignalBridge for UnixSignals {
        fn install(&mut self, flags: &EventFlags) -> InstallReport {
            let mut report = InstallReport::default();
            for (class, signals) in [
                (SignalClass::Interrupt, INTERRUPT_SIGNALS),
                (SignalClass::Terminate, TERMINATE_SIGNALS),
            ] {
                match self.register_class(flags, class, signals) {
                    Ok(()) => report.installed.push(class),
                    Err(e) => report.failures.push(SignalDeliveryFailure {
                        class,
                        reason: FailureReason::Io(e),
                    }),
                }
            }
            report
                .failures
                .push(SignalDeliveryFailure::unsupported(SignalClass::Break));
            report
                .failures
                .push(SignalDeliveryFailure::unsupported(SignalClass::SessionEnd));
            report
        }
    }

    impl Drop for UnixSignals {
        fn drop(&mut self) {
            for (sig, id) in self.registered.drain(..) {
                if !signal_hook::low_level::unregister(id) {
                    tracing::debug!(signal = sig.as_str(), "signal handler already gone");
                }
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{FailureReason, InstallReport, SignalBridge, SignalDeliveryFailure};
    use crate::events::{EventFlags, SignalClass};
    use tokio::task::JoinHandle;

    /// Console control events observed through `tokio::signal::windows`.
    ///
    /// The listener tasks only store into a flag; the controller does the rest.
    #[derive(Default)]
    pub struct WindowsConsole {
        listeners: Vec<JoinHandle<()>>,
    }

    impl WindowsConsole {
        pub fn new() -> Self {
            Self::default()
        }
    }

    macro_rules! listen {
        ($self:ident, $report:ident, $flags:ident, $class:expr, $ctor:path) => {
            match $ctor() {
                Ok(mut stream) => {
                    let flags = $flags.clone();
                    $self.listeners.push(tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            flags.raise($class);
                        }
                    }));
                    if !$report.installed.contains(&$class) {
                        $report.installed.push($class);
                    }
                }
                Err(e) => $report.failures.push(SignalDeliveryFailure {
                    class: $class,
                    reason: FailureReason::Io(e),
                }),
            }
        };
    }

    impl SignalBridge for WindowsConsole {
        fn install(&mut self, flags: &EventFlags) -> InstallReport {
            let mut report = InstallReport::default();
            if tokio::runtime::Handle::try_current().is_err() {
                for class in SignalClass::ALL {
                    report.failures.push(SignalDeliveryFailure {
                        class,
                        reason: FailureReason::Io(std::io::Error::other(
                            "console listeners need a tokio runtime",
                        )),
                    });
                }
                return report;
            }
            listen!(self, report, flags, SignalClass::Interrupt, tokio::signal::windows::ctrl_c);
            listen!(self, report, flags, SignalClass::Break, tokio::signal::windows::ctrl_break);
            listen!(self, report, flags, SignalClass::Terminate, tokio::signal::windows::ctrl_close);
            listen!(self, report, flags, SignalClass::SessionEnd, tokio::signal::windows::ctrl_logoff);
            listen!(self, report, flags, SignalClass::SessionEnd, tokio::signal::windows::ctrl_shutdown);
            report
        }
    }

    impl Drop for WindowsConsole {
        fn drop(&mut self) {
            for listener in self.listeners.drain(..) {
                listener.abort();
            }
        }
    }
}
