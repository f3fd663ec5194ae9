/// Owner of the process-wide singleton services.
///
/// Bring-up order is logger, then connection pool, so every later failure
/// can be logged. Teardown runs in reverse, exactly once, no matter how many
/// paths ask for it, and never lets a failing step stop the remaining ones.
use crate::config::AppConfig;
use crate::pool::{ConnectionPool, PoolError, SqlitePool};
use crate::syslog::{Level, SysLog, TracingLog, SYSTEM_INIT, SYSTEM_MAIN};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Holds at most one live instance of a service.
pub struct ServiceHandle<T: ?Sized> {
    name: &'static str,
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> ServiceHandle<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the service with `make` unless it is already live, in which case
    /// the existing handle is returned and `make` is not called.
    pub fn initialize<E>(&self, make: impl FnOnce() -> Result<Arc<T>, E>) -> Result<Arc<T>, E> {
        let mut slot = self.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let service = make()?;
        *slot = Some(Arc::clone(&service));
        Ok(service)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        self.lock().is_some()
    }

    /// Take the live instance out and run `stop` on it.
    ///
    /// Returns `false` without calling `stop` when nothing is live. A panic
    /// inside `stop` is contained; the handle is empty afterwards either way.
    pub fn teardown(&self, stop: impl FnOnce(&T)) -> bool {
        let Some(service) = self.lock().take() else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(|| stop(&service))).is_err() {
            tracing::error!(service = self.name, "service panicked during teardown");
        }
        true
    }
}

/// Errors raised while bringing services up.
#[derive(Debug)]
pub enum InitError {
    Logger { reason: String },
    Pool { source: PoolError },
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitError::Logger { reason } => write!(f, "logger failed to start: {reason}"),
            InitError::Pool { source } => write!(f, "connection pool failed to start: {source}"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::Logger { .. } => None,
            InitError::Pool { source } => Some(source),
        }
    }
}

pub struct ServiceRegistry {
    logger: ServiceHandle<dyn SysLog>,
    pool: ServiceHandle<dyn ConnectionPool>,
    torn_down: AtomicBool,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            logger: ServiceHandle::new("logger"),
            pool: ServiceHandle::new("connection-pool"),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Start the production services described by `config`.
    ///
    /// `TracingLog` forwards to the global subscriber, so one must already be
    /// installed; otherwise every line would vanish silently.
    pub fn initialize_all(&self, config: &AppConfig) -> Result<(), InitError> {
        let app = config.app.name.clone();
        let database = config.database.clone();
        self.initialize_with(
            move || {
                let unset = tracing::dispatcher::get_default(|dispatch| {
                    dispatch.is::<tracing::subscriber::NoSubscriber>()
                });
                if unset {
                    return Err(InitError::Logger {
                        reason: "no tracing subscriber installed".to_string(),
                    });
                }
                Ok(Arc::new(TracingLog::new(app)) as Arc<dyn SysLog>)
            },
            move || Ok(Arc::new(SqlitePool::new(&database)) as Arc<dyn ConnectionPool>),
        )
    }

    /// Start the logger built by `make_logger`, then the pool built by
    /// `make_pool`. A pool failure is logged through the live logger; whatever
    /// did start stays registered so `teardown_all` can stop it.
    pub fn initialize_with(
        &self,
        make_logger: impl FnOnce() -> Result<Arc<dyn SysLog>, InitError>,
        make_pool: impl FnOnce() -> Result<Arc<dyn ConnectionPool>, InitError>,
    ) -> Result<(), InitError> {
        let logger = self.logger.initialize(make_logger)?;
        logger.write(Level::Info, SYSTEM_INIT, "system initialization started");

        let started = self.pool.initialize(|| {
            let pool = make_pool()?;
            pool.initialize()
                .map_err(|source| InitError::Pool { source })?;
            Ok(pool)
        });
        if let Err(e) = started {
            logger.write(
                Level::Fatal,
                SYSTEM_INIT,
                &format!("system initialization failed: {e}"),
            );
            return Err(e);
        }

        logger.write(Level::Info, SYSTEM_INIT, "system initialization complete");
        Ok(())
    }

    pub fn logger(&self) -> Option<Arc<dyn SysLog>> {
        self.logger.get()
    }

    pub fn pool(&self) -> Option<Arc<dyn ConnectionPool>> {
        self.pool.get()
    }

    #[cfg(test)]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Stop the pool, then the logger. Only the first call does anything;
    /// it returns `true`, every later or concurrent call returns `false`.
    pub fn teardown_all(&self) -> bool {
        if self
            .torn_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let logger = self.logger.get();
        let stopped = self.pool.teardown(|pool| {
            if let Err(e) = pool.teardown() {
                if let Some(logger) = &logger {
                    logger.write(
                        Level::Error,
                        SYSTEM_MAIN,
                        &format!("connection pool teardown failed: {e}"),
                    );
                }
            }
        });
        if !stopped {
            tracing::debug!(service = self.pool.name(), "not running, nothing to stop");
        }
        drop(logger);

        let stopped = self.logger.teardown(|logger| {
            if let Err(e) = logger.close() {
                tracing::debug!(error = %e, "logger close failed");
            }
        });
        if !stopped {
            tracing::debug!(service = self.logger.name(), "not running, nothing to stop");
        }
        true
    }
}
