/// Connection-pool capability whose lifecycle the service registry manages.
///
/// Hosts are logical names mapped to SQLite database files. Connections are
/// checked out with `acquire` and handed back with `release`; `teardown`
/// closes everything idle and refuses further checkouts.
use crate::config::DatabaseConfig;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// One result row, every column rendered as text.
pub type Row = Vec<String>;

pub trait ConnectionPool: Send + Sync {
    fn initialize(&self) -> Result<(), PoolError>;
    fn teardown(&self) -> Result<(), PoolError>;
    fn acquire(&self, host: &str) -> Option<PooledConnection>;
    fn release(&self, host: &str, conn: PooledConnection);
    fn query(&self, conn: &PooledConnection, sql: &str) -> Result<Vec<Row>, PoolError>;
    fn stats(&self) -> Vec<HostStats>;
}

/// A connection checked out of the pool.
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it instead closes
/// the connection and frees its seat.
#[derive(Debug)]
pub struct PooledConnection {
    /// `None` only once `release` has taken it back.
    conn: Option<Connection>,
    host: String,
    state: Weak<Mutex<PoolState>>,
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_none() {
            return;
        }
        tracing::debug!(host = %self.host, "pooled connection dropped without release");
        if let Some(state) = self.state.upgrade() {
            if let Some(slot) = lock_state(&state).slots.get_mut(&self.host) {
                slot.in_use = slot.in_use.saturating_sub(1);
            }
        }
    }
}

/// Per-host occupancy, shown by the `info;` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub host: String,
    pub idle: usize,
    pub in_use: usize,
}

/// Errors raised by the connection pool.
#[derive(Debug)]
pub enum PoolError {
    UnknownHost { host: String },
    Open {
        host: String,
        path: PathBuf,
        source: rusqlite::Error,
    },
    Query { sql: String, source: rusqlite::Error },
    Close { host: String, source: rusqlite::Error },
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::UnknownHost { host } => write!(f, "unknown database host {host}"),
            PoolError::Open { host, path, source } => {
                write!(
                    f,
                    "failed to open database for host {} at {}: {}",
                    host,
                    path.display(),
                    source
                )
            }
            PoolError::Query { sql, source } => write!(f, "query failed ({sql}): {source}"),
            PoolError::Close { host, source } => {
                write!(f, "failed to close connection for host {host}: {source}")
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::UnknownHost { .. } => None,
            PoolError::Open { source, .. } => Some(source),
            PoolError::Query { source, .. } => Some(source),
            PoolError::Close { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Default)]
struct HostSlot {
    idle: Vec<Connection>,
    in_use: usize,
}

#[derive(Debug)]
struct PoolState {
    closed: bool,
    slots: HashMap<String, HostSlot>,
}

/// `ConnectionPool` over SQLite files.
pub struct SqlitePool {
    hosts: BTreeMap<String, PathBuf>,
    max_per_host: usize,
    state: Arc<Mutex<PoolState>>,
}

fn lock_state(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    // A panic while holding the lock leaves counters usable; keep going.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SqlitePool {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            hosts: config.hosts.clone(),
            max_per_host: config.max_connections_per_host,
            state: Arc::new(Mutex::new(PoolState {
                closed: false,
                slots: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock_state(&self.state)
    }

    fn checked_out(&self, host: &str, conn: Connection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            host: host.to_string(),
            state: Arc::downgrade(&self.state),
        }
    }

    fn open(&self, host: &str) -> Result<Connection, PoolError> {
        let path = self.hosts.get(host).ok_or_else(|| PoolError::UnknownHost {
            host: host.to_string(),
        })?;
        Connection::open(path).map_err(|e| PoolError::Open {
            host: host.to_string(),
            path: path.clone(),
            source: e,
        })
    }
}

impl ConnectionPool for SqlitePool {
    /// Open one warm connection per configured host.
    fn initialize(&self) -> Result<(), PoolError> {
        for host in self.hosts.keys() {
            let conn = self.open(host)?;
            // Cheap round trip so a corrupt file fails here rather than on first use
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| PoolError::Open {
                    host: host.clone(),
                    path: self.hosts[host].clone(),
                    source: e,
                })?;
            let mut state = self.lock();
            state.closed = false;
            state.slots.entry(host.clone()).or_default().idle.push(conn);
        }
        tracing::info!(hosts = self.hosts.len(), "connection pool initialized");
        Ok(())
    }

    /// Close every idle connection. Returns the first close failure, after
    /// attempting all of them.
    fn teardown(&self) -> Result<(), PoolError> {
        let drained: Vec<(String, Vec<Connection>)> = {
            let mut state = self.lock();
            state.closed = true;
            state
                .slots
                .iter_mut()
                .map(|(host, slot)| (host.clone(), std::mem::take(&mut slot.idle)))
                .collect()
        };

        let mut first_error = None;
        for (host, conns) in drained {
            for conn in conns {
                if let Err((_conn, e)) = conn.close() {
                    tracing::warn!(host = %host, error = %e, "failed to close connection");
                    if first_error.is_none() {
                        first_error = Some(PoolError::Close {
                            host: host.clone(),
                            source: e,
                        });
                    }
                }
            }
        }
        tracing::info!("connection pool torn down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn acquire(&self, host: &str) -> Option<PooledConnection> {
        if !self.hosts.contains_key(host) {
            tracing::warn!(host, "acquire for unknown host");
            return None;
        }
        {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            let slot = state.slots.entry(host.to_string()).or_default();
            if let Some(conn) = slot.idle.pop() {
                slot.in_use += 1;
                drop(state);
                return Some(self.checked_out(host, conn));
            }
            if slot.in_use >= self.max_per_host {
                tracing::debug!(host, in_use = slot.in_use, "pool exhausted");
                return None;
            }
            // Reserve the seat before opening outside the lock
            slot.in_use += 1;
        }

        match self.open(host) {
            Ok(conn) => Some(self.checked_out(host, conn)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open pooled connection");
                let mut state = self.lock();
                if let Some(slot) = state.slots.get_mut(host) {
                    slot.in_use = slot.in_use.saturating_sub(1);
                }
                None
            }
        }
    }

    fn release(&self, host: &str, mut conn: PooledConnection) {
        if host != conn.host {
            tracing::warn!(host, owner = %conn.host, "connection released under another host");
        }
        let Some(inner) = conn.conn.take() else {
            return;
        };
        let mut state = self.lock();
        let closed = state.closed;
        let Some(slot) = state.slots.get_mut(&conn.host) else {
            tracing::warn!(host = %conn.host, "release for unknown host, dropping connection");
            return;
        };
        slot.in_use = slot.in_use.saturating_sub(1);
        if !closed {
            slot.idle.push(inner);
        }
    }

    fn query(&self, conn: &PooledConnection, sql: &str) -> Result<Vec<Row>, PoolError> {
        let wrap = |e| PoolError::Query {
            sql: sql.to_string(),
            source: e,
        };
        let Some(inner) = conn.conn.as_ref() else {
            return Err(PoolError::UnknownHost {
                host: conn.host.clone(),
            });
        };
        let mut stmt = inner.prepare(sql).map_err(wrap)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(render_value))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(wrap)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(wrap)
    }

    fn stats(&self) -> Vec<HostStats> {
        let state = self.lock();
        self.hosts
            .keys()
            .map(|host| {
                let (idle, in_use) = state
                    .slots
                    .get(host)
                    .map(|s| (s.idle.len(), s.in_use))
                    .unwrap_or((0, 0));
                HostStats {
                    host: host.clone(),
                    idle,
                    in_use,
                }
            })
            .collect()
    }
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
    }
}
