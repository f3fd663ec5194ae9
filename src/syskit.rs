/// System information and help behind the `info;` and `help;` commands,
/// plus the startup banner.
use crate::command::COMMANDS;
use crate::config::AppInfoConfig;
use crate::console::ConsoleDelegate;
use crate::pool::ConnectionPool;
use crate::registry::ServiceRegistry;
use crate::syslog::{Level, SysLog, SYSTEM_MAIN, USER_COMMAND};
use chrono::{DateTime, Local};
use std::sync::Arc;

pub struct SystemKit {
    app: AppInfoConfig,
    started_at: DateTime<Local>,
    registry: Arc<ServiceRegistry>,
}

impl SystemKit {
    pub fn new(app: AppInfoConfig, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            app,
            started_at: Local::now(),
            registry,
        }
    }

    pub fn info_lines(&self, now: DateTime<Local>) -> Vec<String> {
        let mut lines = vec![
            format!("{} {}", self.app.name, self.app.version),
            self.app.company.clone(),
            self.app.copyright.clone(),
            format!("pid: {}", std::process::id()),
            format!("started: {}", self.started_at.format("%Y-%m-%d %H:%M:%S")),
            format!("uptime: {}", format_uptime(now - self.started_at)),
        ];
        match self.registry.pool() {
            Some(pool) => {
                let stats = pool.stats();
                if stats.is_empty() {
                    lines.push("database: no hosts configured".to_string());
                }
                for host in stats {
                    lines.push(format!(
                        "database {}: {} idle, {} in use, {}",
                        host.host,
                        host.idle,
                        host.in_use,
                        check_host(pool.as_ref(), &host.host)
                    ));
                }
            }
            None => lines.push("database: not running".to_string()),
        }
        lines
    }
}

impl ConsoleDelegate for SystemKit {
    fn system_info(&self, out: &dyn SysLog) {
        for line in self.info_lines(Local::now()) {
            out.print_inline(Level::Info, USER_COMMAND, &format!("{line}\n"));
        }
    }

    fn system_help(&self, out: &dyn SysLog) {
        for line in help_lines() {
            out.print_inline(Level::Info, USER_COMMAND, &format!("{line}\n"));
        }
    }
}

/// Round trip `SELECT 1` on a pooled connection for `host`.
fn check_host(pool: &dyn ConnectionPool, host: &str) -> String {
    let Some(conn) = pool.acquire(host) else {
        return "no free connection".to_string();
    };
    let verdict = match pool.query(&conn, "SELECT 1") {
        Ok(rows) if rows == [vec!["1".to_string()]] => "reachable".to_string(),
        Ok(rows) => format!("unexpected reply ({} rows)", rows.len()),
        Err(e) => format!("unreachable: {e}"),
    };
    pool.release(host, conn);
    verdict
}

/// One line per command, listing both spellings.
pub fn help_lines() -> Vec<String> {
    COMMANDS
        .iter()
        .map(|spec| format!("{:<6} or {}  {}", spec.text, spec.code, spec.summary))
        .collect()
}

pub fn banner(app: &AppInfoConfig) -> Vec<String> {
    vec![
        format!("{} {}", app.name, app.version),
        app.developer.clone(),
        app.company.clone(),
        app.copyright.clone(),
        app.homepage.clone(),
    ]
}

/// Print the banner on the console and record it in the log.
pub fn announce(app: &AppInfoConfig, log: &dyn SysLog) {
    for line in banner(app) {
        log.print_inline(Level::Info, SYSTEM_MAIN, &format!("{line}\n"));
        log.write(Level::Info, SYSTEM_MAIN, &line);
    }
}

fn format_uptime(elapsed: chrono::TimeDelta) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}
