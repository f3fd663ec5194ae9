mod command;
mod config;
mod console;
mod controller;
mod events;
mod instance;
mod pool;
mod registry;
mod signals;
mod syskit;
mod syslog;

#[cfg(test)]
mod test_support;

use clap::Parser;
use config::AppConfig;
use console::{CommandConsole, ConsoleDelegate};
use controller::{ExitReason, LifecycleController};
use events::EventFlags;
use instance::InstanceError;
use registry::ServiceRegistry;
use signals::{PlatformSignals, SignalBridge};
use std::path::PathBuf;
use std::sync::Arc;
use syskit::SystemKit;
use syslog::{Level, SYSTEM_MAIN};
use tracing_subscriber::EnvFilter;

/// Process-control shell for a long-running server: single instance,
/// signal-driven shutdown, and a command console behind Ctrl+C.
#[derive(Parser, Debug)]
#[command(name = "clearx", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "clearx.toml")]
    config: PathBuf,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(cli: &Cli, default_level: &str) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        default_level
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn print_config(path: &std::path::Path, config: &AppConfig) {
    println!("Config: {}", path.display());
    println!("  app:       {} {}", config.app.name, config.app.version);
    println!(
        "  lock file: {}",
        instance::lock_path(&config.app.name, &config.instance.lock_dir).display()
    );
    println!(
        "  duplicate exit delay: {}ms",
        config.instance.duplicate_exit_delay_ms
    );
    println!("  poll interval: {}ms", config.control.poll_interval_ms);
    println!("  log level: {}", config.log.level);
    println!(
        "  database: {} host(s), {} connection(s) per host",
        config.database.hosts.len(),
        config.database.max_connections_per_host
    );
    for (host, path) in &config.database.hosts {
        println!("    {host} = {}", path.display());
    }
}

/// Tear everything down and leave. The stdin reader lives on a blocking
/// thread that would keep the runtime from dropping, so exit directly.
fn finish(registry: &ServiceRegistry, reason: &ExitReason) -> ! {
    registry.teardown_all();
    tracing::debug!(?reason, "process exiting");
    std::process::exit(reason.exit_code())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let loaded = AppConfig::load(&cli.config);
    let default_level = match &loaded {
        Ok(config) => config.log.level.clone(),
        Err(_) => "info".to_string(),
    };
    init_tracing(&cli, &default_level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(0);
        }
    };
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.dry_run {
        print_config(&cli.config, &config);
        return;
    }

    // Services first, so every later step can log
    let registry = Arc::new(ServiceRegistry::new());
    if let Err(e) = registry.initialize_all(&config) {
        tracing::error!(error = %e, "system initialization failed");
        finish(&registry, &ExitReason::Fatal(e.to_string()));
    }
    let Some(logger) = registry.logger() else {
        finish(
            &registry,
            &ExitReason::Fatal("logger missing after initialization".to_string()),
        );
    };

    syskit::announce(&config.app, logger.as_ref());

    let events = EventFlags::new();
    let mut bridge = PlatformSignals::new();
    let report = bridge.install(&events);
    for failure in &report.failures {
        let level = if failure.is_unsupported() {
            Level::Info
        } else {
            Level::Error
        };
        logger.write(level, SYSTEM_MAIN, &failure.to_string());
    }
    tracing::debug!(installed = ?report.installed, "signal handlers installed");

    let token = match instance::acquire(&config.app.name, &config.instance.lock_dir) {
        Ok(token) => {
            tracing::debug!(lock = %token.path().display(), "running as the single instance");
            Some(token)
        }
        Err(InstanceError::AlreadyRunning { holder_pid, .. }) => {
            let reason = controller::stand_down(
                &registry,
                logger.as_ref(),
                holder_pid,
                config.instance.duplicate_exit_delay(),
            )
            .await;
            drop(bridge);
            finish(&registry, &reason);
        }
        Err(e) => {
            // Keep serving; only duplicate detection is lost
            logger.write(
                Level::Error,
                SYSTEM_MAIN,
                &format!("single instance check failed: {e}"),
            );
            None
        }
    };

    let delegate = SystemKit::new(config.app.clone(), Arc::clone(&registry));
    let mut console = CommandConsole::stdin(
        Arc::clone(&logger),
        Arc::new(delegate) as Arc<dyn ConsoleDelegate>,
    );
    let mut controller = LifecycleController::new(
        config.control.poll_interval(),
        Arc::clone(&registry),
        Arc::clone(&logger),
        events,
    );

    let task = tokio::spawn(async move { controller.run(&mut console).await });
    let reason = match task.await {
        Ok(reason) => reason,
        Err(e) => {
            tracing::error!(panicked = e.is_panic(), "controller task died");
            controller::stop_services(&registry, logger.as_ref(), &ExitReason::Crashed);
            ExitReason::Crashed
        }
    };

    if let Some(token) = token {
        token.release();
    }
    drop(bridge);
    drop(logger);
    finish(&registry, &reason);
}
