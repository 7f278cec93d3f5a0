use std::{error::Error, path::PathBuf, sync::Arc};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apollo::{
    cli::{Cli, parse_args},
    config::load_config,
    daemon::Daemon,
    pidfile,
    scheduler::Scheduler,
};

fn main() {
    let args = parse_args();
    init_logging(&args);

    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config)?;
    info!(
        "apollo starting for service '{}' on host '{}' in '{}'",
        config.service_name, config.hostname, config.colo
    );

    // The config key wins over the flag so a fleet-wide config can relocate
    // the PID file without touching unit files.
    let pid_path = config
        .pid_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(&args.pid_file));
    let pid_guard = pidfile::acquire(&pid_path)?;

    {
        let pid_path = pid_path.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            if let Err(err) = std::fs::remove_file(&pid_path) {
                warn!("failed to remove PID file {}: {err}", pid_path.display());
            }
            std::process::exit(0);
        })?;
    }

    let daemon = Arc::new(Daemon::new(config)?);
    daemon.register_services()?;
    info!("services registered with Consul");

    let scheduler = Scheduler::new(Arc::clone(&daemon));
    let handles = scheduler.start()?;
    for handle in handles {
        let _ = handle.join();
    }

    drop(pid_guard);
    Ok(())
}

fn init_logging(args: &Cli) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
