//! Heal orchestration: status gating, snapshot overlay, and marker files.

use serde_json::json;
use std::{fs, path::Path};
use tracing::{debug, info, warn};

use crate::daemon::{self, Daemon};
use crate::environment::{self, FAST_HEALING_KEY};
use crate::error::ApolloError;
use crate::runner::{self, SCRIPT_TIMEOUT};

const STATUS_STARTING: &str = "starting";
const STATUS_HEALED: &str = "healed";
const STATUS_FAILED: &str = "failed";

/// Runs one gated heal attempt.
///
/// Invoked by the heal timer and, with `fast = true`, directly from a check
/// tick. Only one attempt runs at a time; a second caller is dropped with a
/// warning.
pub fn run_heal(daemon: &Daemon, fast: bool) {
    if !daemon.try_begin_heal() {
        warn!("heal already in flight, dropping this invocation");
        return;
    }
    let result = heal_inner(daemon, fast);
    daemon.finish_heal();
    if let Err(err) = result {
        warn!("heal attempt abandoned: {err}");
    }
}

fn heal_inner(daemon: &Daemon, fast: bool) -> Result<(), ApolloError> {
    let config = daemon.config();

    if config.heal_dryrun {
        info!("heal_dryrun is set, heal skipped");
        return Ok(());
    }
    if !daemon.heal_ran_before() {
        debug!("skipping the first heal firing, checks have not reported yet");
        return Ok(());
    }

    let current = daemon
        .consul()
        .service_check(&config.hostname, &config.service_name)?;
    let Some(current) = current else {
        debug!("main service has no check yet, heal skipped");
        return Ok(());
    };
    if !current.by_apollo {
        debug!("current status was not authored here, heal skipped");
        return Ok(());
    }
    if !fast && !config.heal_on_status.permits(current.status) {
        debug!(
            "current status '{}' does not trigger healing",
            current.status.as_ref()
        );
        return Ok(());
    }

    let Some(heal_cmd) = config.heal_cmd.as_deref() else {
        debug!("no heal_cmd configured, heal skipped");
        return Ok(());
    };
    let executable = runner::split_command(heal_cmd)
        .first()
        .map(|program| runner::is_executable(program))
        .unwrap_or(false);
    if !executable {
        warn!("heal command '{heal_cmd}' is not executable, heal skipped");
        return Ok(());
    }

    let mut env = daemon.cluster_environment();
    if let Some(snapshot) = daemon.snapshot() {
        env.extend(environment::snapshot_overlay(&snapshot));
    }
    if fast {
        env.insert(FAST_HEALING_KEY.to_string(), "1".to_string());
    }

    if let Err(err) = daemon::touch(&config.healing_active_status_file) {
        warn!(
            "failed to create heal marker {}: {err}",
            config.healing_active_status_file.display()
        );
    }
    write_last_heal(
        &config.healing_last_heal_file,
        daemon::epoch_seconds(),
        fast,
        STATUS_STARTING,
    );

    info!("running heal command: {heal_cmd}");
    let outcome = runner::run_script("heal", heal_cmd, &env, SCRIPT_TIMEOUT);

    if config.healing_active_status_file.exists()
        && let Err(err) = fs::remove_file(&config.healing_active_status_file)
    {
        warn!(
            "failed to remove heal marker {}: {err}",
            config.healing_active_status_file.display()
        );
    }

    let status = match &outcome {
        Ok(result) if !result.timed_out && result.exit_code == Some(0) => STATUS_HEALED,
        _ => STATUS_FAILED,
    };
    if let Ok(result) = &outcome {
        runner::log_output("heal", &result.output);
    }
    if status == STATUS_HEALED {
        info!("heal command reported success");
    } else {
        warn!("heal command did not report success");
    }
    write_last_heal(
        &config.healing_last_heal_file,
        daemon::epoch_seconds(),
        fast,
        status,
    );
    daemon.clear_snapshot();

    outcome.map(|_| ())
}

/// Rewrites the last-heal record as `{"time":…,"fast":…,"status":…}`.
fn write_last_heal(path: &Path, time: f64, fast: bool, status: &str) {
    let payload = json!({ "time": time, "fast": fast, "status": status });
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, payload.to_string())
    };
    if let Err(err) = write() {
        warn!("failed to write last-heal record {}: {err}", path.display());
    }
}
