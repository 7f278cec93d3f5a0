//! Plaintext status report for human consumption.
//!
//! Written after every heal tick so login banners and config generators can
//! read the host's view of itself without talking to Consul.

use chrono::Local;
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::daemon::Daemon;
use crate::verdict::ConsulStatus;

const REPORT_HEADER: &str = "apollo check status";

/// Fetches the agent check table and atomically replaces the report file.
/// Failures are logged; the report is advisory.
pub fn write_report(daemon: &Daemon) {
    let checks = match daemon.consul().agent_checks() {
        Ok(checks) => checks,
        Err(err) => {
            warn!("skipping report, agent checks fetch failed: {err}");
            return;
        }
    };

    let generated_at = Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string();
    let body = render(&checks, &generated_at);
    let path = &daemon.config().report_file;
    match replace_file(path, &body) {
        Ok(()) => debug!("report written to {}", path.display()),
        Err(err) => warn!("failed to write report {}: {err}", path.display()),
    }
}

fn render(checks: &BTreeMap<String, ConsulStatus>, generated_at: &str) -> String {
    let mut out = format!("{REPORT_HEADER}\ngenerated at {generated_at}\n\n");
    if checks.is_empty() {
        out.push_str("no checks registered\n");
        return out;
    }
    for (name, status) in checks {
        out.push_str(&format!("{name}: {}\n", status.report_label()));
    }
    out
}

fn replace_file(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = {
        let mut os: OsString = path.to_path_buf().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    };
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)
}
