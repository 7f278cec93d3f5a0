//! Bounded execution of check and heal scripts.

use std::{
    collections::BTreeMap,
    io::{BufRead, BufReader},
    process::{Command, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::error::ApolloError;

/// Hard ceiling on child-process runtime.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);

/// Polling interval while waiting for a child to finish.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Environment keys inherited from the daemon; everything else is replaced
/// by the `APOLLO_*` family.
const INHERITED_ENV: [&str; 2] = ["PATH", "HOME"];

/// Result of one script invocation.
#[derive(Debug)]
pub struct ScriptResult {
    /// Exit code; `None` when the child died on a signal or was killed after
    /// the timeout.
    pub exit_code: Option<i32>,
    /// True when the child outlived [`SCRIPT_TIMEOUT`] and was killed.
    pub timed_out: bool,
    /// Captured stdout and stderr lines, in per-stream order.
    pub output: Vec<String>,
}

/// Splits a command string on whitespace into argv tokens.
pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Whether `path` names a file with an execute bit set.
pub fn is_executable(path: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Runs `command` with a reset environment and a bounded runtime.
///
/// Both output streams are drained by reader threads so a chatty script
/// cannot fill a pipe and stall. The child is killed when it outlives
/// `timeout`.
pub fn run_script(
    label: &str,
    command: &str,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<ScriptResult, ApolloError> {
    let argv = split_command(command);
    let Some((program, args)) = argv.split_first() else {
        return Err(ApolloError::ScriptSpawn {
            check: label.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for key in INHERITED_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.envs(env);

    let mut child = cmd.spawn().map_err(|source| ApolloError::ScriptSpawn {
        check: label.to_string(),
        source,
    })?;

    let output = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Arc::clone(&output)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Arc::clone(&output)));
    }

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {}
            Err(source) => {
                return Err(ApolloError::ScriptSpawn {
                    check: label.to_string(),
                    source,
                });
            }
        }

        if Instant::now() >= deadline {
            warn!("script for '{label}' exceeded {}s; killing", timeout.as_secs());
            timed_out = true;
            if let Err(err) = child.kill() {
                warn!("failed to kill timed-out script for '{label}': {err}");
            }
            let _ = child.wait();
            break None;
        }

        thread::sleep(WAIT_POLL_INTERVAL);
    };

    for reader in readers {
        let _ = reader.join();
    }

    let output = Arc::try_unwrap(output)
        .map(|lines| lines.into_inner().unwrap_or_default())
        .unwrap_or_default();

    Ok(ScriptResult {
        exit_code,
        timed_out,
        output,
    })
}

fn spawn_reader<R>(
    stream: R,
    sink: Arc<Mutex<Vec<String>>>,
) -> thread::JoinHandle<()>
where
    R: std::io::Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if let Ok(mut lines) = sink.lock() {
                        lines.push(line);
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Logs a script's captured output one line at a time.
pub fn log_output(label: &str, lines: &[String]) {
    for line in lines {
        info!("[{label}] {line}");
    }
}
