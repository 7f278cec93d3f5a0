//! # Self-Healing Daemon Core
//!
//! This module owns the per-tick control flow for one check: run the script,
//! apply the cluster-safety gate, decide the transition, record the retry
//! ledger, and push the result to Consul. It also holds the mutable runtime
//! state shared between the check timers and the heal loop.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

use crate::config::{CheckSpec, Config};
use crate::consul::{self, ConsulClient, NodeCheck, ServiceHealth};
use crate::decision::{Transition, can_change_status, can_host_go_down};
use crate::environment::{self, ServiceView, Snapshot};
use crate::error::ApolloError;
use crate::heal;
use crate::ledger::{LedgerEntry, RetryLedger};
use crate::runner::{self, SCRIPT_TIMEOUT};
use crate::verdict::{ConsulStatus, ScriptVerdict, Verdict};

/// Current time as epoch seconds.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Creates `path` (empty) together with its parent directory.
pub(crate) fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"")
}

/// What one tick actually puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PushPlan {
    status: ConsulStatus,
    by_apollo: bool,
    since: f64,
}

/// Derives the pushed status, authorship marker, and timestamp for one tick.
///
/// The transition timestamp moves only when the pushed status differs from
/// the current one; authorship follows the transition except for OOR, which
/// is always pushed unclaimed.
fn push_plan(
    verdict: Verdict,
    transition: Transition,
    wire_verdict: Verdict,
    current: Option<&NodeCheck>,
    now: f64,
) -> PushPlan {
    let status = match transition {
        Transition::Suppress(overwrite) => overwrite.consul_status(),
        _ => wire_verdict.consul_status(),
    };
    let changed = current.map(|check| check.status) != Some(status);
    let since = if changed {
        now
    } else {
        current.map(|check| check.since).unwrap_or(now)
    };
    let by_apollo = if verdict == Verdict::Oor {
        false
    } else if changed {
        true
    } else {
        current.map(|check| check.by_apollo).unwrap_or(true)
    };

    PushPlan {
        status,
        by_apollo,
        since,
    }
}

/// Shared state for one apollo instance.
pub struct Daemon {
    config: Config,
    consul: ConsulClient,
    snapshot: Mutex<Option<Snapshot>>,
    heal_ran_once: AtomicBool,
    heal_in_flight: AtomicBool,
}

impl Daemon {
    /// Builds the daemon and its Consul client from a loaded configuration.
    pub fn new(config: Config) -> Result<Self, ApolloError> {
        let consul = ConsulClient::new(&config.consul_endpoint)?;
        Ok(Self {
            config,
            consul,
            snapshot: Mutex::new(None),
            heal_ran_once: AtomicBool::new(false),
            heal_in_flight: AtomicBool::new(false),
        })
    }

    /// The immutable configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The Consul client.
    pub fn consul(&self) -> &ConsulClient {
        &self.consul
    }

    /// Registers the main service and every sub-service with TTL checks.
    pub fn register_services(&self) -> Result<(), ApolloError> {
        self.consul.register_service(
            &self.config.service_name,
            self.config.port,
            &self.config.tags_list,
            self.config.service_cmd.as_deref(),
            self.config.main_frequency(),
            self.config.penalty,
        )?;
        for (name, extra) in &self.config.extra_service {
            self.consul.register_service(
                &self.config.wire_id(name),
                None,
                &[],
                Some(&extra.healthcheck),
                extra.frequency,
                self.config.penalty,
            )?;
        }
        Ok(())
    }

    /// One scheduled tick for `spec`. Failures are logged and never escalate
    /// past the tick.
    pub fn run_check_tick(&self, spec: &CheckSpec) {
        if let Err(err) = self.check_tick_inner(spec) {
            warn!("check '{}': tick abandoned: {err}", spec.name);
        }
    }

    fn check_tick_inner(&self, spec: &CheckSpec) -> Result<(), ApolloError> {
        let raw = self.execute_check(spec)?;
        let mut verdict = raw.verdict;

        // A main-service degradation must clear the failure budget first.
        if spec.is_main && !matches!(verdict, Verdict::Ok | Verdict::Oor) {
            let permitted = match self
                .consul
                .service_health(&self.config.service_name, true)
            {
                Ok(health) => can_host_go_down(&self.config, &health),
                Err(err) => {
                    warn!("members read failed, refusing to go down: {err}");
                    false
                }
            };
            if !permitted {
                info!(
                    "check '{}': verdict {:?} suppressed for this tick",
                    spec.name, verdict
                );
                verdict = Verdict::Ok;
            }
        }

        let current = self
            .consul
            .service_check(&self.config.hostname, &spec.consul_id)?;
        let now = epoch_seconds();
        let transition = can_change_status(&self.config, current.as_ref(), verdict, now);

        if spec.is_main
            && !matches!(verdict, Verdict::Ok | Verdict::Oor)
            && transition == Transition::Allow
        {
            self.capture_snapshot();
        }

        // Ledger first, then the push.
        let mut wire_verdict = verdict;
        if verdict != Verdict::Oor {
            let mut ledger =
                RetryLedger::load(&self.config.track_directory, &spec.consul_id);
            ledger.record(LedgerEntry {
                timestamp: now,
                verdict,
            })?;
            if verdict == Verdict::Bad && !ledger.is_hard_failing(spec.retries) {
                debug!(
                    "check '{}': below the retry budget of {}, warning on the wire",
                    spec.name, spec.retries
                );
                wire_verdict = Verdict::Warn;
            }
        }

        if spec.is_main {
            self.update_bad_flag(verdict == Verdict::Bad);
        }

        let plan = push_plan(verdict, transition, wire_verdict, current.as_ref(), now);
        self.consul.update_check(
            &spec.consul_id,
            plan.status,
            &consul::format_note(plan.by_apollo, plan.since),
        )?;
        debug!(
            "check '{}': pushed {} (since {})",
            spec.name,
            plan.status.as_ref(),
            plan.since
        );

        if raw.fast_heal {
            info!("check '{}' requested an immediate heal", spec.name);
            heal::run_heal(self, true);
        }

        Ok(())
    }

    /// Runs the check script and interprets its exit code.
    fn execute_check(&self, spec: &CheckSpec) -> Result<ScriptVerdict, ApolloError> {
        let argv = runner::split_command(&spec.script);
        let executable = argv
            .first()
            .map(|program| runner::is_executable(program))
            .unwrap_or(false);
        if !executable {
            warn!(
                "check '{}': '{}' is not executable, reporting warning",
                spec.name, spec.script
            );
            return Ok(ScriptVerdict {
                verdict: Verdict::Warn,
                fast_heal: false,
            });
        }

        let mut env = self.cluster_environment();
        if let Some(snapshot) = self.snapshot() {
            env.extend(environment::snapshot_overlay(&snapshot));
        }
        let result = runner::run_script(&spec.name, &spec.script, &env, SCRIPT_TIMEOUT)?;
        runner::log_output(&spec.name, &result.output);

        if result.timed_out {
            warn!("check '{}' timed out, treating the run as OK", spec.name);
            return Ok(ScriptVerdict {
                verdict: Verdict::Ok,
                fast_heal: false,
            });
        }

        Ok(ScriptVerdict::from_exit_code(result.exit_code.unwrap_or(1)))
    }

    /// Builds the `APOLLO_*` map from a fresh read of every registered
    /// service. Read failures degrade to empty sections rather than blocking
    /// the child from running.
    pub fn cluster_environment(&self) -> BTreeMap<String, String> {
        let node_checks = self
            .consul
            .node_checks(&self.config.hostname)
            .unwrap_or_else(|err| {
                warn!("node read failed while building environment: {err}");
                Vec::new()
            });

        let mut views = Vec::new();
        for id in self.config.service_ids() {
            let check = node_checks
                .iter()
                .find(|check| check.service_id == id)
                .cloned();
            let health = self.consul.service_health(&id, false).unwrap_or_else(|err| {
                warn!("members read failed for '{id}' while building environment: {err}");
                ServiceHealth::default()
            });
            views.push(ServiceView { id, check, health });
        }

        environment::cluster_environment(&self.config, &views)
    }

    /// Freezes the current cluster environment for the next heal run. Only
    /// the first degradation captures; later ticks keep the original.
    fn capture_snapshot(&self) {
        let already_held = self
            .snapshot
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true);
        if already_held {
            return;
        }

        info!("capturing cluster snapshot for the next heal run");
        let snapshot = self.cluster_environment();
        if let Ok(mut guard) = self.snapshot.lock() {
            guard.get_or_insert(snapshot);
        }
    }

    /// The frozen environment held for the next heal run, if any.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.lock().map(|guard| guard.clone()).unwrap_or(None)
    }

    /// Drops the frozen environment after a heal run consumed it.
    pub fn clear_snapshot(&self) {
        if let Ok(mut guard) = self.snapshot.lock() {
            *guard = None;
        }
    }

    /// Marks the heal loop as having fired. The first call reports false so
    /// the initial firing can be skipped.
    pub fn heal_ran_before(&self) -> bool {
        self.heal_ran_once.swap(true, Ordering::SeqCst)
    }

    /// Claims the global heal slot. Returns false when a heal is in flight.
    pub fn try_begin_heal(&self) -> bool {
        self.heal_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Releases the global heal slot.
    pub fn finish_heal(&self) {
        self.heal_in_flight.store(false, Ordering::SeqCst);
    }

    /// Keeps the bad-flag file in step with the main-service verdict.
    fn update_bad_flag(&self, bad: bool) {
        let path = &self.config.bad_status_file;
        if bad {
            if !path.exists()
                && let Err(err) = touch(path)
            {
                warn!("failed to create bad flag {}: {err}", path.display());
            }
        } else if path.exists()
            && let Err(err) = fs::remove_file(path)
        {
            warn!("failed to remove bad flag {}: {err}", path.display());
        }
    }
}
