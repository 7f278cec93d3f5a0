//! Hysteresis and cluster-safety decisions.
//!
//! Both predicates are pure over the configuration and a fresh Consul read,
//! so the timer plumbing stays free of policy and the policies stay easy to
//! test.

use tracing::{debug, info};

use crate::config::Config;
use crate::consul::{NodeCheck, ServiceHealth};
use crate::verdict::{ConsulStatus, Verdict};

/// Outcome of [`can_change_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Push the new verdict and claim the transition.
    Allow,
    /// Push this verdict instead of the requested one.
    Suppress(Verdict),
    /// Do not author a transition this tick.
    Noop,
}

/// Decides whether the daemon may move a service to `new`.
///
/// `current` is the check as read back from Consul just before the decision;
/// `None` means the check has not reported yet, in which case the first
/// transition is always allowed.
///
/// An out-of-rotation verdict is never authored here: the caller pushes it
/// without the authorship marker. A current status authored by someone else
/// is likewise left alone; once a status change is observed on such a check
/// the daemon re-claims authorship, so an operator withdrawal recovers
/// without dwelling in the hysteresis window.
pub fn can_change_status(
    config: &Config,
    current: Option<&NodeCheck>,
    new: Verdict,
    now: f64,
) -> Transition {
    if new == Verdict::Oor {
        return Transition::Noop;
    }
    let Some(current) = current else {
        return Transition::Allow;
    };
    if !current.by_apollo {
        return Transition::Noop;
    }

    match new {
        Verdict::Bad => {
            if current.status == ConsulStatus::Critical {
                Transition::Noop
            } else {
                Transition::Allow
            }
        }
        Verdict::Warn => {
            if current.status == ConsulStatus::Warning {
                Transition::Noop
            } else {
                Transition::Allow
            }
        }
        Verdict::Ok => match current.status {
            ConsulStatus::Critical => {
                dwell(config.keep_critical_secs, current.since, now, Verdict::Bad)
            }
            ConsulStatus::Warning => {
                dwell(config.keep_warning_secs, current.since, now, Verdict::Warn)
            }
            ConsulStatus::Passing => Transition::Allow,
        },
        Verdict::Oor => Transition::Noop,
    }
}

/// Holds a degraded status until its dwell window has elapsed.
fn dwell(keep_secs: u64, since: f64, now: f64, overwrite: Verdict) -> Transition {
    if keep_secs == 0 || now - since > keep_secs as f64 {
        Transition::Allow
    } else {
        debug!(
            "recovery held back: {:.0}s in window of {keep_secs}s",
            now - since
        );
        Transition::Suppress(overwrite)
    }
}

/// Decides whether this host may take itself out of rotation without blowing
/// the failure budget.
///
/// When the budget is exhausted, only the lexicographically smallest failing
/// hostnames keep their failure. Every instance computes the same sorted
/// prefix, which stops a thundering herd of hosts flapping in and out of
/// rotation.
pub fn can_host_go_down(config: &Config, health: &ServiceHealth) -> bool {
    if health.passing == 0 && !config.allow_full_outage {
        info!(
            "no passing member left for '{}'; refusing to go down",
            config.service_name
        );
        return false;
    }
    if health.critical == 0 {
        return true;
    }
    let Some(threshold) = config.threshold_down else {
        return true;
    };

    let down_threshold = threshold.resolve(health.any);
    if health.critical < down_threshold {
        return true;
    }

    let budget = (down_threshold as usize).min(health.critical_members.len());
    let first_bad = &health.critical_members[..budget];
    let permitted = first_bad.iter().any(|member| member == &config.hostname);
    if permitted {
        debug!(
            "'{}' already holds one of {down_threshold} accepted failures",
            config.hostname
        );
    } else {
        info!(
            "failure budget exhausted for '{}' ({} critical, budget {down_threshold}); \
             staying in rotation",
            config.service_name, health.critical
        );
    }
    permitted
}
