//! `APOLLO_*` environment encoding exported to check and heal scripts.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::consul::{NodeCheck, ServiceHealth, SINCE_UNKNOWN};
use crate::verdict::ConsulStatus;

/// Prefix shared by every exported key.
pub const ENV_PREFIX: &str = "APOLLO_";

/// Prefix used when replaying a frozen environment to the heal command.
pub const SNAPSHOT_PREFIX: &str = "APOLLO_SNAPSHOT_";

/// Set to `1` when a check requested an immediate heal.
pub const FAST_HEALING_KEY: &str = "APOLLO_FAST_HEALING";

/// Frozen copy of the cluster environment, captured when the main service
/// first left OK and held until the next heal call.
pub type Snapshot = BTreeMap<String, String>;

/// Cluster state for one registered service, as needed by the encoding.
#[derive(Debug)]
pub struct ServiceView {
    /// Service id on the wire.
    pub id: String,
    /// This node's check for the service, when registered.
    pub check: Option<NodeCheck>,
    /// Cluster-wide totals for the service.
    pub health: ServiceHealth,
}

/// Builds the full `APOLLO_*` map handed to every child process.
pub fn cluster_environment(
    config: &Config,
    services: &[ServiceView],
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        format!("{ENV_PREFIX}RECORD"),
        format!("{}.service.{}.consul", config.service_name, config.colo),
    );
    env.insert(format!("{ENV_PREFIX}DATACENTER"), config.colo.clone());
    env.insert(
        format!("{ENV_PREFIX}SERVICE_NAME"),
        config.service_name.clone(),
    );

    for view in services {
        env.insert(
            format!("{ENV_PREFIX}SERVICE_STATUS_{}", view.id.to_uppercase()),
            service_status_value(view.check.as_ref(), &view.health),
        );
    }

    env
}

/// Encodes one service's status line:
/// `status=<state>,since=<ts>,passing=<n>,passing_pct=<p>,…,any=<total>,any_pct=<p>`.
fn service_status_value(check: Option<&NodeCheck>, health: &ServiceHealth) -> String {
    let status = check.map(|c| c.status).unwrap_or(ConsulStatus::Passing);
    let since = check.map(|c| c.since).unwrap_or(SINCE_UNKNOWN);

    let mut parts = vec![
        format!("status={}", status.as_ref()),
        format!("since={since}"),
    ];
    for state in [ConsulStatus::Passing, ConsulStatus::Warning, ConsulStatus::Critical] {
        let count = health.count(state);
        parts.push(format!("{}={count}", state.as_ref()));
        parts.push(format!("{}_pct={}", state.as_ref(), pct(count, health.any)));
    }
    parts.push(format!("any={}", health.any));
    parts.push(format!("any_pct={}", if health.any > 0 { 100 } else { 0 }));
    parts.join(",")
}

fn pct(count: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        ((count * 100) as f64 / total as f64).round() as u64
    }
}

/// Re-keys a snapshot under the `APOLLO_SNAPSHOT_` prefix so a heal command
/// sees both the live state and the state at the moment of failure.
pub fn snapshot_overlay(snapshot: &Snapshot) -> BTreeMap<String, String> {
    snapshot
        .iter()
        .map(|(key, value)| {
            let renamed = match key.strip_prefix(ENV_PREFIX) {
                Some(rest) => format!("{SNAPSHOT_PREFIX}{rest}"),
                None => key.clone(),
            };
            (renamed, value.clone())
        })
        .collect()
}
