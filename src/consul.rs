//! Narrow HTTP client for the local Consul agent.
//!
//! Apollo annotates TTL checks rather than owning service discovery, so the
//! client covers exactly five operations: registering services, moving a
//! check between pass/warn/fail, reading this node's checks back, reading the
//! cluster view of one service, and dumping the agent check table for the
//! report.

use serde::Deserialize;
use serde_json::json;
use std::{collections::BTreeMap, sync::OnceLock, thread, time::Duration};
use tracing::{debug, warn};

use crate::error::ApolloError;
use crate::verdict::ConsulStatus;

/// Timeout applied to every request against the agent.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts and pause for node health reads.
const NODE_READ_ATTEMPTS: usize = 4;
const NODE_READ_PAUSE: Duration = Duration::from_secs(1);

/// Attempts and pause for the report fetch.
const AGENT_CHECKS_ATTEMPTS: usize = 5;
const AGENT_CHECKS_PAUSE: Duration = Duration::from_secs(30);

/// Consul's internal node-liveness check id.
const SERF_HEALTH_CHECK_ID: &str = "serfHealth";

/// Marker claiming that Apollo authored the last transition.
pub const BY_APOLLO_MARKER: &str = "by:apollo";

/// Marker prefix carrying the transition timestamp.
pub const LAST_CHANGE_PREFIX: &str = "Last change was on";

/// Output written by the agent itself when a TTL lapses.
const TTL_EXPIRED_MARKER: &str = "TTL expired";

/// `since` value observed when no timestamp marker is present.
pub const SINCE_UNKNOWN: f64 = -1.0;

static LAST_CHANGE_RE: OnceLock<regex::Regex> = OnceLock::new();

fn last_change_re() -> &'static regex::Regex {
    LAST_CHANGE_RE.get_or_init(|| {
        regex::Regex::new(r"Last change was on (-?\d+(?:\.\d+)?)")
            .expect("timestamp marker pattern is valid")
    })
}

/// A check attached to this node, as Apollo reads it back from the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCheck {
    /// Check id, e.g. `service:www`.
    pub check_id: String,
    /// Service id the check belongs to.
    pub service_id: String,
    /// Current state of the check.
    pub status: ConsulStatus,
    /// Whether the last transition carries the Apollo authorship marker.
    pub by_apollo: bool,
    /// Epoch seconds of the last transition; [`SINCE_UNKNOWN`] when the TTL
    /// lapsed or no marker was found.
    pub since: f64,
}

/// Aggregated cluster view of one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceHealth {
    /// Members whose check is passing.
    pub passing: u64,
    /// Members whose check is warning.
    pub warning: u64,
    /// Members whose check (or node) is critical.
    pub critical: u64,
    /// Total members known for the service.
    pub any: u64,
    /// Hostnames of critical members, sorted ascending. Only populated when
    /// the caller asked for members.
    pub critical_members: Vec<String>,
}

impl ServiceHealth {
    /// Member count for one status.
    pub fn count(&self, status: ConsulStatus) -> u64 {
        match status {
            ConsulStatus::Passing => self.passing,
            ConsulStatus::Warning => self.warning,
            ConsulStatus::Critical => self.critical,
        }
    }
}

/// Builds the note pushed alongside every check update.
pub fn format_note(by_apollo: bool, since: f64) -> String {
    if by_apollo {
        format!("{BY_APOLLO_MARKER} {LAST_CHANGE_PREFIX} {since}")
    } else {
        format!("{LAST_CHANGE_PREFIX} {since}")
    }
}

/// Extracts `(by_apollo, since)` from a check's free-form output note.
pub fn parse_output_markers(output: &str) -> (bool, f64) {
    let by_apollo = output.contains(BY_APOLLO_MARKER);
    if output.contains(TTL_EXPIRED_MARKER) {
        return (by_apollo, SINCE_UNKNOWN);
    }
    let since = last_change_re()
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(SINCE_UNKNOWN);
    (by_apollo, since)
}

// Wire shapes, reduced to the fields the daemon consumes.

#[derive(Debug, Deserialize)]
struct RawCheck {
    #[serde(rename = "CheckID", default)]
    check_id: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "Output", default)]
    output: String,
}

impl RawCheck {
    fn parsed_status(&self) -> ConsulStatus {
        self.status
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(ConsulStatus::Passing)
    }
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(rename = "Node", default)]
    node: String,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    #[serde(rename = "Node")]
    node: RawNode,
    #[serde(rename = "Checks", default)]
    checks: Vec<RawCheck>,
}

fn parse_node_check(raw: RawCheck) -> NodeCheck {
    let status = raw.parsed_status();
    let (by_apollo, since) = parse_output_markers(&raw.output);
    NodeCheck {
        check_id: raw.check_id,
        service_id: raw.service_id,
        status,
        by_apollo,
        since,
    }
}

/// Folds the raw member list into per-status totals.
///
/// A member is critical when its service check or its `serfHealth` check is
/// critical; a member without a status counts as passing.
fn aggregate_members(members: Vec<RawMember>, with_members: bool) -> ServiceHealth {
    let mut health = ServiceHealth::default();

    for member in members {
        health.any += 1;

        let serf_critical = member.checks.iter().any(|check| {
            check.check_id == SERF_HEALTH_CHECK_ID
                && check.parsed_status() == ConsulStatus::Critical
        });
        let service_status = member
            .checks
            .iter()
            .find(|check| !check.service_id.is_empty())
            .map(|check| check.parsed_status())
            .unwrap_or(ConsulStatus::Passing);
        let status = if serf_critical {
            ConsulStatus::Critical
        } else {
            service_status
        };

        match status {
            ConsulStatus::Passing => health.passing += 1,
            ConsulStatus::Warning => health.warning += 1,
            ConsulStatus::Critical => {
                health.critical += 1;
                if with_members {
                    health.critical_members.push(member.node.node);
                }
            }
        }
    }

    health.critical_members.sort();
    health
}

/// Blocking client bound to one agent endpoint.
pub struct ConsulClient {
    http: reqwest::blocking::Client,
    endpoint: String,
}

impl ConsulClient {
    /// Builds a client for the given agent base URL.
    pub fn new(endpoint: &str) -> Result<Self, ApolloError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Registers a service with a TTL check of `frequency + penalty` seconds.
    pub fn register_service(
        &self,
        id: &str,
        port: Option<u16>,
        tags: &[String],
        script: Option<&str>,
        frequency: u64,
        penalty: u64,
    ) -> Result<(), ApolloError> {
        let ttl = frequency + penalty;
        let mut check = json!({
            "id": id,
            "real_ttl": frequency,
            "ttl": format!("{ttl}s"),
        });
        if let Some(script) = script {
            check["script"] = json!(script);
        }
        let mut service = json!({ "name": id, "check": check });
        if let Some(port) = port {
            service["port"] = json!(port);
        }
        if !tags.is_empty() {
            service["tags"] = json!(tags);
        }

        let url = format!("{}/v1/agent/service/register", self.endpoint);
        let response = self
            .http
            .put(&url)
            .json(&json!({ "service": service }))
            .send()?;
        Self::ensure_success(response, &url)?;
        debug!("registered service '{id}' with ttl {ttl}s");
        Ok(())
    }

    /// Moves `service:<id>` into the given state, attaching `note`.
    pub fn update_check(
        &self,
        id: &str,
        status: ConsulStatus,
        note: &str,
    ) -> Result<(), ApolloError> {
        let url = format!(
            "{}/v1/agent/check/{}/service:{}",
            self.endpoint,
            status.endpoint(),
            id
        );
        let response = self.http.put(&url).query(&[("note", note)]).send()?;
        Self::ensure_success(response, &url)?;
        Ok(())
    }

    /// Reads every check attached to this node. Transient failures are
    /// retried a few times with a short pause.
    pub fn node_checks(&self, hostname: &str) -> Result<Vec<NodeCheck>, ApolloError> {
        let url = format!("{}/v1/health/node/{}", self.endpoint, hostname);
        let raw: Vec<RawCheck> =
            self.get_with_retries(&url, NODE_READ_ATTEMPTS, NODE_READ_PAUSE)?;
        Ok(raw.into_iter().map(parse_node_check).collect())
    }

    /// Finds the check for one service id on this node, if registered.
    pub fn service_check(
        &self,
        hostname: &str,
        service_id: &str,
    ) -> Result<Option<NodeCheck>, ApolloError> {
        let checks = self.node_checks(hostname)?;
        Ok(checks.into_iter().find(|check| check.service_id == service_id))
    }

    /// Reads the cluster view of one service. Never retried: each safety
    /// decision wants a fresh read, and a failure is treated as a denial by
    /// the caller.
    pub fn service_health(
        &self,
        service: &str,
        with_members: bool,
    ) -> Result<ServiceHealth, ApolloError> {
        let url = format!("{}/v1/health/service/{}", self.endpoint, service);
        let response = self.http.get(&url).send()?;
        let response = Self::ensure_success(response, &url)?;
        let members: Vec<RawMember> = response
            .json()
            .map_err(|source| ApolloError::ConsulDecode { url, source })?;
        Ok(aggregate_members(members, with_members))
    }

    /// Full agent check table for the report, keyed by check id. Retried
    /// patiently; the report is not on any decision path.
    pub fn agent_checks(&self) -> Result<BTreeMap<String, ConsulStatus>, ApolloError> {
        let url = format!("{}/v1/agent/checks", self.endpoint);
        let raw: BTreeMap<String, RawCheck> =
            self.get_with_retries(&url, AGENT_CHECKS_ATTEMPTS, AGENT_CHECKS_PAUSE)?;
        Ok(raw
            .into_iter()
            .map(|(id, check)| (id, check.parsed_status()))
            .collect())
    }

    fn get_with_retries<T>(
        &self,
        url: &str,
        attempts: usize,
        pause: Duration,
    ) -> Result<T, ApolloError>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_get(url) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    warn!("GET {url} failed (attempt {attempt}/{attempts}): {err}");
                    thread::sleep(pause);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_get<T>(&self, url: &str) -> Result<T, ApolloError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.http.get(url).send()?;
        let response = Self::ensure_success(response, url)?;
        response.json().map_err(|source| ApolloError::ConsulDecode {
            url: url.to_string(),
            source,
        })
    }

    fn ensure_success(
        response: reqwest::blocking::Response,
        url: &str,
    ) -> Result<reqwest::blocking::Response, ApolloError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ApolloError::ConsulStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            })
        }
    }
}
