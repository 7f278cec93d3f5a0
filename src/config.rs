//! Configuration management for Apollo.
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::error::ApolloError;
use crate::verdict::ConsulStatus;

/// Default interval for the main service check, in seconds.
pub const DEFAULT_SERVICE_FREQUENCY: u64 = 60;

/// Default interval for the heal loop, in seconds.
pub const DEFAULT_HEAL_FREQUENCY: u64 = 300;

/// Default slack added to a check's frequency to form the Consul TTL.
pub const DEFAULT_PENALTY: u64 = 90;

fn default_heal_frequency() -> u64 {
    DEFAULT_HEAL_FREQUENCY
}

fn default_penalty() -> u64 {
    DEFAULT_PENALTY
}

fn default_consul_endpoint() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_track_directory() -> PathBuf {
    PathBuf::from("/var/apollo/track")
}

fn default_report_file() -> PathBuf {
    PathBuf::from("/var/apollo/run/report.txt")
}

fn default_bad_status_file() -> PathBuf {
    PathBuf::from("/var/apollo/run/bad_status")
}

fn default_healing_active_file() -> PathBuf {
    PathBuf::from("/var/apollo/run/healing_active")
}

fn default_healing_last_heal_file() -> PathBuf {
    PathBuf::from("/var/apollo/run/last_heal.json")
}

fn default_extra_frequency() -> u64 {
    DEFAULT_SERVICE_FREQUENCY
}

fn default_extra_retries() -> u32 {
    1
}

/// Represents the structure of the configuration file.
///
/// Unknown keys are rejected at load so that a typo cannot silently disable a
/// safety setting.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name of the cluster-wide service this host participates in.
    pub service_name: String,
    /// Health check command for the main service. When absent, the main
    /// service is still registered but no check is scheduled for it.
    pub service_cmd: Option<String>,
    /// Interval for the main service check, in seconds.
    pub service_frequency: Option<u64>,
    /// Additional health dimensions registered as their own Consul services.
    #[serde(default)]
    pub extra_service: BTreeMap<String, ExtraServiceConfig>,
    /// Repair command invoked when this host is unhealthy.
    pub heal_cmd: Option<String>,
    /// Interval for the heal loop, in seconds.
    #[serde(default = "default_heal_frequency")]
    pub heal_frequency: u64,
    /// When true, the heal loop only logs what it would do.
    #[serde(default)]
    pub heal_dryrun: bool,
    /// Which current status permits a heal run.
    #[serde(default)]
    pub heal_on_status: HealOnStatus,
    /// Minimum dwell time in `critical` before a recovery is accepted.
    #[serde(default)]
    pub keep_critical_secs: u64,
    /// Minimum dwell time in `warning` before a recovery is accepted.
    #[serde(default)]
    pub keep_warning_secs: u64,
    /// Failure budget: how many cluster members may be failing at once.
    pub threshold_down: Option<Threshold>,
    /// Permit going critical even when no member of the pool is passing.
    #[serde(default)]
    pub allow_full_outage: bool,
    /// Port the main service listens on, forwarded to Consul.
    pub port: Option<u16>,
    /// Name of this host as known to Consul.
    pub hostname: String,
    /// Datacenter this host lives in.
    pub colo: String,
    /// Tags attached to the main service registration.
    #[serde(default)]
    pub tags_list: Vec<String>,
    /// Base URL of the local Consul agent.
    #[serde(default = "default_consul_endpoint")]
    pub consul_endpoint: String,
    /// Seconds added to a check's frequency to form its TTL.
    #[serde(default = "default_penalty")]
    pub penalty: u64,
    /// Directory holding the per-check retry ledgers. Wiped at startup.
    #[serde(default = "default_track_directory")]
    pub track_directory: PathBuf,
    /// Where the plaintext status report is written.
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,
    /// Flag file present while the main service is BAD.
    #[serde(default = "default_bad_status_file")]
    pub bad_status_file: PathBuf,
    /// Marker file present while a heal command is running.
    #[serde(default = "default_healing_active_file")]
    pub healing_active_status_file: PathBuf,
    /// JSON record of the most recent heal invocation.
    #[serde(default = "default_healing_last_heal_file")]
    pub healing_last_heal_file: PathBuf,
    /// PID file path; overrides the command-line flag when set.
    pub pid_file: Option<PathBuf>,
}

/// Configuration for a single sub-service.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExtraServiceConfig {
    /// Health check command for this sub-service.
    pub healthcheck: String,
    /// Check interval in seconds.
    #[serde(default = "default_extra_frequency")]
    pub frequency: u64,
    /// How many consecutive BAD runs are required before failing on the wire.
    #[serde(default = "default_extra_retries")]
    pub retries: u32,
}

/// Which current Consul status permits a scheduled heal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealOnStatus {
    /// Heal whatever the current status is.
    #[default]
    Any,
    /// Heal only while passing.
    Passing,
    /// Heal only while warning.
    Warning,
    /// Heal only while critical.
    Critical,
}

impl HealOnStatus {
    /// Whether the given current status permits a heal run.
    pub fn permits(self, current: ConsulStatus) -> bool {
        match self {
            HealOnStatus::Any => true,
            HealOnStatus::Passing => current == ConsulStatus::Passing,
            HealOnStatus::Warning => current == ConsulStatus::Warning,
            HealOnStatus::Critical => current == ConsulStatus::Critical,
        }
    }
}

/// Failure budget accepted as a fixed count or a percentage of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// A fixed number of members.
    Count(u64),
    /// A percentage of the known members, floored.
    Percent(u64),
}

impl Threshold {
    /// Resolves the budget against the current pool size.
    pub fn resolve(self, any_total: u64) -> u64 {
        match self {
            Threshold::Count(n) => n,
            Threshold::Percent(p) => any_total * p / 100,
        }
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ThresholdVisitor;

        impl<'de> serde::de::Visitor<'de> for ThresholdVisitor {
            type Value = Threshold;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter
                    .write_str("a non-negative integer or a percentage (e.g. \"30%\")")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Threshold::Count(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value < 0 {
                    return Err(E::invalid_value(
                        serde::de::Unexpected::Signed(value),
                        &"non-negative integer",
                    ));
                }
                Ok(Threshold::Count(value as u64))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let trimmed = value.trim();
                let (digits, percent) = match trimmed.strip_suffix('%') {
                    Some(prefix) => (prefix.trim(), true),
                    None => (trimmed, false),
                };
                let number = digits.parse::<u64>().map_err(|_| {
                    E::invalid_value(serde::de::Unexpected::Str(value), &self)
                })?;
                if percent {
                    Ok(Threshold::Percent(number))
                } else {
                    Ok(Threshold::Count(number))
                }
            }
        }

        deserializer.deserialize_any(ThresholdVisitor)
    }
}

/// One scheduled health check, for the main service or a sub-service.
#[derive(Debug, Clone)]
pub struct CheckSpec {
    /// Human name the check is referenced by internally.
    pub name: String,
    /// Service id on the wire to Consul.
    pub consul_id: String,
    /// The command to run, split on whitespace at execution time.
    pub script: String,
    /// Interval between runs, in seconds.
    pub frequency: u64,
    /// Consecutive BAD runs required before failing on the wire.
    pub retries: u32,
    /// True for the main service check.
    pub is_main: bool,
}

impl Config {
    /// Interval for the main service check, falling back to the default.
    pub fn main_frequency(&self) -> u64 {
        self.service_frequency.unwrap_or(DEFAULT_SERVICE_FREQUENCY)
    }

    /// On-the-wire service id for a sub-service name.
    pub fn wire_id(&self, sub_name: &str) -> String {
        format!("{}-{}", sub_name, self.service_name)
    }

    /// Every service id this host registers: the main service plus each
    /// sub-service, in registration order.
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids = vec![self.service_name.clone()];
        ids.extend(self.extra_service.keys().map(|name| self.wire_id(name)));
        ids
    }

    /// The checks to schedule: all sub-services first, then the main service
    /// when it has a check command.
    pub fn check_specs(&self) -> Vec<CheckSpec> {
        let mut specs: Vec<CheckSpec> = self
            .extra_service
            .iter()
            .map(|(name, extra)| CheckSpec {
                name: name.clone(),
                consul_id: self.wire_id(name),
                script: extra.healthcheck.clone(),
                frequency: extra.frequency,
                retries: extra.retries.max(1),
                is_main: false,
            })
            .collect();

        if let Some(cmd) = &self.service_cmd {
            specs.push(CheckSpec {
                name: self.service_name.clone(),
                consul_id: self.service_name.clone(),
                script: cmd.clone(),
                frequency: self.main_frequency(),
                retries: 1,
                is_main: true,
            });
        }

        specs
    }

    /// Rejects configurations whose mandatory keys are present but empty.
    fn validate(&self) -> Result<(), ApolloError> {
        for (key, value) in [
            ("service_name", &self.service_name),
            ("hostname", &self.hostname),
            ("colo", &self.colo),
        ] {
            if value.trim().is_empty() {
                return Err(ApolloError::MissingConfigKey { key });
            }
        }
        Ok(())
    }
}

/// Loads and parses the configuration file.
pub fn load_config(config_path: &str) -> Result<Config, ApolloError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        ApolloError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, Path::new(config_path).display()),
        ))
    })?;

    let config: Config =
        serde_yaml::from_str(&content).map_err(ApolloError::ConfigParseError)?;
    config.validate()?;
    Ok(config)
}
