//! Exit-code vocabulary for check scripts and the Consul health states they
//! map onto.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

/// How the daemon interprets a check script's exit code.
///
/// `Oor` (out of rotation) is a status authored by the script operator rather
/// than by the daemon; it is pushed as `critical` without claiming authorship
/// so that an operator-driven withdrawal survives the hysteresis rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// The service is healthy.
    Ok,
    /// The service is degraded but still serving.
    Warn,
    /// The service is broken on this host.
    Bad,
    /// The host was taken out of rotation deliberately.
    Oor,
}

impl Verdict {
    /// The Consul state this verdict is pushed as.
    pub fn consul_status(self) -> ConsulStatus {
        match self {
            Verdict::Ok => ConsulStatus::Passing,
            Verdict::Warn => ConsulStatus::Warning,
            Verdict::Bad | Verdict::Oor => ConsulStatus::Critical,
        }
    }
}

/// A raw script result: the base verdict plus the fast-heal request channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptVerdict {
    /// The base verdict after decomposing the fast-heal variants.
    pub verdict: Verdict,
    /// True when the script asked for an immediate heal run.
    pub fast_heal: bool,
}

impl ScriptVerdict {
    /// Maps a script exit code onto the verdict table.
    ///
    /// Codes 100 to 102 are the fast-heal variants of OK, WARN, and BAD.
    /// Codes outside the table collapse to WARN.
    pub fn from_exit_code(code: i32) -> Self {
        let (verdict, fast_heal) = match code {
            0 => (Verdict::Ok, false),
            1 => (Verdict::Warn, false),
            2 => (Verdict::Bad, false),
            3 => (Verdict::Oor, false),
            100 => (Verdict::Ok, true),
            101 => (Verdict::Warn, true),
            102 => (Verdict::Bad, true),
            _ => (Verdict::Warn, false),
        };
        Self { verdict, fast_heal }
    }
}

/// The three states a Consul check can be in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConsulStatus {
    /// The check is healthy.
    Passing,
    /// The check is degraded.
    Warning,
    /// The check is failing.
    Critical,
}

impl ConsulStatus {
    /// Path segment of the agent endpoint that moves a check into this state.
    pub fn endpoint(self) -> &'static str {
        match self {
            ConsulStatus::Passing => "pass",
            ConsulStatus::Warning => "warn",
            ConsulStatus::Critical => "fail",
        }
    }

    /// Label used in the plaintext status report.
    pub fn report_label(self) -> &'static str {
        match self {
            ConsulStatus::Passing => "OK",
            ConsulStatus::Warning => "WARNING",
            ConsulStatus::Critical => "BAD",
        }
    }
}
