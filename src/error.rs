//! Error handling for apollo.
use thiserror::Error;

/// Defines all possible errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum ApolloError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A mandatory configuration key is absent or empty.
    #[error("Missing mandatory config key '{key}'")]
    MissingConfigKey {
        /// The key that must be provided.
        key: &'static str,
    },

    /// Error talking to the Consul agent.
    #[error("Consul request failed: {0}")]
    ConsulTransport(#[from] reqwest::Error),

    /// The Consul agent answered with a non-success HTTP status.
    #[error("Consul returned status {status} for {url}")]
    ConsulStatus {
        /// HTTP status code of the response.
        status: u16,
        /// The request URL.
        url: String,
    },

    /// The Consul agent answered with a body the client could not decode.
    #[error("Failed to decode Consul response from {url}: {source}")]
    ConsulDecode {
        /// The request URL.
        url: String,
        /// The underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// Error spawning a check or heal script.
    #[error("Failed to run script for '{check}': {source}")]
    ScriptSpawn {
        /// The check (or heal) the script belongs to.
        check: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error wiping or recreating the track directory at startup.
    #[error("Failed to reset track directory: {source}")]
    TrackDirectory {
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error for the retry ledger.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Error for the PID file guard.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),
}

/// Error type for retry ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Error reading the ledger file from disk.
    #[error("Failed to read ledger file: {source}")]
    ReadError {
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error replacing the ledger file on disk.
    #[error("Failed to write ledger file: {source}")]
    WriteError {
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error serializing or parsing ledger entries.
    #[error("Failed to parse ledger file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing the PID file.
    #[error("Failed to access PID file: {0}")]
    Io(#[from] std::io::Error),

    /// The PID file exists but does not contain a PID.
    #[error("PID file contains invalid contents: '{0}'")]
    Malformed(String),

    /// A live process already holds the PID file.
    #[error("Another apollo instance is already running with PID {0}")]
    AlreadyRunning(i32),
}
