//! Command-line interface for Apollo.
use clap::Parser;

/// Command-line interface for the apollo daemon.
#[derive(Parser)]
#[command(name = "apollo", version, author)]
#[command(about = "A per-host self-healing daemon for Consul service pools", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, value_name = "PATH", default_value = "/etc/apollo/config.yaml")]
    pub config: String,

    /// Path to the PID file guarding against a second live instance.
    #[arg(long = "pid-file", value_name = "PATH", default_value = "/var/apollo/run/apollo.pid")]
    pub pid_file: String,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
