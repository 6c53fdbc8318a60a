//! Command-line configuration for the sidecar.

use clap::Parser;
use std::path::PathBuf;

/// feedbackd - institute feedback sidecar
///
/// Reads one JSON request per line on stdin and writes one JSON response per
/// line on stdout. Logs go to stderr.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Workspace directory to open at startup
    ///
    /// Can also be chosen later with the `workspace.select` method.
    #[arg(short, long, value_name = "DIR", env = "FEEDBACKD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Log filter (e.g. `info`, `debug`, `feedbackd=trace`)
    ///
    /// RUST_LOG takes precedence when set.
    #[arg(long, default_value = "info", env = "FEEDBACKD_LOG")]
    pub log_level: String,
}
