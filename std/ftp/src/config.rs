//! Server configuration, filled from the command line.

use std::path::PathBuf;
use std::time::Duration;

/// What a tool call does when its session is already running another call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BusyPolicy {
    /// Wait for the running call to finish.
    #[default]
    Queue,
    /// Fail immediately with `SessionBusy`.
    Reject,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Local directories transfers may read from or write to.
    pub allowed_dirs: Vec<PathBuf>,
    pub connect_timeout: Duration,
    pub busy_policy: BusyPolicy,
    /// Start new sessions in passive mode.
    pub passive: bool,
    /// Upper bound for `read_file`.
    pub read_file_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_dirs: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            busy_policy: BusyPolicy::Queue,
            passive: true,
            read_file_limit: 1024 * 1024,
        }
    }
}
