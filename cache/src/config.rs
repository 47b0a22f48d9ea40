use std::time::Duration;

/// Configuration for a [Cache](super::Cache).
#[derive(Clone, Debug)]
pub struct Config {
    /// Time between periodic refreshes.
    pub refresh_interval: Duration,

    /// Maximum number of pending on-demand refresh requests.
    ///
    /// When the mailbox is full, callers of [Cache::fetch](super::Cache::fetch) wait until
    /// the coordination loop catches up.
    pub mailbox_size: usize,
}

impl Config {
    /// Generates a configuration with reasonable defaults for usage in production.
    pub fn recommended() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            mailbox_size: 64,
        }
    }
}
