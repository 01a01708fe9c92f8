use std::time::Duration;

use serde::Deserialize;

/// Settings for the shared headless browser.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    /// Upper bound on any single page operation, whatever the source's own
    /// timeout says.
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
    /// Pages older than this are presumed leaked and swept.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// How long to wait for a page to close before giving up on it.
    #[serde(default = "default_close_wait_ms")]
    pub close_wait_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_headless() -> bool {
    true
}

fn default_window_width() -> u32 {
    1920
}

fn default_window_height() -> u32 {
    1080
}

fn default_hard_timeout_ms() -> u64 {
    60_000
}

fn default_stale_after_ms() -> u64 {
    120_000
}

fn default_close_wait_ms() -> u64 {
    5_000
}

fn default_idle_timeout_secs() -> u64 {
    3_600
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            window_width: default_window_width(),
            window_height: default_window_height(),
            hard_timeout_ms: default_hard_timeout_ms(),
            stale_after_ms: default_stale_after_ms(),
            close_wait_ms: default_close_wait_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl BrowserConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn close_wait(&self) -> Duration {
        Duration::from_millis(self.close_wait_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
