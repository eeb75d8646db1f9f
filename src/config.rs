//! Runtime configuration for the page session layer and the browser backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the persisted page state file inside the storage directory.
pub const STATE_FILE: &str = "browser_state.json";

/// Name of the lock file guarding the state file.
pub const LOCK_FILE: &str = "browser_lock";

/// Directory name used under the home directory when none is configured.
pub const DEFAULT_STORAGE_DIR: &str = ".claude_web_interaction";

/// Browser launch settings.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Run without a visible window.
    pub headless: bool,
    /// Viewport width in CSS pixels.
    pub viewport_width: u32,
    /// Viewport height in CSS pixels.
    pub viewport_height: u32,
    /// User agent override.
    pub user_agent: Option<String>,
    /// Explicit Chrome/Chromium executable.
    pub chrome_path: Option<PathBuf>,
    /// Per-request CDP timeout.
    pub request_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1280,
            viewport_height: 800,
            user_agent: None,
            chrome_path: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings for the session manager and the data store.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root directory for all persisted state.
    pub storage_dir: PathBuf,
    /// Budget for re-navigating a restored page to its last URL.
    pub navigation_timeout: Duration,
    /// How long to wait for the state lock before taking it over.
    pub lock_timeout: Duration,
    /// Interval between lock attempts.
    pub lock_poll_interval: Duration,
    /// Record outgoing requests in each page's activity log.
    pub capture_network: bool,
    /// Console messages, errors and requests kept per page.
    pub activity_capacity: usize,
}

impl SessionConfig {
    /// Configuration rooted at `storage_dir` with default timeouts.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            navigation_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(1),
            lock_poll_interval: Duration::from_millis(100),
            capture_network: false,
            activity_capacity: crate::browser::activity::DEFAULT_CAPACITY,
        }
    }

    /// Path of the page state file.
    pub fn state_path(&self) -> PathBuf {
        self.storage_dir.join(STATE_FILE)
    }

    /// Path of the state lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.storage_dir.join(LOCK_FILE)
    }

    /// Storage root.
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(default_storage_dir())
    }
}

/// `~/.claude_web_interaction`, falling back to the working directory when no
/// home directory can be determined.
pub fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_STORAGE_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_storage_dir() {
        let config = SessionConfig::new("/tmp/pk");
        assert_eq!(config.state_path(), PathBuf::from("/tmp/pk/browser_state.json"));
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/pk/browser_lock"));
        assert_eq!(config.lock_timeout, Duration::from_secs(1));
        assert_eq!(config.navigation_timeout, Duration::from_secs(30));
    }
}
