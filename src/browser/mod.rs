//! Browser automation capability consumed by the session layer and the tools.
//!
//! The session manager only needs to open, navigate, query and close pages.
//! Tools additionally read content, evaluate scripts and interact with
//! elements. Both go through the [`BrowserBackend`] and [`PageHandle`] traits
//! so the manager can run against a real Chromium instance or the in-process
//! [`MemoryBackend`].

pub mod activity;
mod chromium;
mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

pub use activity::{ActivityLog, ConsoleMessage, NetworkRequest, PageError};
pub use chromium::ChromiumBackend;
pub use memory::MemoryBackend;

/// URL every fresh or unrestorable page sits on.
pub const BLANK_URL: &str = "about:blank";

/// Navigation completion condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// `document.readyState` reached `complete`.
    Load,
    /// The navigation committed and the DOM was parsed.
    #[default]
    DomContentLoaded,
    /// As `Load`, then no new resource loads for half a second.
    NetworkIdle,
}

impl fmt::Display for WaitUntil {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WaitUntil::Load => "load",
            WaitUntil::DomContentLoaded => "domcontentloaded",
            WaitUntil::NetworkIdle => "networkidle",
        };
        f.write_str(name)
    }
}

/// Options for [`PageHandle::navigate`].
#[derive(Debug, Clone, Copy)]
pub struct NavigateOptions {
    /// When to consider the navigation finished.
    pub wait_until: WaitUntil,
    /// Upper bound on the whole navigation.
    pub timeout: Duration,
}

impl NavigateOptions {
    /// Options with the given timeout and the default wait condition.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            wait_until: WaitUntil::default(),
            timeout,
        }
    }
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }
}

/// A live, operable browser page.
#[async_trait::async_trait]
pub trait PageHandle: Send + Sync + fmt::Debug {
    /// Process-unique identity of this handle. Two handles for the same page
    /// id opened at different times never share it.
    fn handle_id(&self) -> &str;

    /// Navigate to `url`.
    async fn navigate(&self, url: &str, options: NavigateOptions) -> Result<()>;

    /// URL the page currently shows.
    async fn current_url(&self) -> Result<String>;

    /// Document title.
    async fn title(&self) -> Result<String>;

    /// Serialized HTML of the document.
    async fn content(&self) -> Result<String>;

    /// Evaluate a script and return its JSON value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// PNG screenshot bytes.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>>;

    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<()>;

    /// Type `text` into the first element matching `selector`.
    async fn fill(&self, selector: &str, text: &str) -> Result<()>;

    /// Feed console messages, uncaught errors and requests into `log` for
    /// as long as the page lives.
    async fn watch(&self, log: Arc<ActivityLog>) -> Result<()>;

    /// Close the page.
    async fn close(&self) -> Result<()>;
}

/// Source of new pages.
#[async_trait::async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Open a blank page. Failing here means the automation context itself is
    /// unavailable.
    async fn open_page(&self) -> Result<Arc<dyn PageHandle>>;

    /// Release the automation context.
    async fn shutdown(&self) -> Result<()>;
}

/// Prefix bare hosts with `https://`.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("about:")
        || url.starts_with("file://")
        || url.starts_with("data:")
    {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hosts_get_https() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url(" http://a.test "), "http://a.test");
        assert_eq!(normalize_url("about:blank"), "about:blank");
    }

    #[test]
    fn wait_until_parses_lowercase_names() {
        let w: WaitUntil = serde_json::from_str("\"networkidle\"").unwrap();
        assert_eq!(w, WaitUntil::NetworkIdle);
        let w: WaitUntil = serde_json::from_str("\"domcontentloaded\"").unwrap();
        assert_eq!(w, WaitUntil::DomContentLoaded);
        assert_eq!(WaitUntil::Load.to_string(), "load");
    }
}
