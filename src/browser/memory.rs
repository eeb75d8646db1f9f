//! In-process backend with simulated pages.
//!
//! Pages track their URL and title without any network access. Hosts under
//! the reserved `.invalid` top-level domain fail to navigate, which makes
//! restoration fallbacks observable without a real browser.
//!
//! `evaluate` understands two script shapes beyond property reads:
//! `console.<level>(<arg>)` logs a console message and `throw <arg>` raises an
//! uncaught error. Successful navigations log a `document` request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use super::{ActivityLog, BrowserBackend, NavigateOptions, PageHandle, BLANK_URL};
use crate::error::{Error, Result};

/// PNG file signature, returned as screenshot bytes.
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

/// Backend whose pages live entirely in memory.
#[derive(Default)]
pub struct MemoryBackend {
    next_handle: AtomicU64,
    opened: AtomicUsize,
    shut_down: AtomicBool,
    pages: Mutex<Vec<Arc<MemoryPage>>>,
    screenshots_fail: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// New backend; handles are named `h1`, `h2`, ...
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Whether [`BrowserBackend::shutdown`] ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn each_page<T>(&self, f: impl FnOnce(&[Arc<MemoryPage>]) -> T) -> T {
        match self.pages.lock() {
            Ok(pages) => f(&pages),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Pages opened and not yet closed, crashed ones included.
    pub fn open_pages(&self) -> usize {
        self.each_page(|pages| pages.iter().filter(|p| !p.is_closed()).count())
    }

    /// Make every page's screenshots fail from now on while the pages keep
    /// answering everything else.
    pub fn fail_screenshots(&self) {
        self.screenshots_fail.store(true, Ordering::SeqCst);
    }

    /// Make the page with `handle_id` stop answering, as a crashed tab does.
    /// It still counts as open until closed.
    pub fn crash(&self, handle_id: &str) -> bool {
        self.each_page(|pages| {
            pages
                .iter()
                .find(|p| p.handle_id == handle_id)
                .map(|p| p.update(|state| state.crashed = true))
                .is_some()
        })
    }
}

#[async_trait::async_trait]
impl BrowserBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_page(&self) -> Result<Arc<dyn PageHandle>> {
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.opened.fetch_add(1, Ordering::SeqCst);
        let page = Arc::new(MemoryPage::new(format!("h{n}"), self.screenshots_fail.clone()));
        match self.pages.lock() {
            Ok(mut pages) => pages.push(page.clone()),
            Err(poisoned) => poisoned.into_inner().push(page.clone()),
        }
        Ok(page)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct PageState {
    url: String,
    title: String,
    fields: HashMap<String, String>,
    log: Option<Arc<ActivityLog>>,
    crashed: bool,
    closed: bool,
}

/// Simulated page.
#[derive(Debug)]
struct MemoryPage {
    handle_id: String,
    screenshots_fail: Arc<AtomicBool>,
    state: Mutex<PageState>,
}

impl MemoryPage {
    fn new(handle_id: String, screenshots_fail: Arc<AtomicBool>) -> Self {
        Self {
            handle_id,
            screenshots_fail,
            state: Mutex::new(PageState {
                url: BLANK_URL.to_string(),
                title: String::new(),
                fields: HashMap::new(),
                log: None,
                crashed: false,
                closed: false,
            }),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut PageState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn is_closed(&self) -> bool {
        self.update(|state| state.closed)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut PageState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("memory page state poisoned".into()))?;
        if state.closed {
            return Err(Error::Browser(format!("page {} is closed", self.handle_id)));
        }
        if state.crashed {
            return Err(Error::Browser(format!("page {} crashed", self.handle_id)));
        }
        f(&mut state)
    }
}

/// Argument of `<prefix>(<arg>)`, unquoted.
fn call_argument<'a>(script: &'a str, prefix: &str) -> Option<&'a str> {
    let call = script.strip_prefix(prefix)?.trim_end_matches(';').trim();
    let inner = call.strip_prefix('(')?.strip_suffix(')')?;
    Some(unquote(inner))
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix(['"', '\''])
        .and_then(|r| r.strip_suffix(['"', '\'']))
        .unwrap_or(raw)
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    host.split(':').next().unwrap_or_default()
}

#[async_trait::async_trait]
impl PageHandle for MemoryPage {
    fn handle_id(&self) -> &str {
        &self.handle_id
    }

    async fn navigate(&self, url: &str, _options: NavigateOptions) -> Result<()> {
        self.with_state(|state| {
            let host = host_of(url);
            if host == "invalid" || host.ends_with(".invalid") {
                return Err(Error::Navigation {
                    url: url.to_string(),
                    message: "net::ERR_NAME_NOT_RESOLVED".into(),
                });
            }
            state.url = url.to_string();
            state.title = if url == BLANK_URL {
                String::new()
            } else {
                host.to_string()
            };
            state.fields.clear();
            if url != BLANK_URL {
                if let Some(log) = &state.log {
                    log.record_request("GET", url, "document");
                }
            }
            Ok(())
        })
    }

    async fn current_url(&self) -> Result<String> {
        self.with_state(|state| Ok(state.url.clone()))
    }

    async fn title(&self) -> Result<String> {
        self.with_state(|state| Ok(state.title.clone()))
    }

    async fn content(&self) -> Result<String> {
        self.with_state(|state| {
            let mut selectors: Vec<_> = state.fields.iter().collect();
            selectors.sort();
            let inputs: String = selectors
                .into_iter()
                .map(|(selector, value)| {
                    format!("<input data-selector=\"{selector}\" value=\"{value}\">")
                })
                .collect();
            Ok(format!(
                "<html><head><title>{}</title></head><body>{inputs}</body></html>",
                state.title
            ))
        })
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let script = script.trim();
        self.with_state(|state| {
            if let Some(message) = script.strip_prefix("throw ") {
                let message = unquote(message.trim_end_matches(';'));
                if let Some(log) = &state.log {
                    log.record_error(message, None);
                }
                return Err(Error::Browser(format!("Uncaught {message}")));
            }
            if let Some(rest) = script.strip_prefix("console.") {
                if let Some((level, _)) = rest.split_once('(') {
                    let text = call_argument(rest, level).unwrap_or_default();
                    if let Some(log) = &state.log {
                        log.record_console(level, text, None);
                    }
                    return Ok(Value::Null);
                }
            }
            Ok(match script {
                "document.title" => json!(state.title),
                "location.href" | "window.location.href" => json!(state.url),
                _ => Value::Null,
            })
        })
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>> {
        self.with_state(|_| {
            if self.screenshots_fail.load(Ordering::SeqCst) {
                return Err(Error::Browser("screenshot capture failed".into()));
            }
            Ok(PNG_SIGNATURE.to_vec())
        })
    }

    async fn click(&self, _selector: &str) -> Result<()> {
        self.with_state(|_| Ok(()))
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.with_state(|state| {
            state.fields.insert(selector.to_string(), text.to_string());
            Ok(())
        })
    }

    async fn watch(&self, log: Arc<ActivityLog>) -> Result<()> {
        self.with_state(|state| {
            state.log = Some(log);
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        self.update(|state| state.closed = true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_hosts_fail_to_navigate() {
        let backend = MemoryBackend::new();
        let page = backend.open_page().await.unwrap();
        assert_eq!(page.handle_id(), "h1");

        let err = page
            .navigate("https://bad.invalid/path", NavigateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Navigation { .. }));
        assert_eq!(page.current_url().await.unwrap(), BLANK_URL);

        page.navigate("https://example.com/a", NavigateOptions::default())
            .await
            .unwrap();
        assert_eq!(page.current_url().await.unwrap(), "https://example.com/a");
        assert_eq!(page.title().await.unwrap(), "example.com");

        page.fill("#q", "rust").await.unwrap();
        assert!(page.content().await.unwrap().contains(r##"data-selector="#q" value="rust""##));
    }

    #[tokio::test]
    async fn closed_pages_reject_calls() {
        let backend = MemoryBackend::new();
        let page = backend.open_page().await.unwrap();
        page.close().await.unwrap();
        assert!(page.current_url().await.is_err());
        // second close is harmless
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn watched_page_records_activity() {
        let backend = MemoryBackend::new();
        let page = backend.open_page().await.unwrap();
        let log = Arc::new(ActivityLog::new(10, true));

        // Nothing is recorded before watching starts.
        page.evaluate("console.log('early')").await.unwrap();
        page.watch(log.clone()).await.unwrap();

        page.evaluate("console.warn(\"careful\");").await.unwrap();
        assert!(page.evaluate("throw 'boom'").await.is_err());
        page.navigate("https://example.com", NavigateOptions::default())
            .await
            .unwrap();

        let console = log.console(&[], None);
        assert_eq!(console.len(), 1);
        assert_eq!((console[0].level.as_str(), console[0].text.as_str()), ("warn", "careful"));
        assert_eq!(log.errors(None)[0].message, "boom");
        assert_eq!(log.requests(None)[0].url, "https://example.com");
    }

    #[tokio::test]
    async fn crashed_page_stays_open_until_closed() {
        let backend = MemoryBackend::new();
        let page = backend.open_page().await.unwrap();
        assert!(backend.crash("h1"));
        assert!(!backend.crash("h9"));

        assert!(page.current_url().await.is_err());
        assert_eq!(backend.open_pages(), 1);
        page.close().await.unwrap();
        assert_eq!(backend.open_pages(), 0);
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://a.b.invalid:8080/x?y"), "a.b.invalid");
        assert_eq!(host_of("example.com/x"), "example.com");
    }
}
