//! Chromium backend over the DevTools protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::{
    EventConsoleApiCalled, EventExceptionThrown, RemoteObject, StackTrace,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig as CdpBrowserConfig, Page};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ActivityLog, BrowserBackend, NavigateOptions, PageHandle, WaitUntil};
use crate::config::BrowserConfig;
use crate::error::{Error, Result};

/// Launches Chromium lazily on the first page request and hands out tabs.
pub struct ChromiumBackend {
    config: BrowserConfig,
    browser: Mutex<Option<Browser>>,
    next_handle: AtomicU64,
}

impl ChromiumBackend {
    /// Backend that will launch Chromium with `config` when first needed.
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: Mutex::new(None),
            next_handle: AtomicU64::new(1),
        }
    }

    async fn launch(&self) -> Result<Browser> {
        let mut builder = CdpBrowserConfig::builder();
        if !self.config.headless {
            builder = builder.with_head();
        }

        builder = builder
            .viewport(Viewport {
                width: self.config.viewport_width,
                height: self.config.viewport_height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .request_timeout(self.config.request_timeout)
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run");

        if let Some(ref ua) = self.config.user_agent {
            builder = builder.arg(format!("--user-agent={ua}"));
        }
        if let Some(ref path) = self.config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        let cdp_config = builder
            .build()
            .map_err(|e| Error::BrowserLaunch(format!("invalid browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(|e| Error::BrowserLaunch(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
            debug!("browser event handler exited");
        });

        info!(
            headless = self.config.headless,
            width = self.config.viewport_width,
            height = self.config.viewport_height,
            "launched chromium"
        );
        Ok(browser)
    }

    fn wrap(&self, page: Page) -> Arc<dyn PageHandle> {
        let n = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Arc::new(ChromiumPage {
            handle_id: format!("cdp-{n}"),
            page,
            listeners: StdMutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl BrowserBackend for ChromiumBackend {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn open_page(&self) -> Result<Arc<dyn PageHandle>> {
        let mut guard = self.browser.lock().await;

        if let Some(browser) = guard.as_ref() {
            match browser.new_page(super::BLANK_URL).await {
                Ok(page) => return Ok(self.wrap(page)),
                Err(e) => {
                    // The browser process most likely went away; relaunch once.
                    warn!(error = %e, "opening page failed, relaunching browser");
                    *guard = None;
                }
            }
        }

        let browser = self.launch().await?;
        let page = browser
            .new_page(super::BLANK_URL)
            .await
            .map_err(|e| Error::BrowserLaunch(e.to_string()))?;
        *guard = Some(browser);
        Ok(self.wrap(page))
    }

    async fn shutdown(&self) -> Result<()> {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            info!("closing chromium");
            browser.close().await?;
        }
        Ok(())
    }
}

/// Poll interval while waiting on page readiness.
const READY_POLL: Duration = Duration::from_millis(50);

/// How long the resource count must stay unchanged to count as idle.
const NETWORK_QUIET: Duration = Duration::from_millis(500);

/// One Chromium tab.
struct ChromiumPage {
    handle_id: String,
    page: Page,
    listeners: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChromiumPage {
    async fn eval_string(&self, script: &str) -> std::result::Result<String, CdpError> {
        let value = self.page.evaluate(script).await?;
        Ok(value.into_value::<String>().unwrap_or_default())
    }

    async fn wait_for_load(&self) -> std::result::Result<(), CdpError> {
        while self.eval_string("document.readyState").await? != "complete" {
            tokio::time::sleep(READY_POLL).await;
        }
        Ok(())
    }

    async fn resource_count(&self) -> std::result::Result<u64, CdpError> {
        let value = self
            .page
            .evaluate("performance.getEntriesByType('resource').length")
            .await?;
        Ok(value.into_value::<u64>().unwrap_or_default())
    }

    async fn wait_for_network_idle(&self) -> std::result::Result<(), CdpError> {
        let mut last = self.resource_count().await?;
        loop {
            tokio::time::sleep(NETWORK_QUIET).await;
            let now = self.resource_count().await?;
            if now == last {
                return Ok(());
            }
            last = now;
        }
    }

    fn keep(&self, task: JoinHandle<()>) {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }
}

/// Lowercase wire name of a CDP enum.
fn cdp_name<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_ascii_lowercase))
}

fn render(object: &RemoteObject) -> String {
    match &object.value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => object
            .description
            .clone()
            .unwrap_or_else(|| cdp_name(&object.r#type).unwrap_or_default()),
    }
}

fn location(trace: Option<&StackTrace>) -> Option<String> {
    trace
        .and_then(|trace| trace.call_frames.first())
        .filter(|frame| !frame.url.is_empty())
        .map(|frame| format!("{}:{}", frame.url, frame.line_number + 1))
}

impl std::fmt::Debug for ChromiumPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumPage")
            .field("handle_id", &self.handle_id)
            .finish()
    }
}

#[async_trait::async_trait]
impl PageHandle for ChromiumPage {
    fn handle_id(&self) -> &str {
        &self.handle_id
    }

    async fn navigate(&self, url: &str, options: NavigateOptions) -> Result<()> {
        // goto returns once the frame has committed and the DOM is parsed.
        let nav = async {
            self.page.goto(url).await?;
            match options.wait_until {
                WaitUntil::DomContentLoaded => {}
                WaitUntil::Load => self.wait_for_load().await?,
                WaitUntil::NetworkIdle => {
                    if let Err(e) = self.page.wait_for_navigation().await {
                        debug!(url, error = %e, "wait for navigation failed, polling instead");
                    }
                    self.wait_for_load().await?;
                    self.wait_for_network_idle().await?;
                }
            }
            Ok::<_, CdpError>(())
        };

        match tokio::time::timeout(options.timeout, nav).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout(format!(
                "navigation to {url} exceeded {}ms",
                options.timeout.as_millis()
            ))),
        }
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await?
            .unwrap_or_else(|| super::BLANK_URL.to_string()))
    }

    async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(script).await?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self.page.find_element(selector).await?;
        element.click().await?;
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        let element = self.page.find_element(selector).await?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }

    async fn watch(&self, log: Arc<ActivityLog>) -> Result<()> {
        let mut console = self.page.event_listener::<EventConsoleApiCalled>().await?;
        let sink = log.clone();
        self.keep(tokio::spawn(async move {
            while let Some(event) = console.next().await {
                let text: Vec<String> = event.args.iter().map(render).collect();
                sink.record_console(
                    cdp_name(&event.r#type).unwrap_or_else(|| "log".into()),
                    text.join(" "),
                    location(event.stack_trace.as_ref()),
                );
            }
        }));

        let mut exceptions = self.page.event_listener::<EventExceptionThrown>().await?;
        let sink = log.clone();
        self.keep(tokio::spawn(async move {
            while let Some(event) = exceptions.next().await {
                let details = &event.exception_details;
                let message = details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| details.text.clone());
                let at = location(details.stack_trace.as_ref()).or_else(|| {
                    details
                        .url
                        .as_ref()
                        .map(|url| format!("{url}:{}", details.line_number + 1))
                });
                sink.record_error(message, at);
            }
        }));

        if log.captures_network() {
            let mut requests = self.page.event_listener::<EventRequestWillBeSent>().await?;
            self.keep(tokio::spawn(async move {
                while let Some(event) = requests.next().await {
                    let kind = event
                        .r#type
                        .as_ref()
                        .and_then(cdp_name)
                        .unwrap_or_else(|| "other".into());
                    log.record_request(event.request.method.clone(), event.request.url.clone(), kind);
                }
            }));
        }

        debug!(handle = %self.handle_id, "watching page activity");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let listeners = match self.listeners.lock() {
            Ok(mut listeners) => std::mem::take(&mut *listeners),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in listeners {
            task.abort();
        }
        self.page.clone().close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chromiumoxide::cdp::js_protocol::runtime::ConsoleApiCalledType;
    use serde_json::json;

    use super::*;

    #[test]
    fn cdp_enums_use_their_wire_names() {
        assert_eq!(cdp_name(&ConsoleApiCalledType::Warning).as_deref(), Some("warning"));
    }

    #[test]
    fn remote_objects_render_as_console_text() {
        let string: RemoteObject =
            serde_json::from_value(json!({"type": "string", "value": "ready"})).unwrap();
        let number: RemoteObject =
            serde_json::from_value(json!({"type": "number", "value": 42})).unwrap();
        let element: RemoteObject = serde_json::from_value(
            json!({"type": "object", "subtype": "node", "description": "div#app"}),
        )
        .unwrap();
        assert_eq!(render(&string), "ready");
        assert_eq!(render(&number), "42");
        assert_eq!(render(&element), "div#app");
    }

    #[test]
    fn call_site_is_one_based() {
        let trace: StackTrace = serde_json::from_value(json!({
            "callFrames": [{
                "functionName": "boot",
                "scriptId": "7",
                "url": "https://a.test/app.js",
                "lineNumber": 2,
                "columnNumber": 4
            }]
        }))
        .unwrap();
        assert_eq!(location(Some(&trace)).as_deref(), Some("https://a.test/app.js:3"));
        assert_eq!(location(None), None);
    }
}
