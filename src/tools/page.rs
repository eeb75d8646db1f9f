//! Page tools.
//!
//! Each call resolves `page_id` through the session manager, performs a
//! single action on the leased page and reports the URL the page ended on so
//! the id can be restored later. Failures of the action itself come back as
//! `isError` results; the page stays registered either way.

use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{parse_args, Tool, ToolContext};
use crate::browser::{normalize_url, NavigateOptions, WaitUntil};
use crate::error::{Error, Result};
use crate::protocol::{ContentItem, ToolCallResult, ToolDefinition};
use crate::session::{PageIdInput, PageLease};

const PAGE_ID_SCHEMA: &str = "Page to act on. Numbers and numeric strings name the same page. Omit to open a new page.";

fn page_id_property() -> Value {
    json!({
        "type": ["string", "integer"],
        "description": PAGE_ID_SCHEMA
    })
}

async fn lease(context: &ToolContext, page_id: &PageIdInput) -> Result<PageLease> {
    context.sessions.get_or_create_page(page_id.resolve()).await
}

/// Record where the page ended up. Returns the URL when the page answered.
async fn report_url(context: &ToolContext, lease: &PageLease) -> Option<String> {
    match lease.page().current_url().await {
        Ok(url) => {
            context.sessions.update_metadata(lease.id(), &url).await;
            Some(url)
        }
        Err(e) => {
            warn!(page_id = %lease.id(), error = %e, "could not read page URL");
            None
        }
    }
}

fn failed(lease: &PageLease, action: &str, err: &Error) -> ToolCallResult {
    ToolCallResult::error(format!("{action} failed on page {}: {err}", lease.id()))
}

/// Navigate a page, creating it when needed.
pub struct NavigateTool;

#[derive(Debug, Deserialize)]
struct NavigateArgs {
    url: String,
    #[serde(default)]
    page_id: PageIdInput,
    #[serde(default)]
    wait_until: WaitUntil,
    timeout_ms: Option<u64>,
}

#[async_trait::async_trait]
impl Tool for NavigateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "navigate".into(),
            description: "Navigate a browser page to a URL. Returns the page_id to use in later calls; the page survives server restarts.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "URL to open. Bare hosts get https://"
                    },
                    "page_id": page_id_property(),
                    "wait_until": {
                        "type": "string",
                        "enum": ["load", "domcontentloaded", "networkidle"],
                        "default": "domcontentloaded"
                    },
                    "timeout_ms": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Navigation budget in milliseconds"
                    }
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: NavigateArgs = parse_args(arguments)?;
        let url = normalize_url(&args.url);
        let options = NavigateOptions {
            wait_until: args.wait_until,
            timeout: args
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(context.navigation_timeout),
        };

        let lease = lease(context, &args.page_id).await?;
        debug!(page_id = %lease.id(), url = %url, wait_until = %options.wait_until, "navigating");
        let outcome = lease.page().navigate(&url, options).await;
        let current = report_url(context, &lease).await;

        if let Err(e) = outcome {
            return Ok(failed(&lease, "navigation", &e));
        }
        let title = lease.page().title().await.unwrap_or_default();
        ToolCallResult::json(&json!({
            "page_id": lease.id(),
            "origin": lease.origin(),
            "url": current.unwrap_or(url),
            "title": title,
        }))
    }
}

/// Read title, text and optionally HTML.
pub struct ExtractPageContentTool;

#[derive(Debug, Deserialize)]
struct ExtractArgs {
    #[serde(default)]
    page_id: PageIdInput,
    #[serde(default)]
    include_html: bool,
}

const TEXT_SCRIPT: &str = "document.body ? document.body.innerText : ''";
const LINKS_SCRIPT: &str =
    "Array.from(document.links).map(a => ({ text: a.innerText.trim(), href: a.href }))";

#[async_trait::async_trait]
impl Tool for ExtractPageContentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "extract_page_content".into(),
            description: "Extract the title, visible text and links of a page, optionally with its HTML.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": page_id_property(),
                    "include_html": {
                        "type": "boolean",
                        "default": false
                    }
                }
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ExtractArgs = parse_args(arguments)?;
        let lease = lease(context, &args.page_id).await?;

        let extracted = extract(&lease, args.include_html).await;
        let url = report_url(context, &lease).await;
        match extracted {
            Ok(mut content) => {
                content["page_id"] = json!(lease.id());
                content["url"] = json!(url);
                ToolCallResult::json(&content)
            }
            Err(e) => Ok(failed(&lease, "extraction", &e)),
        }
    }
}

async fn extract(lease: &PageLease, include_html: bool) -> Result<Value> {
    let page = lease.page();
    let title = page.title().await?;
    let text = match page.evaluate(TEXT_SCRIPT).await? {
        Value::String(text) => text,
        _ => String::new(),
    };
    let links = match page.evaluate(LINKS_SCRIPT).await? {
        Value::Array(links) => links,
        _ => Vec::new(),
    };
    let mut content = json!({
        "title": title,
        "text": text,
        "links": links,
    });
    if include_html {
        content["html"] = json!(page.content().await?);
    }
    Ok(content)
}

/// PNG screenshot as image content.
pub struct TakeScreenshotTool;

#[derive(Debug, Deserialize)]
struct ScreenshotArgs {
    #[serde(default)]
    page_id: PageIdInput,
    #[serde(default)]
    full_page: bool,
}

#[async_trait::async_trait]
impl Tool for TakeScreenshotTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "take_screenshot".into(),
            description: "Capture a PNG screenshot of a page.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": page_id_property(),
                    "full_page": {
                        "type": "boolean",
                        "default": false,
                        "description": "Capture the whole scrollable page instead of the viewport"
                    }
                }
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ScreenshotArgs = parse_args(arguments)?;
        let lease = lease(context, &args.page_id).await?;

        let shot = lease.page().screenshot(args.full_page).await;
        let url = report_url(context, &lease).await;
        match shot {
            Ok(png) => {
                let summary = ToolCallResult::json(&json!({
                    "page_id": lease.id(),
                    "url": url,
                    "bytes": png.len(),
                }))?;
                let data = base64::engine::general_purpose::STANDARD.encode(&png);
                Ok(summary.with(ContentItem::image(data, "image/png")))
            }
            Err(e) => Ok(failed(&lease, "screenshot", &e)),
        }
    }
}

/// Click an element.
pub struct ClickElementTool;

#[derive(Debug, Deserialize)]
struct ClickArgs {
    #[serde(default)]
    page_id: PageIdInput,
    selector: String,
}

#[async_trait::async_trait]
impl Tool for ClickElementTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "click_element".into(),
            description: "Click the first element matching a CSS selector.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": page_id_property(),
                    "selector": {
                        "type": "string",
                        "description": "CSS selector"
                    }
                },
                "required": ["selector"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ClickArgs = parse_args(arguments)?;
        let lease = lease(context, &args.page_id).await?;

        let clicked = lease.page().click(&args.selector).await;
        let url = report_url(context, &lease).await;
        match clicked {
            Ok(()) => ToolCallResult::json(&json!({
                "page_id": lease.id(),
                "selector": args.selector,
                "url": url,
            })),
            Err(e) => Ok(failed(&lease, "click", &e)),
        }
    }
}

/// Type into an input.
pub struct FillInputTool;

#[derive(Debug, Deserialize)]
struct FillArgs {
    #[serde(default)]
    page_id: PageIdInput,
    selector: String,
    text: String,
}

#[async_trait::async_trait]
impl Tool for FillInputTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fill_input".into(),
            description: "Type text into the first input matching a CSS selector.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": page_id_property(),
                    "selector": {
                        "type": "string",
                        "description": "CSS selector"
                    },
                    "text": {
                        "type": "string"
                    }
                },
                "required": ["selector", "text"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: FillArgs = parse_args(arguments)?;
        let lease = lease(context, &args.page_id).await?;

        let filled = lease.page().fill(&args.selector, &args.text).await;
        let url = report_url(context, &lease).await;
        match filled {
            Ok(()) => ToolCallResult::json(&json!({
                "page_id": lease.id(),
                "selector": args.selector,
                "url": url,
            })),
            Err(e) => Ok(failed(&lease, "fill", &e)),
        }
    }
}

/// Run a script in the page.
pub struct EvaluateJavascriptTool;

#[derive(Debug, Deserialize)]
struct EvaluateArgs {
    #[serde(default)]
    page_id: PageIdInput,
    script: String,
}

#[async_trait::async_trait]
impl Tool for EvaluateJavascriptTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "evaluate_javascript".into(),
            description: "Evaluate a JavaScript expression in a page and return its JSON value.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": page_id_property(),
                    "script": {
                        "type": "string",
                        "description": "Expression or IIFE to evaluate"
                    }
                },
                "required": ["script"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: EvaluateArgs = parse_args(arguments)?;
        let lease = lease(context, &args.page_id).await?;

        let evaluated = lease.page().evaluate(&args.script).await;
        let url = report_url(context, &lease).await;
        match evaluated {
            Ok(result) => ToolCallResult::json(&json!({
                "page_id": lease.id(),
                "url": url,
                "result": result,
            })),
            Err(e) => Ok(failed(&lease, "evaluation", &e)),
        }
    }
}

/// Current URL, title and persisted metadata.
pub struct GetPageInfoTool;

#[derive(Debug, Deserialize)]
struct PageArgs {
    #[serde(default)]
    page_id: PageIdInput,
}

#[async_trait::async_trait]
impl Tool for GetPageInfoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_page_info".into(),
            description: "Report a page's current URL, title and remembered metadata, restoring the page if needed.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": page_id_property()
                }
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: PageArgs = parse_args(arguments)?;
        let lease = lease(context, &args.page_id).await?;

        let url = report_url(context, &lease).await;
        let title = lease.page().title().await.ok();
        let info = context.sessions.page_info(lease.id()).await;
        ToolCallResult::json(&json!({
            "page_id": lease.id(),
            "origin": lease.origin(),
            "url": url,
            "title": title,
            "metadata": info.map(|info| info.metadata),
        }))
    }
}

/// Every live or remembered page.
pub struct ListPagesTool;

#[async_trait::async_trait]
impl Tool for ListPagesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_pages".into(),
            description: "List every known page id with its last URL and whether it is open.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let pages = context.sessions.pages().await;
        let live = pages.iter().filter(|p| p.live).count();
        ToolCallResult::json(&json!({
            "pages": pages,
            "live": live,
            "known": pages.len(),
        }))
    }
}

/// Close one page.
pub struct ClosePageTool;

#[derive(Debug, Deserialize)]
struct CloseArgs {
    #[serde(default)]
    page_id: PageIdInput,
    #[serde(default)]
    purge: bool,
}

#[async_trait::async_trait]
impl Tool for ClosePageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "close_page".into(),
            description: "Close a page. Its id and last URL are remembered unless purge is set, so it can be reopened later.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": page_id_property(),
                    "purge": {
                        "type": "boolean",
                        "default": false,
                        "description": "Also forget the page's metadata"
                    }
                },
                "required": ["page_id"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: CloseArgs = parse_args(arguments)?;
        let id = args
            .page_id
            .resolve()
            .ok_or_else(|| Error::InvalidParams("page_id is required".into()))?;

        let known = context.sessions.close_page(&id, args.purge).await;
        if !known {
            return Ok(ToolCallResult::error(format!("no page known as {id}")));
        }
        ToolCallResult::json(&json!({
            "page_id": id,
            "closed": true,
            "purged": args.purge,
        }))
    }
}

/// Close everything.
pub struct CloseAllPagesTool;

#[async_trait::async_trait]
impl Tool for CloseAllPagesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "close_all_pages".into(),
            description: "Close every open page. Page ids stay known and reopen on next use.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let closed = context.sessions.close_all().await;
        ToolCallResult::json(&json!({ "closed": closed }))
    }
}
