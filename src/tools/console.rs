//! Console, error and network activity tools.
//!
//! Activity is captured per page id from the moment a page is opened under
//! it, across recreations, until the id is purged.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{parse_args, Tool, ToolContext};
use crate::browser::ActivityLog;
use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::session::PageIdInput;

fn filter_properties(extra: Value) -> Value {
    let mut properties = json!({
        "page_id": {
            "type": ["string", "integer"],
            "description": "Page to read. Omit for every page."
        },
        "limit": {
            "type": "integer",
            "minimum": 1,
            "description": "Keep only the most recent entries"
        }
    });
    if let (Some(properties), Value::Object(extra)) = (properties.as_object_mut(), extra) {
        properties.extend(extra);
    }
    properties
}

#[derive(Debug, Deserialize)]
struct ActivityArgs {
    #[serde(default)]
    page_id: PageIdInput,
    #[serde(default)]
    types: Vec<String>,
    limit: Option<usize>,
}

/// Build `{page_id, <key>, count}` for one page or `{pages: {id: [...]}}` for
/// all of them.
fn report<T, F>(context: &ToolContext, args: &ActivityArgs, key: &str, read: F) -> Result<ToolCallResult>
where
    T: serde::Serialize,
    F: Fn(&ActivityLog) -> Vec<T>,
{
    match args.page_id.resolve() {
        Some(id) => {
            let entries = context
                .sessions
                .activity(&id)
                .map(|log| read(log.as_ref()))
                .unwrap_or_default();
            let mut out = json!({
                "page_id": id,
                "count": entries.len(),
            });
            out[key] = serde_json::to_value(entries)?;
            ToolCallResult::json(&out)
        }
        None => {
            let mut pages = Map::new();
            for (id, log) in context.sessions.activity_logs() {
                pages.insert(id.to_string(), serde_json::to_value(read(log.as_ref()))?);
            }
            ToolCallResult::json(&json!({ "pages": pages }))
        }
    }
}

/// Console messages.
pub struct GetConsoleLogsTool;

#[async_trait::async_trait]
impl Tool for GetConsoleLogsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_console_logs".into(),
            description: "Console messages logged by a page, or by every page, oldest first.".into(),
            input_schema: json!({
                "type": "object",
                "properties": filter_properties(json!({
                    "types": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Only these console types, e.g. [\"error\", \"warning\"]"
                    }
                }))
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ActivityArgs = parse_args(arguments)?;
        report(context, &args, "logs", |log| log.console(&args.types, args.limit))
    }
}

/// Uncaught page errors.
pub struct GetPageErrorsTool;

#[async_trait::async_trait]
impl Tool for GetPageErrorsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_page_errors".into(),
            description: "Uncaught JavaScript errors raised on a page, or on every page.".into(),
            input_schema: json!({
                "type": "object",
                "properties": filter_properties(json!({}))
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ActivityArgs = parse_args(arguments)?;
        report(context, &args, "errors", |log| log.errors(args.limit))
    }
}

/// Requests a page sent, when capture is on.
pub struct GetNetworkRequestsTool;

#[async_trait::async_trait]
impl Tool for GetNetworkRequestsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_network_requests".into(),
            description: "Requests sent by a page, or by every page. Empty unless the server runs with network capture enabled.".into(),
            input_schema: json!({
                "type": "object",
                "properties": filter_properties(json!({}))
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: ActivityArgs = parse_args(arguments)?;
        if !context.sessions.captures_network() {
            return ToolCallResult::json(&json!({
                "enabled": false,
                "requests": [],
            }));
        }
        report(context, &args, "requests", |log| log.requests(args.limit))
    }
}

/// Run a script and return what it logged along with its value.
pub struct ExecuteConsoleCommandTool;

#[derive(Debug, Deserialize)]
struct CommandArgs {
    #[serde(default)]
    page_id: PageIdInput,
    command: String,
}

#[async_trait::async_trait]
impl Tool for ExecuteConsoleCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "execute_console_command".into(),
            description: "Run a JavaScript command in a page's console. Returns its value and the console messages it produced.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": {
                        "type": ["string", "integer"],
                        "description": "Page to run the command in"
                    },
                    "command": {
                        "type": "string",
                        "description": "JavaScript to evaluate"
                    }
                },
                "required": ["page_id", "command"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: CommandArgs = parse_args(arguments)?;
        let id = args
            .page_id
            .resolve()
            .ok_or_else(|| Error::InvalidParams("page_id is required".into()))?;
        let lease = context.sessions.get_or_create_page(Some(id)).await?;

        let started = Utc::now();
        let outcome = lease.page().evaluate(&args.command).await;
        let logged: Vec<_> = context
            .sessions
            .activity(lease.id())
            .map(|log| log.console(&[], None))
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.timestamp >= started)
            .collect();

        match outcome {
            Ok(result) => ToolCallResult::json(&json!({
                "page_id": lease.id(),
                "success": true,
                "result": result,
                "console": logged,
            })),
            Err(e) => Ok(ToolCallResult::error(format!(
                "command failed on page {}: {e}",
                lease.id()
            ))),
        }
    }
}
