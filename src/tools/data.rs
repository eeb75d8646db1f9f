//! Data session and captured-entry tools.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{parse_args, Tool, ToolContext};
use crate::data::EntryQuery;
use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::session::{PageIdInput, PageLease};

fn session_id_property() -> Value {
    json!({
        "type": "string",
        "description": "Data session id returned by create_data_session"
    })
}

fn entry_id_property() -> Value {
    json!({
        "type": "string",
        "description": "Entry id returned by a persist_* tool"
    })
}

/// Start a key/value session.
pub struct CreateDataSessionTool;

#[derive(Debug, Deserialize)]
struct CreateSessionArgs {
    name: Option<String>,
    expiration: Option<u64>,
}

#[async_trait::async_trait]
impl Tool for CreateDataSessionTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "create_data_session".into(),
            description: "Create a named key/value session for keeping results between calls.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string"
                    },
                    "expiration": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Seconds of inactivity after which the session is dropped"
                    }
                }
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: CreateSessionArgs = parse_args(arguments)?;
        let session = context.data.sessions.create(args.name, args.expiration).await?;
        ToolCallResult::json(&session)
    }
}

#[derive(Debug, Deserialize)]
struct SessionArgs {
    session_id: String,
}

/// Fetch a session.
pub struct GetDataSessionTool;

#[async_trait::async_trait]
impl Tool for GetDataSessionTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_data_session".into(),
            description: "Get a data session with all of its values.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": session_id_property()
                },
                "required": ["session_id"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: SessionArgs = parse_args(arguments)?;
        let session = context.data.sessions.get(&args.session_id).await?;
        ToolCallResult::json(&session)
    }
}

/// Delete a session.
pub struct DeleteDataSessionTool;

#[async_trait::async_trait]
impl Tool for DeleteDataSessionTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_data_session".into(),
            description: "Delete a data session and its values.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": session_id_property()
                },
                "required": ["session_id"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: SessionArgs = parse_args(arguments)?;
        let deleted = context.data.sessions.delete(&args.session_id).await?;
        ToolCallResult::json(&json!({
            "session_id": args.session_id,
            "deleted": deleted,
        }))
    }
}

/// Store a value.
pub struct SetSessionValueTool;

#[derive(Debug, Deserialize)]
struct SetValueArgs {
    session_id: String,
    key: String,
    value: Value,
}

#[async_trait::async_trait]
impl Tool for SetSessionValueTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "set_session_value".into(),
            description: "Store any JSON value under a key in a data session.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": session_id_property(),
                    "key": {
                        "type": "string"
                    },
                    "value": {
                        "description": "Any JSON value"
                    }
                },
                "required": ["session_id", "key", "value"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: SetValueArgs = parse_args(arguments)?;
        let session = context
            .data
            .sessions
            .set_value(&args.session_id, &args.key, args.value)
            .await?;
        ToolCallResult::json(&json!({
            "session_id": session.id,
            "key": args.key,
            "keys": session.data.keys().collect::<Vec<_>>(),
        }))
    }
}

/// Read a value.
pub struct GetSessionValueTool;

#[derive(Debug, Deserialize)]
struct GetValueArgs {
    session_id: String,
    key: String,
    #[serde(default)]
    default: Value,
}

#[async_trait::async_trait]
impl Tool for GetSessionValueTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_session_value".into(),
            description: "Read a value from a data session, or the given default when unset.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": session_id_property(),
                    "key": {
                        "type": "string"
                    },
                    "default": {
                        "description": "Returned when the key is unset"
                    }
                },
                "required": ["session_id", "key"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: GetValueArgs = parse_args(arguments)?;
        let value = context
            .data
            .sessions
            .get_value(&args.session_id, &args.key)
            .await?;
        let found = value.is_some();
        ToolCallResult::json(&json!({
            "key": args.key,
            "found": found,
            "value": value.unwrap_or(args.default),
        }))
    }
}

/// Remove a value.
pub struct DeleteSessionValueTool;

#[derive(Debug, Deserialize)]
struct DeleteValueArgs {
    session_id: String,
    key: String,
}

#[async_trait::async_trait]
impl Tool for DeleteSessionValueTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_session_value".into(),
            description: "Remove a key from a data session.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": session_id_property(),
                    "key": {
                        "type": "string"
                    }
                },
                "required": ["session_id", "key"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: DeleteValueArgs = parse_args(arguments)?;
        let deleted = context
            .data
            .sessions
            .delete_value(&args.session_id, &args.key)
            .await?;
        ToolCallResult::json(&json!({
            "key": args.key,
            "deleted": deleted,
        }))
    }
}

/// Drop expired sessions.
pub struct CleanupExpiredSessionsTool;

#[async_trait::async_trait]
impl Tool for CleanupExpiredSessionsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "cleanup_expired_sessions".into(),
            description: "Delete every data session past its expiration.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    async fn execute(&self, _arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let removed = context.data.sessions.cleanup_expired().await?;
        ToolCallResult::json(&json!({ "removed": removed }))
    }
}

/// What `persist_page_content` captures.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PageDataType {
    #[default]
    Content,
    Html,
    Screenshot,
    Metadata,
}

impl PageDataType {
    fn as_str(self) -> &'static str {
        match self {
            PageDataType::Content => "content",
            PageDataType::Html => "html",
            PageDataType::Screenshot => "screenshot",
            PageDataType::Metadata => "metadata",
        }
    }
}

/// Capture something from a page into the entry store.
pub struct PersistPageContentTool;

#[derive(Debug, Deserialize)]
struct PersistPageArgs {
    #[serde(default)]
    page_id: PageIdInput,
    #[serde(default)]
    data_type: PageDataType,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[async_trait::async_trait]
impl Tool for PersistPageContentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "persist_page_content".into(),
            description: "Save a page's content, HTML, screenshot or metadata as a persisted entry.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page_id": {
                        "type": ["string", "integer"],
                        "description": "Page to capture"
                    },
                    "data_type": {
                        "type": "string",
                        "enum": ["content", "html", "screenshot", "metadata"],
                        "default": "content"
                    },
                    "metadata": {
                        "type": "object",
                        "description": "Extra context stored with the entry"
                    }
                },
                "required": ["page_id"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: PersistPageArgs = parse_args(arguments)?;
        let id = args
            .page_id
            .resolve()
            .ok_or_else(|| Error::InvalidParams("page_id is required".into()))?;
        let lease = context.sessions.get_or_create_page(Some(id)).await?;

        let (url, data) = match capture(context, &lease, args.data_type).await {
            Ok(captured) => captured,
            Err(e) => {
                return Ok(ToolCallResult::error(format!(
                    "capturing {} failed on page {}: {e}",
                    args.data_type.as_str(),
                    lease.id()
                )))
            }
        };
        context.sessions.update_metadata(lease.id(), &url).await;

        let mut metadata = args.metadata;
        metadata.insert("page_id".into(), json!(lease.id()));
        metadata.insert("url".into(), json!(url));

        let entry = context
            .data
            .entries
            .save(format!("page_{}", args.data_type.as_str()), data, metadata)
            .await?;
        ToolCallResult::json(&json!({
            "entry_id": entry.id,
            "type": entry.entry_type,
            "timestamp": entry.timestamp,
            "page_id": lease.id(),
        }))
    }
}

/// Read `data_type` from the leased page. Returns the page URL with it.
async fn capture(context: &ToolContext, lease: &PageLease, data_type: PageDataType) -> Result<(String, Value)> {
    let page = lease.page();
    let url = page.current_url().await?;
    let data = match data_type {
        PageDataType::Content => json!({
            "title": page.title().await?,
            "url": url,
            "text": page
                .evaluate("document.body ? document.body.innerText : ''")
                .await?,
        }),
        PageDataType::Html => json!({
            "url": url,
            "html": page.content().await?,
        }),
        PageDataType::Screenshot => json!({
            "url": url,
            "mime_type": "image/png",
            "data": base64::engine::general_purpose::STANDARD.encode(page.screenshot(true).await?),
        }),
        PageDataType::Metadata => json!(context.sessions.page_info(lease.id()).await),
    };
    Ok((url, data))
}

/// Store arbitrary extracted data.
pub struct PersistExtractedDataTool;

#[derive(Debug, Deserialize)]
struct PersistExtractedArgs {
    data_type: String,
    data: Value,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[async_trait::async_trait]
impl Tool for PersistExtractedDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "persist_extracted_data".into(),
            description: "Save arbitrary extracted data as a persisted entry of type extracted_<data_type>.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "data_type": {
                        "type": "string",
                        "description": "Short tag such as links, table or prices"
                    },
                    "data": {
                        "description": "Any JSON value"
                    },
                    "metadata": {
                        "type": "object"
                    }
                },
                "required": ["data_type", "data"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: PersistExtractedArgs = parse_args(arguments)?;
        if args.data_type.trim().is_empty() {
            return Err(Error::InvalidParams("data_type must not be empty".into()));
        }
        let entry = context
            .data
            .entries
            .save(
                format!("extracted_{}", args.data_type.trim()),
                args.data,
                args.metadata,
            )
            .await?;
        ToolCallResult::json(&json!({
            "entry_id": entry.id,
            "type": entry.entry_type,
            "timestamp": entry.timestamp,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct EntryArgs {
    entry_id: String,
}

/// Load an entry.
pub struct GetPersistedDataTool;

#[async_trait::async_trait]
impl Tool for GetPersistedDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_persisted_data".into(),
            description: "Load a persisted entry by id.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entry_id": entry_id_property()
                },
                "required": ["entry_id"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: EntryArgs = parse_args(arguments)?;
        let entry = context.data.entries.load(&args.entry_id).await?;
        ToolCallResult::json(&entry)
    }
}

/// Search entries.
pub struct QueryPersistedDataTool;

#[derive(Debug, Deserialize)]
struct QueryArgs {
    entry_type: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

#[async_trait::async_trait]
impl Tool for QueryPersistedDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "query_persisted_data".into(),
            description: "List persisted entries, newest first, filtered by type and time range.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entry_type": {
                        "type": "string",
                        "description": "Exact type, e.g. page_content or extracted_links"
                    },
                    "start_time": {
                        "type": "string",
                        "format": "date-time"
                    },
                    "end_time": {
                        "type": "string",
                        "format": "date-time"
                    },
                    "limit": {
                        "type": "integer",
                        "minimum": 1
                    }
                }
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: QueryArgs = parse_args(arguments)?;
        let entries = context
            .data
            .entries
            .query(&EntryQuery {
                entry_type: args.entry_type,
                start: args.start_time,
                end: args.end_time,
                limit: args.limit,
            })
            .await?;
        ToolCallResult::json(&json!({
            "count": entries.len(),
            "entries": entries,
        }))
    }
}

/// Delete an entry.
pub struct DeletePersistedDataTool;

#[async_trait::async_trait]
impl Tool for DeletePersistedDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delete_persisted_data".into(),
            description: "Delete a persisted entry.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entry_id": entry_id_property()
                },
                "required": ["entry_id"]
            }),
        }
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult> {
        let args: EntryArgs = parse_args(arguments)?;
        let deleted = context.data.entries.delete(&args.entry_id).await?;
        ToolCallResult::json(&json!({
            "entry_id": args.entry_id,
            "deleted": deleted,
        }))
    }
}
