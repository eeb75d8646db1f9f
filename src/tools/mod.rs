//! Tool trait, execution context and registry.
//!
//! Every tool is a thin adapter: parse arguments, obtain a page lease or a
//! data store handle from the [`ToolContext`], perform one action, report.

mod console;
mod data;
mod page;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::data::DataStore;
use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::session::SessionManager;

pub use console::{
    ExecuteConsoleCommandTool, GetConsoleLogsTool, GetNetworkRequestsTool, GetPageErrorsTool,
};
pub use data::{
    CleanupExpiredSessionsTool, CreateDataSessionTool, DeleteDataSessionTool,
    DeletePersistedDataTool, DeleteSessionValueTool, GetDataSessionTool, GetPersistedDataTool,
    GetSessionValueTool, PersistExtractedDataTool, PersistPageContentTool,
    QueryPersistedDataTool, SetSessionValueTool,
};
pub use page::{
    ClickElementTool, CloseAllPagesTool, ClosePageTool, EvaluateJavascriptTool,
    ExtractPageContentTool, FillInputTool, GetPageInfoTool, ListPagesTool, NavigateTool,
    TakeScreenshotTool,
};

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<ToolCallResult>;
}

/// Shared state handed to every tool call.
pub struct ToolContext {
    /// Page session manager.
    pub sessions: Arc<SessionManager>,
    /// Data sessions and captured entries.
    pub data: Arc<DataStore>,
    /// Default navigation budget for `navigate`.
    pub navigation_timeout: Duration,
}

impl ToolContext {
    /// Bundle the stores with the default 30 second navigation budget.
    pub fn new(sessions: Arc<SessionManager>, data: Arc<DataStore>) -> Self {
        Self {
            sessions,
            data,
            navigation_timeout: Duration::from_secs(30),
        }
    }

    /// Override the navigation budget.
    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Registry with every built-in tool.
    pub fn new(context: ToolContext) -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
            context: Arc::new(context),
        };

        let builtin: Vec<Arc<dyn Tool>> = vec![
            // Pages
            Arc::new(NavigateTool),
            Arc::new(ExtractPageContentTool),
            Arc::new(TakeScreenshotTool),
            Arc::new(ClickElementTool),
            Arc::new(FillInputTool),
            Arc::new(EvaluateJavascriptTool),
            Arc::new(GetPageInfoTool),
            Arc::new(ListPagesTool),
            Arc::new(ClosePageTool),
            Arc::new(CloseAllPagesTool),
            // Page activity
            Arc::new(GetConsoleLogsTool),
            Arc::new(GetPageErrorsTool),
            Arc::new(GetNetworkRequestsTool),
            Arc::new(ExecuteConsoleCommandTool),
            // Data sessions
            Arc::new(CreateDataSessionTool),
            Arc::new(GetDataSessionTool),
            Arc::new(DeleteDataSessionTool),
            Arc::new(SetSessionValueTool),
            Arc::new(GetSessionValueTool),
            Arc::new(DeleteSessionValueTool),
            Arc::new(CleanupExpiredSessionsTool),
            // Captured entries
            Arc::new(PersistPageContentTool),
            Arc::new(PersistExtractedDataTool),
            Arc::new(GetPersistedDataTool),
            Arc::new(QueryPersistedDataTool),
            Arc::new(DeletePersistedDataTool),
        ];
        for tool in builtin {
            registry.register(tool);
        }

        registry
    }

    /// Tool definitions, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        tool.execute(arguments, &self.context).await
    }

    /// Register a custom tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<ToolContext> {
        &self.context
    }
}

/// Deserialize tool arguments. A missing `arguments` object counts as `{}`.
pub(crate) fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        Value::Object(Default::default())
    } else {
        arguments
    };
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Optional {
        #[serde(default)]
        limit: Option<usize>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Required {
        key: String,
    }

    #[test]
    fn null_arguments_are_an_empty_object() {
        let args: Optional = parse_args(Value::Null).unwrap();
        assert!(args.limit.is_none());
    }

    #[test]
    fn missing_fields_are_invalid_params() {
        let err = parse_args::<Required>(serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }
}
