//! # pagekeeper-mcp
//!
//! MCP (Model Context Protocol) server for browser automation with pages that
//! outlive individual tool calls.
//!
//! Agents call tools one at a time with no shared state between calls. The
//! [`SessionManager`] gives each browser page a stable id, remembers the URL
//! every page was last seen on, and recreates pages from that record when the
//! live handle is gone (closed, crashed, or lost to a server restart).
//!
//! ## Features
//!
//! - **MCP-compliant**: JSON-RPC 2.0 over stdio (standard MCP transport)
//! - **Persistent page ids**: `"3"` and `3` name the same page, ids survive
//!   restarts, and concurrent calls on one id are serialized
//! - **Fail-open**: unreachable URLs fall back to a blank page, and state file
//!   trouble is logged rather than surfaced
//! - **Data persistence**: key/value data sessions and captured page entries
//!
//! ## Available Tools
//!
//! - Pages: `navigate`, `extract_page_content`, `take_screenshot`,
//!   `click_element`, `fill_input`, `evaluate_javascript`, `get_page_info`,
//!   `list_pages`, `close_page`, `close_all_pages`
//! - Page activity: `get_console_logs`, `get_page_errors`,
//!   `get_network_requests`, `execute_console_command`
//! - Data: `create_data_session`, `get_data_session`, `delete_data_session`,
//!   `set_session_value`, `get_session_value`, `delete_session_value`,
//!   `cleanup_expired_sessions`, `persist_page_content`,
//!   `persist_extracted_data`, `get_persisted_data`, `query_persisted_data`,
//!   `delete_persisted_data`
//!
//! ## Usage with VS Code
//!
//! Add to your `.vscode/mcp.json`:
//!
//! ```json
//! {
//!   "servers": {
//!     "pagekeeper": {
//!       "command": "pagekeeper-mcp",
//!       "args": ["--headless", "true"],
//!       "env": { "MCP_BROWSER_STORAGE_DIR": "/tmp/pagekeeper" }
//!     }
//!   }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod browser;
pub mod config;
pub mod data;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tools;

pub use error::{Error, Result};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpMessage};
pub use server::McpServer;
pub use session::{PageId, SessionManager};
pub use tools::{Tool, ToolContext, ToolRegistry};
