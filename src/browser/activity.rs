//! Console output, uncaught errors and network requests seen on a page.
//!
//! One [`ActivityLog`] exists per page id and outlives the handles attached
//! to it, so messages logged before a page was recreated stay readable.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Entries kept per kind before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A `console.*` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleMessage {
    /// When the message was seen.
    pub timestamp: DateTime<Utc>,
    /// `log`, `info`, `warning`, `error`, `debug`, ...
    #[serde(rename = "type")]
    pub level: String,
    /// Arguments joined by spaces.
    pub text: String,
    /// `url:line` of the call site, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// An uncaught exception.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageError {
    /// When the error was thrown.
    pub timestamp: DateTime<Utc>,
    /// Exception description.
    pub message: String,
    /// `url:line` where it was thrown, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkRequest {
    /// When the request was sent.
    pub timestamp: DateTime<Utc>,
    /// HTTP method.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// `document`, `xhr`, `fetch`, `script`, ...
    pub resource_type: String,
}

#[derive(Debug, Default)]
struct Buffers {
    console: VecDeque<ConsoleMessage>,
    errors: VecDeque<PageError>,
    requests: VecDeque<NetworkRequest>,
}

/// Bounded per-page activity buffers.
#[derive(Debug)]
pub struct ActivityLog {
    capacity: usize,
    capture_network: bool,
    buffers: Mutex<Buffers>,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    if queue.len() == capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

fn newest<T: Clone>(queue: &VecDeque<T>, limit: Option<usize>) -> Vec<T> {
    let skip = limit.map_or(0, |limit| queue.len().saturating_sub(limit));
    queue.iter().skip(skip).cloned().collect()
}

impl ActivityLog {
    /// Log keeping `capacity` entries of each kind. Requests are only kept
    /// when `capture_network` is set.
    pub fn new(capacity: usize, capture_network: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            capture_network,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Buffers) -> T) -> T {
        let mut buffers = match self.buffers.lock() {
            Ok(buffers) => buffers,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut buffers)
    }

    /// Whether request capture is on.
    pub fn captures_network(&self) -> bool {
        self.capture_network
    }

    /// Append a console message.
    pub fn record_console(&self, level: impl Into<String>, text: impl Into<String>, location: Option<String>) {
        let message = ConsoleMessage {
            timestamp: Utc::now(),
            level: level.into(),
            text: text.into(),
            location,
        };
        self.with(|b| push_bounded(&mut b.console, message, self.capacity));
    }

    /// Append an uncaught error.
    pub fn record_error(&self, message: impl Into<String>, location: Option<String>) {
        let error = PageError {
            timestamp: Utc::now(),
            message: message.into(),
            location,
        };
        self.with(|b| push_bounded(&mut b.errors, error, self.capacity));
    }

    /// Dropped unless network capture is on.
    pub fn record_request(&self, method: impl Into<String>, url: impl Into<String>, resource_type: impl Into<String>) {
        if !self.capture_network {
            return;
        }
        let request = NetworkRequest {
            timestamp: Utc::now(),
            method: method.into(),
            url: url.into(),
            resource_type: resource_type.into(),
        };
        self.with(|b| push_bounded(&mut b.requests, request, self.capacity));
    }

    /// Oldest first; `limit` keeps only the most recent entries. `levels`
    /// filters by console type when non-empty.
    pub fn console(&self, levels: &[String], limit: Option<usize>) -> Vec<ConsoleMessage> {
        self.with(|b| {
            if levels.is_empty() {
                return newest(&b.console, limit);
            }
            let matching: VecDeque<ConsoleMessage> = b
                .console
                .iter()
                .filter(|m| levels.iter().any(|l| l.eq_ignore_ascii_case(&m.level)))
                .cloned()
                .collect();
            newest(&matching, limit)
        })
    }

    /// Uncaught errors, oldest first.
    pub fn errors(&self, limit: Option<usize>) -> Vec<PageError> {
        self.with(|b| newest(&b.errors, limit))
    }

    /// Captured requests, oldest first.
    pub fn requests(&self, limit: Option<usize>) -> Vec<NetworkRequest> {
        self.with(|b| newest(&b.requests, limit))
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_are_dropped_at_capacity() {
        let log = ActivityLog::new(2, false);
        for n in 0..3 {
            log.record_console("log", format!("m{n}"), None);
        }
        let texts: Vec<String> = log.console(&[], None).into_iter().map(|m| m.text).collect();
        assert_eq!(texts, ["m1", "m2"]);
    }

    #[test]
    fn console_filters_by_level_and_limit() {
        let log = ActivityLog::default();
        log.record_console("log", "a", None);
        log.record_console("error", "b", None);
        log.record_console("error", "c", Some("app.js:3".into()));

        let errors = log.console(&["ERROR".to_string()], Some(1));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].text, "c");
        assert_eq!(errors[0].location.as_deref(), Some("app.js:3"));
        assert_eq!(log.console(&[], None).len(), 3);
    }

    #[test]
    fn requests_need_network_capture() {
        let off = ActivityLog::new(10, false);
        off.record_request("GET", "https://a.test", "document");
        assert!(off.requests(None).is_empty());

        let on = ActivityLog::new(10, true);
        on.record_request("GET", "https://a.test", "document");
        assert_eq!(on.requests(None)[0].url, "https://a.test");
    }
}
