//! Structured JSON logging, one line per event, parseable with `jq`.
//!
//! Sits alongside the human-readable `env_logger` stream configured in
//! `main`; enabled per `config::LoggingConfig::json_events`.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp (RFC3339)
    pub timestamp: String,

    /// Log level
    pub level: LogLevel,

    /// Component/module name
    pub component: String,

    /// Log message
    pub message: String,

    /// Additional structured data
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: humantime::format_rfc3339(SystemTime::now()).to_string(),
            level,
            component: component.into(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Output as a JSON line.
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }
}

pub struct JsonLogger;

impl JsonLogger {
    pub fn debug(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Debug, component, message).emit();
    }

    pub fn info(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Info, component, message).emit();
    }

    pub fn warn(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Warn, component, message).emit();
    }

    pub fn error(component: impl Into<String>, message: impl Into<String>) {
        LogEntry::new(LogLevel::Error, component, message).emit();
    }

    /// A question was classified by the dispatcher's decision table.
    pub fn query_classified(name: &str, qtype: u16, classification: &str, source_ip: &str) {
        let data = serde_json::json!({
            "event_type": "query_classified",
            "name": name,
            "qtype": qtype,
            "classification": classification,
            "source_ip": source_ip,
        });
        LogEntry::new(LogLevel::Debug, "dispatcher", "query classified")
            .with_data(data)
            .emit();
    }

    /// A segment was accepted (or rejected as malformed) off the wire.
    pub fn segment_accepted(conn_id: u16, seq: u32, ack: u32, flags: u8, malformed: bool) {
        let data = serde_json::json!({
            "event_type": "segment_accepted",
            "conn_id": conn_id,
            "seq": seq,
            "ack": ack,
            "flags": flags,
            "malformed": malformed,
        });
        let level = if malformed { LogLevel::Warn } else { LogLevel::Debug };
        LogEntry::new(level, "tc", "segment accepted").with_data(data).emit();
    }

    /// The TC state machine transitioned.
    pub fn tc_state_transition(conn_id: u16, from: &str, to: &str) {
        let data = serde_json::json!({
            "event_type": "tc_state_transition",
            "conn_id": conn_id,
            "from": from,
            "to": to,
        });
        LogEntry::new(LogLevel::Info, "tc", "state transition")
            .with_data(data)
            .emit();
    }

    /// A proxy connection was opened, authenticated, and dialed.
    pub fn proxy_connection_opened(conn_id: u16, destination: &str, network: &str) {
        let data = serde_json::json!({
            "event_type": "proxy_connection_opened",
            "conn_id": conn_id,
            "destination": destination,
            "network": network,
        });
        LogEntry::new(LogLevel::Info, "proxy_server", "connection opened")
            .with_data(data)
            .emit();
    }

    /// A proxy connection's TC closed and entered linger.
    pub fn proxy_connection_closed(conn_id: u16, bytes_sent: u64, bytes_received: u64, reason: &str) {
        let data = serde_json::json!({
            "event_type": "proxy_connection_closed",
            "conn_id": conn_id,
            "bytes_sent": bytes_sent,
            "bytes_received": bytes_received,
            "reason": reason,
        });
        LogEntry::new(LogLevel::Info, "proxy_server", "connection closed")
            .with_data(data)
            .emit();
    }

    /// A query was answered with the black-hole address because its name
    /// matched the blocklist.
    pub fn blocklist_hit(name: &str, matched_suffix: &str, source_ip: &str) {
        let data = serde_json::json!({
            "event_type": "blocklist_hit",
            "name": name,
            "matched_suffix": matched_suffix,
            "source_ip": source_ip,
        });
        LogEntry::new(LogLevel::Info, "blocklist", "blocked name answered")
            .with_data(data)
            .emit();
    }

    /// A recursive forward attempt, successful or not.
    pub fn forward_attempt(upstream: &str, transport: &str, success: bool, elapsed_ms: u64) {
        let data = serde_json::json!({
            "event_type": "forward_attempt",
            "upstream": upstream,
            "transport": transport,
            "success": success,
            "elapsed_ms": elapsed_ms,
        });
        let level = if success { LogLevel::Debug } else { LogLevel::Warn };
        LogEntry::new(level, "forwarder", "forward attempt").with_data(data).emit();
    }
}

/// Macros for convenient JSON logging, gated by `config.logging.json_events`
/// at the call site.
#[macro_export]
macro_rules! jlog_debug {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::debug($component, $message)
    };
}

#[macro_export]
macro_rules! jlog_info {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::info($component, $message)
    };
}

#[macro_export]
macro_rules! jlog_warn {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::warn($component, $message)
    };
}

#[macro_export]
macro_rules! jlog_error {
    ($component:expr, $message:expr) => {
        $crate::json_logger::JsonLogger::error($component, $message)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_carries_level_and_component() {
        let entry = LogEntry::new(LogLevel::Info, "test", "Test message");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.component, "test");
        assert_eq!(entry.message, "Test message");
    }

    #[test]
    fn serializes_with_uppercase_level() {
        let entry = LogEntry::new(LogLevel::Error, "network", "Connection failed");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"level\":\"ERROR\""));
        assert!(json.contains("\"component\":\"network\""));
    }
}
