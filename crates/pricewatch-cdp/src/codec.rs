//! Wire envelope of the remote-debugging protocol.
//!
//! Three frame shapes travel over a tab's websocket:
//! - command  `{"id": N, "method": "Domain.command", "params": {...}}` (outbound)
//! - response `{"id": N, "result": {...}}` or `{"id": N, "error": {...}}` (inbound)
//! - event    `{"method": "Domain.event", "params": {...}}` (inbound, no `id`)

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{CdpError, Result};

/// Protocol method names used by this crate and its callers.
pub mod methods {
    pub const PAGE_ENABLE: &str = "Page.enable";
    pub const PAGE_NAVIGATE: &str = "Page.navigate";
    pub const PAGE_LOAD_EVENT_FIRED: &str = "Page.loadEventFired";
    pub const RUNTIME_EVALUATE: &str = "Runtime.evaluate";
    pub const BROWSER_GET_VERSION: &str = "Browser.getVersion";
    pub const BROWSER_CLOSE: &str = "Browser.close";
}

/// Outbound command frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Command {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        let params = if params.is_null() { json!({}) } else { params };
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error object of a rejected command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Response frame correlated to a command by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: std::result::Result<Value, RemoteError>,
}

impl Response {
    pub fn into_result(self) -> Result<Value> {
        self.outcome.map_err(|err| CdpError::Remote {
            code: err.code,
            message: err.message,
        })
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOrigin {
    #[default]
    Browser,
    /// Pushed locally into a tab's queue, e.g. to end a wait on timeout.
    Injected,
}

/// Unsolicited event frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub method: String,
    pub params: Value,
    pub origin: EventOrigin,
}

impl Event {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            origin: EventOrigin::Browser,
        }
    }

    /// A locally injected event with empty params.
    pub fn injected(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: json!({}),
            origin: EventOrigin::Injected,
        }
    }

    pub fn is(&self, method: &str) -> bool {
        self.method == method
    }

    pub fn is_injected(&self) -> bool {
        self.origin == EventOrigin::Injected
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Event(Event),
}

/// A frame that could not be decoded.
///
/// `id` is set when the frame was JSON carrying a command id, so the failure
/// can be handed to that command's waiter instead of tearing down the tab.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameError {
    pub id: Option<u64>,
    pub reason: String,
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<RemoteError>,
}

pub fn decode(text: &str) -> std::result::Result<Inbound, FrameError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|err| FrameError {
        id: serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| value.get("id").and_then(Value::as_u64)),
        reason: err.to_string(),
    })?;

    if let Some(id) = raw.id {
        let outcome = match raw.error {
            Some(error) => Err(error),
            None => Ok(raw.result.unwrap_or(Value::Null)),
        };
        return Ok(Inbound::Response(Response { id, outcome }));
    }

    match raw.method {
        Some(method) => Ok(Inbound::Event(Event::new(method, raw.params))),
        None => Err(FrameError {
            id: None,
            reason: "frame has neither id nor method".to_string(),
        }),
    }
}

/// Value returned by a page-context evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Objects and arrays, returned by value.
    Json(Value),
}

impl RemoteValue {
    /// Decode the result of `Runtime.evaluate`.
    pub fn from_evaluation(result: &Value) -> Result<Self> {
        if let Some(details) = result.get("exceptionDetails") {
            let message = details
                .pointer("/exception/description")
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("uncaught exception");
            return Err(CdpError::Exception(message.to_string()));
        }

        let remote = result.get("result").unwrap_or(&Value::Null);
        let kind = remote.get("type").and_then(Value::as_str).unwrap_or("undefined");
        let value = remote.get("value");

        Ok(match (kind, value) {
            ("undefined", _) => RemoteValue::Undefined,
            (_, None) => match remote.get("unserializableValue").and_then(Value::as_str) {
                Some(text) => text.parse().map(RemoteValue::Number).unwrap_or(RemoteValue::Null),
                None if remote.get("subtype").and_then(Value::as_str) == Some("null") => {
                    RemoteValue::Null
                }
                None => RemoteValue::Undefined,
            },
            (_, Some(Value::Null)) => RemoteValue::Null,
            (_, Some(Value::Bool(flag))) => RemoteValue::Bool(*flag),
            (_, Some(Value::Number(number))) => {
                RemoteValue::Number(number.as_f64().unwrap_or_default())
            }
            (_, Some(Value::String(text))) => RemoteValue::String(text.clone()),
            (_, Some(other)) => RemoteValue::Json(other.clone()),
        })
    }

    /// Textual form fed to field parsers; `null`/`undefined` read as empty.
    pub fn as_text(&self) -> String {
        match self {
            RemoteValue::Undefined | RemoteValue::Null => String::new(),
            RemoteValue::Bool(flag) => flag.to_string(),
            RemoteValue::Number(number) => {
                if number.fract() == 0.0 && number.abs() < 1e15 {
                    format!("{}", *number as i64)
                } else {
                    number.to_string()
                }
            }
            RemoteValue::String(text) => text.clone(),
            RemoteValue::Json(value) => value.to_string(),
        }
    }
}
