use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::handlers::HandlerMode;

/// What travels between services: who is asking, with what, and the shape
/// they want back. Only `response` is ever replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub requester_service: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub response: Value,
}

impl Envelope {
    pub fn with_response(self, response: Value) -> Self {
        Self { response, ..self }
    }
}

/// How a request is served, read from the well-known payload keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Single lookup through the synthesizer.
    Point,
    /// Single entity by id; served by a fixed plan when the requester has one.
    OnDemand,
    /// One cursor-paginated page.
    Batch { cursor: Option<String> },
}

impl RequestKind {
    pub fn classify(payload: &Map<String, Value>) -> Self {
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or("");
        if kind.eq_ignore_ascii_case("batch") {
            return RequestKind::Batch {
                cursor: payload.get("cursor").and_then(cursor_value),
            };
        }
        let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
        if kind.eq_ignore_ascii_case("on-demand") || action.to_ascii_lowercase().contains("on-demand") {
            return RequestKind::OnDemand;
        }
        RequestKind::Point
    }

    pub fn handler_mode(&self) -> Option<HandlerMode> {
        match self {
            RequestKind::Point => None,
            RequestKind::OnDemand => Some(HandlerMode::OnDemand),
            RequestKind::Batch { .. } => Some(HandlerMode::Batch),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, RequestKind::Batch { .. })
    }

    pub fn cursor(&self) -> Option<&str> {
        match self {
            RequestKind::Batch { cursor } => cursor.as_deref(),
            _ => None,
        }
    }
}

fn cursor_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
