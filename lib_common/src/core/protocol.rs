//! Viewer wire protocol: JSON text frames exchanged over the viewer socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::WatchError;
use crate::core::normalizer::NormalizedEvent;
use crate::core::target::WatchTarget;

/// Messages pushed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewerMessage {
    Welcome {
        message: String,
    },
    Status {
        watching: String,
    },
    #[serde(rename_all = "camelCase")]
    Change {
        operation: String,
        namespace: String,
        /// RFC 3339 with milliseconds.
        timestamp: String,
        rendered_text: String,
        rendered_structured: Value,
        raw: Value,
    },
    Error {
        message: String,
    },
}

impl ViewerMessage {
    pub fn welcome(message: impl Into<String>) -> Self {
        ViewerMessage::Welcome { message: message.into() }
    }

    pub fn status(watching: impl Into<String>) -> Self {
        ViewerMessage::Status { watching: watching.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ViewerMessage::Error { message: message.into() }
    }

    pub fn change(event: &NormalizedEvent) -> Self {
        ViewerMessage::Change {
            operation: event.operation.label(),
            namespace: event.namespace.clone(),
            timestamp: event
                .timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            rendered_text: event.rendered_text.clone(),
            rendered_structured: event.rendered_structured.clone(),
            raw: event.raw.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&WatchError> for ViewerMessage {
    fn from(err: &WatchError) -> Self {
        ViewerMessage::error(err.to_string())
    }
}

/// Messages viewers send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewerRequest {
    SelectTarget {
        #[serde(default, alias = "db")]
        container: Option<String>,
        #[serde(default, alias = "collection")]
        resource: Option<String>,
    },
}

impl ViewerRequest {
    /// Parses one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, WatchError> {
        let request: ViewerRequest =
            serde_json::from_str(text).map_err(|e| WatchError::MalformedRequest(e.to_string()))?;

        match &request {
            ViewerRequest::SelectTarget { container, .. } => {
                if container.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                    return Err(WatchError::MalformedRequest(
                        "selectTarget requires a container (use \"*\" for the whole deployment)".into(),
                    ));
                }
            }
        }
        Ok(request)
    }

    pub fn target(&self) -> WatchTarget {
        match self {
            ViewerRequest::SelectTarget { container, resource } => {
                WatchTarget::from_parts(container.as_deref(), resource.as_deref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_target_parsing() {
        let req = ViewerRequest::parse(r#"{"type":"selectTarget","container":"orders","resource":"items"}"#).unwrap();
        assert_eq!(req.target(), WatchTarget::OneResource("orders".into(), "items".into()));

        let req = ViewerRequest::parse(r#"{"type":"selectTarget","db":"orders","collection":"*"}"#).unwrap();
        assert_eq!(req.target(), WatchTarget::OneContainer("orders".into()));

        let req = ViewerRequest::parse(r#"{"type":"selectTarget","container":"*"}"#).unwrap();
        assert_eq!(req.target(), WatchTarget::EntireDeployment);
    }

    #[test]
    fn test_malformed_requests() {
        for text in [
            "not json",
            r#"{"type":"dance"}"#,
            r#"{"container":"orders"}"#,
            r#"{"type":"selectTarget"}"#,
            r#"{"type":"selectTarget","container":"  "}"#,
        ] {
            let err = ViewerRequest::parse(text).unwrap_err();
            assert!(matches!(err, WatchError::MalformedRequest(_)), "{text}");
        }
    }

    #[test]
    fn test_outbound_shapes() {
        let value = serde_json::to_value(ViewerMessage::status("orders.*")).unwrap();
        assert_eq!(value, json!({ "type": "status", "watching": "orders.*" }));

        let value = serde_json::to_value(ViewerMessage::welcome("hi")).unwrap();
        assert_eq!(value, json!({ "type": "welcome", "message": "hi" }));

        let value = serde_json::to_value(ViewerMessage::error("boom")).unwrap();
        assert_eq!(value, json!({ "type": "error", "message": "boom" }));
    }

    #[test]
    fn test_change_message_fields() {
        let raw = crate::core::normalizer::RawNotification::new(bson::doc! {
            "operationType": "insert",
            "ns": { "db": "orders", "coll": "items" },
            "wallTime": bson::DateTime::from_millis(1_700_000_000_000),
            "fullDocument": { "a": 1 },
        });
        let event = crate::core::normalizer::normalize(&raw);
        let value = serde_json::to_value(ViewerMessage::change(&event)).unwrap();

        assert_eq!(value["type"], "change");
        assert_eq!(value["operation"], "INSERT");
        assert_eq!(value["namespace"], "orders.items");
        assert_eq!(value["timestamp"], "2023-11-14T22:13:20.000Z");
        assert_eq!(value["renderedStructured"], json!({ "a": 1 }));
        assert!(value["renderedText"].as_str().unwrap().contains("\"a\": 1"));
        assert_eq!(value["raw"]["operationType"], "insert");
    }
}
