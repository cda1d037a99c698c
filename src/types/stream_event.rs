use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An application event decoded from one frame of the chat event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Progress update emitted while the backend works on a reply.
    Status {
        /// Human-readable progress text.
        message: String,

        /// Model the backend is currently using, if it reports one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_name: Option<String>,
    },

    /// The reply is finished; `result` carries the final payload.
    Complete {
        /// Final response document.
        #[serde(default)]
        result: Value,
    },

    /// The backend gave up on the request.
    Error {
        /// Error description, either a string or a structured object.
        error: Value,
    },
}

impl StreamEvent {
    /// Creates a status event.
    pub fn status(message: impl Into<String>, model_name: Option<String>) -> Self {
        StreamEvent::Status {
            message: message.into(),
            model_name,
        }
    }

    /// Creates an error event from plain text.
    pub fn error(text: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: Value::String(text.into()),
        }
    }

    /// Returns true for events that end the stream's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }

    /// Returns a human-readable cause for an error event.
    pub fn error_text(&self) -> Option<String> {
        match self {
            StreamEvent::Error { error } => Some(describe_error(error)),
            _ => None,
        }
    }
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        Value::Object(map) => ["message", "detail", "error"]
            .iter()
            .find_map(|key| map.get(*key))
            .map(describe_error)
            .unwrap_or_else(|| error.to_string()),
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_deserialization() {
        let event: StreamEvent = serde_json::from_value(json!({
            "type": "status",
            "message": "Classifying",
            "model_name": "small"
        }))
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::status("Classifying", Some("small".to_string()))
        );
        assert!(!event.is_terminal());
    }

    #[test]
    fn complete_without_result() {
        let event: StreamEvent = serde_json::from_value(json!({"type": "complete"})).unwrap();
        assert_eq!(event, StreamEvent::Complete { result: Value::Null });
        assert!(event.is_terminal());
    }

    #[test]
    fn error_text_from_object() {
        let event: StreamEvent = serde_json::from_value(json!({
            "type": "error",
            "error": {"code": 503, "message": "upstream unavailable"}
        }))
        .unwrap();
        assert_eq!(event.error_text().as_deref(), Some("upstream unavailable"));
        assert_eq!(
            StreamEvent::error("boom").error_text().as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parsed = serde_json::from_value::<StreamEvent>(json!({"type": "delta"}));
        assert!(parsed.is_err());
    }
}
