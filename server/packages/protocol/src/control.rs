use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Handshake request type answered once the runtime can serve frames.
pub const IS_READY: &str = "is-ready";

/// Correlated request sent on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ControlRequest {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Fire-and-forget console messages. They carry no id and get no reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleMessage {
    Script { script: String },
    Command { command: String, arg: Vec<String> },
}

impl ConsoleMessage {
    pub fn script(script: impl Into<String>) -> Self {
        Self::Script {
            script: script.into(),
        }
    }

    /// Builds a command from `#name arg1 arg2` style text.
    pub fn parse_command(line: &str) -> Option<Self> {
        let mut parts = line.trim().trim_start_matches('#').split_whitespace();
        let command = parts.next()?.to_string();
        Some(Self::Command {
            command,
            arg: parts.map(str::to_string).collect(),
        })
    }
}

/// Reply to `is-ready`: any reply counts unless it reports an error or an
/// explicit `ready: false`.
pub fn reply_is_ready(reply: &Value) -> bool {
    if reply.get("error").is_some_and(|error| !error.is_null()) {
        return false;
    }
    reply.get("ready").and_then(Value::as_bool).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_payload_is_flattened() {
        let mut payload = Map::new();
        payload.insert("width".to_string(), json!(640));
        let request = ControlRequest::new("abc", "resize", payload);
        assert_eq!(
            serde_json::to_value(&request).expect("serialize"),
            json!({ "id": "abc", "type": "resize", "width": 640 })
        );
    }

    #[test]
    fn console_messages_have_no_id() {
        assert_eq!(
            serde_json::to_value(ConsoleMessage::script("print(1)")).expect("serialize"),
            json!({ "type": "script", "script": "print(1)" })
        );
        assert_eq!(
            serde_json::to_value(ConsoleMessage::parse_command("#perfhud  artist on"))
                .expect("serialize"),
            json!({ "type": "command", "command": "perfhud", "arg": ["artist", "on"] })
        );
        assert_eq!(ConsoleMessage::parse_command("  # "), None);
    }

    #[test]
    fn readiness_reply_rules() {
        assert!(reply_is_ready(&json!({ "id": "x" })));
        assert!(reply_is_ready(&json!({ "id": "x", "ready": true })));
        assert!(!reply_is_ready(&json!({ "id": "x", "ready": false })));
        assert!(!reply_is_ready(&json!({ "id": "x", "error": "booting" })));
    }
}
