use serde_json::{json, Value};
use std::fmt;

/// JSON-RPC "internal error" code, used for errors synthesized by the proxy.
pub const INTERNAL_ERROR: i64 = -32603;

/// One framed protocol message.
///
/// The payload is opaque to the proxy. It is relayed as-is on exclusive channels;
/// only the JSON-RPC `id` and `method` members are ever inspected, for routing
/// responses on shared channels and for pairing Streamable HTTP responses with the
/// request that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message(String);

impl Message {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_value(value: &Value) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn parse(&self) -> Option<Value> {
        serde_json::from_str(&self.0).ok()
    }

    /// The frame rendered on a single line for line-delimited transports.
    ///
    /// Frames that already fit on one line are returned unchanged. JSON frames
    /// spanning lines are re-serialized compactly.
    pub fn to_line(&self) -> String {
        if !self.0.contains(['\n', '\r']) {
            return self.0.clone();
        }
        match self.parse() {
            Some(value) => value.to_string(),
            None => self.0.replace(['\r', '\n'], " "),
        }
    }

    /// Splits a JSON-RPC batch into its members. Anything else is returned whole.
    pub fn split_batch(&self) -> Vec<Message> {
        match self.parse() {
            Some(Value::Array(items)) if !items.is_empty() => {
                items.iter().map(Message::from_value).collect()
            }
            _ => vec![self.clone()],
        }
    }

    /// Ids of the requests in this frame: members carrying both `id` and `method`.
    pub fn request_ids(&self) -> Vec<Value> {
        self.ids_where(|obj| obj.contains_key("method"))
    }

    /// Ids of the responses in this frame: members carrying `id` but no `method`.
    pub fn response_ids(&self) -> Vec<Value> {
        self.ids_where(|obj| !obj.contains_key("method"))
    }

    fn ids_where(&self, keep: impl Fn(&serde_json::Map<String, Value>) -> bool) -> Vec<Value> {
        let Some(value) = self.parse() else {
            return Vec::new();
        };
        let members = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        members
            .into_iter()
            .filter_map(|member| match member {
                Value::Object(mut obj) if keep(&obj) => match obj.remove("id") {
                    Some(Value::Null) | None => None,
                    Some(id) => Some(id),
                },
                _ => None,
            })
            .collect()
    }
}

impl From<String> for Message {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Message {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds a JSON-RPC error response for `id`.
pub fn jsonrpc_error(id: &Value, code: i64, message: &str) -> Message {
    Message::from_value(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    }))
}

/// Stable map key for a JSON-RPC id, so `1` and `"1"` stay distinct.
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_frames_are_untouched() {
        let raw = r#"{ "ping" : 1 }"#;
        assert_eq!(Message::from(raw).to_line(), raw);
    }

    #[test]
    fn multi_line_json_is_compacted() {
        let msg = Message::from("{\n  \"ping\": 1\n}");
        assert_eq!(msg.to_line(), r#"{"ping":1}"#);
    }

    #[test]
    fn request_and_response_ids_are_told_apart() {
        let batch = Message::from(
            r#"[{"jsonrpc":"2.0","id":1,"method":"a"},{"jsonrpc":"2.0","method":"note"},{"jsonrpc":"2.0","id":"x","result":{}}]"#,
        );
        assert_eq!(batch.request_ids(), vec![json!(1)]);
        assert_eq!(batch.response_ids(), vec![json!("x")]);
        assert_eq!(batch.split_batch().len(), 3);
    }

    #[test]
    fn opaque_frames_have_no_ids() {
        let msg = Message::from("not json at all");
        assert!(msg.request_ids().is_empty());
        assert_eq!(msg.split_batch(), vec![msg.clone()]);
    }

    #[test]
    fn error_response_carries_the_request_id() {
        let err = jsonrpc_error(&json!("req-7"), INTERNAL_ERROR, "backend failed");
        let value = err.parse().unwrap();
        assert_eq!(value["id"], json!("req-7"));
        assert_eq!(value["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(id_key(&json!(1)), "1");
        assert_eq!(id_key(&json!("1")), "\"1\"");
    }
}
