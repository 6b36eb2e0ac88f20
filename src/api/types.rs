//! Wire types for the remote service.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a chain/completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single `{role, content}` turn sent to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Listing order for thread messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

/// A file attached to a thread message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub file_id: Option<String>,
}

/// A message as stored in a remote thread (or synthesized from the local buffer).
///
/// `content` is kept as raw JSON: it is either a plain string or a list of
/// typed blocks, and the service does not guarantee either shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ThreadMessage {
    /// A user message built from the local buffer.
    pub fn local_user(content: &str) -> Self {
        Self {
            id: None,
            role: Role::User.as_str().to_string(),
            content: Value::String(content.to_string()),
            attachments: Vec::new(),
            metadata: None,
        }
    }

    /// Text of the message: a plain string, or the first `text` block's value.
    /// Anything else yields an empty string.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .and_then(|b| b.get("text"))
                .and_then(|t| match t {
                    Value::String(s) => Some(s.clone()),
                    other => other.get("value").and_then(Value::as_str).map(str::to_string),
                })
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body for creating a thread message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageCreate {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// File object returned by the files endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Chat-completion request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

/// Chat-completion response; only the parts the runtime reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

impl ChatCompletionResponse {
    /// Content of the first choice, if any.
    pub fn first_content(&self) -> Option<String> {
        self.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: Option<ChoiceMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Parameters for creating a vector store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVectorStore {
    pub name: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub expires_after: Option<Value>,
    #[serde(default)]
    pub chunking_strategy: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(content: Value) -> ThreadMessage {
        serde_json::from_value(json!({"role": "user", "content": content})).unwrap()
    }

    #[test]
    fn text_from_typed_blocks() {
        let msg = message(json!([{"type": "text", "text": {"value": "X"}}]));
        assert_eq!(msg.text(), "X");
    }

    #[test]
    fn text_from_plain_string() {
        assert_eq!(message(json!("Y")).text(), "Y");
    }

    #[test]
    fn text_skips_non_text_blocks() {
        let msg = message(json!([
            {"type": "image_file", "image_file": {"file_id": "f"}},
            {"type": "text", "text": {"value": "second"}}
        ]));
        assert_eq!(msg.text(), "second");
    }

    #[test]
    fn malformed_content_degrades_to_empty() {
        assert_eq!(message(json!(null)).text(), "");
        assert_eq!(message(json!(42)).text(), "");
        assert_eq!(message(json!([])).text(), "");
        assert_eq!(message(json!([{"type": "text"}])).text(), "");
        assert_eq!(message(json!([{"type": "text", "text": {"value": 5}}])).text(), "");
        assert_eq!(message(json!({"text": "nope"})).text(), "");
    }

    #[test]
    fn missing_content_and_null_attachments_deserialize() {
        let msg: ThreadMessage =
            serde_json::from_value(json!({"role": "assistant", "attachments": null})).unwrap();
        assert_eq!(msg.text(), "");
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn null_role_reads_as_empty() {
        let messages: Vec<ThreadMessage> = serde_json::from_value(json!([
            {"role": null, "content": "system notice"},
            {"role": "user", "content": "hi"}
        ]))
        .unwrap();
        assert_eq!(messages[0].role, "");
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn completion_request_omits_absent_tools() {
        let req = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.7,
            max_tokens: 10,
            tools: None,
        };
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn first_content_handles_missing_choices() {
        let empty: ChatCompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert_eq!(empty.first_content(), None);
        let full: ChatCompletionResponse = serde_json::from_value(
            json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}]}),
        )
        .unwrap();
        assert_eq!(full.first_content().as_deref(), Some("ok"));
    }
}
