use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    /// Base64 image payloads, without a data-URI prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: None,
            extra: Map::new(),
        }
    }
}

/// Sampling options in Ollama naming. Anything not modelled here is kept in
/// `extra` and forwarded to Ollama untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A caller chat request.
///
/// `_webSearch` and `_deepResearch` are read on the way in and never written
/// back out, so a re-serialized request cannot carry them to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(
        rename = "_webSearch",
        default,
        skip_serializing,
        deserialize_with = "lenient_flag"
    )]
    pub web_search: bool,
    #[serde(
        rename = "_deepResearch",
        default,
        skip_serializing,
        deserialize_with = "lenient_flag"
    )]
    pub deep_research: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub const INTERNAL_FLAGS: [&str; 2] = ["_webSearch", "_deepResearch"];

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: None,
            stream: None,
            web_search: false,
            deep_research: false,
            extra: Map::new(),
        }
    }

    /// Text of the last message, but only when a user wrote it.
    pub fn latest_user_text(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }

    pub fn force_stream(&mut self) {
        self.stream = Some(true);
    }

    /// Prepends `block` to the first system message, or inserts a leading
    /// system message when there is none.
    pub fn merge_system_context(&mut self, block: &str) {
        if block.is_empty() {
            return;
        }
        match self
            .messages
            .iter_mut()
            .find(|m| m.role == MessageRole::System)
        {
            Some(system) => {
                system.content = if system.content.is_empty() {
                    block.to_string()
                } else {
                    format!("{block}\n\n{}", system.content)
                };
            }
            None => self
                .messages
                .insert(0, ChatMessage::new(MessageRole::System, block)),
        }
    }
}

/// Removes the internal flags from an untyped payload. Used on bodies that
/// could not be read as a `ChatRequest`.
pub fn strip_internal_flags(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        for flag in INTERNAL_FLAGS {
            obj.remove(flag);
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Only a literal `true` turns a flag on; anything else reads as off.
fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(matches!(Value::deserialize(deserializer)?, Value::Bool(true)))
}
