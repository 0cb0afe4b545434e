//! Splicing the schema block into a conversation.
//!
//! The block is delimited by two literal markers. Injecting is idempotent:
//! old blocks are removed from every message before the fresh one is added
//! to the first system message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub const SCHEMA_START: &str = "<!-- DB_SCHEMA_START -->";
pub const SCHEMA_END: &str = "<!-- DB_SCHEMA_END -->";

/// One conversation message. Fields other than `role` and `content` are kept
/// as they came.
///
/// `content` is `None` for messages that carry none, such as an assistant
/// turn made only of tool calls (`"content": null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(Content::Text(content.into())),
            extra: Map::new(),
        }
    }

    pub fn with_parts(role: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        Self {
            role: role.into(),
            content: Some(Content::Parts(parts)),
            extra: Map::new(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Typed content part. Non-text parts (images and so on) pass through intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: Map::new(),
        }
    }
}

/// The delimited block as it is appended to a system message
pub fn schema_block(schema: &str) -> String {
    format!("\n\n{}\n{}\n{}", SCHEMA_START, schema, SCHEMA_END)
}

/// Byte range of the first complete block, including the blank-line
/// separator in front of it when present.
fn block_range(text: &str) -> Option<(usize, usize)> {
    let start = text.find(SCHEMA_START)?;
    let end = start + text[start..].find(SCHEMA_END)? + SCHEMA_END.len();
    let from = if text[..start].ends_with("\n\n") { start - 2 } else { start };
    Some((from, end))
}

/// Remove every delimited block from `text`
pub fn strip_schema_blocks(text: &str) -> String {
    let mut out = text.to_string();
    while let Some((from, end)) = block_range(&out) {
        out.replace_range(from..end, "");
    }
    out
}

/// Trimmed text between the markers, when both are present
pub fn extract_schema_info(content: &str) -> Option<&str> {
    let start = content.find(SCHEMA_START)? + SCHEMA_START.len();
    let end = start + content[start..].find(SCHEMA_END)?;
    Some(content[start..end].trim())
}

fn strip_content(content: &mut Content) {
    match content {
        Content::Text(text) => {
            if block_range(text).is_some() {
                *text = strip_schema_blocks(text);
            }
        }
        Content::Parts(parts) => {
            parts.retain_mut(|part| match part.text.as_mut() {
                Some(text) if block_range(text).is_some() => {
                    *text = strip_schema_blocks(text);
                    !text.trim().is_empty()
                }
                _ => true,
            });
        }
    }
}

/// Drop schema blocks from every non-system message
pub fn strip_schema_from_history(messages: &mut [Message]) {
    for message in messages.iter_mut().filter(|m| !m.is_system()) {
        if let Some(content) = message.content.as_mut() {
            strip_content(content);
        }
    }
}

/// Put `schema` into the first system message, replacing any earlier copy.
///
/// Returns false when the conversation has no system message. History is
/// cleaned either way.
pub fn inject_schema(messages: &mut [Message], schema: &str) -> bool {
    strip_schema_from_history(messages);

    let Some(system) = messages.iter_mut().find(|m| m.is_system()) else {
        debug!("no system message to carry the schema");
        return false;
    };

    let block = schema_block(schema);
    match system.content.as_mut() {
        Some(content) => {
            strip_content(content);
            match content {
                Content::Text(text) => text.push_str(&block),
                Content::Parts(parts) => parts.push(ContentPart::text(block)),
            }
        }
        None => system.content = Some(Content::Text(block)),
    }
    true
}
