//! Message types
//!
//! Conversation content as submitted to a session: chat messages for callers
//! that render their own prompt, and homogeneous chunks for the cache.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
    /// System prompt
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Encoded image or video frame data, compared byte for byte
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    /// Caller-side identifier, e.g. a file name
    pub id: String,
    /// Raw encoded bytes
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }
}

/// One homogeneous unit of conversation content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum MessageChunk {
    Text(String),
    Images(Vec<Attachment>),
    Videos(Vec<Attachment>),
}

impl MessageChunk {
    pub fn text(s: impl Into<String>) -> Self {
        MessageChunk::Text(s.into())
    }

    /// Returns true for image and video chunks
    pub fn is_media(&self) -> bool {
        match self {
            MessageChunk::Text(_) => false,
            MessageChunk::Images(_) | MessageChunk::Videos(_) => true,
        }
    }

    /// Returns true for a text chunk with no characters
    pub fn is_empty_text(&self) -> bool {
        matches!(self, MessageChunk::Text(text) if text.is_empty())
    }

    /// Returns true if both chunks carry the same kind of content
    pub fn same_kind(&self, other: &MessageChunk) -> bool {
        matches!(
            (self, other),
            (MessageChunk::Text(_), MessageChunk::Text(_))
                | (MessageChunk::Images(_), MessageChunk::Images(_))
                | (MessageChunk::Videos(_), MessageChunk::Videos(_))
        )
    }

    /// Appends `other` to this chunk if the kinds match, returning it otherwise
    pub fn try_merge(&mut self, other: MessageChunk) -> Result<(), MessageChunk> {
        match (self, other) {
            (MessageChunk::Text(a), MessageChunk::Text(b)) => {
                a.push_str(&b);
                Ok(())
            }
            (MessageChunk::Images(a), MessageChunk::Images(b)) => {
                a.extend(b);
                Ok(())
            }
            (MessageChunk::Videos(a), MessageChunk::Videos(b)) => {
                a.extend(b);
                Ok(())
            }
            (_, other) => Err(other),
        }
    }
}

/// Renders messages with a plain ChatML layout, ending on an open assistant turn
pub fn render_chatml(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str("<|im_start|>");
        out.push_str(message.role.as_str());
        out.push('\n');
        out.push_str(&message.content);
        out.push_str("<|im_end|>\n");
    }
    out.push_str("<|im_start|>assistant\n");
    out
}
