/// Shared types for the messenger layer
use serde::{Deserialize, Serialize};

/// Maximum number of wrapper layers peeled off a raw payload
pub const MAX_UNWRAP_DEPTH: usize = 6;

/// Delivery status of an outbound message
///
/// Ordered: a status never moves backwards once observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// Canonical message content, after wrapper resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    Video {
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    Audio {
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        seconds: Option<u32>,
        /// Client-held preview handle (never sent by the server)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_preview: Option<String>,
    },
    Document {
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        size: Option<u64>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        name: Option<String>,
    },
    System {
        #[serde(default)]
        note: Option<String>,
    },
    Unsupported,
}

impl MessageContent {
    /// Short preview for conversation lists and notifications
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::Image { .. } => "[Image]".to_string(),
            MessageContent::Video { .. } => "[Video]".to_string(),
            MessageContent::Audio { .. } => "[Voice message]".to_string(),
            MessageContent::Document { file_name: Some(name), .. } => format!("📄 {}", name),
            MessageContent::Document { .. } => "[Document]".to_string(),
            MessageContent::Location { .. } => "[Location]".to_string(),
            MessageContent::System { .. } => "[System]".to_string(),
            MessageContent::Unsupported => "New message".to_string(),
        }
    }

    /// Locally held preview resource, if any
    pub fn local_preview(&self) -> Option<&str> {
        match self {
            MessageContent::Audio { local_preview, .. } => local_preview.as_deref(),
            _ => None,
        }
    }
}

/// Payload shape as delivered by the upstream session.
///
/// Besides the closed set of content kinds, upstream may wrap the real
/// content in one or more envelope variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawContent {
    Content { content: MessageContent },
    Ephemeral { message: Box<RawContent> },
    ViewOnce { message: Box<RawContent> },
    DeviceSent { message: Box<RawContent> },
    Wrapped { message: Box<RawContent> },
}

impl RawContent {
    /// Resolve nested wrappers to the canonical inner content.
    ///
    /// Gives up after [`MAX_UNWRAP_DEPTH`] layers and reports `Unsupported`.
    pub fn unwrap_content(self) -> MessageContent {
        let mut current = self;
        for _ in 0..=MAX_UNWRAP_DEPTH {
            current = match current {
                RawContent::Content { content } => return content,
                RawContent::Ephemeral { message }
                | RawContent::ViewOnce { message }
                | RawContent::DeviceSent { message }
                | RawContent::Wrapped { message } => *message,
            };
        }
        MessageContent::Unsupported
    }
}

impl From<MessageContent> for RawContent {
    fn from(content: MessageContent) -> Self {
        RawContent::Content { content }
    }
}

/// Message as returned by the upstream session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub id: String,
    pub conversation_id: String,
    pub from_me: bool,
    /// RFC3339 timestamp
    pub timestamp: String,
    pub content: RawContent,
    #[serde(default)]
    pub status: Option<MessageStatus>,
}

/// Canonical message served to dashboard clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub from_me: bool,
    pub timestamp: String,
    pub content: MessageContent,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    /// Echo of the submitter's correlation id, when this message answers a send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl From<UpstreamMessage> for Message {
    fn from(m: UpstreamMessage) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            from_me: m.from_me,
            timestamp: m.timestamp,
            content: m.content.unwrap_content(),
            status: m.status,
            correlation_id: None,
        }
    }
}

/// Upstream conversation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message: Option<UpstreamMessage>,
}

/// Owner of an assigned conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: String,
    pub name: String,
}

/// Viewer-scoped projection of a conversation (list view in the dashboard)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation_id: String,
    pub name: String,
    pub unread_count: u32,
    /// Preview text of the last message
    pub last_preview: String,
    /// RFC3339 timestamp of the last message
    pub last_timestamp: Option<String>,
    pub owner: Option<Owner>,
}

/// One page of history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Real-time events streamed over SSE (/events endpoint)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessengerEvent {
    /// A new message arrived or was sent
    #[serde(rename = "message.new")]
    MessageNew {
        conversation_id: String,
        message: Message,
    },
    /// Delivery status of a message changed
    #[serde(rename = "message.status")]
    MessageStatus {
        conversation_id: String,
        message_id: String,
        status: MessageStatus,
    },
}

impl MessengerEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            MessengerEvent::MessageNew { conversation_id, .. }
            | MessengerEvent::MessageStatus { conversation_id, .. } => conversation_id,
        }
    }

    /// Wire name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            MessengerEvent::MessageNew { .. } => "message.new",
            MessengerEvent::MessageStatus { .. } => "message.status",
        }
    }
}
