/// Collaborator seams: the upstream messaging session and the records store
///
/// Both are black boxes to this crate. Implementations live elsewhere
/// (an in-memory pair ships in `memory.rs` for demos and tests).
use crate::error::Result;
use crate::messenger_types::{Conversation, UpstreamMessage};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dashboard role of a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Manager,
    Agent,
}

/// Identity of the dashboard user making a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
}

impl Viewer {
    /// Agents only see conversations assigned to them
    pub fn is_restricted(&self) -> bool {
        self.role == Role::Agent
    }

    /// "First Last", falling back to the email, then to "Agent"
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if !full.is_empty() {
            full.to_string()
        } else if !self.email.is_empty() {
            self.email.clone()
        } else {
            "Agent".to_string()
        }
    }
}

/// What the upstream should list for a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerScope {
    All,
    Only(Vec<String>),
}

/// Raw page returned by the upstream session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPage {
    pub items: Vec<UpstreamMessage>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Media bytes as served by the upstream session
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPayload {
    pub bytes: Bytes,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

/// One file of an outbound media send
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Recorded voice note
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceNote {
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Connection check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(default)]
    pub phone: Option<String>,
}

/// The single, stateful, rate-limited upstream messaging session
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    async fn list_conversations(&self, scope: &ViewerScope) -> Result<Vec<Conversation>>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<UpstreamPage>;

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<UpstreamMessage>;

    async fn send_media(
        &self,
        conversation_id: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<Vec<UpstreamMessage>>;

    async fn send_voice(&self, conversation_id: &str, voice: VoiceNote) -> Result<UpstreamMessage>;

    /// `Ok(None)` when the upstream has no media for this message (yet)
    async fn fetch_media(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<MediaPayload>>;

    async fn connection_status(&self) -> Result<ConnectionStatus>;
}

/// Access-control and records collaborator
#[async_trait]
pub trait RecordsStore: Send + Sync {
    /// Resolve a viewer by id; `Ok(None)` for unknown ids
    async fn viewer(&self, viewer_id: &str) -> Result<Option<Viewer>>;

    /// Assignee viewer id per conversation (absent = unassigned)
    async fn assignments(&self, conversation_ids: &[String]) -> Result<HashMap<String, String>>;

    /// Conversations assigned to a viewer
    async fn assigned_to(&self, viewer_id: &str) -> Result<Vec<String>>;
}
