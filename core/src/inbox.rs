/// Inbox service: the API layer between dashboard requests and the upstream session
///
/// Owns the read caches, the send chains, the media store and the event hub.
/// Created once at startup and shared by every request handler.
use crate::coalescer::{CacheStats, TtlCoalescer};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::media_store::{MediaBlob, MediaConfig, MediaStore};
use crate::messenger_types::{
    Conversation, ConversationView, Message, MessagePage, MessageStatus, MessengerEvent, Owner,
    UpstreamMessage,
};
use crate::realtime::{RealtimeHub, Subscription};
use crate::send_serializer::SendSerializer;
use crate::upstream::{
    ConnectionStatus, OutgoingFile, RecordsStore, UpstreamSession, Viewer, ViewerScope, VoiceNote,
};
use crate::utils::Backoff;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Most files accepted by one media send
pub const MAX_MEDIA_FILES: usize = 30;
/// Largest accepted voice note
pub const MAX_VOICE_BYTES: usize = 16 * 1024 * 1024;

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub connected: bool,
    pub phone: Option<String>,
    pub sessions: usize,
    pub active_send_chains: usize,
    pub cached_media: usize,
    pub conversation_cache_hits: u64,
    pub conversation_cache_fetches: u64,
    pub message_cache_hits: u64,
    pub message_cache_fetches: u64,
}

#[derive(Clone)]
pub struct InboxService {
    config: Config,
    upstream: Arc<dyn UpstreamSession>,
    records: Arc<dyn RecordsStore>,
    conversations: TtlCoalescer<Arc<Vec<ConversationView>>>,
    messages: TtlCoalescer<Arc<MessagePage>>,
    media: MediaStore,
    sends: SendSerializer,
    hub: RealtimeHub,
}

impl InboxService {
    pub fn new(
        config: Config,
        upstream: Arc<dyn UpstreamSession>,
        records: Arc<dyn RecordsStore>,
    ) -> Self {
        let media = MediaStore::new(
            upstream.clone(),
            MediaConfig {
                ttl: config.media_ttl,
                attempts: config.media_attempts,
                backoff: Backoff::new(config.media_retry_base, config.media_retry_base * 8),
                max_entries: config.media_max_entries,
                fetch_timeout: config.fetch_timeout,
            },
        );
        let hub = RealtimeHub::new(records.clone(), config.event_capacity);
        info!(
            "Inbox service ready (conversations ttl {:?}, messages ttl {:?})",
            config.conversations_ttl, config.messages_ttl
        );

        Self {
            conversations: TtlCoalescer::new("conversations")
                .with_fetch_timeout(config.fetch_timeout),
            messages: TtlCoalescer::new("messages").with_fetch_timeout(config.fetch_timeout),
            media,
            sends: SendSerializer::new(),
            hub,
            config,
            upstream,
            records,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    pub fn conversations_cache_key(viewer_id: &str) -> String {
        format!("conversations:{}", viewer_id)
    }

    pub fn messages_cache_key(
        conversation_id: &str,
        viewer_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> String {
        format!(
            "messages:{}:{}:{}:{}",
            conversation_id,
            viewer_id,
            before.unwrap_or(""),
            limit
        )
    }

    /// Resolve the viewer behind a request; unknown ids are refused
    pub async fn viewer(&self, viewer_id: &str) -> Result<Viewer> {
        self.records
            .viewer(viewer_id)
            .await?
            .ok_or(GatewayError::Forbidden)
    }

    /// Agents may only touch conversations assigned to them
    pub async fn authorize(&self, viewer: &Viewer, conversation_id: &str) -> Result<()> {
        if !viewer.is_restricted() {
            return Ok(());
        }
        let owners = self
            .records
            .assignments(&[conversation_id.to_string()])
            .await?;
        if owners.get(conversation_id).map(String::as_str) == Some(viewer.id.as_str()) {
            Ok(())
        } else {
            debug!("Viewer {} refused for {}", viewer.id, conversation_id);
            Err(GatewayError::Forbidden)
        }
    }

    /// Viewer-scoped conversation list, newest activity first
    pub async fn list_conversations(&self, viewer: &Viewer) -> Result<Arc<Vec<ConversationView>>> {
        let key = Self::conversations_cache_key(&viewer.id);
        let upstream = self.upstream.clone();
        let records = self.records.clone();
        let viewer = viewer.clone();

        self.conversations
            .get(&key, self.config.conversations_ttl, move || async move {
                project_conversations(upstream, records, &viewer).await.map(Arc::new)
            })
            .await
    }

    /// One page of history for a conversation
    pub async fn list_messages(
        &self,
        viewer: &Viewer,
        conversation_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Arc<MessagePage>> {
        self.authorize(viewer, conversation_id).await?;
        let limit = self.config.page_limit(limit);
        let key = Self::messages_cache_key(conversation_id, &viewer.id, before, limit);
        let upstream = self.upstream.clone();
        let conversation_id = conversation_id.to_string();
        let before = before.map(str::to_string);

        self.messages
            .get(&key, self.config.messages_ttl, move || async move {
                let page = upstream
                    .list_messages(&conversation_id, limit, before.as_deref())
                    .await?;
                Ok(Arc::new(MessagePage {
                    items: page.items.into_iter().map(Message::from).collect(),
                    has_more: page.has_more,
                    next_cursor: page.next_cursor,
                }))
            })
            .await
    }

    /// Send a text message, serialized behind earlier sends to the same conversation
    pub async fn send_text(
        &self,
        viewer: &Viewer,
        conversation_id: &str,
        text: &str,
        correlation_id: Option<String>,
    ) -> Result<Message> {
        self.authorize(viewer, conversation_id).await?;
        if text.trim().is_empty() {
            return Err(GatewayError::InvalidPayload("text required".to_string()));
        }
        let body = if viewer.is_restricted() && self.config.agent_signature {
            format!("*{}:*\n{}", viewer.display_name(), text)
        } else {
            text.to_string()
        };

        let upstream = self.upstream.clone();
        let conversation = conversation_id.to_string();
        let mut sent = self
            .serialized_send(
                conversation_id,
                move || async move {
                    upstream.send_text(&conversation, &body).await.map(|m| vec![m])
                },
                correlation_id,
            )
            .await?;
        sent.pop()
            .ok_or_else(|| GatewayError::Upstream("send returned no message".to_string()))
    }

    /// Send up to [`MAX_MEDIA_FILES`] files in one go
    pub async fn send_media(
        &self,
        viewer: &Viewer,
        conversation_id: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<Vec<Message>> {
        self.authorize(viewer, conversation_id).await?;
        if files.is_empty() {
            return Err(GatewayError::InvalidPayload("files required".to_string()));
        }
        if files.len() > MAX_MEDIA_FILES {
            return Err(GatewayError::InvalidPayload(format!(
                "at most {} files per send",
                MAX_MEDIA_FILES
            )));
        }
        if let Some(empty) = files.iter().find(|f| f.bytes.is_empty()) {
            return Err(GatewayError::InvalidPayload(format!("{} is empty", empty.file_name)));
        }

        let upstream = self.upstream.clone();
        let conversation = conversation_id.to_string();
        self.serialized_send(
            conversation_id,
            move || async move { upstream.send_media(&conversation, files).await },
            None,
        )
        .await
    }

    /// Send a recorded voice note
    pub async fn send_voice(
        &self,
        viewer: &Viewer,
        conversation_id: &str,
        voice: VoiceNote,
        correlation_id: Option<String>,
    ) -> Result<Message> {
        self.authorize(viewer, conversation_id).await?;
        if voice.bytes.is_empty() {
            return Err(GatewayError::InvalidPayload("voice file required".to_string()));
        }
        if voice.bytes.len() > MAX_VOICE_BYTES {
            return Err(GatewayError::InvalidPayload("voice note too large".to_string()));
        }
        if !voice.mime_type.starts_with("audio/") {
            return Err(GatewayError::InvalidPayload(format!(
                "unsupported voice type {}",
                voice.mime_type
            )));
        }

        let upstream = self.upstream.clone();
        let conversation = conversation_id.to_string();
        let mut sent = self
            .serialized_send(
                conversation_id,
                move || async move {
                    upstream.send_voice(&conversation, voice).await.map(|m| vec![m])
                },
                correlation_id,
            )
            .await?;
        sent.pop()
            .ok_or_else(|| GatewayError::Upstream("send returned no message".to_string()))
    }

    /// Media bytes for a message the viewer may see
    pub async fn fetch_media(
        &self,
        viewer: &Viewer,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Arc<MediaBlob>> {
        self.authorize(viewer, conversation_id).await?;
        self.media.fetch(conversation_id, message_id).await
    }

    pub fn media_cache_control(&self) -> String {
        self.media.cache_control()
    }

    /// A message arrived from the upstream session
    pub fn ingest_upstream_message(&self, message: UpstreamMessage) {
        let message = Message::from(message);
        self.announce(message);
    }

    /// The upstream reported a delivery status change
    pub fn ingest_status(&self, conversation_id: &str, message_id: &str, status: MessageStatus) {
        self.hub.publish(MessengerEvent::MessageStatus {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            status,
        });
    }

    /// Open the event stream for a dashboard session
    pub fn subscribe(&self, session_id: &str, viewer: Viewer) -> Subscription {
        self.hub.subscribe(session_id, viewer)
    }

    pub async fn status(&self) -> Result<GatewayStatus> {
        let lookup = self.upstream.connection_status();
        let connection = match timeout(self.config.fetch_timeout, lookup).await {
            Ok(result) => result?,
            Err(_) => ConnectionStatus {
                connected: false,
                phone: None,
            },
        };
        let conversations: CacheStats = self.conversations.stats();
        let messages: CacheStats = self.messages.stats();
        Ok(GatewayStatus {
            connected: connection.connected,
            phone: connection.phone,
            sessions: self.hub.session_count(),
            active_send_chains: self.sends.active_chains(),
            cached_media: self.media.cached(),
            conversation_cache_hits: conversations.hits,
            conversation_cache_fetches: conversations.fetches,
            message_cache_hits: messages.hits,
            message_cache_fetches: messages.fetches,
        })
    }

    /// Sweep expired entries out of every cache
    pub fn purge_expired(&self) -> usize {
        let purged = self.conversations.purge_expired()
            + self.messages.purge_expired()
            + self.media.purge_expired();
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        purged
    }

    /// Drop cached views touched by a new message in `conversation_id`
    pub fn invalidate_conversation(&self, conversation_id: &str) {
        // Every viewer's list may carry this conversation's preview and ordering
        self.conversations.evict_prefix("conversations:");
        self.messages
            .evict_prefix(&format!("messages:{}:", conversation_id));
    }

    async fn serialized_send<F, Fut>(
        &self,
        conversation_id: &str,
        send: F,
        correlation_id: Option<String>,
    ) -> Result<Vec<Message>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<UpstreamMessage>>> + Send + 'static,
    {
        let service = self.clone();
        let conversation = conversation_id.to_string();
        let limit = self.config.fetch_timeout;

        self.sends
            .enqueue(conversation_id, move || async move {
                let sent = match timeout(limit, send()).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout(format!(
                        "send to {} exceeded {:?}",
                        conversation, limit
                    ))),
                };
                let sent = match sent {
                    Ok(sent) => sent,
                    Err(e) => {
                        warn!("Send to {} failed: {}", conversation, e);
                        return Err(e);
                    }
                };

                let mut messages: Vec<Message> = sent.into_iter().map(Message::from).collect();
                if let Some(last) = messages.last_mut() {
                    last.correlation_id = correlation_id;
                }
                for message in &messages {
                    service.announce(message.clone());
                }
                Ok(messages)
            })
            .await
    }

    fn announce(&self, message: Message) {
        self.invalidate_conversation(&message.conversation_id);
        self.hub.publish(MessengerEvent::MessageNew {
            conversation_id: message.conversation_id.clone(),
            message,
        });
    }
}

async fn project_conversations(
    upstream: Arc<dyn UpstreamSession>,
    records: Arc<dyn RecordsStore>,
    viewer: &Viewer,
) -> Result<Vec<ConversationView>> {
    let scope = if viewer.is_restricted() {
        ViewerScope::Only(records.assigned_to(&viewer.id).await?)
    } else {
        ViewerScope::All
    };
    if scope == ViewerScope::Only(Vec::new()) {
        return Ok(Vec::new());
    }

    let mut conversations: Vec<Conversation> = upstream.list_conversations(&scope).await?;
    if let ViewerScope::Only(allowed) = &scope {
        let allowed: HashSet<&String> = allowed.iter().collect();
        conversations.retain(|c| allowed.contains(&c.id));
    }

    let ids: Vec<String> = conversations.iter().map(|c| c.id.clone()).collect();
    let assignments = records.assignments(&ids).await?;
    let owner_ids: HashSet<&String> = assignments.values().collect();
    let mut owner_names: HashMap<String, String> = HashMap::new();
    for owner_id in owner_ids {
        let name = match records.viewer(owner_id).await? {
            Some(owner) => owner.display_name(),
            None => "Agent".to_string(),
        };
        owner_names.insert(owner_id.clone(), name);
    }

    let mut views: Vec<ConversationView> = conversations
        .into_iter()
        .map(|c| {
            let owner = assignments.get(&c.id).map(|owner_id| Owner {
                id: owner_id.clone(),
                name: owner_names
                    .get(owner_id)
                    .cloned()
                    .unwrap_or_else(|| "Agent".to_string()),
            });
            let last = c.last_message.map(Message::from);
            ConversationView {
                conversation_id: c.id,
                name: c.name,
                unread_count: c.unread_count,
                last_preview: last.as_ref().map(|m| m.content.preview()).unwrap_or_default(),
                last_timestamp: last.map(|m| m.timestamp),
                owner,
            }
        })
        .collect();
    views.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryRecords, InMemoryUpstream};
    use crate::upstream::Role;

    fn viewer(id: &str, role: Role, first: &str) -> Viewer {
        Viewer {
            id: id.into(),
            role,
            first_name: first.into(),
            last_name: String::new(),
            email: format!("{}@example.com", id),
        }
    }

    fn setup() -> (InboxService, Arc<InMemoryUpstream>, Arc<InMemoryRecords>) {
        let upstream = Arc::new(InMemoryUpstream::new());
        upstream.add_conversation("c1", "Alice");
        upstream.add_conversation("c2", "Bob");
        let records = Arc::new(InMemoryRecords::new());
        records.add_viewer(viewer("admin", Role::Admin, "Ada"));
        records.add_viewer(viewer("agent", Role::Agent, "Sam"));
        records.assign("c2", "agent");
        let service = InboxService::new(Config::default(), upstream.clone(), records.clone());
        (service, upstream, records)
    }

    #[tokio::test]
    async fn test_projection_includes_owner_and_scope() {
        let (service, _upstream, _records) = setup();
        let admin = service.viewer("admin").await.unwrap();
        let agent = service.viewer("agent").await.unwrap();

        let all = service.list_conversations(&admin).await.unwrap();
        assert_eq!(all.len(), 2);
        let bob = all.iter().find(|c| c.conversation_id == "c2").unwrap();
        assert_eq!(bob.owner.as_ref().unwrap().name, "Sam");

        let mine = service.list_conversations(&agent).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].conversation_id, "c2");
    }

    #[tokio::test]
    async fn test_agent_refused_for_unassigned_chat() {
        let (service, upstream, _records) = setup();
        let agent = service.viewer("agent").await.unwrap();
        let err = service.send_text(&agent, "c1", "hello", None).await.unwrap_err();
        assert_eq!(err, GatewayError::Forbidden);
        assert_eq!(upstream.sends(), 0);
        assert!(service.viewer("nobody").await.is_err());
    }

    #[tokio::test]
    async fn test_agent_signature_prefix() {
        let (service, upstream, _records) = setup();
        let agent = service.viewer("agent").await.unwrap();
        service.send_text(&agent, "c2", "on my way", None).await.unwrap();
        assert_eq!(upstream.sent_texts("c2"), vec!["*Sam:*\non my way".to_string()]);
    }

    #[tokio::test]
    async fn test_send_echoes_correlation_id_and_publishes() {
        let (service, _upstream, _records) = setup();
        let admin = service.viewer("admin").await.unwrap();
        let mut events = service.subscribe("s1", admin.clone());

        let sent = service
            .send_text(&admin, "c1", "hello", Some("corr-1".into()))
            .await
            .unwrap();
        assert_eq!(sent.correlation_id.as_deref(), Some("corr-1"));

        match events.recv().await.unwrap() {
            MessengerEvent::MessageNew { message, .. } => {
                assert_eq!(message.id, sent.id);
                assert_eq!(message.correlation_id.as_deref(), Some("corr-1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_errors_are_classified() {
        let (service, upstream, _records) = setup();
        let admin = service.viewer("admin").await.unwrap();

        upstream.fail_next_send("wa-number-not-registered");
        let err = service.send_text(&admin, "c1", "hi", None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        upstream.set_connected(false);
        let err = service.send_text(&admin, "c1", "hi", None).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 503);

        let err = service.send_text(&admin, "c1", "   ", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_stale_views() {
        let (service, _upstream, _records) = setup();
        let admin = service.viewer("admin").await.unwrap();
        service.list_conversations(&admin).await.unwrap();
        service.list_messages(&admin, "c1", None, None).await.unwrap();
        assert_eq!(service.purge_expired(), 0);

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        assert_eq!(service.purge_expired(), 2);
    }

    #[tokio::test]
    async fn test_voice_validation() {
        let (service, upstream, _records) = setup();
        let admin = service.viewer("admin").await.unwrap();
        let bad = VoiceNote {
            mime_type: "text/plain".into(),
            bytes: bytes::Bytes::from_static(b"not audio"),
        };
        assert!(service.send_voice(&admin, "c1", bad, None).await.is_err());
        assert_eq!(upstream.sends(), 0);
    }
}
