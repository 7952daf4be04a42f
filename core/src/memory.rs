/// In-memory collaborators for the demo binary and tests
///
/// `InMemoryUpstream` stands in for the real messaging session and counts
/// every call so cache behaviour can be observed from the outside.
use crate::error::{GatewayError, Result};
use crate::messenger_types::{Conversation, MessageContent, MessageStatus, UpstreamMessage};
use crate::upstream::{
    ConnectionStatus, MediaPayload, OutgoingFile, RecordsStore, UpstreamPage, UpstreamSession,
    Viewer, ViewerScope, VoiceNote,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct UpstreamData {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<UpstreamMessage>>,
    media: HashMap<(String, String), MediaPayload>,
    /// Failure reasons handed out to the next sends, in order
    send_failures: VecDeque<String>,
    in_flight_sends: HashMap<String, usize>,
}

#[derive(Default)]
pub struct InMemoryUpstream {
    data: Mutex<UpstreamData>,
    disconnected: AtomicBool,
    send_delay_ms: AtomicUsize,
    media_delay_ms: AtomicUsize,
    next_id: AtomicUsize,
    conversation_lists: AtomicUsize,
    message_lists: AtomicUsize,
    media_fetches: AtomicUsize,
    sends: AtomicUsize,
    overlapping_sends: AtomicUsize,
}

impl InMemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_conversation(&self, id: &str, name: &str) {
        lock(&self.data).conversations.push(Conversation {
            id: id.to_string(),
            name: name.to_string(),
            unread_count: 0,
            last_message: None,
        });
    }

    /// Simulate an inbound message from the network
    pub fn receive_text(&self, conversation_id: &str, text: &str) -> UpstreamMessage {
        let msg = self.make_message(conversation_id, false, MessageContent::Text { text: text.to_string() });
        self.record(msg.clone());
        msg
    }

    pub fn put_media(&self, conversation_id: &str, message_id: &str, payload: MediaPayload) {
        lock(&self.data)
            .media
            .insert((conversation_id.to_string(), message_id.to_string()), payload);
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Make every send take this long (to expose overlapping sends)
    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Make every media download take this long
    pub fn set_media_delay(&self, delay: Duration) {
        self.media_delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Fail the next send with an upstream reason code
    pub fn fail_next_send(&self, reason: &str) {
        lock(&self.data).send_failures.push_back(reason.to_string());
    }

    pub fn conversation_lists(&self) -> usize {
        self.conversation_lists.load(Ordering::SeqCst)
    }

    pub fn message_lists(&self) -> usize {
        self.message_lists.load(Ordering::SeqCst)
    }

    pub fn media_fetches(&self) -> usize {
        self.media_fetches.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Sends that started while another send to the same conversation was running
    pub fn overlapping_sends(&self) -> usize {
        self.overlapping_sends.load(Ordering::SeqCst)
    }

    pub fn sent_texts(&self, conversation_id: &str) -> Vec<String> {
        lock(&self.data)
            .messages
            .get(conversation_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.from_me)
                    .filter_map(|m| match m.content.clone().unwrap_content() {
                        MessageContent::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn make_message(&self, conversation_id: &str, from_me: bool, content: MessageContent) -> UpstreamMessage {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        UpstreamMessage {
            id: format!("m{}", n + 1),
            conversation_id: conversation_id.to_string(),
            from_me,
            timestamp: chrono::Utc::now().to_rfc3339(),
            content: content.into(),
            status: from_me.then_some(MessageStatus::Sent),
        }
    }

    fn record(&self, msg: UpstreamMessage) {
        let mut data = lock(&self.data);
        if let Some(conv) = data.conversations.iter_mut().find(|c| c.id == msg.conversation_id) {
            conv.last_message = Some(msg.clone());
            if !msg.from_me {
                conv.unread_count += 1;
            }
        }
        data.messages.entry(msg.conversation_id.clone()).or_default().push(msg);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(GatewayError::NotConnected)
        } else {
            Ok(())
        }
    }

    async fn run_send(&self, conversation_id: &str, content: MessageContent) -> Result<UpstreamMessage> {
        self.ensure_connected()?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        {
            let mut data = lock(&self.data);
            let running = data.in_flight_sends.entry(conversation_id.to_string()).or_default();
            if *running > 0 {
                self.overlapping_sends.fetch_add(1, Ordering::SeqCst);
            }
            *running += 1;
        }

        let delay = self.send_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failure = {
            let mut data = lock(&self.data);
            if let Some(running) = data.in_flight_sends.get_mut(conversation_id) {
                *running = running.saturating_sub(1);
            }
            data.send_failures.pop_front()
        };
        if let Some(reason) = failure {
            return Err(GatewayError::from_upstream_reason(&reason));
        }

        let msg = self.make_message(conversation_id, true, content);
        self.record(msg.clone());
        Ok(msg)
    }
}

#[async_trait]
impl UpstreamSession for InMemoryUpstream {
    async fn list_conversations(&self, scope: &ViewerScope) -> Result<Vec<Conversation>> {
        self.ensure_connected()?;
        self.conversation_lists.fetch_add(1, Ordering::SeqCst);
        let data = lock(&self.data);
        Ok(data
            .conversations
            .iter()
            .filter(|c| match scope {
                ViewerScope::All => true,
                ViewerScope::Only(ids) => ids.contains(&c.id),
            })
            .cloned()
            .collect())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<UpstreamPage> {
        self.ensure_connected()?;
        self.message_lists.fetch_add(1, Ordering::SeqCst);
        let data = lock(&self.data);
        let all = data.messages.get(conversation_id).cloned().unwrap_or_default();
        let end = match before {
            Some(id) => all.iter().position(|m| m.id == id).unwrap_or(all.len()),
            None => all.len(),
        };
        let start = end.saturating_sub(limit);
        let items = all[start..end].to_vec();
        let has_more = start > 0;
        Ok(UpstreamPage {
            next_cursor: if has_more { items.first().map(|m| m.id.clone()) } else { None },
            items,
            has_more,
        })
    }

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<UpstreamMessage> {
        self.run_send(conversation_id, MessageContent::Text { text: text.to_string() })
            .await
    }

    async fn send_media(
        &self,
        conversation_id: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<Vec<UpstreamMessage>> {
        let mut sent = Vec::with_capacity(files.len());
        for file in files {
            let content = if file.mime_type.starts_with("image/") {
                MessageContent::Image { caption: None, mime_type: Some(file.mime_type.clone()) }
            } else if file.mime_type.starts_with("video/") {
                MessageContent::Video { caption: None, mime_type: Some(file.mime_type.clone()) }
            } else {
                MessageContent::Document {
                    file_name: Some(file.file_name.clone()),
                    mime_type: Some(file.mime_type.clone()),
                    size: Some(file.bytes.len() as u64),
                }
            };
            let msg = self.run_send(conversation_id, content).await?;
            self.put_media(
                conversation_id,
                &msg.id,
                MediaPayload {
                    bytes: file.bytes,
                    mime_type: Some(file.mime_type),
                    file_name: Some(file.file_name),
                },
            );
            sent.push(msg);
        }
        Ok(sent)
    }

    async fn send_voice(&self, conversation_id: &str, voice: VoiceNote) -> Result<UpstreamMessage> {
        let content = MessageContent::Audio {
            mime_type: Some(voice.mime_type.clone()),
            seconds: None,
            local_preview: None,
        };
        let msg = self.run_send(conversation_id, content).await?;
        self.put_media(
            conversation_id,
            &msg.id,
            MediaPayload {
                bytes: voice.bytes,
                mime_type: Some(voice.mime_type),
                file_name: None,
            },
        );
        Ok(msg)
    }

    async fn fetch_media(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<MediaPayload>> {
        self.ensure_connected()?;
        self.media_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.media_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let data = lock(&self.data);
        Ok(data
            .media
            .get(&(conversation_id.to_string(), message_id.to_string()))
            .cloned())
    }

    async fn connection_status(&self) -> Result<ConnectionStatus> {
        Ok(ConnectionStatus {
            connected: !self.disconnected.load(Ordering::SeqCst),
            phone: None,
        })
    }
}

/// Viewer and assignment records held in memory
#[derive(Default)]
pub struct InMemoryRecords {
    viewers: Mutex<HashMap<String, Viewer>>,
    assignments: Mutex<HashMap<String, String>>,
}

impl InMemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_viewer(&self, viewer: Viewer) {
        lock(&self.viewers).insert(viewer.id.clone(), viewer);
    }

    pub fn assign(&self, conversation_id: &str, viewer_id: &str) {
        lock(&self.assignments).insert(conversation_id.to_string(), viewer_id.to_string());
    }
}

#[async_trait]
impl RecordsStore for InMemoryRecords {
    async fn viewer(&self, viewer_id: &str) -> Result<Option<Viewer>> {
        Ok(lock(&self.viewers).get(viewer_id).cloned())
    }

    async fn assignments(&self, conversation_ids: &[String]) -> Result<HashMap<String, String>> {
        let assignments = lock(&self.assignments);
        Ok(conversation_ids
            .iter()
            .filter_map(|id| assignments.get(id).map(|owner| (id.clone(), owner.clone())))
            .collect())
    }

    async fn assigned_to(&self, viewer_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = lock(&self.assignments)
            .iter()
            .filter(|(_, owner)| owner.as_str() == viewer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
