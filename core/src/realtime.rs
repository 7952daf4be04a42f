/// Real-time event fan-out to dashboard sessions
///
/// One subscription per session id; a newer subscription for the same
/// session ends the older one. Each subscription only yields events for
/// conversations its viewer may see. The hub never touches caches.
use crate::messenger_types::MessengerEvent;
use crate::upstream::{RecordsStore, Viewer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

struct SessionSlot {
    generation: u64,
    superseded: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct RealtimeHub {
    sender: broadcast::Sender<MessengerEvent>,
    sessions: Arc<Mutex<HashMap<String, SessionSlot>>>,
    next_generation: Arc<AtomicU64>,
    records: Arc<dyn RecordsStore>,
}

fn lock(m: &Mutex<HashMap<String, SessionSlot>>) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RealtimeHub {
    pub fn new(records: Arc<dyn RecordsStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
            records,
        }
    }

    /// Fan an event out to every live subscription; returns the receiver count
    pub fn publish(&self, event: MessengerEvent) -> usize {
        debug!("Publishing {} for {}", event.kind(), event.conversation_id());
        // No receivers is not an error: nobody is watching right now
        self.sender.send(event).unwrap_or(0)
    }

    /// Open the event stream for a dashboard session
    pub fn subscribe(&self, session_id: &str, viewer: Viewer) -> Subscription {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (superseded_tx, superseded_rx) = watch::channel(false);
        let previous = lock(&self.sessions).insert(
            session_id.to_string(),
            SessionSlot {
                generation,
                superseded: superseded_tx,
            },
        );
        if let Some(previous) = previous {
            info!("Session {} reconnected, closing older stream", session_id);
            let _ = previous.superseded.send(true);
        }

        Subscription {
            session_id: session_id.to_string(),
            generation,
            viewer,
            rx: self.sender.subscribe(),
            superseded: superseded_rx,
            pending: None,
            hub: self.clone(),
        }
    }

    /// Number of connected sessions
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    async fn can_view(&self, viewer: &Viewer, conversation_id: &str) -> bool {
        if !viewer.is_restricted() {
            return true;
        }
        match self.records.assignments(&[conversation_id.to_string()]).await {
            Ok(owners) => owners.get(conversation_id).map(String::as_str) == Some(viewer.id.as_str()),
            Err(e) => {
                warn!("Assignment lookup for {} failed: {}", conversation_id, e);
                false
            }
        }
    }

    fn release(&self, session_id: &str, generation: u64) {
        let mut sessions = lock(&self.sessions);
        if sessions.get(session_id).map(|s| s.generation) == Some(generation) {
            sessions.remove(session_id);
            debug!("Session {} disconnected", session_id);
        }
    }
}

/// Event stream of one dashboard session
pub struct Subscription {
    session_id: String,
    generation: u64,
    viewer: Viewer,
    rx: broadcast::Receiver<MessengerEvent>,
    superseded: watch::Receiver<bool>,
    /// Dequeued event still waiting on its visibility check
    pending: Option<MessengerEvent>,
    hub: RealtimeHub,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event this viewer may see; `None` once the stream is over.
    ///
    /// Cancel-safe: an event whose visibility check is interrupted stays
    /// buffered and is delivered by the next call.
    pub async fn recv(&mut self) -> Option<MessengerEvent> {
        loop {
            if *self.superseded.borrow() {
                return None;
            }
            if let Some(event) = &self.pending {
                let visible = self.hub.can_view(&self.viewer, event.conversation_id()).await;
                let event = self.pending.take();
                if visible {
                    return event;
                }
                continue;
            }
            let received = tokio::select! {
                received = self.rx.recv() => received,
                changed = self.superseded.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
            };
            match received {
                Ok(event) => self.pending = Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Client is too slow: skip what was dropped and keep going
                    warn!("Session {} lagged {} events", self.session_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.release(&self.session_id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRecords;
    use crate::messenger_types::{Message, MessageContent, MessageStatus};
    use crate::error::Result;
    use crate::upstream::Role;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Records store whose assignment lookups take a while
    struct SlowRecords {
        inner: InMemoryRecords,
        delay: Duration,
    }

    #[async_trait]
    impl RecordsStore for SlowRecords {
        async fn viewer(&self, viewer_id: &str) -> Result<Option<Viewer>> {
            self.inner.viewer(viewer_id).await
        }

        async fn assignments(
            &self,
            conversation_ids: &[String],
        ) -> Result<HashMap<String, String>> {
            tokio::time::sleep(self.delay).await;
            self.inner.assignments(conversation_ids).await
        }

        async fn assigned_to(&self, viewer_id: &str) -> Result<Vec<String>> {
            self.inner.assigned_to(viewer_id).await
        }
    }

    fn viewer(id: &str, role: Role) -> Viewer {
        Viewer {
            id: id.into(),
            role,
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
        }
    }

    fn new_message(conversation_id: &str) -> MessengerEvent {
        MessengerEvent::MessageNew {
            conversation_id: conversation_id.into(),
            message: Message {
                id: "m1".into(),
                conversation_id: conversation_id.into(),
                from_me: false,
                timestamp: "2024-01-01T00:00:00Z".into(),
                content: MessageContent::Text { text: "hi".into() },
                status: None,
                correlation_id: None,
            },
        }
    }

    #[tokio::test]
    async fn test_agent_only_sees_assigned_conversations() {
        let records = Arc::new(InMemoryRecords::new());
        records.assign("c-mine", "agent-1");
        let hub = RealtimeHub::new(records, 16);

        let mut admin = hub.subscribe("s-admin", viewer("admin-1", Role::Admin));
        let mut agent = hub.subscribe("s-agent", viewer("agent-1", Role::Agent));

        hub.publish(new_message("c-other"));
        hub.publish(MessengerEvent::MessageStatus {
            conversation_id: "c-mine".into(),
            message_id: "m9".into(),
            status: MessageStatus::Read,
        });

        assert_eq!(admin.recv().await.unwrap().conversation_id(), "c-other");
        assert_eq!(admin.recv().await.unwrap().kind(), "message.status");
        let seen = agent.recv().await.unwrap();
        assert_eq!(seen.conversation_id(), "c-mine");
    }

    #[tokio::test]
    async fn test_resubscribe_supersedes_older_stream() {
        let hub = RealtimeHub::new(Arc::new(InMemoryRecords::new()), 16);
        let mut first = hub.subscribe("s1", viewer("u1", Role::User));
        let mut second = hub.subscribe("s1", viewer("u1", Role::User));
        assert_eq!(hub.session_count(), 1);

        let ended = tokio::time::timeout(Duration::from_secs(1), first.recv()).await;
        assert_eq!(ended.unwrap(), None);

        hub.publish(new_message("c1"));
        assert!(second.recv().await.is_some());

        drop(first);
        assert_eq!(hub.session_count(), 1);
        drop(second);
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_recv_keeps_event() {
        let inner = InMemoryRecords::new();
        inner.assign("c-mine", "agent-1");
        let records = SlowRecords {
            inner,
            delay: Duration::from_secs(2),
        };
        let hub = RealtimeHub::new(Arc::new(records), 16);
        let mut agent = hub.subscribe("s-agent", viewer("agent-1", Role::Agent));

        hub.publish(new_message("c-mine"));
        // Give up while the assignment lookup is still running, as an idle tick would
        let cut = tokio::time::timeout(Duration::from_millis(500), agent.recv()).await;
        assert!(cut.is_err());

        let event = tokio::time::timeout(Duration::from_secs(5), agent.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.conversation_id(), "c-mine");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = RealtimeHub::new(Arc::new(InMemoryRecords::new()), 4);
        assert_eq!(hub.publish(new_message("c1")), 0);
    }
}
