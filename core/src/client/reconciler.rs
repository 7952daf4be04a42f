/// Optimistic send reconciliation for one conversation
///
/// A submitted message shows up at once as a pending entry. The send
/// response and the `message.new` event both carry the correlation id, and
/// whichever arrives first swaps the pending entry for the authoritative
/// message at the same position. The other one then finds nothing to do.
use crate::error::GatewayError;
use crate::messenger_types::{Message, MessageContent, MessageStatus, MessengerEvent};
use uuid::Uuid;

/// Locally rendered message waiting for the server
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub correlation_id: String,
    pub conversation_id: String,
    pub content: MessageContent,
    /// RFC3339 submission time
    pub submitted_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Pending(PendingMessage),
    Confirmed(Message),
}

/// Tick marks shown next to an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMark {
    /// Still sending (clock icon)
    Clock,
    /// Accepted by the server
    Single,
    /// Delivered to the recipient's device (grey)
    DoubleGrey,
    /// Read by the recipient (blue)
    DoubleBlue,
}

impl StatusMark {
    pub fn for_status(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Sent => StatusMark::Single,
            MessageStatus::Delivered => StatusMark::DoubleGrey,
            MessageStatus::Read => StatusMark::DoubleBlue,
        }
    }
}

impl TimelineEntry {
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            TimelineEntry::Pending(p) => Some(&p.correlation_id),
            TimelineEntry::Confirmed(m) => m.correlation_id.as_deref(),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            TimelineEntry::Pending(_) => None,
            TimelineEntry::Confirmed(m) => Some(&m.id),
        }
    }

    pub fn content(&self) -> &MessageContent {
        match self {
            TimelineEntry::Pending(p) => &p.content,
            TimelineEntry::Confirmed(m) => &m.content,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TimelineEntry::Pending(_))
    }

    /// Marks for outbound entries; inbound messages show none
    pub fn status_mark(&self) -> Option<StatusMark> {
        match self {
            TimelineEntry::Pending(_) => Some(StatusMark::Clock),
            TimelineEntry::Confirmed(m) if m.from_me => {
                Some(StatusMark::for_status(m.status.unwrap_or(MessageStatus::Sent)))
            }
            TimelineEntry::Confirmed(_) => None,
        }
    }
}

/// Notice handed to the UI when a send is abandoned
#[derive(Debug, Clone, PartialEq)]
pub struct SendFailure {
    pub correlation_id: String,
    pub conversation_id: String,
    /// The content that was not sent, so the user can retry it
    pub content: MessageContent,
    pub user_message: String,
    pub retryable: bool,
}

/// Ordered message list of one conversation as the dashboard renders it
#[derive(Debug, Clone)]
pub struct Timeline {
    conversation_id: String,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            entries: Vec::new(),
        }
    }

    /// Start from a fetched history page (oldest first)
    pub fn with_history(conversation_id: &str, history: Vec<Message>) -> Self {
        let mut timeline = Self::new(conversation_id);
        for message in history {
            timeline.merge_confirmed(message);
        }
        timeline
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    /// Append a pending entry and return its fresh correlation id
    pub fn submit(&mut self, content: MessageContent) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        self.entries.push(TimelineEntry::Pending(PendingMessage {
            correlation_id: correlation_id.clone(),
            conversation_id: self.conversation_id.clone(),
            content,
            submitted_at: chrono::Utc::now().to_rfc3339(),
        }));
        correlation_id
    }

    /// Apply the synchronous send response. Returns whether anything changed.
    pub fn confirm(&mut self, correlation_id: &str, mut message: Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        message.correlation_id = Some(correlation_id.to_string());
        message.status = Some(message.status.unwrap_or(MessageStatus::Sent).max(MessageStatus::Sent));

        let pending_at = self.pending_position(correlation_id);
        let existing_at = self.position_of(&message.id);

        match (pending_at, existing_at) {
            (Some(idx), existing) => {
                if let TimelineEntry::Pending(pending) = &self.entries[idx] {
                    carry_local_preview(&mut message.content, &pending.content);
                }
                if let Some(TimelineEntry::Confirmed(known)) = existing.map(|i| &self.entries[i]) {
                    message.status = message.status.max(known.status);
                }
                self.entries[idx] = TimelineEntry::Confirmed(message);
                // The same message also arrived without a correlation id
                if let Some(dup) = existing {
                    self.entries.remove(dup);
                }
                true
            }
            (None, Some(_)) => false,
            (None, None) => {
                self.entries.push(TimelineEntry::Confirmed(message));
                true
            }
        }
    }

    /// Apply a real-time event. Returns whether anything changed.
    pub fn apply_event(&mut self, event: &MessengerEvent) -> bool {
        if event.conversation_id() != self.conversation_id {
            return false;
        }
        match event {
            MessengerEvent::MessageNew { message, .. } => match message.correlation_id.clone() {
                Some(correlation_id) => self.confirm(&correlation_id, message.clone()),
                None => self.merge_confirmed(message.clone()),
            },
            MessengerEvent::MessageStatus {
                message_id, status, ..
            } => self.update_status(message_id, *status),
        }
    }

    /// Drop the pending entry of a failed send and describe the failure
    pub fn fail(&mut self, correlation_id: &str, error: &GatewayError) -> Option<SendFailure> {
        let idx = self.pending_position(correlation_id)?;
        match self.entries.remove(idx) {
            TimelineEntry::Pending(pending) => Some(SendFailure {
                correlation_id: pending.correlation_id,
                conversation_id: pending.conversation_id,
                content: pending.content,
                user_message: error.user_message(),
                retryable: error.is_retryable(),
            }),
            TimelineEntry::Confirmed(_) => None,
        }
    }

    fn update_status(&mut self, message_id: &str, status: MessageStatus) -> bool {
        let Some(idx) = self.position_of(message_id) else {
            return false;
        };
        match &mut self.entries[idx] {
            TimelineEntry::Confirmed(m) if m.status.map_or(true, |s| status > s) => {
                m.status = Some(status);
                true
            }
            _ => false,
        }
    }

    fn merge_confirmed(&mut self, message: Message) -> bool {
        match self.position_of(&message.id) {
            Some(_) => match message.status {
                Some(status) => self.update_status(&message.id, status),
                None => false,
            },
            None => {
                self.entries.push(TimelineEntry::Confirmed(message));
                true
            }
        }
    }

    fn pending_position(&self, correlation_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| match e {
            TimelineEntry::Pending(p) => p.correlation_id == correlation_id,
            TimelineEntry::Confirmed(_) => false,
        })
    }

    fn position_of(&self, message_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message_id() == Some(message_id))
    }
}

fn carry_local_preview(content: &mut MessageContent, pending: &MessageContent) {
    if let (MessageContent::Audio { local_preview, .. }, Some(preview)) =
        (content, pending.local_preview())
    {
        if local_preview.is_none() {
            *local_preview = Some(preview.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> MessageContent {
        MessageContent::Text { text: t.into() }
    }

    fn message(id: &str, from_me: bool, content: MessageContent) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            from_me,
            timestamp: "2024-05-01T10:00:00Z".into(),
            content,
            status: None,
            correlation_id: None,
        }
    }

    fn echoed(correlation_id: &str, id: &str) -> MessengerEvent {
        let mut m = message(id, true, text("hello"));
        m.correlation_id = Some(correlation_id.into());
        MessengerEvent::MessageNew {
            conversation_id: "c1".into(),
            message: m,
        }
    }

    #[test]
    fn test_response_then_event_keeps_one_entry_in_place() {
        let mut timeline = Timeline::with_history("c1", vec![message("m0", false, text("hi"))]);
        let corr = timeline.submit(text("hello"));
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.entries()[1].status_mark(), Some(StatusMark::Clock));

        assert!(timeline.confirm(&corr, message("m1", true, text("hello"))));
        assert!(!timeline.apply_event(&echoed(&corr, "m1")));

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.entries()[1].message_id(), Some("m1"));
        assert_eq!(timeline.entries()[1].status_mark(), Some(StatusMark::Single));
        assert_eq!(timeline.pending_count(), 0);
    }

    #[test]
    fn test_event_then_response_keeps_one_entry_in_place() {
        let mut timeline = Timeline::new("c1");
        let corr = timeline.submit(text("hello"));
        let later = timeline.submit(text("second"));

        assert!(timeline.apply_event(&echoed(&corr, "m1")));
        assert!(!timeline.confirm(&corr, message("m1", true, text("hello"))));

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.entries()[0].message_id(), Some("m1"));
        assert_eq!(timeline.entries()[1].correlation_id(), Some(later.as_str()));
    }

    #[test]
    fn test_uncorrelated_echo_is_folded_into_pending_entry() {
        let mut timeline = Timeline::new("c1");
        let corr = timeline.submit(text("hello"));
        let other = message("m1", true, text("hello"));
        timeline.apply_event(&MessengerEvent::MessageNew {
            conversation_id: "c1".into(),
            message: other.clone(),
        });
        assert_eq!(timeline.len(), 2);

        timeline.confirm(&corr, other);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].correlation_id(), Some(corr.as_str()));
    }

    #[test]
    fn test_local_audio_preview_survives_confirmation() {
        let mut timeline = Timeline::new("c1");
        let corr = timeline.submit(MessageContent::Audio {
            mime_type: Some("audio/ogg".into()),
            seconds: Some(3),
            local_preview: Some("blob:local-1".into()),
        });
        let server = message(
            "m7",
            true,
            MessageContent::Audio {
                mime_type: Some("audio/ogg".into()),
                seconds: Some(3),
                local_preview: None,
            },
        );
        timeline.confirm(&corr, server);
        assert_eq!(timeline.entries()[0].content().local_preview(), Some("blob:local-1"));
    }

    #[test]
    fn test_failure_removes_pending_and_reports() {
        let mut timeline = Timeline::new("c1");
        let corr = timeline.submit(text("hello"));
        let failure = timeline.fail(&corr, &GatewayError::NotConnected).unwrap();
        assert!(timeline.is_empty());
        assert!(failure.retryable);
        assert_eq!(failure.content, text("hello"));
        assert!(failure.user_message.contains("try again"));
        assert!(timeline.fail(&corr, &GatewayError::NotConnected).is_none());
    }

    #[test]
    fn test_status_never_regresses() {
        let mut timeline = Timeline::with_history("c1", vec![message("m1", true, text("x"))]);
        let status = |s| MessengerEvent::MessageStatus {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            status: s,
        };
        assert!(timeline.apply_event(&status(MessageStatus::Read)));
        assert!(!timeline.apply_event(&status(MessageStatus::Delivered)));
        assert_eq!(timeline.entries()[0].status_mark(), Some(StatusMark::DoubleBlue));
    }

    #[test]
    fn test_foreign_conversation_and_duplicates_ignored() {
        let mut timeline = Timeline::with_history("c1", vec![message("m1", false, text("x"))]);
        let mut foreign = message("m2", false, text("y"));
        foreign.conversation_id = "c2".into();
        assert!(!timeline.apply_event(&MessengerEvent::MessageNew {
            conversation_id: "c2".into(),
            message: foreign,
        }));
        assert!(!timeline.apply_event(&MessengerEvent::MessageNew {
            conversation_id: "c1".into(),
            message: message("m1", false, text("x")),
        }));
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.entries()[0].status_mark(), None);
    }
}
