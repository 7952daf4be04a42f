/// Voice note recording state machine
///
/// `idle -> recording -> (canceled | finalizing -> sent)`. Time is passed in
/// by the caller so the machine stays free of clocks.
use crate::upstream::VoiceNote;
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_VOICE_MIME: &str = "audio/ogg; codecs=opus";

/// Thresholds of a recording session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordingPolicy {
    /// Shorter recordings are discarded
    pub min_duration: Duration,
    /// Smaller recordings are discarded
    pub min_bytes: usize,
    /// Sliding this far to the left cancels (px)
    pub cancel_distance: f32,
    /// Recording stops on its own here
    pub max_duration: Duration,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_millis(800),
            min_bytes: 1024,
            cancel_distance: 80.0,
            max_duration: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Canceled,
    Finalizing,
    Sent,
}

/// Finished recording ready to be uploaded
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceUpload {
    pub mime_type: String,
    pub bytes: Bytes,
    pub duration: Duration,
}

impl From<VoiceUpload> for VoiceNote {
    fn from(upload: VoiceUpload) -> Self {
        VoiceNote {
            mime_type: upload.mime_type,
            bytes: upload.bytes,
        }
    }
}

pub struct VoiceRecorder {
    policy: RecordingPolicy,
    mime_type: String,
    state: RecorderState,
    started_at: Option<Instant>,
    buffer: BytesMut,
}

impl VoiceRecorder {
    pub fn new(policy: RecordingPolicy) -> Self {
        Self::with_mime_type(policy, DEFAULT_VOICE_MIME)
    }

    pub fn with_mime_type(policy: RecordingPolicy, mime_type: &str) -> Self {
        Self {
            policy,
            mime_type: mime_type.to_string(),
            state: RecorderState::Idle,
            started_at: None,
            buffer: BytesMut::new(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn recorded_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Begin a new recording. Refused while one is recording or uploading.
    pub fn start(&mut self, now: Instant) -> bool {
        match self.state {
            RecorderState::Recording | RecorderState::Finalizing => false,
            RecorderState::Idle | RecorderState::Canceled | RecorderState::Sent => {
                self.buffer.clear();
                self.started_at = Some(now);
                self.state = RecorderState::Recording;
                true
            }
        }
    }

    /// Append captured audio. Returns the upload if this chunk hit the time cap.
    pub fn push_chunk(&mut self, chunk: &[u8], now: Instant) -> Option<VoiceUpload> {
        if self.state != RecorderState::Recording {
            return None;
        }
        self.buffer.extend_from_slice(chunk);
        self.tick(now)
    }

    /// Horizontal drag offset of the record gesture (negative is left)
    pub fn slide(&mut self, dx: f32) {
        if self.state == RecorderState::Recording && dx <= -self.policy.cancel_distance {
            debug!("Voice recording canceled by slide ({}px)", dx);
            self.discard();
        }
    }

    /// Enforce the time cap
    pub fn tick(&mut self, now: Instant) -> Option<VoiceUpload> {
        if self.state != RecorderState::Recording || self.elapsed(now) < self.policy.max_duration {
            return None;
        }
        if self.buffer.len() < self.policy.min_bytes {
            debug!(
                "Voice recording reached {:?} with only {} bytes, discarded",
                self.policy.max_duration,
                self.buffer.len()
            );
            self.discard();
            return None;
        }
        debug!("Voice recording reached {:?}, finalizing", self.policy.max_duration);
        self.finalize(self.policy.max_duration)
    }

    /// Release of the record button
    pub fn stop(&mut self, now: Instant) -> Option<VoiceUpload> {
        if self.state != RecorderState::Recording {
            return None;
        }
        let elapsed = self.elapsed(now).min(self.policy.max_duration);
        if elapsed < self.policy.min_duration || self.buffer.len() < self.policy.min_bytes {
            debug!(
                "Voice recording too short ({:?}, {} bytes), discarded",
                elapsed,
                self.buffer.len()
            );
            self.discard();
            return None;
        }
        self.finalize(elapsed)
    }

    pub fn upload_confirmed(&mut self) {
        if self.state == RecorderState::Finalizing {
            self.state = RecorderState::Sent;
        }
    }

    pub fn upload_failed(&mut self) {
        if self.state == RecorderState::Finalizing {
            self.state = RecorderState::Idle;
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    fn finalize(&mut self, duration: Duration) -> Option<VoiceUpload> {
        self.state = RecorderState::Finalizing;
        self.started_at = None;
        Some(VoiceUpload {
            mime_type: self.mime_type.clone(),
            bytes: self.buffer.split().freeze(),
            duration,
        })
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.started_at = None;
        self.state = RecorderState::Canceled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (VoiceRecorder, Instant) {
        let mut rec = VoiceRecorder::new(RecordingPolicy::default());
        let t0 = Instant::now();
        assert!(rec.start(t0));
        (rec, t0)
    }

    #[test]
    fn test_short_recording_is_never_uploaded() {
        let (mut rec, t0) = recorder();
        rec.push_chunk(&[0u8; 500], t0 + Duration::from_millis(100));
        assert_eq!(rec.stop(t0 + Duration::from_millis(300)), None);
        assert_eq!(rec.state(), RecorderState::Canceled);
        assert_eq!(rec.recorded_bytes(), 0);
    }

    #[test]
    fn test_long_enough_but_too_small_is_discarded() {
        let (mut rec, t0) = recorder();
        rec.push_chunk(&[0u8; 500], t0 + Duration::from_millis(500));
        assert_eq!(rec.stop(t0 + Duration::from_secs(2)), None);
    }

    #[test]
    fn test_valid_recording_finalizes_then_sent() {
        let (mut rec, t0) = recorder();
        rec.push_chunk(&[1u8; 2048], t0 + Duration::from_millis(900));
        let upload = rec.stop(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(upload.bytes.len(), 2048);
        assert_eq!(upload.duration, Duration::from_secs(1));
        assert_eq!(rec.state(), RecorderState::Finalizing);
        assert!(!rec.start(t0 + Duration::from_secs(2)));

        rec.upload_confirmed();
        assert_eq!(rec.state(), RecorderState::Sent);
        let note: VoiceNote = upload.into();
        assert!(note.mime_type.starts_with("audio/"));
    }

    #[test]
    fn test_slide_cancels_regardless_of_time() {
        let (mut rec, t0) = recorder();
        rec.push_chunk(&[1u8; 4096], t0 + Duration::from_secs(5));
        rec.slide(-40.0);
        assert_eq!(rec.state(), RecorderState::Recording);
        rec.slide(-81.0);
        assert_eq!(rec.state(), RecorderState::Canceled);
        assert_eq!(rec.stop(t0 + Duration::from_secs(6)), None);
    }

    #[test]
    fn test_time_cap_forces_finalizing() {
        let (mut rec, t0) = recorder();
        assert!(rec.push_chunk(&[1u8; 4096], t0 + Duration::from_secs(60)).is_none());
        let upload = rec.tick(t0 + Duration::from_secs(120)).unwrap();
        assert_eq!(upload.duration, Duration::from_secs(120));
        assert_eq!(rec.state(), RecorderState::Finalizing);
    }

    #[test]
    fn test_time_cap_with_tiny_buffer_discards() {
        let (mut rec, t0) = recorder();
        assert!(rec.push_chunk(&[1u8; 100], t0 + Duration::from_secs(30)).is_none());
        assert!(rec.tick(t0 + Duration::from_secs(120)).is_none());
        assert_eq!(rec.state(), RecorderState::Canceled);
        // Nothing left to flush on release
        assert!(rec.stop(t0 + Duration::from_secs(121)).is_none());
    }

    #[test]
    fn test_failed_upload_returns_to_idle() {
        let (mut rec, t0) = recorder();
        rec.push_chunk(&[1u8; 4096], t0 + Duration::from_secs(1));
        rec.stop(t0 + Duration::from_secs(2)).unwrap();
        rec.upload_failed();
        assert_eq!(rec.state(), RecorderState::Idle);
        assert!(rec.start(t0 + Duration::from_secs(3)));
    }
}
