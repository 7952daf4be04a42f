/// Dashboard-side state: optimistic timelines and the voice recorder
pub mod reconciler;
pub mod recorder;

pub use reconciler::{PendingMessage, SendFailure, StatusMark, Timeline, TimelineEntry};
pub use recorder::{RecorderState, RecordingPolicy, VoiceRecorder, VoiceUpload};
