/// Content-addressed media cache
///
/// Blobs are keyed by (conversation, message). Content never changes for a
/// message id, so entries only expire for space; absence is never cached.
use crate::coalescer::TtlCoalescer;
use crate::error::{GatewayError, Result};
use crate::upstream::UpstreamSession;
use crate::utils::Backoff;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Immutable media payload for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub conversation_id: String,
    pub message_id: String,
    pub bytes: Bytes,
    pub mime_type: String,
    pub file_name: Option<String>,
    /// RFC3339 fetch time
    pub fetched_at: String,
    /// Hex SHA-256 of `bytes`
    pub digest: String,
}

impl MediaBlob {
    pub fn new(
        conversation_id: &str,
        message_id: &str,
        bytes: Bytes,
        mime_type: Option<String>,
        file_name: Option<String>,
    ) -> Self {
        let digest = Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        Self {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            bytes,
            mime_type: mime_type
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            file_name,
            fetched_at: chrono::Utc::now().to_rfc3339(),
            digest,
        }
    }

    /// Strong validator for HTTP caching
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.digest)
    }

    /// `Cache-Control` value for a blob of `max_age`
    pub fn cache_control(max_age: Duration) -> String {
        format!("public, max-age={}, immutable", max_age.as_secs())
    }
}

/// Tuning for media fetches
#[derive(Debug, Clone, Copy)]
pub struct MediaConfig {
    pub ttl: Duration,
    /// Total attempts when the upstream reports "no such media"
    pub attempts: u32,
    pub backoff: Backoff,
    pub max_entries: usize,
    pub fetch_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            attempts: 3,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(2)),
            max_entries: 512,
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

/// Media cache fronting the upstream session
#[derive(Clone)]
pub struct MediaStore {
    upstream: Arc<dyn UpstreamSession>,
    cache: TtlCoalescer<Arc<MediaBlob>>,
    config: MediaConfig,
}

impl MediaStore {
    pub fn new(upstream: Arc<dyn UpstreamSession>, config: MediaConfig) -> Self {
        let cache = TtlCoalescer::new("media")
            .with_fetch_timeout(config.fetch_timeout)
            .with_max_entries(config.max_entries);
        info!(
            "Media store initialized (ttl {:?}, {} attempts)",
            config.ttl, config.attempts
        );
        Self {
            upstream,
            cache,
            config,
        }
    }

    pub fn cache_key(conversation_id: &str, message_id: &str) -> String {
        format!("media:{}:{}", conversation_id, message_id)
    }

    /// Fetch media for a message, sharing one upstream transfer among all callers
    pub async fn fetch(&self, conversation_id: &str, message_id: &str) -> Result<Arc<MediaBlob>> {
        let key = Self::cache_key(conversation_id, message_id);
        let upstream = self.upstream.clone();
        let config = self.config;
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();

        self.cache
            .get(&key, self.config.ttl, move || async move {
                fetch_with_retry(upstream, config, &conversation_id, &message_id)
                    .await
                    .map(Arc::new)
            })
            .await
    }

    /// Drop a cached blob (e.g. the message was deleted upstream)
    pub fn forget(&self, conversation_id: &str, message_id: &str) -> bool {
        self.cache.evict(&Self::cache_key(conversation_id, message_id))
    }

    /// Drop blobs past their lifetime
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_control(&self) -> String {
        MediaBlob::cache_control(self.config.ttl)
    }
}

async fn fetch_with_retry(
    upstream: Arc<dyn UpstreamSession>,
    config: MediaConfig,
    conversation_id: &str,
    message_id: &str,
) -> Result<MediaBlob> {
    let attempts = config.attempts.max(1);
    for attempt in 0..attempts {
        match upstream.fetch_media(conversation_id, message_id).await? {
            Some(payload) if !payload.bytes.is_empty() => {
                debug!(
                    "Fetched media {}:{} ({} bytes)",
                    conversation_id,
                    message_id,
                    payload.bytes.len()
                );
                return Ok(MediaBlob::new(
                    conversation_id,
                    message_id,
                    payload.bytes,
                    payload.mime_type,
                    payload.file_name,
                ));
            }
            _ if attempt + 1 < attempts => {
                let delay = config.backoff.delay(attempt);
                debug!(
                    "Media {}:{} not available yet, retrying in {:?}",
                    conversation_id, message_id, delay
                );
                tokio::time::sleep(delay).await;
            }
            _ => {}
        }
    }
    Err(GatewayError::NotFound(format!(
        "media {}:{}",
        conversation_id, message_id
    )))
}
