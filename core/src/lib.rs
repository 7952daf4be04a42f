/// Inbox gateway core
///
/// Fronting layer between a multi-user dashboard and one rate-limited
/// upstream messaging session: coalescing TTL caches, per-conversation send
/// ordering, an immutable media cache, real-time fan-out and the client-side
/// optimistic reconciliation.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod upstream;
pub mod coalescer;
pub mod send_serializer;
pub mod media_store;
pub mod realtime;
pub mod inbox;
pub mod messenger_api;
pub mod client;
pub mod memory;
pub mod utils;

pub use error::{GatewayError, Result};
pub use config::Config;
pub use inbox::InboxService;
