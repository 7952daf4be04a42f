/// Configuration management
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 17082;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listening address
    pub listen_addr: SocketAddr,

    /// Staleness tolerance of conversation lists
    pub conversations_ttl: Duration,

    /// Staleness tolerance of message pages
    pub messages_ttl: Duration,

    /// Media cache lifetime (content is immutable)
    pub media_ttl: Duration,

    /// Upper bound for any upstream fetch
    pub fetch_timeout: Duration,

    /// Attempts before a missing media item is reported as not found
    pub media_attempts: u32,

    /// Base delay between media attempts
    pub media_retry_base: Duration,

    /// Maximum number of cached media blobs
    pub media_max_entries: usize,

    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,

    /// Page size when the client does not ask for one
    pub default_page_limit: usize,

    /// Largest page a client may ask for
    pub max_page_limit: usize,

    /// Prefix agent replies with the agent's name
    pub agent_signature: bool,

    /// Seed the in-memory backends with demo data
    pub demo_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            conversations_ttl: Duration::from_secs(2),
            messages_ttl: Duration::from_secs(4),
            media_ttl: Duration::from_secs(86_400),
            fetch_timeout: Duration::from_secs(15),
            media_attempts: 3,
            media_retry_base: Duration::from_millis(250),
            media_max_entries: 512,
            event_capacity: 256,
            default_page_limit: 25,
            max_page_limit: 200,
            agent_signature: true,
            demo_data: true,
        }
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| GatewayError::Config(format!("{} requires a value", flag)))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| GatewayError::Config(format!("{} must be a valid number", flag)))
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            let arg = args[i].as_str();
            match arg {
                "--conversations-ttl-ms" => {
                    let ms: u64 = parse_number(flag_value(args, i, arg)?, arg)?;
                    config.conversations_ttl = Duration::from_millis(ms);
                    i += 2;
                }
                "--messages-ttl-ms" => {
                    let ms: u64 = parse_number(flag_value(args, i, arg)?, arg)?;
                    config.messages_ttl = Duration::from_millis(ms);
                    i += 2;
                }
                "--media-ttl-secs" => {
                    let secs: u64 = parse_number(flag_value(args, i, arg)?, arg)?;
                    config.media_ttl = Duration::from_secs(secs);
                    i += 2;
                }
                "--fetch-timeout-ms" => {
                    let ms: u64 = parse_number(flag_value(args, i, arg)?, arg)?;
                    config.fetch_timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--media-attempts" => {
                    config.media_attempts = parse_number(flag_value(args, i, arg)?, arg)?;
                    i += 2;
                }
                "--event-capacity" => {
                    config.event_capacity = parse_number(flag_value(args, i, arg)?, arg)?;
                    i += 2;
                }
                "--no-signature" => {
                    config.agent_signature = false;
                    i += 1;
                }
                "--no-demo" => {
                    config.demo_data = false;
                    i += 1;
                }
                other if i == 1 && !other.starts_with("--") => {
                    let port: u16 = other.parse().map_err(|_| {
                        GatewayError::Config("Port must be a valid number (0-65535)".to_string())
                    })?;
                    config.listen_addr.set_port(port);
                    i += 1;
                }
                other => {
                    return Err(GatewayError::Config(format!(
                        "Unknown argument {}. Usage: {} [port] [--conversations-ttl-ms <ms>] [--messages-ttl-ms <ms>] [--media-ttl-secs <s>] [--fetch-timeout-ms <ms>] [--media-attempts <n>] [--event-capacity <n>] [--no-signature] [--no-demo]",
                        other,
                        args.first().map(String::as_str).unwrap_or("inbox-gateway")
                    )));
                }
            }
        }

        // Env overrides (nice for containers)
        if let Some(p) = std::env::var("INBOX_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            config.listen_addr.set_port(p);
        }
        if let Some(addr) = std::env::var("INBOX_BIND")
            .ok()
            .and_then(|s| s.parse::<std::net::IpAddr>().ok())
        {
            config.listen_addr.set_ip(addr);
        }
        if let Some(ms) = std::env::var("INBOX_FETCH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.fetch_timeout = Duration::from_millis(ms);
        }
        if std::env::var("INBOX_NO_SIGNATURE").is_ok() {
            config.agent_signature = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break cache or pagination invariants
    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout.is_zero() {
            return Err(GatewayError::Config("fetch timeout must be positive".to_string()));
        }
        if self.media_attempts == 0 {
            return Err(GatewayError::Config("media attempts must be at least 1".to_string()));
        }
        if self.default_page_limit == 0 || self.default_page_limit > self.max_page_limit {
            return Err(GatewayError::Config(
                "default page limit must be within 1..=max page limit".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp a client-requested page size
    pub fn page_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_limit)
            .clamp(1, self.max_page_limit)
    }
}
