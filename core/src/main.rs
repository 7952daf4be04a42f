/// Inbox gateway - HTTP entry point
use inbox_core::memory::{InMemoryRecords, InMemoryUpstream};
use inbox_core::messenger_api::start_inbox_api;
use inbox_core::upstream::{Role, Viewer};
use inbox_core::{Config, InboxService};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn seed_demo(upstream: &InMemoryUpstream, records: &InMemoryRecords) {
    upstream.add_conversation("15550001@s.whatsapp.net", "Alice");
    upstream.add_conversation("15550002@s.whatsapp.net", "Bob");
    upstream.receive_text("15550001@s.whatsapp.net", "Hi, is my order on its way?");
    upstream.receive_text("15550002@s.whatsapp.net", "Thanks for the quick reply!");

    records.add_viewer(Viewer {
        id: "admin".to_string(),
        role: Role::Admin,
        first_name: "Ada".to_string(),
        last_name: "Admin".to_string(),
        email: "admin@example.com".to_string(),
    });
    records.add_viewer(Viewer {
        id: "agent".to_string(),
        role: Role::Agent,
        first_name: "Sam".to_string(),
        last_name: "Agent".to_string(),
        email: "agent@example.com".to_string(),
    });
    records.assign("15550002@s.whatsapp.net", "agent");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let upstream = Arc::new(InMemoryUpstream::new());
    let records = Arc::new(InMemoryRecords::new());
    if config.demo_data {
        seed_demo(&upstream, &records);
        info!("Seeded demo conversations (viewers: admin, agent)");
    } else {
        warn!("Running without demo data: the in-memory upstream starts empty");
    }

    let addr = config.listen_addr;
    let service = InboxService::new(config, upstream, records);

    let janitor = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            janitor.purge_expired();
        }
    });
    info!("Starting inbox gateway on {}", addr);

    tokio::select! {
        result = start_inbox_api(service, addr) => {
            result.map_err(|e| anyhow::anyhow!("API error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
