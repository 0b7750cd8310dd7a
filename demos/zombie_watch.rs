//! Illustrative binary wiring `Client` from environment variables and
//! printing reaper activity as it happens. Not part of the published API --
//! just a worked example for `cargo run --example zombie_watch` once this
//! file is wired into `Cargo.toml`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use leaseguard::{Client, Config, PgSessionConnector, TracingHooks};

#[tokio::main]
async fn main() -> Result<(), leaseguard::Error> {
    tracing_subscriber::fmt::init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let secret = env::var("LEASE_SECRET").expect("LEASE_SECRET must be set");
    let service_name = env::var("SERVICE_NAME").unwrap_or_else(|_| "zombie-watch".to_string());
    let instance_id = env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());

    let config = Config::builder()
        .coordination_secret(secret.into_bytes())
        .service_name(service_name)
        .instance_id(instance_id)
        .build()?;

    let connector = Arc::new(PgSessionConnector::new(database_url));
    let client = Arc::new(Client::new(config, connector, Arc::new(TracingHooks))?);

    loop {
        match client.query("SELECT 1").await {
            Ok(_) => tracing::info!("heartbeat query ok"),
            Err(err) => tracing::warn!(error = %err, "heartbeat query failed"),
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}
