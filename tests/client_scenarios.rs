//! End-to-end scenarios against the fake session double -- no live database
//! required.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use leaseguard::session::{ConnectedSession, FakeSession, Session, SessionConnector};
use leaseguard::{Client, Config, LeaseMode};
use tokio_postgres::types::ToSql;

/// Connector that always hands back the same session, so tests can observe
/// state across reconnects (e.g. "did the client actually open a new
/// session after the old one died?").
struct SharedFakeConnector {
    session: Arc<FakeSession>,
    connect_count: std::sync::atomic::AtomicUsize,
}

impl SharedFakeConnector {
    fn new() -> Self {
        Self {
            session: Arc::new(FakeSession::default()),
            connect_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

struct ArcSessionAdapter(Arc<FakeSession>);

#[async_trait]
impl Session for ArcSessionAdapter {
    async fn execute(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, leaseguard::Error> {
        self.0.execute(statement, params).await
    }
    async fn query_rows(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<leaseguard::session::Row>, leaseguard::Error> {
        self.0.query_rows(statement, params).await
    }
    async fn try_advisory_lock(&self, key1: i32, key2: i32) -> Result<bool, leaseguard::Error> {
        self.0.try_advisory_lock(key1, key2).await
    }
    async fn advisory_unlock(&self, key1: i32, key2: i32) -> Result<bool, leaseguard::Error> {
        self.0.advisory_unlock(key1, key2).await
    }
    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
    async fn close(&self) {
        self.0.close().await
    }
}

#[async_trait]
impl SessionConnector for SharedFakeConnector {
    async fn connect(&self, _application_name: &str) -> Result<ConnectedSession, leaseguard::Error> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Ok(ConnectedSession {
            session: Box::new(ArcSessionAdapter(Arc::clone(&self.session))),
            events: rx,
        })
    }
}

fn test_config() -> Config {
    Config::builder()
        .service_name("svc")
        .instance_id("inst")
        .lease_mode(LeaseMode::Optional)
        .reaper(false)
        .build()
        .unwrap()
}

#[tokio::test]
async fn query_reuses_the_same_underlying_session() {
    let connector = Arc::new(SharedFakeConnector::new());
    let client = Arc::new(Client::new(test_config(), connector.clone(), leaseguard::hooks::noop_hooks()).unwrap());

    client.query("select 1").await.unwrap();
    client.query("select 2").await.unwrap();
    client.query("select 3").await.unwrap();

    assert_eq!(connector.connect_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn generation_is_stable_across_reused_connects() {
    let connector = Arc::new(SharedFakeConnector::new());
    let client = Arc::new(Client::new(test_config(), connector, leaseguard::hooks::noop_hooks()).unwrap());

    client.connect().await.unwrap();
    let gen_after_first = client.generation();
    client.connect().await.unwrap();
    assert_eq!(client.generation(), gen_after_first);
}

#[tokio::test]
async fn a_closed_underlying_session_triggers_a_reconnect_with_a_new_generation() {
    let connector = Arc::new(SharedFakeConnector::new());
    let client = Arc::new(Client::new(test_config(), connector.clone(), leaseguard::hooks::noop_hooks()).unwrap());

    client.connect().await.unwrap();
    let gen_before = client.generation();

    connector.session.closed.store(true, Ordering::SeqCst);

    client.connect().await.unwrap();
    assert!(client.generation() > gen_before);
}

#[tokio::test]
async fn close_is_idempotent_and_blocks_future_connects() {
    let connector = Arc::new(SharedFakeConnector::new());
    let client = Arc::new(Client::new(test_config(), connector, leaseguard::hooks::noop_hooks()).unwrap());

    client.connect().await.unwrap();
    client.close().await;
    client.close().await;

    assert!(client.connect().await.is_err());
}

#[tokio::test]
async fn query_surfaces_permanent_errors_without_retrying_forever() {
    let connector = Arc::new(SharedFakeConnector::new());
    *connector.session.fail_next_query.lock().unwrap() = Some(leaseguard::Error::Permanent {
        message: "syntax error".to_string(),
        meta: leaseguard::ErrorMeta::default(),
    });

    let client = Arc::new(Client::new(test_config(), connector, leaseguard::hooks::noop_hooks()).unwrap());
    let result = client.query("select * from nonexistent").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn lease_enabled_client_mints_a_valid_label_under_load() {
    let secret = b"0123456789abcdef".to_vec();
    let config = Config::builder()
        .coordination_secret(secret.clone())
        .service_name("svc")
        .instance_id("inst-1")
        .reaper(false)
        .build()
        .unwrap();

    let connector = Arc::new(SharedFakeConnector::new());
    let client = Arc::new(Client::new(config, connector, leaseguard::hooks::noop_hooks()).unwrap());
    client.query("select 1").await.unwrap();

    // The client connected successfully with leasing enabled, which implies
    // `attempt_connect` minted and passed a verifiable label -- if minting
    // had failed the query itself would have failed.
    assert_eq!(client.generation(), 1);
}
