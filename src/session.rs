//! Database session abstraction.
//!
//! `Session` is the seam between the client state machine and the wire
//! driver. The real implementation wraps `tokio-postgres` and spawns a task
//! that polls the connection for asynchronous driver messages -- fatal
//! errors and stream termination can arrive at any time, not just in
//! response to a query, so the client needs a channel to learn about them
//! out of band.

use std::future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_postgres::types::ToSql;
use tokio_postgres::AsyncMessage;

use crate::error::{Error, ErrorMeta};
use crate::retry::classify;

/// An event surfaced by the connection outside of any in-flight query.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The server (or transport) reported a fatal error; the session should
    /// be considered dead.
    Fatal(String),
    /// The connection's message stream ended -- the socket closed.
    Closed,
}

/// Abstraction over a single database connection, decoupled from
/// `tokio-postgres` so tests can substitute [`FakeSession`].
#[async_trait]
pub trait Session: Send + Sync {
    /// Run a statement that returns no rows, e.g. `SELECT 1` for heartbeats
    /// or `pg_terminate_backend($1)`. Parameters are always bound, never
    /// interpolated into the SQL text.
    async fn execute(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error>;

    /// Run a query and return its rows.
    async fn query_rows(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, Error>;

    /// Try to acquire a named advisory lock; returns whether it was
    /// acquired.
    async fn try_advisory_lock(&self, key1: i32, key2: i32) -> Result<bool, Error>;

    /// Release a previously-acquired advisory lock.
    async fn advisory_unlock(&self, key1: i32, key2: i32) -> Result<bool, Error>;

    /// Whether the underlying connection has already observed a fatal
    /// event or closure.
    fn is_closed(&self) -> bool;

    /// Best-effort graceful close; failures are swallowed since a session
    /// being discarded has nothing left to report them to. Idempotent.
    async fn close(&self);
}

/// A minimal row representation sufficient for the reaper's scan query.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub pid: Option<i32>,
    pub application_name: Option<String>,
    pub state_change_ms: Option<i64>,
}

/// Connects new sessions, parameterized so tests can swap in
/// [`FakeSessionConnector`].
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, application_name: &str) -> Result<ConnectedSession, Error>;
}

/// A connected session paired with the event receiver fed by its background
/// polling task.
pub struct ConnectedSession {
    pub session: Box<dyn Session>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Connects to Postgres using `tokio-postgres` over a plain TCP connection
/// (no TLS) built from a fixed connection string.
pub struct PgSessionConnector {
    connection_string: String,
}

impl PgSessionConnector {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[async_trait]
impl SessionConnector for PgSessionConnector {
    async fn connect(&self, application_name: &str) -> Result<ConnectedSession, Error> {
        let mut config: tokio_postgres::Config = self
            .connection_string
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid connection string: {e}")))?;
        config.application_name(application_name);

        let (client, mut connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| classify(&e.to_string(), meta_from_driver_error(&e)))?;

        let (tx, rx) = mpsc::unbounded_channel();

        // tokio-postgres requires the Connection future to be polled for
        // the client to make progress; we drive it on a dedicated task and
        // forward any asynchronous messages (notices, fatal errors, or end
        // of stream) to the client via `tx`.
        tokio::spawn(async move {
            let tx = tx;
            loop {
                let message =
                    future::poll_fn(|cx| Pin::new(&mut connection).poll_message(cx)).await;
                match message {
                    Some(Ok(AsyncMessage::Notice(_))) => continue,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = tx.send(SessionEvent::Fatal(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = tx.send(SessionEvent::Closed);
                        break;
                    }
                }
            }
        });

        Ok(ConnectedSession {
            session: Box::new(PgSession {
                client: AsyncMutex::new(Some(client)),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

fn meta_from_driver_error(e: &tokio_postgres::Error) -> ErrorMeta {
    let sqlstate = e.code().map(|c| c.code().to_string());
    ErrorMeta {
        sqlstate,
        ..Default::default()
    }
}

/// Holds the driver client behind a lock so `close()` can actually drop it
/// (and let `tokio-postgres` tear the socket down) rather than merely
/// flagging the session as unusable -- an orphaned-but-never-dropped client
/// would itself be exactly the zombie this crate exists to prevent.
struct PgSession {
    client: AsyncMutex<Option<tokio_postgres::Client>>,
    closed: std::sync::atomic::AtomicBool,
}

impl PgSession {
    fn already_closed_error() -> Error {
        Error::InvariantViolation("session already closed".to_string())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn execute(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return Err(Self::already_closed_error());
        };
        client.execute(statement, params).await.map_err(|e| {
            let err = classify(&e.to_string(), meta_from_driver_error(&e));
            if err.is_transient() {
                self.closed
                    .store(true, std::sync::atomic::Ordering::Relaxed);
            }
            err
        })
    }

    async fn query_rows(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, Error> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return Err(Self::already_closed_error());
        };
        let rows = client.query(statement, params).await.map_err(|e| {
            let err = classify(&e.to_string(), meta_from_driver_error(&e));
            if err.is_transient() {
                self.closed
                    .store(true, std::sync::atomic::Ordering::Relaxed);
            }
            err
        })?;
        Ok(rows
            .into_iter()
            .map(|row| Row {
                pid: row.try_get("pid").ok(),
                application_name: row.try_get("application_name").ok(),
                state_change_ms: row.try_get("state_change_ms").ok(),
            })
            .collect())
    }

    async fn try_advisory_lock(&self, key1: i32, key2: i32) -> Result<bool, Error> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return Err(Self::already_closed_error());
        };
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1, $2) AS acquired", &[&key1, &key2])
            .await
            .map_err(|e| classify(&e.to_string(), meta_from_driver_error(&e)))?;
        Ok(row.get("acquired"))
    }

    async fn advisory_unlock(&self, key1: i32, key2: i32) -> Result<bool, Error> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            return Err(Self::already_closed_error());
        };
        let row = client
            .query_one("SELECT pg_advisory_unlock($1, $2) AS released", &[&key1, &key2])
            .await
            .map_err(|e| classify(&e.to_string(), meta_from_driver_error(&e)))?;
        Ok(row.get("released"))
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            return true;
        }
        match self.client.try_lock() {
            Ok(guard) => guard.as_ref().map(|c| c.is_closed()).unwrap_or(true),
            Err(_) => false,
        }
    }

    async fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Relaxed);
        self.client.lock().await.take();
    }
}

/// In-memory test double implementing [`Session`] without a live database.
///
/// Scripted via a queue of canned results, letting tests drive specific
/// failure sequences (e.g. a transient error followed by success) without
/// needing an actual Postgres instance.
pub struct FakeSession {
    pub advisory_locks: std::sync::Mutex<std::collections::HashSet<(i32, i32)>>,
    pub scripted_rows: std::sync::Mutex<Vec<Row>>,
    pub closed: std::sync::atomic::AtomicBool,
    pub fail_next_execute: std::sync::Mutex<Option<Error>>,
    pub fail_next_query: std::sync::Mutex<Option<Error>>,
    /// Delay the next `execute()` call by this long before it resolves, to
    /// let tests exercise a caller's timeout handling without a real hang.
    pub delay_next_execute_ms: std::sync::Mutex<Option<u64>>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self {
            advisory_locks: std::sync::Mutex::new(std::collections::HashSet::new()),
            scripted_rows: std::sync::Mutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
            fail_next_execute: std::sync::Mutex::new(None),
            fail_next_query: std::sync::Mutex::new(None),
            delay_next_execute_ms: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&self, _statement: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<u64, Error> {
        let delay_ms = self.delay_next_execute_ms.lock().unwrap().take();
        if let Some(delay_ms) = delay_ms {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        if let Some(err) = self.fail_next_execute.lock().unwrap().take() {
            return Err(err);
        }
        Ok(1)
    }

    async fn query_rows(&self, _statement: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>, Error> {
        if let Some(err) = self.fail_next_query.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.scripted_rows.lock().unwrap().clone())
    }

    async fn try_advisory_lock(&self, key1: i32, key2: i32) -> Result<bool, Error> {
        Ok(self.advisory_locks.lock().unwrap().insert((key1, key2)))
    }

    async fn advisory_unlock(&self, key1: i32, key2: i32) -> Result<bool, Error> {
        Ok(self.advisory_locks.lock().unwrap().remove(&(key1, key2)))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Connector that always hands out a fresh [`FakeSession`] with no scripted
/// events, for client-level tests that don't exercise the reaper scan.
#[derive(Default)]
pub struct FakeSessionConnector;

#[async_trait]
impl SessionConnector for FakeSessionConnector {
    async fn connect(&self, _application_name: &str) -> Result<ConnectedSession, Error> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(ConnectedSession {
            session: Box::new(FakeSession::default()),
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_session_locks_are_mutually_exclusive() {
        let session = FakeSession::default();
        assert!(session.try_advisory_lock(1, 2).await.unwrap());
        assert!(!session.try_advisory_lock(1, 2).await.unwrap());
        assert!(session.advisory_unlock(1, 2).await.unwrap());
        assert!(session.try_advisory_lock(1, 2).await.unwrap());
    }

    #[tokio::test]
    async fn fake_session_can_script_a_failure() {
        let session = FakeSession::default();
        *session.fail_next_execute.lock().unwrap() = Some(Error::TransientTransport {
            message: "boom".to_string(),
            meta: ErrorMeta::default(),
        });
        assert!(session.execute("select 1", &[]).await.is_err());
        assert!(session.execute("select 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn fake_connector_hands_out_open_sessions() {
        let connector = FakeSessionConnector;
        let connected = connector.connect("app").await.unwrap();
        assert!(!connected.session.is_closed());
    }
}
