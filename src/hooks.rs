//! Observability hooks.
//!
//! Every hook has a no-op default so callers only implement the events they
//! care about. Hooks must never block the client's critical path for long;
//! they're invoked inline, so a slow hook slows down connects/queries.

use std::sync::Arc;

use crate::error::{Error, ErrorMeta};

#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub instance_id: String,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct ReconnectEvent {
    pub instance_id: String,
    pub generation: u64,
    pub retries: u32,
    pub delay_ms: u64,
    pub err: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryStartEvent {
    pub statement: String,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct QueryEndEvent {
    pub statement: String,
    pub generation: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct QueryErrorEvent {
    pub statement: String,
    pub generation: u64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct QueryRetryEvent {
    pub statement: String,
    pub attempt: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct HeartbeatFailEvent {
    pub generation: u64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ReapEvent {
    pub generation: u64,
    pub service_name: String,
    pub locked: bool,
    pub terminated_pids: Vec<i32>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientDeadEvent {
    pub generation: u64,
    /// Which component detected the fatal condition, e.g. `"connect"`,
    /// `"session"`, or `"heartbeat"`.
    pub source: String,
    pub reason: String,
    pub meta: ErrorMeta,
}

/// Lifecycle callbacks a caller can observe without reaching into the
/// client's internals. All methods default to doing nothing.
pub trait Hooks: Send + Sync {
    fn on_connect(&self, _event: &ConnectEvent) {}
    fn on_reconnect(&self, _event: &ReconnectEvent) {}
    fn on_query_start(&self, _event: &QueryStartEvent) {}
    fn on_query_end(&self, _event: &QueryEndEvent) {}
    fn on_query_error(&self, _event: &QueryErrorEvent) {}
    fn on_query_retry(&self, _event: &QueryRetryEvent) {}
    fn on_heartbeat(&self, _event: &HeartbeatEvent) {}
    fn on_heartbeat_fail(&self, _event: &HeartbeatFailEvent) {}
    fn on_reap(&self, _event: &ReapEvent) {}
    fn on_client_dead(&self, _event: &ClientDeadEvent) {}
}

/// The default no-op implementation, used when a caller supplies no hooks.
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Hooks that forward every event to `tracing`, at a level matched to
/// severity: lifecycle/success events at `debug`, failures at `warn`.
pub struct TracingHooks;

impl Hooks for TracingHooks {
    fn on_connect(&self, event: &ConnectEvent) {
        tracing::debug!(instance_id = %event.instance_id, generation = event.generation, "connected");
    }

    fn on_reconnect(&self, event: &ReconnectEvent) {
        tracing::info!(
            instance_id = %event.instance_id,
            generation = event.generation,
            retries = event.retries,
            delay_ms = event.delay_ms,
            err = event.err.as_deref().unwrap_or(""),
            "reconnected"
        );
    }

    fn on_query_start(&self, event: &QueryStartEvent) {
        tracing::debug!(generation = event.generation, "query start");
        let _ = &event.statement; // never logged: may contain sensitive literals
    }

    fn on_query_end(&self, event: &QueryEndEvent) {
        tracing::debug!(
            generation = event.generation,
            duration_ms = event.duration_ms,
            "query end"
        );
    }

    fn on_query_error(&self, event: &QueryErrorEvent) {
        tracing::warn!(generation = event.generation, error = %event.message, "query error");
    }

    fn on_query_retry(&self, event: &QueryRetryEvent) {
        tracing::warn!(attempt = event.attempt, delay_ms = event.delay_ms, "query retry");
    }

    fn on_heartbeat(&self, event: &HeartbeatEvent) {
        tracing::debug!(generation = event.generation, "heartbeat ok");
    }

    fn on_heartbeat_fail(&self, event: &HeartbeatFailEvent) {
        tracing::warn!(generation = event.generation, error = %event.message, "heartbeat failed");
    }

    fn on_reap(&self, event: &ReapEvent) {
        tracing::info!(
            generation = event.generation,
            service_name = %event.service_name,
            locked = event.locked,
            killed = event.terminated_pids.len(),
            duration_ms = event.duration_ms,
            error = event.error.as_deref().unwrap_or(""),
            "reaper pass complete"
        );
    }

    fn on_client_dead(&self, event: &ClientDeadEvent) {
        tracing::error!(
            generation = event.generation,
            source = %event.source,
            reason = %event.reason,
            sqlstate = event.meta.sqlstate.as_deref().unwrap_or(""),
            "client dead"
        );
    }
}

pub type SharedHooks = Arc<dyn Hooks>;

pub fn noop_hooks() -> SharedHooks {
    Arc::new(NoopHooks)
}

pub fn query_error_from(statement: &str, generation: u64, err: &Error) -> QueryErrorEvent {
    QueryErrorEvent {
        statement: statement.to_string(),
        generation,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHooks {
        connects: AtomicUsize,
    }

    impl Hooks for CountingHooks {
        fn on_connect(&self, _event: &ConnectEvent) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn default_hooks_do_nothing_and_do_not_panic() {
        let hooks = NoopHooks;
        hooks.on_connect(&ConnectEvent {
            instance_id: "x".to_string(),
            generation: 1,
        });
    }

    #[test]
    fn custom_hook_observes_event() {
        let hooks = CountingHooks {
            connects: AtomicUsize::new(0),
        };
        hooks.on_connect(&ConnectEvent {
            instance_id: "x".to_string(),
            generation: 1,
        });
        assert_eq!(hooks.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_dead_event_carries_structured_meta() {
        let hooks = TracingHooks;
        hooks.on_client_dead(&ClientDeadEvent {
            generation: 3,
            source: "session".to_string(),
            reason: "connection reset".to_string(),
            meta: ErrorMeta {
                sqlstate: Some("08006".to_string()),
                ..Default::default()
            },
        });
    }

    #[test]
    fn reconnect_event_carries_retry_accounting() {
        let hooks = TracingHooks;
        hooks.on_reconnect(&ReconnectEvent {
            instance_id: "inst".to_string(),
            generation: 2,
            retries: 2,
            delay_ms: 150,
            err: Some("reset".to_string()),
        });
    }
}
