//! Client core: the generation-counter state machine tying together leases,
//! retries, heartbeats, and the reaper.
//!
//! A monotonically increasing generation number is attached to every
//! session. Anything that observes a fatal event or a reconnect compares its
//! captured generation against the client's current one before acting, so
//! a slow background task (a heartbeat, a fatal-event listener) can never
//! clobber a session that has already been superseded.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::config::{Config, HeartbeatErrorMode, ProbabilityGating};
use crate::error::{Error, ErrorMeta};
use crate::hooks::{
    ClientDeadEvent, ConnectEvent, HeartbeatEvent, HeartbeatFailEvent, QueryEndEvent,
    QueryRetryEvent, QueryStartEvent, ReconnectEvent, SharedHooks,
};
use crate::lease::LeaseManager;
use crate::reaper::Reaper;
use crate::retry::retry_with_backoff;
use crate::session::{Row, Session, SessionConnector, SessionEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Dead,
    Closed,
}

struct Inner {
    phase: Phase,
    session: Option<Arc<dyn Session>>,
    expires_at_ms: i64,
}

/// A resilient handle to a single logical database connection.
///
/// Despite the name, `Client` does not pool connections -- it manages
/// exactly one at a time, reconnecting transparently when the current one
/// dies. See the module-level docs for the state machine this enforces.
pub struct Client {
    config: Config,
    connector: Arc<dyn SessionConnector>,
    hooks: SharedHooks,
    lease_manager: Option<LeaseManager>,
    reaper: Option<Arc<Reaper>>,
    generation: Arc<AtomicU64>,
    inner: Mutex<Inner>,
    /// Guards a single in-flight heartbeat attempt per generation -- a
    /// concurrent `query()` call that also needs a heartbeat waits here
    /// instead of minting and installing a second, redundant label.
    heartbeat_lock: Mutex<()>,
    now_ms: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Client {
    pub fn new(config: Config, connector: Arc<dyn SessionConnector>, hooks: SharedHooks) -> Result<Self, Error> {
        config.validate()?;
        let lease_manager = match &config.coordination_secret {
            Some(secret) => Some(LeaseManager::new(secret.clone())?),
            None => None,
        };
        let reaper = if config.reaper {
            lease_manager
                .clone()
                .map(|lm| Arc::new(Reaper::new(lm, hooks.clone())))
        } else {
            None
        };
        Ok(Self {
            config,
            connector,
            hooks,
            lease_manager,
            reaper,
            generation: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                session: None,
                expires_at_ms: 0,
            }),
            heartbeat_lock: Mutex::new(()),
            now_ms: Box::new(current_time_ms),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Exposes the raw generation counter so a test double can race a
    /// supersession against an in-flight `connect()`. Not reachable outside
    /// `#[cfg(test)]` builds.
    #[cfg(test)]
    fn generation_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    /// Swap in a deterministic clock for tests that need to control exactly
    /// how much lease time remains without real sleeps.
    #[cfg(test)]
    fn set_now_ms(&mut self, f: impl Fn() -> i64 + Send + Sync + 'static) {
        self.now_ms = Box::new(f);
    }

    /// Ensure a live, verified session, connecting or reconnecting as
    /// needed. Concurrent callers serialize on the same internal mutex, so
    /// at most one physical connect attempt is ever in flight -- the lock
    /// itself is the single-flight mechanism.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<dyn Session>, Error> {
        let mut guard = self.inner.lock().await;

        if guard.phase == Phase::Connected {
            if let Some(session) = guard.session.clone() {
                if !session.is_closed() {
                    return Ok(session);
                }
            }
        }
        if guard.phase == Phase::Closed {
            return Err(Error::InvariantViolation(
                "connect() called after close()".to_string(),
            ));
        }

        let was_reconnect = guard.phase == Phase::Dead || guard.phase == Phase::Connected;
        if let Some(stale) = guard.session.take() {
            tokio::spawn(async move { stale.close().await });
        }
        guard.phase = Phase::Connecting;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let retry_count = AtomicU32::new(0);
        let last_delay_ms = AtomicU64::new(0);
        let last_retry_err: StdMutex<Option<String>> = StdMutex::new(None);

        let connect_result = retry_with_backoff(
            self.config.retries.max(1),
            self.config.min_backoff_ms.max(0) as u64,
            self.config.max_backoff_ms.max(0) as u64,
            self.config.max_connect_retry_time_ms.max(0) as u64,
            |_attempt| self.attempt_connect(),
            |attempt, delay_ms, err| {
                retry_count.store(attempt, Ordering::SeqCst);
                last_delay_ms.store(delay_ms, Ordering::SeqCst);
                *last_retry_err.lock().unwrap() = Some(err.to_string());
            },
        )
        .await;

        let (session, events, expires_at_ms) = match connect_result {
            Ok(triple) => triple,
            Err(err) => {
                guard.phase = Phase::Dead;
                self.hooks.on_client_dead(&ClientDeadEvent {
                    generation,
                    source: "connect".to_string(),
                    reason: err.to_string(),
                    meta: err.meta().cloned().unwrap_or_default(),
                });
                return Err(err);
            }
        };

        // Another generation may have started (and already won) while this
        // handshake was in flight -- a fatal event on a still-live prior
        // session is detected and acted on without needing this connect()
        // call's lock, see `dispatch_fatal`. Discard rather than install.
        if self.generation.load(Ordering::SeqCst) != generation {
            // The event that caused the supersession already took
            // `guard.session` for its own generation (see `dispatch_fatal`)
            // and, finding it gone, never got to move the phase past
            // `Connecting` -- this connect() attempt has to do it instead,
            // or the client would be stuck in `Connecting` forever.
            guard.phase = Phase::Dead;
            let stale = session;
            tokio::spawn(async move { stale.close().await });
            return Err(Error::InvariantViolation(
                "connect() superseded by a newer generation during handshake".to_string(),
            ));
        }

        guard.phase = Phase::Connected;
        guard.session = Some(Arc::clone(&session));
        guard.expires_at_ms = expires_at_ms;

        if was_reconnect {
            self.hooks.on_reconnect(&ReconnectEvent {
                instance_id: self.config.instance_id.clone(),
                generation,
                retries: retry_count.load(Ordering::SeqCst),
                delay_ms: last_delay_ms.load(Ordering::SeqCst),
                err: last_retry_err.lock().unwrap().clone(),
            });
        } else {
            self.hooks.on_connect(&ConnectEvent {
                instance_id: self.config.instance_id.clone(),
                generation,
            });
        }

        self.spawn_fatal_listener(generation, Arc::clone(&session), events);
        self.maybe_run_reaper(&session, generation);

        Ok(session)
    }

    async fn attempt_connect(
        &self,
    ) -> Result<(Arc<dyn Session>, mpsc::UnboundedReceiver<SessionEvent>, i64), Error> {
        let now_ms = (self.now_ms)();
        let expires_at_ms = now_ms + self.config.lease_ttl_ms;

        let application_name = if let Some(lm) = &self.lease_manager {
            lm.mint(&self.config.service_name, &self.config.instance_id, expires_at_ms)?
        } else if self.config.lease_mode == crate::config::LeaseMode::Required {
            return Err(Error::Configuration(
                "lease_mode is Required but no coordination_secret is configured".to_string(),
            ));
        } else {
            format!("{}:{}", self.config.service_name, self.config.instance_id)
        };

        let connected = self.connector.connect(&application_name).await?;
        Ok((Arc::from(connected.session), connected.events, expires_at_ms))
    }

    /// Eagerly attach a listener to a freshly-installed session's event
    /// channel, so a fatal event is acted on as soon as it arrives instead
    /// of only being noticed the next time something calls `connect()`.
    fn spawn_fatal_listener(
        self: &Arc<Self>,
        generation: u64,
        session: Arc<dyn Session>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let reason = match events.recv().await {
                Some(SessionEvent::Fatal(message)) => message,
                Some(SessionEvent::Closed) | None => "connection closed".to_string(),
            };
            this.dispatch_fatal(generation, session, "session".to_string(), reason)
                .await;
        });
    }

    /// React to a fatal/closed event for `session`. Bumps the generation
    /// counter without taking the inner lock first, so the bump is visible
    /// to an in-flight `connect()` call even while that call still holds
    /// the lock for its own handshake -- this is what lets the
    /// generation guard in `connect()` observe a supersession that happened
    /// mid-handshake. Detaching the session and emitting `onClientDead`
    /// still waits for the lock, since those only matter once the session
    /// in question is still the installed one.
    async fn dispatch_fatal(
        self: &Arc<Self>,
        generation: u64,
        session: Arc<dyn Session>,
        source: String,
        reason: String,
    ) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        let mut guard = self.inner.lock().await;
        let still_current = guard
            .session
            .as_ref()
            .map(|current| Arc::ptr_eq(current, &session))
            .unwrap_or(false);
        if still_current {
            guard.phase = Phase::Dead;
            guard.session = None;
        }
        drop(guard);

        if still_current {
            self.hooks.on_client_dead(&ClientDeadEvent {
                generation,
                source,
                reason,
                meta: ErrorMeta::default(),
            });
        }

        session.close().await;
    }

    fn maybe_run_reaper(self: &Arc<Self>, session: &Arc<dyn Session>, generation: u64) {
        let Some(reaper) = self.reaper.clone() else {
            return;
        };
        let should_draw = match self.config.reaper_probability_gating {
            ProbabilityGating::BeforeCooldown => {
                rand::rng().random::<f64>() < self.config.reaper_run_probability
            }
            ProbabilityGating::Ignored => true,
        };
        if !should_draw {
            return;
        }
        if !reaper.cooldown_elapsed(&self.config, (self.now_ms)()) {
            return;
        }

        let this = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            if this.generation() != generation {
                return;
            }
            let now_ms = (this.now_ms)();
            let _ = reaper
                .run_pass(session.as_ref(), &this.config, generation, now_ms)
                .await;
        });
    }

    /// Renew the lease if the current session's remaining time has dropped
    /// below the soft-remaining threshold. Called from `query()` ahead of
    /// every statement. When the remaining time is also below
    /// `heartbeat_hard_wait_remaining_ms`, the caller is made to wait for
    /// the renewal to finish before proceeding -- otherwise it's kicked off
    /// in the background and `query()` carries on without waiting.
    ///
    /// The hard-wait path's result is propagated back to the caller: under
    /// [`HeartbeatErrorMode::Throw`], a failure past the hard-wait threshold
    /// fails the in-flight `query()` call outright instead of silently
    /// continuing against a session already marked dead. The backgrounded
    /// path has no caller to report to, so its result is discarded.
    async fn heartbeat_if_needed(self: &Arc<Self>, generation: u64) -> Result<(), Error> {
        if self.lease_manager.is_none() {
            return Ok(());
        }
        let expires_at_ms = {
            let guard = self.inner.lock().await;
            if guard.phase != Phase::Connected {
                return Ok(());
            }
            guard.expires_at_ms
        };
        let now_ms = (self.now_ms)();
        let remaining = expires_at_ms - now_ms;
        if remaining > self.config.heartbeat_soft_remaining_ms {
            return Ok(());
        }

        if remaining <= self.config.heartbeat_hard_wait_remaining_ms {
            self.run_heartbeat_locked(generation, expires_at_ms).await
        } else {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _ = this.run_heartbeat_locked(generation, expires_at_ms).await;
            });
            Ok(())
        }
    }

    /// Single-flight heartbeat attempt, serialized by `heartbeat_lock`.
    /// Re-checks the remaining time once the lock is held, so a caller that
    /// queued up behind an already-running heartbeat doesn't repeat work a
    /// concurrent attempt just finished.
    async fn run_heartbeat_locked(
        self: &Arc<Self>,
        generation: u64,
        old_expires_at_ms: i64,
    ) -> Result<(), Error> {
        let _guard = self.heartbeat_lock.lock().await;
        if self.generation() != generation {
            return Ok(());
        }

        let session = {
            let guard = self.inner.lock().await;
            if guard.phase != Phase::Connected {
                return Ok(());
            }
            let now_ms = (self.now_ms)();
            if guard.expires_at_ms - now_ms > self.config.heartbeat_soft_remaining_ms {
                return Ok(());
            }
            guard.session.clone()
        };
        let Some(session) = session else { return Ok(()) };

        let now_ms = (self.now_ms)();
        let new_expires_at_ms = now_ms + self.config.lease_ttl_ms;
        let label = match self.lease_manager.as_ref().map(|lm| {
            lm.mint(&self.config.service_name, &self.config.instance_id, new_expires_at_ms)
        }) {
            Some(Ok(label)) => label,
            Some(Err(err)) => {
                return self
                    .handle_heartbeat_failure(generation, old_expires_at_ms, err)
                    .await;
            }
            None => return Ok(()),
        };

        let deadline = Instant::now() + Duration::from_millis(self.config.heartbeat_timeout_ms.max(0) as u64);
        let result = tokio::time::timeout_at(
            deadline,
            session.execute("SELECT set_config('application_name', $1, false)", &[&label]),
        )
        .await;

        match result {
            Ok(Ok(_)) => {
                let mut guard = self.inner.lock().await;
                if guard.phase == Phase::Connected {
                    guard.expires_at_ms = new_expires_at_ms;
                }
                drop(guard);
                self.hooks.on_heartbeat(&HeartbeatEvent { generation });
                Ok(())
            }
            Ok(Err(err)) => {
                self.handle_heartbeat_failure(generation, old_expires_at_ms, err)
                    .await
            }
            Err(_) => {
                self.handle_heartbeat_failure(
                    generation,
                    old_expires_at_ms,
                    Error::TransientTransport {
                        message: "heartbeat timed out".to_string(),
                        meta: ErrorMeta::default(),
                    },
                )
                .await
            }
        }
    }

    /// Past the hard-wait threshold, `Throw` re-raises the heartbeat's
    /// error at the call site instead of quietly marking the session dead
    /// and letting the current query run against it anyway.
    async fn handle_heartbeat_failure(
        self: &Arc<Self>,
        generation: u64,
        expires_at_ms: i64,
        err: Error,
    ) -> Result<(), Error> {
        self.hooks.on_heartbeat_fail(&HeartbeatFailEvent {
            generation,
            message: err.to_string(),
        });

        let now_ms = (self.now_ms)();
        let remaining = expires_at_ms - now_ms;
        let past_hard_wait = remaining <= self.config.heartbeat_hard_wait_remaining_ms;

        match self.config.heartbeat_error_mode {
            HeartbeatErrorMode::Swallow => Ok(()),
            HeartbeatErrorMode::Throw => {
                if past_hard_wait {
                    let stale = {
                        let mut guard = self.inner.lock().await;
                        if guard.phase == Phase::Connected {
                            guard.phase = Phase::Dead;
                            guard.session.take()
                        } else {
                            None
                        }
                    };
                    self.hooks.on_client_dead(&ClientDeadEvent {
                        generation,
                        source: "heartbeat".to_string(),
                        reason: err.to_string(),
                        meta: err.meta().cloned().unwrap_or_default(),
                    });
                    if let Some(stale) = stale {
                        stale.close().await;
                    }
                    Err(err)
                } else {
                    Ok(())
                }
            }
            HeartbeatErrorMode::Reconnect => {
                if past_hard_wait {
                    let stale = {
                        let mut guard = self.inner.lock().await;
                        if guard.phase == Phase::Connected {
                            guard.phase = Phase::Dead;
                            guard.session.take()
                        } else {
                            None
                        }
                    };
                    if let Some(stale) = stale {
                        stale.close().await;
                    }
                }
                Ok(())
            }
        }
    }

    /// Run a query, retrying transient failures and transparently
    /// reconnecting if the current session has died.
    pub async fn query(self: &Arc<Self>, statement: &str) -> Result<Vec<Row>, Error> {
        let generation = self.generation();
        self.hooks.on_query_start(&QueryStartEvent {
            statement: statement.to_string(),
            generation,
        });
        let start = Instant::now();

        let result = retry_with_backoff(
            self.config.retries.max(1),
            self.config.min_backoff_ms.max(0) as u64,
            self.config.max_backoff_ms.max(0) as u64,
            self.config.max_query_retry_time_ms.max(0) as u64,
            |_attempt| {
                let statement = statement.to_string();
                async move {
                    let session = self.connect().await?;
                    self.heartbeat_if_needed(self.generation()).await?;
                    if session.is_closed() {
                        // The heartbeat may have condemned this very
                        // session (e.g. `HeartbeatErrorMode::Reconnect`
                        // closes it but doesn't surface an error) without
                        // this attempt ever seeing a connect() failure.
                        // Fail the attempt so the retry loop reconnects.
                        return Err(Error::TransientTransport {
                            message: "session closed during heartbeat".to_string(),
                            meta: ErrorMeta::default(),
                        });
                    }
                    let deadline = Instant::now()
                        + Duration::from_millis(self.config.default_query_timeout_ms.max(0) as u64);
                    match tokio::time::timeout_at(deadline, session.query_rows(&statement, &[])).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::TransientTransport {
                            message: "query timed out".to_string(),
                            meta: ErrorMeta::default(),
                        }),
                    }
                }
            },
            |attempt, delay_ms, _err| {
                self.hooks.on_query_retry(&QueryRetryEvent {
                    statement: statement.to_string(),
                    attempt,
                    delay_ms,
                });
            },
        )
        .await;

        match &result {
            Ok(_) => {
                self.hooks.on_query_end(&QueryEndEvent {
                    statement: statement.to_string(),
                    generation,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
            Err(err) => {
                self.hooks
                    .on_query_error(&crate::hooks::query_error_from(statement, generation, err));
            }
        }
        result
    }

    /// Tear down the client. Idempotent; subsequent `connect()` calls fail.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        let session = guard.session.take();
        guard.phase = Phase::Closed;
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn is_dead(&self) -> bool {
        matches!(self.inner.lock().await.phase, Phase::Dead)
    }
}

fn current_time_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
