//! Distributed reaper.
//!
//! Scans idle sessions whose `application_name` carries one of our leases,
//! verifies the lease client-side (the reaper never trusts the server's
//! notion of staleness alone), and terminates anything expired. Mutual
//! exclusion across concurrently-running instances is via a Postgres
//! advisory lock, not a database row -- there is no schema to provision.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use crate::config::{Config, ReaperErrorMode};
use crate::error::Error;
use crate::hooks::{ReapEvent, SharedHooks};
use crate::lease::LeaseManager;
use crate::session::Session;

/// Outcome of a reaper pass that actually acquired the advisory lock.
/// `error` is set only when the scan/terminate step failed and
/// [`ReaperErrorMode::Swallow`] is in effect -- a populated `error` alongside
/// an empty `terminated_pids` is a failed pass, not a clean empty one.
#[derive(Debug)]
pub struct ReapOutcome {
    pub terminated_pids: Vec<i32>,
    pub error: Option<Error>,
}

/// Fixed namespace for this library's advisory locks, combined with
/// `hashtext(service_name)` to get the second lock key. Chosen arbitrarily;
/// any other library using the same namespace would collide, a risk this
/// crate documents but does not attempt to resolve (see DESIGN.md).
const ADVISORY_LOCK_NAMESPACE: i32 = 0x5047_4151u32 as i32;

fn advisory_keys(service_name: &str) -> (i32, i32) {
    (ADVISORY_LOCK_NAMESPACE, hashtext(service_name))
}

/// Reimplementation of Postgres's `hashtext()` is unnecessary: we let the
/// server compute it via `hashtext($1)` in the scan query, and only need a
/// stable *client-side* key for tests that don't talk to a real server. The
/// public API always goes through `try_advisory_lock`, which accepts raw
/// i32 keys, so this is a deterministic stand-in used only when the real
/// database isn't involved.
fn hashtext(service_name: &str) -> i32 {
    let mut hash: i32 = 0;
    for byte in service_name.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as i32);
    }
    hash
}

/// Runs one reaper pass: acquire the advisory lock, scan, verify, terminate,
/// release. Returns `Ok(None)` if the lock was held elsewhere (another
/// instance is already reaping).
pub struct Reaper {
    lease_manager: LeaseManager,
    hooks: SharedHooks,
    last_run_ms: AtomicI64,
}

impl Reaper {
    pub fn new(lease_manager: LeaseManager, hooks: SharedHooks) -> Self {
        Self {
            lease_manager,
            hooks,
            last_run_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Whether a pass is allowed to run right now, given the configured
    /// cooldown. The probability draw (see [`Config::reaper_run_probability`])
    /// happens before this check, per the resolved open question in
    /// DESIGN.md.
    pub fn cooldown_elapsed(&self, config: &Config, now_ms: i64) -> bool {
        let last = self.last_run_ms.load(Ordering::Relaxed);
        last == i64::MIN || now_ms.saturating_sub(last) >= config.reaper_cooldown_ms
    }

    /// Run a single pass against `session`, which must already be connected.
    /// Returns `None` if the advisory lock was unavailable (another instance
    /// is already reaping); otherwise `Some(outcome)` describing what the
    /// completed pass did, win or lose. `onReap` always fires for a
    /// completed pass, including a swallowed failure -- a caller watching
    /// hooks should never see a reap attempt silently vanish.
    pub async fn run_pass(
        &self,
        session: &dyn Session,
        config: &Config,
        generation: u64,
        now_ms: i64,
    ) -> Result<Option<ReapOutcome>, Error> {
        let (key1, key2) = advisory_keys(&config.service_name);

        let acquired = session.try_advisory_lock(key1, key2).await?;
        if !acquired {
            return Ok(None);
        }

        let start = Instant::now();
        let result = self.scan_and_terminate(session, config, now_ms).await;
        let _ = session.advisory_unlock(key1, key2).await;
        self.last_run_ms.store(now_ms, Ordering::Relaxed);
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(terminated) => {
                self.hooks.on_reap(&ReapEvent {
                    generation,
                    service_name: config.service_name.clone(),
                    locked: true,
                    terminated_pids: terminated.clone(),
                    duration_ms,
                    error: None,
                });
                Ok(Some(ReapOutcome {
                    terminated_pids: terminated,
                    error: None,
                }))
            }
            Err(err) => {
                self.hooks.on_reap(&ReapEvent {
                    generation,
                    service_name: config.service_name.clone(),
                    locked: true,
                    terminated_pids: Vec::new(),
                    duration_ms,
                    error: Some(err.to_string()),
                });
                match config.reaper_error_mode {
                    ReaperErrorMode::Swallow => Ok(Some(ReapOutcome {
                        terminated_pids: Vec::new(),
                        error: Some(err),
                    })),
                    ReaperErrorMode::Throw => Err(err),
                }
            }
        }
    }

    async fn scan_and_terminate(
        &self,
        session: &dyn Session,
        config: &Config,
        now_ms: i64,
    ) -> Result<Vec<i32>, Error> {
        let min_idle_ms = config.min_connection_idle_time_sec * 1_000;
        let scan_sql = "SELECT pid, application_name, \
             (extract(epoch from now() - state_change) * 1000)::bigint AS state_change_ms \
             FROM pg_stat_activity \
             WHERE datname = current_database() AND state = 'idle' \
             AND pid <> pg_backend_pid() AND application_name LIKE $1"
            .to_string();
        // `normalize_service_name` can append a content-hash suffix and
        // truncate the service name, and how much it truncates depends on
        // the minting instance's name length -- there's no single string
        // this reaper could put in the `LIKE` prefix that's guaranteed to
        // match every one of this service's leases. So the SQL-side filter
        // only narrows to "one of our own labels", an optimization rather
        // than the source of truth; the authoritative service match happens
        // below, per row, using that row's own parsed instance name.
        let like_prefix = "s=%".to_string();
        let rows = session.query_rows(&scan_sql, &[&like_prefix]).await?;

        let mut candidates = Vec::new();
        for row in rows {
            let Some(pid) = row.pid else { continue };
            let Some(label) = row.application_name else {
                continue;
            };
            let Some(idle_ms) = row.state_change_ms else {
                continue;
            };
            if idle_ms < min_idle_ms {
                continue;
            }

            let Some(parsed) = self.lease_manager.parse_and_verify(&label, now_ms) else {
                // Not one of ours (or malformed) -- never touch sessions we
                // can't positively attribute to this library.
                continue;
            };
            let expected_service =
                crate::lease::normalize_service_name(&config.service_name, &parsed.instance);
            if parsed.service != expected_service || !parsed.is_expired {
                continue;
            }

            candidates.push((pid, parsed.expires_at_ms, idle_ms));
        }

        // Stalest lease first, then longest-idle, then a deterministic
        // pid tie-break.
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));
        candidates.truncate(config.max_idle_connections_to_kill);

        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let pids: Vec<i32> = candidates.into_iter().map(|(pid, _, _)| pid).collect();
        session
            .execute(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE pid = ANY($1::int[])",
                &[&pids],
            )
            .await?;
        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseMode;
    use crate::hooks::noop_hooks;
    use crate::session::{FakeSession, Row};
    use std::sync::Arc;

    fn test_config() -> Config {
        Config::builder()
            .service_name("svc")
            .lease_mode(LeaseMode::Optional)
            .min_connection_idle_time_sec(0)
            .build()
            .unwrap()
    }

    fn lease_manager() -> LeaseManager {
        LeaseManager::new(b"0123456789abcdef".to_vec()).unwrap()
    }

    #[tokio::test]
    async fn terminates_only_expired_matching_leases() {
        let lm = lease_manager();
        let expired_label = lm.mint("svc", "inst-a", 0).unwrap();
        let fresh_label = lm.mint("svc", "inst-b", i64::MAX / 2).unwrap();

        let session = FakeSession::default();
        *session.scripted_rows.lock().unwrap() = vec![
            Row {
                pid: Some(100),
                application_name: Some(expired_label),
                state_change_ms: Some(60_000),
            },
            Row {
                pid: Some(200),
                application_name: Some(fresh_label),
                state_change_ms: Some(60_000),
            },
        ];

        let reaper = Reaper::new(lm, noop_hooks());
        let config = test_config();
        let outcome = reaper
            .run_pass(&session, &config, 1, 1_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.terminated_pids, vec![100]);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn skips_sessions_not_belonging_to_this_service() {
        let lm = lease_manager();
        let other_service_label = lm.mint("other-svc", "inst-a", 0).unwrap();

        let session = FakeSession::default();
        *session.scripted_rows.lock().unwrap() = vec![Row {
            pid: Some(100),
            application_name: Some(other_service_label),
            state_change_ms: Some(60_000),
        }];

        let reaper = Reaper::new(lm, noop_hooks());
        let config = test_config();
        let outcome = reaper
            .run_pass(&session, &config, 1, 1_000)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.terminated_pids.is_empty());
    }

    #[tokio::test]
    async fn returns_none_when_lock_already_held() {
        let lm = lease_manager();
        let session = FakeSession::default();
        let (key1, key2) = advisory_keys("svc");
        session
            .advisory_locks
            .lock()
            .unwrap()
            .insert((key1, key2));

        let reaper = Reaper::new(lm, noop_hooks());
        let config = test_config();
        let result = reaper
            .run_pass(&session, &config, 1, 1_000)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn swallowed_scan_error_still_reports_locked_true_and_fires_on_reap() {
        use crate::hooks::Hooks;
        use std::sync::Mutex;

        struct CapturingHooks {
            events: Mutex<Vec<ReapEvent>>,
        }
        impl Hooks for CapturingHooks {
            fn on_reap(&self, event: &ReapEvent) {
                self.events.lock().unwrap().push(event.clone());
            }
        }

        let lm = lease_manager();
        let session = FakeSession::default();
        *session.fail_next_query.lock().unwrap() = Some(Error::Permanent {
            message: "scan failed".to_string(),
            meta: Default::default(),
        });

        let hooks = Arc::new(CapturingHooks {
            events: Mutex::new(Vec::new()),
        });
        let reaper = Reaper::new(lm, hooks.clone());
        let mut config = test_config();
        config.reaper_error_mode = crate::config::ReaperErrorMode::Swallow;

        let outcome = reaper
            .run_pass(&session, &config, 7, 1_000)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.terminated_pids.is_empty());
        assert!(outcome.error.is_some());

        let captured = hooks.events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].generation, 7);
        assert!(captured[0].locked);
        assert!(captured[0].terminated_pids.is_empty());
        assert!(captured[0].error.is_some());
    }

    #[tokio::test]
    async fn throw_mode_propagates_the_scan_error() {
        let lm = lease_manager();
        let session = FakeSession::default();
        *session.fail_next_query.lock().unwrap() = Some(Error::Permanent {
            message: "scan failed".to_string(),
            meta: Default::default(),
        });

        let reaper = Reaper::new(lm, noop_hooks());
        let mut config = test_config();
        config.reaper_error_mode = crate::config::ReaperErrorMode::Throw;

        let result = reaper.run_pass(&session, &config, 1, 1_000).await;
        assert!(result.is_err());
    }

    #[test]
    fn cooldown_blocks_immediate_rerun() {
        let lm = lease_manager();
        let reaper = Reaper::new(lm, noop_hooks());
        let config = test_config();
        reaper.last_run_ms.store(1_000, Ordering::Relaxed);
        assert!(!reaper.cooldown_elapsed(&config, 1_500));
        assert!(reaper.cooldown_elapsed(&config, 1_000 + config.reaper_cooldown_ms));
    }
}
