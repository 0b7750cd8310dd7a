//! Transient-error classification and decorrelated-jitter backoff.

use rand::Rng;

use crate::error::{Error, ErrorMeta};

/// SQLSTATE class/codes treated as transient: connection exceptions (class
/// 08), admin-initiated termination / crash shutdown / cannot-connect-now
/// (`57P01`, `57P02`, `57P03`), and `too_many_connections` (`53300`).
const TRANSIENT_SQLSTATES: &[&str] = &["53300", "57P01", "57P02", "57P03"];

fn is_transient_sqlstate_class(sqlstate: &str) -> bool {
    sqlstate.starts_with("08") || TRANSIENT_SQLSTATES.contains(&sqlstate)
}

/// Transport-level errno/syscall strings treated as transient.
const TRANSIENT_ERRNOS: &[&str] = &[
    "ECONNRESET",
    "EPIPE",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "EAI_AGAIN",
    "ECONNABORTED",
    "EADDRINUSE",
];

/// Literal message substrings treated as transient when no SQLSTATE or
/// errno is available to classify on.
const TRANSIENT_MESSAGE_SUBSTRINGS: &[&str] = &[
    "Connection terminated unexpectedly",
    "sorry, too many clients already",
];

/// Classify a raw driver failure into the library's [`Error`] taxonomy.
///
/// `sqlstate` is `Some` only for errors the server itself reported (as
/// opposed to transport failures that never reached a server response).
pub fn classify(message: &str, meta: ErrorMeta) -> Error {
    if let Some(sqlstate) = meta.sqlstate.as_deref() {
        if is_transient_sqlstate_class(sqlstate) {
            return Error::TransientDatabase {
                sqlstate: sqlstate.to_string(),
                message: message.to_string(),
                meta,
            };
        }
        return Error::Permanent {
            message: message.to_string(),
            meta,
        };
    }

    let errno_transient = meta
        .errno
        .as_deref()
        .map(|e| TRANSIENT_ERRNOS.contains(&e))
        .unwrap_or(false);
    let message_transient = TRANSIENT_MESSAGE_SUBSTRINGS
        .iter()
        .any(|needle| message.contains(needle));

    if errno_transient || message_transient {
        return Error::TransientTransport {
            message: message.to_string(),
            meta,
        };
    }

    Error::Permanent {
        message: message.to_string(),
        meta,
    }
}

/// Decorrelated-jitter backoff: `delay = min(cap, uniform(base, prev * 3))`.
///
/// Keeps the previously drawn delay so each call can widen the sampling
/// range from it, per Marc Brooker's decorrelated-jitter algorithm.
#[derive(Clone, Debug)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    prev_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            cap_ms,
            prev_ms: base_ms,
        }
    }

    /// Draw the next delay and advance internal state.
    pub fn next_delay_ms(&mut self) -> u64 {
        let upper = self.prev_ms.saturating_mul(3).max(self.base_ms);
        let delay = if upper <= self.base_ms {
            self.base_ms
        } else {
            rand::rng().random_range(self.base_ms..=upper)
        };
        let delay = delay.min(self.cap_ms);
        self.prev_ms = delay;
        delay
    }

    /// Reset to the base delay, e.g. after a successful attempt.
    pub fn reset(&mut self) {
        self.prev_ms = self.base_ms;
    }
}

/// Retry an async operation under decorrelated-jitter backoff, bounded by
/// both an attempt count and a wall-clock budget. `op` is re-invoked on any
/// [`Error::is_transient`] failure; anything else is returned immediately.
/// `on_retry` is called with the attempt number, the delay about to be
/// slept, and the error that triggered the retry -- the only place that
/// knows the actual delay chosen, so callers that want to report it (hook
/// events, reconnect bookkeeping) observe it here rather than guessing.
pub async fn retry_with_backoff<F, Fut, T, R>(
    max_attempts: u32,
    base_ms: u64,
    cap_ms: u64,
    max_elapsed_ms: u64,
    mut op: F,
    mut on_retry: R,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
    R: FnMut(u32, u64, &Error),
{
    let mut backoff = Backoff::new(base_ms, cap_ms);
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let elapsed = start.elapsed().as_millis() as u64;
                if elapsed >= max_elapsed_ms {
                    return Err(err);
                }
                let delay = backoff.next_delay_ms();
                let remaining = max_elapsed_ms.saturating_sub(elapsed);
                let delay = delay.min(remaining);
                on_retry(attempt, delay, &err);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
