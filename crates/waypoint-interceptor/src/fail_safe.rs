//! Fail-safe circuit breaker guarding all communication with the proxy.
//!
//! The breaker counts consecutive transport failures (and proxy-reported
//! failures) across every hooked call. Once the threshold is reached, proxy
//! routing is disabled process-wide for a cooldown period, after which the
//! next call is simply allowed through again: there is no half-open probe
//! state, and a post-cooldown failure re-trips immediately.

use std::fmt::Display;
use std::time::{Duration, Instant};

use hyper::header::HeaderMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::FailSafeConfig;
use crate::headers::X_WAYPOINT_ERROR;

/// Raised when a proxy response carries the error indicator header.
///
/// Presence of the header alone signals failure, regardless of its value;
/// the breaker counts it the same as a transport failure.
#[derive(Debug, Error)]
#[error("proxy reported an error handling the request")]
pub struct ProxyReportedError;

/// Classifies errors the breaker absorbs.
///
/// Transport failures on the way to the proxy (connection refused, TLS
/// failure, DNS failure) and [`ProxyReportedError`] are recoverable: they are
/// counted and the call falls back to a direct attempt. Everything else
/// propagates to the caller unchanged.
pub trait RecoverableError {
    fn is_recoverable(&self) -> bool;
}

struct BreakerState {
    healthy: bool,
    consecutive_errors: u32,
    tripped_at: Option<Instant>,
}

/// Time-windowed error counter shared by all hooks.
pub struct FailSafe {
    state: Mutex<BreakerState>,
    max_errors_allowed: u32,
    cooldown: Duration,
}

impl FailSafe {
    pub fn new(max_errors_allowed: u32, cooldown: Duration) -> Self {
        FailSafe {
            state: Mutex::new(BreakerState {
                healthy: true,
                consecutive_errors: 0,
                tripped_at: None,
            }),
            max_errors_allowed,
            cooldown,
        }
    }

    pub fn from_config(config: &FailSafeConfig) -> Self {
        Self::new(
            config.max_errors_allowed,
            Duration::from_secs(config.cooldown_sec),
        )
    }

    /// Whether proxy routing is currently permitted.
    ///
    /// Reading this is what closes the circuit again: once the cooldown has
    /// elapsed the breaker flips back to healthy as a side effect, and the
    /// next call is attempted optimistically. The error counter is not reset
    /// by the flip, so a single post-cooldown failure re-trips.
    pub fn state_ok(&self) -> bool {
        let mut state = self.state.lock();
        if !state.healthy {
            if let Some(tripped_at) = state.tripped_at {
                if tripped_at.elapsed() >= self.cooldown {
                    debug!("FailSafe cooldown elapsed, re-enabling proxy routing");
                    state.healthy = true;
                }
            }
        }
        state.healthy
    }

    /// Record a proxy communication failure, tripping the breaker when the
    /// consecutive error count reaches the configured threshold.
    pub fn on_error(&self) {
        let mut state = self.state.lock();
        state.consecutive_errors += 1;
        if state.consecutive_errors >= self.max_errors_allowed {
            state.healthy = false;
            state.tripped_at = Some(Instant::now());
            debug!(
                errors = state.consecutive_errors,
                "FailSafe threshold reached, starting cooldown"
            );
        }
    }

    /// Record a successful proxied call, resetting the error counter.
    pub fn on_success(&self) {
        self.state.lock().consecutive_errors = 0;
    }

    /// The guarded-call contract around a proxied attempt.
    ///
    /// `Ok(v)` resets the counter and yields the value. A recoverable error
    /// is counted and swallowed, yielding `Ok(None)`: the caller must fall
    /// back to a direct call. Any other error propagates unchanged so the
    /// breaker never hides unrelated application errors.
    pub fn guard<T, E>(&self, outcome: Result<T, E>) -> Result<Option<T>, E>
    where
        E: RecoverableError + Display,
    {
        match outcome {
            Ok(value) => {
                self.on_success();
                Ok(Some(value))
            }
            Err(error) if error.is_recoverable() => {
                self.on_error();
                warn!("FailSafe: error communicating with the Waypoint proxy: {error}");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Check a proxy response for the explicit error indicator header.
    pub fn check_headers(&self, headers: &HeaderMap) -> Result<(), ProxyReportedError> {
        if headers.contains_key(&X_WAYPOINT_ERROR) {
            return Err(ProxyReportedError);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    const MAX_ERRORS: u32 = 3;
    const COOLDOWN: Duration = Duration::from_millis(200);

    #[derive(Debug, Error)]
    enum TestError {
        #[error("transport failure")]
        Transport,
        #[error("application failure")]
        Application,
    }

    impl RecoverableError for TestError {
        fn is_recoverable(&self) -> bool {
            matches!(self, TestError::Transport)
        }
    }

    fn breaker() -> FailSafe {
        FailSafe::new(MAX_ERRORS, COOLDOWN)
    }

    #[test]
    fn test_enter_fail_safe() {
        let fail_safe = breaker();
        assert!(fail_safe.state_ok());
        for _ in 0..MAX_ERRORS {
            fail_safe.on_error();
        }
        assert!(!fail_safe.state_ok());
    }

    #[test]
    fn test_stays_tripped_before_cooldown() {
        let fail_safe = breaker();
        for _ in 0..MAX_ERRORS {
            fail_safe.on_error();
        }
        sleep(COOLDOWN / 4);
        assert!(!fail_safe.state_ok());
    }

    #[test]
    fn test_exit_fail_safe_after_cooldown() {
        let fail_safe = breaker();
        for _ in 0..MAX_ERRORS {
            fail_safe.on_error();
        }
        assert!(!fail_safe.state_ok());
        sleep(COOLDOWN + Duration::from_millis(50));
        assert!(fail_safe.state_ok());
    }

    #[test]
    fn test_retrips_on_first_error_after_cooldown() {
        let fail_safe = breaker();
        for _ in 0..MAX_ERRORS {
            fail_safe.on_error();
        }
        sleep(COOLDOWN + Duration::from_millis(50));
        assert!(fail_safe.state_ok());

        // Counter was never reset, so one more failure trips again.
        fail_safe.on_error();
        assert!(!fail_safe.state_ok());
    }

    #[test]
    fn test_success_after_cooldown_keeps_circuit_closed() {
        let fail_safe = breaker();
        for _ in 0..MAX_ERRORS {
            fail_safe.on_error();
        }
        sleep(COOLDOWN + Duration::from_millis(50));
        assert!(fail_safe.state_ok());

        fail_safe.on_success();
        fail_safe.on_error();
        assert!(fail_safe.state_ok());
    }

    #[test]
    fn test_guard_swallows_recoverable_errors() {
        let fail_safe = breaker();
        let outcome: Result<Option<()>, TestError> =
            fail_safe.guard(Err(TestError::Transport));
        assert!(matches!(outcome, Ok(None)));
    }

    #[test]
    fn test_guard_propagates_unrelated_errors() {
        let fail_safe = breaker();
        let outcome: Result<Option<()>, TestError> =
            fail_safe.guard(Err(TestError::Application));
        assert!(matches!(outcome, Err(TestError::Application)));
        // Unrelated errors are not counted.
        assert!(fail_safe.state_ok());
        for _ in 0..MAX_ERRORS {
            let _ = fail_safe.guard::<(), _>(Err(TestError::Application));
        }
        assert!(fail_safe.state_ok());
    }

    #[test]
    fn test_guard_success_resets_counter() {
        let fail_safe = breaker();
        for _ in 0..MAX_ERRORS - 1 {
            let _ = fail_safe.guard::<(), _>(Err(TestError::Transport));
        }
        assert!(fail_safe.state_ok());
        let _ = fail_safe.guard::<(), TestError>(Ok(()));
        // Counter is back at zero, so the threshold starts over.
        for _ in 0..MAX_ERRORS - 1 {
            let _ = fail_safe.guard::<(), _>(Err(TestError::Transport));
        }
        assert!(fail_safe.state_ok());
    }

    #[test]
    fn test_check_headers_flags_error_indicator() {
        let fail_safe = breaker();
        let mut headers = HeaderMap::new();
        assert!(fail_safe.check_headers(&headers).is_ok());

        // Presence alone signals failure, whatever the value.
        headers.insert(X_WAYPOINT_ERROR.clone(), "2".parse().unwrap());
        assert!(fail_safe.check_headers(&headers).is_err());
    }
}
