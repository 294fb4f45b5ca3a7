//! Proxy-directed retry protocol.
//!
//! After a proxied call returns, the response headers are the sole retry
//! signal: a retry-after delay in (possibly fractional) seconds plus a
//! correlated sequence id. The proxy is the only authority on how many times
//! to retry; the loop terminates exactly when a response carries no retry
//! directive.

use std::time::Duration;

use hyper::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::headers::{X_WAYPOINT_RETRY_AFTER, X_WAYPOINT_SEQUENCE_ID};

/// A single retry instruction extracted from a proxy response.
#[derive(Debug, Clone)]
pub struct RetryDirective {
    pub sequence_id: HeaderValue,
    pub delay: Duration,
}

impl RetryDirective {
    /// Inspect response headers for a retry directive.
    ///
    /// Returns `None` when no retry is requested, and also when the
    /// directive is malformed (unparsable or negative delay, missing or
    /// empty sequence id) - in that case the anomaly is logged and the
    /// response is surfaced as-is.
    pub fn from_headers(headers: &HeaderMap) -> Option<RetryDirective> {
        let raw_retry_after = headers.get(&X_WAYPOINT_RETRY_AFTER)?;

        let delay_secs: f64 = match raw_retry_after.to_str().ok().and_then(|v| v.parse().ok()) {
            Some(secs) => secs,
            None => {
                debug!(
                    "Retry required, but parsing header {} as float failed ({:?})",
                    X_WAYPOINT_RETRY_AFTER.as_str(),
                    raw_retry_after
                );
                return None;
            }
        };

        // Rejects NaN, infinities, negatives and delays too large to
        // represent as a Duration.
        let delay = match Duration::try_from_secs_f64(delay_secs) {
            Ok(delay) => delay,
            Err(_) => {
                debug!(
                    "Retry required, but {} carries an invalid delay ({delay_secs})",
                    X_WAYPOINT_RETRY_AFTER.as_str()
                );
                return None;
            }
        };

        let sequence_id = match headers.get(&X_WAYPOINT_SEQUENCE_ID) {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                debug!(
                    "Retry required, but {} is missing!",
                    X_WAYPOINT_SEQUENCE_ID.as_str()
                );
                return None;
            }
        };

        Some(RetryDirective { sequence_id, delay })
    }

    /// Suspend until the proxy-directed delay has elapsed.
    ///
    /// Only this call suspends; concurrent outbound calls are unaffected.
    /// If the host cancels the outer call, the pending retry is abandoned
    /// together with this sleep.
    pub async fn wait(&self) {
        debug!("Retry required, will retry in {:?}...", self.delay);
        tokio::time::sleep(self.delay).await;
    }
}
