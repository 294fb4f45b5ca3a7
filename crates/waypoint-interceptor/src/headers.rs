//! Safe header insertion helpers for the Waypoint wire protocol.
//!
//! This module provides compile-time safe header names and values for the
//! headers exchanged with the Waypoint proxy, eliminating runtime
//! `.parse().unwrap()` calls.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};

// Request direction: injected on proxied requests.
pub static X_WAYPOINT_HOST: HeaderName = HeaderName::from_static("x-waypoint-host");
pub static X_WAYPOINT_SCHEME: HeaderName = HeaderName::from_static("x-waypoint-scheme");
pub static X_WAYPOINT_INTERCEPTOR: HeaderName = HeaderName::from_static("x-waypoint-interceptor");
pub static X_WAYPOINT_REQ_ID: HeaderName = HeaderName::from_static("x-waypoint-req-id");
pub static X_WAYPOINT_TENANT_ID: HeaderName = HeaderName::from_static("x-waypoint-tenant-id");

// Response direction: read from proxy responses.
pub static X_WAYPOINT_ERROR: HeaderName = HeaderName::from_static("x-waypoint-error");
pub static X_WAYPOINT_SEQUENCE_ID: HeaderName = HeaderName::from_static("x-waypoint-sequence-id");
pub static X_WAYPOINT_RETRY_AFTER: HeaderName = HeaderName::from_static("x-waypoint-retry-after");

// Per-call override: recognized on the request path only, never transmitted.
pub static X_WAYPOINT_ALLOW: HeaderName = HeaderName::from_static("x-waypoint-allow");

pub static VALUE_TRUE: HeaderValue = HeaderValue::from_static("true");

/// Identity string carried on every proxied request.
pub const INTERCEPTOR_ID: &str =
    concat!("waypoint-rust-interceptor/", env!("CARGO_PKG_VERSION"));

/// Insert a header with a static name and a dynamic string value.
/// Returns false if the value couldn't be converted to a valid header value.
pub fn set_header_value(headers: &mut HeaderMap, name: &HeaderName, value: &str) -> bool {
    match HeaderValue::from_str(value) {
        Ok(header_value) => {
            headers.insert(name.clone(), header_value);
            true
        }
        Err(_) => false,
    }
}

/// Remove the sequence-id header so retries stay invisible to the caller.
///
/// All other proxy-added response headers pass through unchanged.
pub fn strip_sequence_id(headers: &mut HeaderMap) {
    headers.remove(&X_WAYPOINT_SEQUENCE_ID);
}
