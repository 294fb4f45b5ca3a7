//! Client hooks: the integration points that intercept outbound calls.
//!
//! One hook exists per supported HTTP client surface. Rust has no runtime
//! monkey-patching, so a hook wraps the original, un-intercepted client
//! machinery and exposes the same request entry point: the proxy redirection
//! is entirely a matter of destination/header rewriting, never a different
//! transport. An uninstalled hook forwards every call verbatim.
//!
//! # Module Structure
//!
//! - `hyper` - hook around the shared `hyper_util` legacy client
//! - `reqwest` - hook around a `reqwest::Client`

#[cfg(feature = "hyper-client")]
mod hyper_hook;
#[cfg(feature = "reqwest-client")]
mod reqwest_hook;

#[cfg(feature = "hyper-client")]
pub use hyper_hook::{HttpClient, HyperHook};
#[cfg(feature = "reqwest-client")]
pub use reqwest_hook::ReqwestHook;

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::Uri;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConnectionConfig, HTTPS_SCHEME, HTTP_SCHEME};
use crate::fail_safe::{FailSafe, ProxyReportedError, RecoverableError};
use crate::headers::{
    set_header_value, INTERCEPTOR_ID, X_WAYPOINT_HOST, X_WAYPOINT_INTERCEPTOR, X_WAYPOINT_REQ_ID,
    X_WAYPOINT_SCHEME, X_WAYPOINT_SEQUENCE_ID, X_WAYPOINT_TENANT_ID,
};
use crate::traffic_filter::TrafficFilter;

/// Errors surfaced by a hook's request entry point.
///
/// Inner client errors pass through transparently so the wrapper keeps the
/// client's own error contract.
#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    ProxyReported(#[from] ProxyReportedError),

    /// The destination host could not be parsed from the call's URL. This is
    /// a caller programming error and never falls back silently.
    #[error("could not extract a destination host from '{0}'")]
    MissingHost(String),

    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    #[cfg(feature = "hyper-client")]
    #[error(transparent)]
    Client(#[from] hyper_util::client::legacy::Error),

    #[cfg(feature = "reqwest-client")]
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

impl RecoverableError for HookError {
    fn is_recoverable(&self) -> bool {
        match self {
            HookError::ProxyReported(_) => true,
            #[cfg(feature = "hyper-client")]
            HookError::Client(error) => error.is_connect(),
            #[cfg(feature = "reqwest-client")]
            HookError::Reqwest(error) => error.is_connect() || error.is_timeout(),
            _ => false,
        }
    }
}

/// Handshake response body from the proxy.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub managed: bool,
}

/// State shared by every hook: the connection settings plus the single
/// breaker and filter owned by the interceptor.
pub struct RoutingState {
    pub connection: ConnectionConfig,
    pub fail_safe: Arc<FailSafe>,
    pub traffic_filter: Arc<TrafficFilter>,
}

impl RoutingState {
    /// Decide whether a call may be routed through the proxy.
    ///
    /// A tripped breaker short-circuits to "do not route" without consulting
    /// the filter, so the per-call override header is only stripped when the
    /// filter actually runs.
    pub(crate) async fn should_route(&self, host: &str, headers: &mut HeaderMap) -> bool {
        self.connection.is_valid
            && self.fail_safe.state_ok()
            && self.traffic_filter.is_allowed(host, headers).await
    }
}

/// Ephemeral per-call state, carried across all retry attempts of one
/// logical request and destroyed when the call completes.
pub struct RequestContext {
    /// Diagnostics only; a fresh id per outbound call.
    pub request_id: String,
    /// Present once the proxy responded with a retry directive.
    pub sequence_id: Option<HeaderValue>,
    pub original_headers: HeaderMap,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl RequestContext {
    pub fn new(scheme: &str, host: &str, port: Option<u16>, original_headers: HeaderMap) -> Self {
        RequestContext {
            request_id: Uuid::new_v4().to_string(),
            sequence_id: None,
            original_headers,
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// Original `host[:port]`, the port included only when non-default for
    /// the scheme.
    pub fn host_header_value(&self) -> String {
        match self.port {
            Some(port) if !is_default_port(&self.scheme, port) => {
                format!("{}:{}", self.host, port)
            }
            _ => self.host.clone(),
        }
    }
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    (scheme == HTTP_SCHEME && port == 80) || (scheme == HTTPS_SCHEME && port == 443)
}

/// A single intercepted HTTP client surface.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the target client surface is compiled in. Hooks for absent
    /// surfaces are skipped silently.
    fn is_supported(&self) -> bool {
        true
    }

    /// Activate interception. Idempotent; an installed hook rewrites
    /// eligible calls toward the proxy.
    fn install(&self);

    /// Restore pass-through behavior. Idempotent.
    fn uninstall(&self);

    fn is_installed(&self) -> bool;

    /// Issue a direct (non-intercepted) GET against the proxy handshake
    /// endpoint and capture the managed flag from its JSON body.
    async fn probe(&self, url: &str, headers: HeaderMap) -> Option<Handshake>;
}

/// Build the proxied destination: the proxy's scheme/host/port with the
/// original path and query.
pub(crate) fn proxied_uri(
    connection: &ConnectionConfig,
    path_and_query: Option<&PathAndQuery>,
) -> Result<Uri, hyper::http::Error> {
    let path = path_and_query.map(|pq| pq.as_str()).unwrap_or("/");
    Uri::try_from(format!("{}{}", connection.proxy_url, path)).map_err(hyper::http::Error::from)
}

/// Build the header set for a proxied attempt: the caller's headers plus the
/// wire-protocol headers identifying the original destination.
pub(crate) fn proxied_headers(state: &RoutingState, ctx: &RequestContext) -> HeaderMap {
    let mut headers = ctx.original_headers.clone();
    let host_value = ctx.host_header_value();
    set_header_value(&mut headers, &HOST, &host_value);
    set_header_value(&mut headers, &X_WAYPOINT_HOST, &host_value);
    set_header_value(&mut headers, &X_WAYPOINT_SCHEME, &ctx.scheme);
    headers.insert(
        X_WAYPOINT_INTERCEPTOR.clone(),
        HeaderValue::from_static(INTERCEPTOR_ID),
    );
    set_header_value(&mut headers, &X_WAYPOINT_REQ_ID, &ctx.request_id);
    if state.traffic_filter.managed() {
        set_header_value(&mut headers, &X_WAYPOINT_TENANT_ID, &state.connection.tenant_id);
    }
    if let Some(sequence_id) = &ctx.sequence_id {
        headers.insert(X_WAYPOINT_SEQUENCE_ID.clone(), sequence_id.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailSafeConfig, TrafficFilterConfig};

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            is_valid: true,
            proxy_host: "proxy.internal".to_string(),
            proxy_port: 8000,
            proxy_scheme: "http",
            proxy_url: "http://proxy.internal:8000".to_string(),
            tenant_id: "tenant-a".to_string(),
            handshake_port: 8040,
        }
    }

    fn state() -> RoutingState {
        RoutingState {
            connection: connection(),
            fail_safe: Arc::new(FailSafe::from_config(&FailSafeConfig::default())),
            traffic_filter: Arc::new(TrafficFilter::new(&TrafficFilterConfig::default())),
        }
    }

    #[test]
    fn test_proxied_uri_keeps_path_and_query() {
        let uri: Uri = "https://api.example.com/v1/items?page=2".parse().unwrap();
        let proxied = proxied_uri(&connection(), uri.path_and_query()).unwrap();
        assert_eq!(proxied.to_string(), "http://proxy.internal:8000/v1/items?page=2");
    }

    #[test]
    fn test_proxied_uri_defaults_to_root_path() {
        let proxied = proxied_uri(&connection(), None).unwrap();
        assert_eq!(proxied.to_string(), "http://proxy.internal:8000/");
    }

    #[test]
    fn test_host_header_value_omits_default_ports() {
        let ctx = RequestContext::new("https", "api.example.com", Some(443), HeaderMap::new());
        assert_eq!(ctx.host_header_value(), "api.example.com");
        let ctx = RequestContext::new("http", "api.example.com", Some(80), HeaderMap::new());
        assert_eq!(ctx.host_header_value(), "api.example.com");
        let ctx = RequestContext::new("http", "api.example.com", Some(8080), HeaderMap::new());
        assert_eq!(ctx.host_header_value(), "api.example.com:8080");
        let ctx = RequestContext::new("https", "api.example.com", None, HeaderMap::new());
        assert_eq!(ctx.host_header_value(), "api.example.com");
    }

    #[test]
    fn test_proxied_headers_carry_the_wire_protocol() {
        let state = state();
        let mut original = HeaderMap::new();
        original.insert("authorization", HeaderValue::from_static("Bearer t"));
        let ctx = RequestContext::new("https", "api.example.com", None, original);

        let headers = proxied_headers(&state, &ctx);
        assert_eq!(headers.get(HOST).unwrap(), "api.example.com");
        assert_eq!(headers.get(&X_WAYPOINT_HOST).unwrap(), "api.example.com");
        assert_eq!(headers.get(&X_WAYPOINT_SCHEME).unwrap(), "https");
        assert_eq!(headers.get(&X_WAYPOINT_INTERCEPTOR).unwrap(), INTERCEPTOR_ID);
        assert_eq!(
            headers.get(&X_WAYPOINT_REQ_ID).unwrap().to_str().unwrap(),
            ctx.request_id
        );
        // Caller headers pass through untouched.
        assert_eq!(headers.get("authorization").unwrap(), "Bearer t");
        // Not managed: no tenant header, no sequence id on a first attempt.
        assert!(headers.get(&X_WAYPOINT_TENANT_ID).is_none());
        assert!(headers.get(&X_WAYPOINT_SEQUENCE_ID).is_none());
    }

    #[test]
    fn test_proxied_headers_tenant_only_when_managed() {
        let state = state();
        state.traffic_filter.set_managed(true);
        let ctx = RequestContext::new("http", "api.example.com", None, HeaderMap::new());
        let headers = proxied_headers(&state, &ctx);
        assert_eq!(headers.get(&X_WAYPOINT_TENANT_ID).unwrap(), "tenant-a");
    }

    #[test]
    fn test_proxied_headers_sequence_id_on_retry_attempts() {
        let state = state();
        let mut ctx = RequestContext::new("http", "api.example.com", None, HeaderMap::new());
        ctx.sequence_id = Some(HeaderValue::from_static("seq-1"));
        let headers = proxied_headers(&state, &ctx);
        assert_eq!(headers.get(&X_WAYPOINT_SEQUENCE_ID).unwrap(), "seq-1");
    }

    #[test]
    fn test_request_ids_are_unique_per_call() {
        let a = RequestContext::new("http", "h", None, HeaderMap::new());
        let b = RequestContext::new("http", "h", None, HeaderMap::new());
        assert_ne!(a.request_id, b.request_id);
    }

    #[tokio::test]
    async fn test_should_route_requires_valid_connection() {
        let mut state = state();
        state.connection.is_valid = false;
        assert!(!state.should_route("8.8.8.8", &mut HeaderMap::new()).await);
    }

    #[tokio::test]
    async fn test_should_route_short_circuits_on_tripped_breaker() {
        let state = state();
        for _ in 0..FailSafeConfig::default().max_errors_allowed {
            state.fail_safe.on_error();
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            crate::headers::X_WAYPOINT_ALLOW.clone(),
            HeaderValue::from_static("true"),
        );
        assert!(!state.should_route("8.8.8.8", &mut headers).await);
        // The filter never ran, so the override header was not stripped.
        assert!(headers.get(&crate::headers::X_WAYPOINT_ALLOW).is_some());
    }
}
