//! Client-side interceptor for the Waypoint egress proxy.
//!
//! Wraps an application's outbound HTTP clients so eligible calls are
//! transparently rerouted through the proxy, with fail-safe fallback to
//! direct delivery, proxy-directed retries and host-level traffic
//! filtering. See the crate README for the wiring walkthrough.

// ===== Core interceptor modules =====
pub mod config;
pub mod fail_safe;
pub mod headers;
pub mod hooks;
pub mod interceptor;
pub mod retry;
pub mod traffic_filter;

pub use fail_safe::{FailSafe, ProxyReportedError, RecoverableError};
pub use hooks::{Handshake, Hook, HookError};
pub use interceptor::Interceptor;
pub use retry::RetryDirective;
pub use traffic_filter::TrafficFilter;

#[cfg(feature = "hyper-client")]
pub use hooks::{HttpClient, HyperHook};
#[cfg(feature = "reqwest-client")]
pub use hooks::ReqwestHook;
