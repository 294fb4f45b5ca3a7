//! Interceptor orchestration.
//!
//! Owns the process-wide configuration, constructs the single breaker and
//! traffic filter shared by all hooks, installs every supported hook and
//! performs the startup handshake with the proxy.

use std::sync::Arc;

use hyper::header::HeaderMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::InterceptorConfig;
use crate::fail_safe::FailSafe;
use crate::headers::{set_header_value, X_WAYPOINT_TENANT_ID};
use crate::hooks::{Hook, RoutingState};
use crate::traffic_filter::TrafficFilter;

#[cfg(feature = "hyper-client")]
use crate::hooks::HyperHook;
#[cfg(feature = "reqwest-client")]
use crate::hooks::ReqwestHook;

static INSTANCE: OnceCell<Arc<Interceptor>> = OnceCell::const_new();

/// Process-wide singleton that wires configuration, breaker, filter and
/// hooks together.
///
/// At most one instance exists per process: hooks toggle shared entry
/// points, and a second instance would double-wrap them. Use
/// [`Interceptor::init`] for normal operation; [`Interceptor::bootstrap`]
/// builds a detached instance for embedding in tests.
pub struct Interceptor {
    state: Arc<RoutingState>,
    hooks: Vec<Arc<dyn Hook>>,
    #[cfg(feature = "hyper-client")]
    hyper: Arc<HyperHook>,
    #[cfg(feature = "reqwest-client")]
    reqwest: Arc<ReqwestHook>,
}

impl Interceptor {
    /// Initialize (once) from the environment and return the singleton.
    ///
    /// Subsequent calls return the existing instance unchanged.
    pub async fn init() -> Arc<Interceptor> {
        INSTANCE
            .get_or_init(|| async {
                Arc::new(Interceptor::bootstrap(InterceptorConfig::from_env()).await)
            })
            .await
            .clone()
    }

    /// Build an interceptor from an explicit configuration.
    ///
    /// With an invalid connection config the interceptor stays fully inert:
    /// no hooks are installed and every wrapped call passes through
    /// unchanged. A failed handshake only logs a warning; hooks stay
    /// installed and host traffic keeps flowing, directly when need be.
    pub async fn bootstrap(config: InterceptorConfig) -> Interceptor {
        let state = Arc::new(RoutingState {
            connection: config.connection.clone(),
            fail_safe: Arc::new(FailSafe::from_config(&config.fail_safe)),
            traffic_filter: Arc::new(TrafficFilter::new(&config.traffic_filter)),
        });

        #[cfg(feature = "hyper-client")]
        let hyper = Arc::new(HyperHook::new(state.clone()));
        #[cfg(feature = "reqwest-client")]
        let reqwest = Arc::new(ReqwestHook::new(state.clone()));

        let mut hooks: Vec<Arc<dyn Hook>> = Vec::new();
        #[cfg(feature = "hyper-client")]
        hooks.push(hyper.clone());
        #[cfg(feature = "reqwest-client")]
        hooks.push(reqwest.clone());
        hooks.retain(|hook| hook.is_supported());

        let interceptor = Interceptor {
            state,
            hooks,
            #[cfg(feature = "hyper-client")]
            hyper,
            #[cfg(feature = "reqwest-client")]
            reqwest,
        };

        if !interceptor.state.connection.is_valid {
            warn!("Waypoint proxy connection is not configured, interceptor stays inert");
            return interceptor;
        }

        interceptor.install();
        info!("Waypoint interceptor is loaded");
        interceptor.handshake().await;
        interceptor
    }

    /// Validate the connection to the proxy and learn its managed mode.
    async fn handshake(&self) {
        let Some(hook) = self.hooks.iter().find(|hook| hook.is_installed()) else {
            return;
        };

        debug!("Establishing handshake with the Waypoint proxy...");
        let url = self.state.connection.handshake_url();
        let mut headers = HeaderMap::new();
        set_header_value(
            &mut headers,
            &X_WAYPOINT_TENANT_ID,
            &self.state.connection.tenant_id,
        );

        match hook.probe(&url, headers).await {
            Some(handshake) => {
                self.state.traffic_filter.set_managed(handshake.managed);
                debug!("Successfully communicated with the Waypoint proxy");
            }
            None => {
                warn!(
                    "Failed to communicate with the Waypoint proxy; make sure it is running \
                     and port '{}' is set as the handshake port",
                    self.state.connection.handshake_port
                );
            }
        }
    }

    /// Activate every supported hook. Idempotent.
    pub fn install(&self) {
        for hook in &self.hooks {
            hook.install();
            debug!("Installed {} hook", hook.name());
        }
    }

    /// Restore every hook to pass-through behavior. Idempotent.
    pub fn uninstall(&self) {
        for hook in &self.hooks {
            hook.uninstall();
            debug!("Uninstalled {} hook", hook.name());
        }
    }

    /// Whether any hook is currently rewriting traffic.
    pub fn is_active(&self) -> bool {
        self.state.connection.is_valid && self.hooks.iter().any(|hook| hook.is_installed())
    }

    /// The hook wrapping the shared hyper legacy client.
    #[cfg(feature = "hyper-client")]
    pub fn hyper_hook(&self) -> Arc<HyperHook> {
        self.hyper.clone()
    }

    /// The hook wrapping a `reqwest::Client`.
    #[cfg(feature = "reqwest-client")]
    pub fn reqwest_hook(&self) -> Arc<ReqwestHook> {
        self.reqwest.clone()
    }

    pub fn fail_safe(&self) -> Arc<FailSafe> {
        self.state.fail_safe.clone()
    }

    pub fn traffic_filter(&self) -> Arc<TrafficFilter> {
        self.state.traffic_filter.clone()
    }
}
