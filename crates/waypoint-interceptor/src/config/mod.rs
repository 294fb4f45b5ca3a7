//! Configuration types for the Waypoint interceptor.
//!
//! Everything is sourced from environment variables with typed defaults;
//! there is no configuration file. A missing or unparsable proxy address
//! never raises an error: it produces an invalid [`ConnectionConfig`] and the
//! interceptor stays fully inert.

use std::env;
use std::str::FromStr;

use tracing::warn;

pub const ENV_PROXY_HOST: &str = "WAYPOINT_PROXY_HOST";
pub const ENV_TENANT_ID: &str = "WAYPOINT_TENANT_ID";
pub const ENV_HANDSHAKE_PORT: &str = "WAYPOINT_HANDSHAKE_PORT";
pub const ENV_PROXY_SUPPORT_TLS: &str = "WAYPOINT_PROXY_SUPPORT_TLS";
pub const ENV_ALLOW_LIST: &str = "WAYPOINT_ALLOW_LIST";
pub const ENV_BLOCK_LIST: &str = "WAYPOINT_BLOCK_LIST";
pub const ENV_FAILSAFE_MAX_ERRORS: &str = "WAYPOINT_FAILSAFE_MAX_ERRORS";
pub const ENV_FAILSAFE_COOLDOWN_SEC: &str = "WAYPOINT_FAILSAFE_COOLDOWN_SEC";

const DEFAULT_TENANT_ID: &str = "unknown";
const DEFAULT_HANDSHAKE_PORT: u16 = 8040;
const DEFAULT_MAX_ERRORS_ALLOWED: u32 = 5;
const DEFAULT_COOLDOWN_SEC: u64 = 10;

pub const HTTP_SCHEME: &str = "http";
pub const HTTPS_SCHEME: &str = "https";

fn load_env_str(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn load_env_parsed<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Could not parse {} value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

/// Immutable, process-wide connection settings for reaching the proxy.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub is_valid: bool,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_scheme: &'static str,
    pub proxy_url: String,
    pub tenant_id: String,
    pub handshake_port: u16,
}

impl ConnectionConfig {
    /// Load the proxy connection settings from the environment.
    ///
    /// An absent, portless or otherwise unparsable `WAYPOINT_PROXY_HOST`
    /// yields an invalid config (warn-logged) rather than an error.
    pub fn from_env() -> Self {
        let scheme = if load_env_str(ENV_PROXY_SUPPORT_TLS, "0") == "1" {
            HTTPS_SCHEME
        } else {
            HTTP_SCHEME
        };
        let raw = load_env_str(ENV_PROXY_HOST, "");
        Self::parse(&raw, scheme)
    }

    fn parse(raw_proxy_host: &str, scheme: &'static str) -> Self {
        let tenant_id = load_env_str(ENV_TENANT_ID, DEFAULT_TENANT_ID);
        let handshake_port = load_env_parsed(ENV_HANDSHAKE_PORT, DEFAULT_HANDSHAKE_PORT);

        if raw_proxy_host.is_empty() {
            warn!(
                "Could not obtain the host of the Waypoint proxy; set {} to 'host:port' \
                 to allow the interceptor to be loaded",
                ENV_PROXY_HOST
            );
            return Self::invalid(scheme, tenant_id, handshake_port);
        }

        let mut parts = raw_proxy_host.split(':');
        let (host, port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) if !host.is_empty() => (host, port),
            _ => {
                warn!(
                    "Could not parse {} value '{}'; expected 'host:port' with no extra ':'",
                    ENV_PROXY_HOST, raw_proxy_host
                );
                return Self::invalid(scheme, tenant_id, handshake_port);
            }
        };

        let proxy_port: u16 = match port.parse() {
            Ok(port) => port,
            Err(_) => {
                warn!(
                    "Could not parse the port of {} value '{}'",
                    ENV_PROXY_HOST, raw_proxy_host
                );
                return Self::invalid(scheme, tenant_id, handshake_port);
            }
        };

        ConnectionConfig {
            is_valid: true,
            proxy_host: host.to_string(),
            proxy_port,
            proxy_scheme: scheme,
            proxy_url: format!("{scheme}://{host}:{proxy_port}"),
            tenant_id,
            handshake_port,
        }
    }

    fn invalid(scheme: &'static str, tenant_id: String, handshake_port: u16) -> Self {
        ConnectionConfig {
            is_valid: false,
            proxy_host: String::new(),
            proxy_port: 0,
            proxy_scheme: scheme,
            proxy_url: String::new(),
            tenant_id,
            handshake_port,
        }
    }

    /// URL of the proxy handshake endpoint.
    pub fn handshake_url(&self) -> String {
        format!(
            "{}://{}:{}/handshake",
            self.proxy_scheme, self.proxy_host, self.handshake_port
        )
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy)]
pub struct FailSafeConfig {
    pub max_errors_allowed: u32,
    pub cooldown_sec: u64,
}

impl FailSafeConfig {
    pub fn from_env() -> Self {
        FailSafeConfig {
            max_errors_allowed: load_env_parsed(ENV_FAILSAFE_MAX_ERRORS, DEFAULT_MAX_ERRORS_ALLOWED),
            cooldown_sec: load_env_parsed(ENV_FAILSAFE_COOLDOWN_SEC, DEFAULT_COOLDOWN_SEC),
        }
    }
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        FailSafeConfig {
            max_errors_allowed: DEFAULT_MAX_ERRORS_ALLOWED,
            cooldown_sec: DEFAULT_COOLDOWN_SEC,
        }
    }
}

/// Raw comma-separated destination lists, as configured.
#[derive(Debug, Clone, Default)]
pub struct TrafficFilterConfig {
    pub allow_list: Option<String>,
    pub block_list: Option<String>,
}

impl TrafficFilterConfig {
    pub fn from_env() -> Self {
        TrafficFilterConfig {
            allow_list: env::var(ENV_ALLOW_LIST).ok().filter(|v| !v.is_empty()),
            block_list: env::var(ENV_BLOCK_LIST).ok().filter(|v| !v.is_empty()),
        }
    }
}

/// Aggregated interceptor configuration, loaded once per process.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    pub connection: ConnectionConfig,
    pub fail_safe: FailSafeConfig,
    pub traffic_filter: TrafficFilterConfig,
}

impl InterceptorConfig {
    pub fn from_env() -> Self {
        InterceptorConfig {
            connection: ConnectionConfig::from_env(),
            fail_safe: FailSafeConfig::from_env(),
            traffic_filter: TrafficFilterConfig::from_env(),
        }
    }
}
