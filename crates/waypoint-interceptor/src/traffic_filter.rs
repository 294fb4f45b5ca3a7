//! Destination filtering for proxy routing.
//!
//! The filter decides, per destination, whether a call is eligible to be
//! forwarded through the Waypoint proxy: explicit allow/block lists, a
//! per-call header override, and a private-address exclusion backed by a
//! process-lifetime DNS resolution cache.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::header::HeaderMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::TrafficFilterConfig;
use crate::headers::{VALUE_TRUE, X_WAYPOINT_ALLOW};

const LIST_DELIMITER: char = ',';

// Dotted all-numeric strings are not hostnames; they must parse as IPs.
static NOT_ONLY_NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d.]+$").unwrap());
static ADDRESS_VALIDATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9]){2,}$",
    )
    .unwrap()
});

/// Decides whether a destination may be routed through the proxy.
pub struct TrafficFilter {
    allow_list: Option<Vec<String>>,
    block_list: Option<Vec<String>>,
    valid: bool,
    managed: AtomicBool,
    // host-or-ip literal -> "is external"; never expired, resolution
    // failures are deliberately not stored.
    external_cache: RwLock<HashMap<String, bool>>,
}

impl TrafficFilter {
    pub fn new(config: &TrafficFilterConfig) -> Self {
        let mut allow_list = parse_list(config.allow_list.as_deref());
        let mut block_list = parse_list(config.block_list.as_deref());
        let valid = validate_lists(&mut allow_list, &mut block_list);
        debug!(valid, "TrafficFilter loaded");
        TrafficFilter {
            allow_list,
            block_list,
            valid,
            managed: AtomicBool::new(false),
            external_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Whether the proxy identified itself as managed during the handshake.
    /// Gates the tenant-id header on proxied requests only.
    pub fn managed(&self) -> bool {
        self.managed.load(Ordering::Relaxed)
    }

    pub fn set_managed(&self, managed: bool) {
        debug!(managed, "Proxy managed mode updated");
        self.managed.store(managed, Ordering::Relaxed);
    }

    /// Check whether the given host or IP should be forwarded through the
    /// proxy.
    ///
    /// The per-call override header is honored first and removed from
    /// `headers` so it never reaches the network.
    pub async fn is_allowed(&self, host_or_ip: &str, headers: &mut HeaderMap) -> bool {
        if !self.valid {
            return false;
        }

        if let Some(forced) = take_header_override(headers) {
            return forced;
        }

        if let Some(allow_list) = &self.allow_list {
            return allow_list.iter().any(|entry| entry == host_or_ip);
        }

        if let Some(block_list) = &self.block_list {
            if block_list.iter().any(|entry| entry == host_or_ip) {
                return false;
            }
        }

        self.is_external(host_or_ip).await
    }

    /// Whether a destination resolves to an address outside the private
    /// ranges. Results are cached by the literal string passed in, except
    /// for resolution failures, which are retried on the next call.
    async fn is_external(&self, host_or_ip: &str) -> bool {
        if let Some(cached) = self.external_cache.read().get(host_or_ip) {
            return *cached;
        }

        let is_external = match host_or_ip.parse::<IpAddr>() {
            Ok(ip) => is_external_ip(ip),
            Err(_) => match resolve(host_or_ip).await {
                Some(ip) => is_external_ip(ip),
                None => return false,
            },
        };

        self.external_cache
            .write()
            .insert(host_or_ip.to_string(), is_external);
        is_external
    }
}

/// Extract the per-call override, stripping it from the outgoing headers.
fn take_header_override(headers: &mut HeaderMap) -> Option<bool> {
    let value = headers.remove(&X_WAYPOINT_ALLOW)?;
    Some(value == VALUE_TRUE)
}

fn parse_list(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }
    Some(raw.split(LIST_DELIMITER).map(str::to_string).collect())
}

/// Validate both lists at construction time.
///
/// Invalid allow-list entries are dropped individually (fail open for the
/// rest of the list); any invalid block-list entry invalidates the whole
/// filter (fail closed). A non-empty allow-list takes absolute precedence
/// and empties the block-list.
fn validate_lists(
    allow_list: &mut Option<Vec<String>>,
    block_list: &mut Option<Vec<String>>,
) -> bool {
    if let Some(allowed) = allow_list {
        allowed.retain(|entry| {
            let valid = is_valid_entry(entry);
            if !valid {
                warn!("Unsupported value '{entry}' will be removed from the allow list");
            }
            valid
        });
    }

    let Some(blocked) = block_list else {
        return true;
    };

    if allow_list.as_ref().is_some_and(|list| !list.is_empty()) {
        warn!("TrafficFilter: found an allow list, skipping the block list");
        blocked.clear();
        return true;
    }

    let all_valid = blocked.iter().all(|entry| {
        let valid = is_valid_entry(entry);
        if !valid {
            warn!("Error while parsing '{entry}' from the block list");
        }
        valid
    });

    if !all_valid {
        warn!("Interceptor disabled to avoid passing wrong traffic through the proxy");
    }
    all_valid
}

/// A list entry must be a syntactically valid hostname or IP address.
/// Scheme, port or path in an entry makes it invalid.
fn is_valid_entry(entry: &str) -> bool {
    if entry.parse::<IpAddr>().is_ok() {
        return true;
    }
    if NOT_ONLY_NUMBERS.is_match(entry) {
        return false;
    }
    ADDRESS_VALIDATOR.is_match(entry)
}

fn is_external_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback()),
        IpAddr::V6(v6) => !v6.is_loopback(),
    }
}

async fn resolve(host: &str) -> Option<IpAddr> {
    match tokio::net::lookup_host((host, 80)).await {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
        Err(error) => {
            warn!("TrafficFilter: could not resolve '{host}': {error}");
            None
        }
    }
}
