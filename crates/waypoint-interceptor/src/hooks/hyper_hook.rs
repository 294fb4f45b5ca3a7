//! Hook around the shared `hyper_util` legacy client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::http::request;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use super::{proxied_headers, proxied_uri, Handshake, Hook, HookError, RequestContext, RoutingState};
use crate::headers::strip_sequence_id;
use crate::retry::RetryDirective;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Type alias for the underlying HTTP client used by this hook.
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Intercepts calls issued through a hyper legacy [`Client`].
///
/// The hook owns the original client and uses it for every attempt, direct
/// or proxied; redirection is purely destination/header rewriting.
pub struct HyperHook {
    client: HttpClient,
    state: Arc<RoutingState>,
    installed: AtomicBool,
}

impl HyperHook {
    pub fn new(state: Arc<RoutingState>) -> Self {
        HyperHook {
            client: create_http_client(),
            state,
            installed: AtomicBool::new(false),
        }
    }

    /// Wrap an existing client instead of building the default one.
    pub fn with_client(client: HttpClient, state: Arc<RoutingState>) -> Self {
        HyperHook {
            client,
            state,
            installed: AtomicBool::new(false),
        }
    }

    /// The outbound-request entry point.
    ///
    /// Behaves exactly like the inner client when the hook is uninstalled or
    /// the call is not eligible for proxy routing. The body is taken as
    /// [`Bytes`] because the retry protocol requires replayable bodies.
    pub async fn request(&self, req: Request<Bytes>) -> Result<Response<Incoming>, HookError> {
        if !self.is_installed() {
            return Ok(self.client.request(req.map(Full::new)).await?);
        }

        let (mut parts, body) = req.into_parts();
        let host = parts
            .uri
            .host()
            .ok_or_else(|| HookError::MissingHost(parts.uri.to_string()))?
            .to_string();

        let mut original_headers = parts.headers.clone();
        if self.state.should_route(&host, &mut original_headers).await {
            let ctx = RequestContext::new(
                parts.uri.scheme_str().unwrap_or(crate::config::HTTP_SCHEME),
                &host,
                parts.uri.port_u16(),
                original_headers.clone(),
            );
            let attempt = self.via_proxy(&parts, &body, ctx).await;
            if let Some(response) = self.state.fail_safe.guard(attempt)? {
                return Ok(response);
            }
        }

        debug!("Will send {} without using the Waypoint proxy", parts.uri);
        parts.headers = original_headers;
        Ok(self
            .client
            .request(Request::from_parts(parts, Full::new(body)))
            .await?)
    }

    /// Issue the proxied attempt and drive the proxy-directed retry loop.
    async fn via_proxy(
        &self,
        parts: &request::Parts,
        body: &Bytes,
        mut ctx: RequestContext,
    ) -> Result<Response<Incoming>, HookError> {
        loop {
            let uri = proxied_uri(&self.state.connection, parts.uri.path_and_query())?;
            debug!(
                request_id = %ctx.request_id,
                "Forwarding the request to {uri} via the Waypoint proxy"
            );

            let mut attempt = Request::builder()
                .method(parts.method.clone())
                .uri(uri)
                .body(Full::new(body.clone()))?;
            *attempt.headers_mut() = proxied_headers(&self.state, &ctx);

            let mut response = self.client.request(attempt).await?;
            self.state.fail_safe.check_headers(response.headers())?;

            match RetryDirective::from_headers(response.headers()) {
                Some(directive) => {
                    directive.wait().await;
                    ctx.sequence_id = Some(directive.sequence_id);
                }
                None => {
                    strip_sequence_id(response.headers_mut());
                    return Ok(response);
                }
            }
        }
    }
}

#[async_trait]
impl Hook for HyperHook {
    fn name(&self) -> &'static str {
        "hyper"
    }

    fn install(&self) {
        self.installed.store(true, Ordering::Relaxed);
    }

    fn uninstall(&self) {
        self.installed.store(false, Ordering::Relaxed);
    }

    fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Relaxed)
    }

    async fn probe(&self, url: &str, headers: HeaderMap) -> Option<Handshake> {
        let attempt = || async {
            let mut req = Request::builder()
                .method(hyper::Method::GET)
                .uri(url)
                .body(Full::new(Bytes::new()))?;
            *req.headers_mut() = headers.clone();

            let response = self.client.request(req).await?;
            if response.status() != hyper::StatusCode::OK {
                return Ok::<Option<Handshake>, HookError>(None);
            }
            let Ok(collected) = response.into_body().collect().await else {
                return Ok(None);
            };
            Ok(serde_json::from_slice(&collected.to_bytes()).ok())
        };

        match attempt().await {
            Ok(handshake) => handshake,
            Err(error) => {
                warn!("Establishing handshake with the Waypoint proxy failed: {error}");
                None
            }
        }
    }
}

/// Create the shared HTTP client with connection pooling, allowing both
/// plain HTTP and HTTPS upstreams.
fn create_http_client() -> HttpClient {
    let mut http_connector = HttpConnector::new();
    http_connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http_connector.enforce_http(false);

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .expect("Failed to load native root certificates")
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(https_connector)
}
