//! Hook around a `reqwest::Client`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::HeaderMap;
use tracing::{debug, warn};

use super::{proxied_headers, Handshake, Hook, HookError, RequestContext, RoutingState};
use crate::headers::strip_sequence_id;
use crate::retry::RetryDirective;

/// Intercepts calls issued through a [`reqwest::Client`].
///
/// The host application builds its requests as usual and submits them via
/// [`ReqwestHook::execute`]; eligible calls are rewritten toward the proxy,
/// everything else reaches the inner client untouched.
pub struct ReqwestHook {
    client: reqwest::Client,
    state: Arc<RoutingState>,
    installed: AtomicBool,
}

impl ReqwestHook {
    pub fn new(state: Arc<RoutingState>) -> Self {
        Self::with_client(reqwest::Client::new(), state)
    }

    pub fn with_client(client: reqwest::Client, state: Arc<RoutingState>) -> Self {
        ReqwestHook {
            client,
            state,
            installed: AtomicBool::new(false),
        }
    }

    /// The outbound-request entry point, mirroring `Client::execute`.
    pub async fn execute(&self, req: reqwest::Request) -> Result<reqwest::Response, HookError> {
        if !self.is_installed() {
            return Ok(self.client.execute(req).await?);
        }

        let host = req
            .url()
            .host_str()
            .ok_or_else(|| HookError::MissingHost(req.url().to_string()))?
            .to_string();

        let mut original_headers = req.headers().clone();
        if self.state.should_route(&host, &mut original_headers).await {
            // The retry protocol needs replayable bodies; a streaming body
            // cannot be cloned, so such calls go out directly.
            if let Some(replayable) = req.try_clone() {
                let ctx = RequestContext::new(
                    req.url().scheme(),
                    &host,
                    req.url().port(),
                    original_headers.clone(),
                );
                let attempt = self.via_proxy(replayable, ctx).await;
                if let Some(response) = self.state.fail_safe.guard(attempt)? {
                    return Ok(response);
                }
            } else {
                debug!("Request body is not replayable, sending it directly");
            }
        }

        debug!("Will send {} without using the Waypoint proxy", req.url());
        let mut req = req;
        *req.headers_mut() = original_headers;
        Ok(self.client.execute(req).await?)
    }

    async fn via_proxy(
        &self,
        original: reqwest::Request,
        mut ctx: RequestContext,
    ) -> Result<reqwest::Response, HookError> {
        loop {
            let Some(mut attempt) = original.try_clone() else {
                // A Bytes-backed body is always replayable, so cloning the
                // request the caller already cloned once cannot fail.
                return Ok(self.client.execute(original).await?);
            };

            let connection = &self.state.connection;
            let url = attempt.url_mut();
            let rewritten = url.set_scheme(connection.proxy_scheme).is_ok()
                && url.set_host(Some(&connection.proxy_host)).is_ok()
                && url.set_port(Some(connection.proxy_port)).is_ok();
            if !rewritten {
                return Err(HookError::MissingHost(original.url().to_string()));
            }
            *attempt.headers_mut() = proxied_headers(&self.state, &ctx);

            debug!(
                request_id = %ctx.request_id,
                "Forwarding the request to {} via the Waypoint proxy",
                attempt.url()
            );

            let mut response = self.client.execute(attempt).await?;
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
impl Hook for ReqwestHook {
    fn name(&self) -> &'static str {
        "reqwest"
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
        let attempt = self.client.get(url).headers(headers).send().await;
        match attempt {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                response.json::<Handshake>().await.ok()
            }
            Ok(response) => {
                warn!(
                    "Establishing handshake with the Waypoint proxy failed: HTTP {}",
                    response.status()
                );
                None
            }
            Err(error) => {
                warn!("Establishing handshake with the Waypoint proxy failed: {error}");
                None
            }
        }
    }
}
