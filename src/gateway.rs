//! Authenticated request gateway.
//!
//! Every request goes out with the current access token.  A token that is missing or about to
//! expire is refreshed first; a request the backend answers with 401 is refreshed and reissued
//! exactly once.  If the store already holds a different token by the time the 401 arrives,
//! another caller has rotated the session and the request is reissued with that token instead.  Refresh coordination belongs to the [`Refresher`], so any number of concurrent
//! gateway calls trigger at most one exchange between them.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::observability::{
    GATEWAY_CANCELLED, GATEWAY_LOCAL_UNAUTHORIZED, GATEWAY_REQUESTS, GATEWAY_RETRIES,
};
use crate::refresher::Refresher;
use crate::transport::{HttpResponse, RequestSpec, Transport};
use crate::{CredentialBundle, Error, Result};

/// Wraps a [`Transport`] with bearer authentication and one refresh-driven retry.
#[derive(Clone)]
pub struct Gateway {
    transport: Arc<dyn Transport>,
    refresher: Refresher,
}

impl Gateway {
    /// Creates a gateway sending through `transport`.
    pub fn new(transport: Arc<dyn Transport>, refresher: Refresher) -> Self {
        Self {
            transport,
            refresher,
        }
    }

    /// Returns the refresher used by this gateway.
    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    /// Sends `request` without a cancellation signal.
    pub async fn send(&self, request: &RequestSpec) -> Result<HttpResponse> {
        self.send_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Sends `request`, giving up with [`Error::Abort`] as soon as `cancel` fires.
    ///
    /// The response is returned unmodified whatever its status.  When no usable token exists the
    /// response is a locally synthesized 401 and nothing is sent.  When the backend answers 401
    /// and the refresh that follows fails, the backend's own 401 is returned.
    pub async fn send_with_cancel(
        &self,
        request: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        GATEWAY_REQUESTS.click();
        let Some(bundle) = self.usable_bundle(cancel).await? else {
            GATEWAY_LOCAL_UNAUTHORIZED.click();
            tracing::info!(path = %request.path, "no usable credentials; request not sent");
            return Ok(HttpResponse::local_unauthorized());
        };

        let response = self.issue(request, &bundle.access_token, cancel).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        let fresh = match self.rotated_since(&bundle.access_token)? {
            Some(rotated) => {
                tracing::debug!(path = %request.path, "request unauthorized; token already rotated");
                rotated
            }
            None => {
                tracing::info!(path = %request.path, "request unauthorized; refreshing");
                let Some(fresh) = cancellable(cancel, self.refresher.refresh()).await? else {
                    return Ok(response);
                };
                fresh
            }
        };
        GATEWAY_RETRIES.click();
        tracing::debug!(path = %request.path, "retrying with refreshed token");
        self.issue(request, &fresh.access_token, cancel).await
    }

    async fn usable_bundle(&self, cancel: &CancellationToken) -> Result<Option<CredentialBundle>> {
        let store = self.refresher.store();
        match store.load()? {
            Some(bundle)
                if !bundle.expires_within(store.clock().now(), self.refresher.margin()) =>
            {
                Ok(Some(bundle))
            }
            _ => cancellable(cancel, self.refresher.refresh()).await,
        }
    }

    // A usable stored bundle whose access token is not `rejected`.
    fn rotated_since(&self, rejected: &str) -> Result<Option<CredentialBundle>> {
        let store = self.refresher.store();
        Ok(store.load()?.filter(|bundle| {
            bundle.access_token != rejected
                && !bundle.expires_within(store.clock().now(), self.refresher.margin())
        }))
    }

    async fn issue(
        &self,
        request: &RequestSpec,
        bearer: &str,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        tracing::debug!(method = %request.method, path = %request.path, "sending request");
        cancellable(cancel, self.transport.execute(request, bearer)).await?
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            GATEWAY_CANCELLED.click();
            Err(Error::abort("request cancelled"))
        }
        output = fut => Ok(output),
    }
}
