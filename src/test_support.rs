//! Scriptable in-process stand-ins for the backend, shared by unit and integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use tokio::sync::Semaphore;

use crate::auth::AuthBackend;
use crate::clock::Clock;
use crate::transport::{HttpResponse, RequestSpec, ResponseBody, Transport, EVENT_STREAM};
use crate::{CredentialBundle, Error, LoginCredentials, Result};

/////////////////////////////////////////// FakeAuthBackend ////////////////////////////////////////

/// An [`AuthBackend`] that mints numbered bundles and counts its calls.
///
/// Scripted refresh results are consumed first; once they run out every refresh succeeds.  A
/// gated backend parks each refresh until the test releases a permit.
pub struct FakeAuthBackend {
    clock: Arc<dyn Clock>,
    lifetime: Duration,
    refresh_lifetime: Duration,
    scripted: Mutex<VecDeque<Result<CredentialBundle>>>,
    gate: Option<Arc<Semaphore>>,
    issued: AtomicUsize,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    logout_fails: AtomicBool,
    refresh_tokens_seen: Mutex<Vec<String>>,
}

impl FakeAuthBackend {
    /// Creates a backend whose bundles live for an hour.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            lifetime: Duration::from_secs(3600),
            refresh_lifetime: Duration::from_secs(86400),
            scripted: Mutex::new(VecDeque::new()),
            gate: None,
            issued: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            logout_fails: AtomicBool::new(false),
            refresh_tokens_seen: Mutex::new(Vec::new()),
        }
    }

    /// Sets the access token lifetime of minted bundles.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Parks every refresh until a permit is added to the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Queues the result of the next unscripted refresh.
    pub fn push_refresh(&self, result: Result<CredentialBundle>) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// Queues a refresh the backend explicitly rejects.
    pub fn push_rejection(&self) {
        self.push_refresh(Err(Error::authentication("refresh token expired")));
    }

    /// Queues a refresh that fails in transit.
    pub fn push_network_failure(&self) {
        self.push_refresh(Err(Error::connection("connection reset", None)));
    }

    /// Makes every logout fail in transit.
    pub fn fail_logouts(&self) {
        self.logout_fails.store(true, Ordering::SeqCst);
    }

    /// Returns a bundle as the backend would mint it next, without counting a call.
    pub fn mint(&self) -> CredentialBundle {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.clock.now();
        CredentialBundle::new(
            format!("access-{n}"),
            format!("refresh-{n}"),
            "session-1",
            now + self.lifetime,
            now + self.refresh_lifetime,
        )
    }

    /// Number of login exchanges.
    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Number of refresh exchanges.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of logout exchanges.
    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented so far, in order.
    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl AuthBackend for FakeAuthBackend {
    async fn login(&self, credentials: &LoginCredentials) -> Result<CredentialBundle> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password.is_empty() {
            return Err(Error::authentication("invalid username or password"));
        }
        Ok(self.mint())
    }

    async fn refresh(&self, _session_id: &str, refresh_token: &str) -> Result<CredentialBundle> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_tokens_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(refresh_token.to_string());
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::connection("gate closed", None))?;
            permit.forget();
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.mint()),
        }
    }

    async fn logout(&self, _bundle: &CredentialBundle) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.logout_fails.load(Ordering::SeqCst) {
            return Err(Error::connection("connection reset", None));
        }
        Ok(())
    }
}

//////////////////////////////////////////// FakeTransport /////////////////////////////////////////

type Responder = Box<dyn Fn(&RequestSpec, &str) -> Result<HttpResponse> + Send + Sync>;

/// A [`Transport`] that answers from a closure and records every request it sees.
pub struct FakeTransport {
    responder: Responder,
    calls: Mutex<Vec<(RequestSpec, String)>>,
    hang_on: Mutex<Option<usize>>,
}

impl FakeTransport {
    /// Creates a transport that answers every request with `responder`.
    pub fn new(
        responder: impl Fn(&RequestSpec, &str) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            hang_on: Mutex::new(None),
        }
    }

    /// A transport that answers 200 only when presented with `token`, 401 otherwise.
    pub fn accepting(token: impl Into<String>) -> Self {
        let token = token.into();
        Self::new(move |_, bearer| {
            if bearer == token {
                Ok(HttpResponse::json(200, &serde_json::json!({"ok": true})))
            } else {
                Ok(HttpResponse::json(
                    401,
                    &serde_json::json!({"error": {"message": "token expired"}}),
                ))
            }
        })
    }

    /// A transport that accepts any token minted by [`FakeAuthBackend`] after the first.
    pub fn rejecting_first_token() -> Self {
        Self::new(|_, bearer| {
            if bearer == "access-1" {
                Ok(HttpResponse::json(401, &serde_json::json!({})))
            } else {
                Ok(HttpResponse::json(200, &serde_json::json!({"ok": true})))
            }
        })
    }

    /// Makes the `n`th request (counting from one) never answer.
    pub fn hang_on_call(&self, n: usize) {
        *self.hang_on.lock().unwrap_or_else(PoisonError::into_inner) = Some(n);
    }

    /// Every request seen so far with the bearer token it carried.
    pub fn calls(&self) -> Vec<(RequestSpec, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bearer tokens seen so far, in order.
    pub fn bearers(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, bearer)| bearer).collect()
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, request: &RequestSpec, bearer: &str) -> Result<HttpResponse> {
        let call = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push((request.clone(), bearer.to_string()));
            calls.len()
        };
        let hang = *self.hang_on.lock().unwrap_or_else(PoisonError::into_inner);
        if hang == Some(call) {
            futures::future::pending::<()>().await;
        }
        (self.responder)(request, bearer)
    }
}

/// An event-stream response delivering `chunks` in order.
pub fn event_stream_response(chunks: Vec<&'static str>) -> HttpResponse {
    let chunks = chunks
        .into_iter()
        .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
        .collect::<Vec<_>>();
    HttpResponse::new(
        200,
        Some(EVENT_STREAM.to_string()),
        ResponseBody::Stream(Box::pin(stream::iter(chunks))),
    )
}
