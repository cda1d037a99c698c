//! The chat session core.
//!
//! [`ChatCore`] ties the token store, refresher, gateway, frame reader, and state machine
//! together behind the handful of operations a front end needs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthBackend;
use crate::client::{HttpAuthBackend, ReqwestTransport};
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::event_logger::EventLogger;
use crate::gateway::Gateway;
use crate::observer::SessionObserver;
use crate::refresher::Refresher;
use crate::sse::read_events;
use crate::status::{Phase, SessionDriver, SessionTimings};
use crate::token_store::{FileStorage, MemoryStorage, Storage, TokenStore};
use crate::transport::{Accept, HttpResponse, RequestSpec, Transport};
use crate::{CredentialBundle, LoginCredentials, Result};

/// Default path of the chat endpoint.
pub const DEFAULT_CHAT_PATH: &str = "chat";

/// How a chat message settled.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    /// The session reached a terminal phase.
    Settled(Phase),
    /// The backend refused the credentials even after a refresh.  They have been cleared.
    ReauthenticationRequired,
}

impl ChatOutcome {
    /// Returns the terminal phase, if the session ran.
    pub fn phase(&self) -> Option<&Phase> {
        match self {
            ChatOutcome::Settled(phase) => Some(phase),
            ChatOutcome::ReauthenticationRequired => None,
        }
    }
}

/// Sign-in, sign-out, and message submission against one backend.
#[derive(Clone)]
pub struct ChatCore {
    store: TokenStore,
    backend: Arc<dyn AuthBackend>,
    transport: Arc<dyn Transport>,
    refresher: Refresher,
    gateway: Gateway,
    logger: Option<Arc<dyn EventLogger>>,
    timings: SessionTimings,
    chat_path: String,
}

impl ChatCore {
    /// Creates a core with default margin, timings, and chat path.
    pub fn new(
        transport: Arc<dyn Transport>,
        backend: Arc<dyn AuthBackend>,
        store: TokenStore,
    ) -> Self {
        let refresher = Refresher::new(store.clone(), backend.clone());
        let gateway = Gateway::new(transport.clone(), refresher.clone());
        Self {
            store,
            backend,
            transport,
            refresher,
            gateway,
            logger: None,
            timings: SessionTimings::default(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
        }
    }

    /// Builds the HTTP stack described by `config`.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let storage: Arc<dyn Storage> = match &config.storage_path {
            Some(path) => Arc::new(FileStorage::new(path)),
            None => Arc::new(MemoryStorage::new()),
        };
        let store =
            TokenStore::new(storage, clock.clone()).with_legacy_lifetime(config.legacy_lifetime);
        let transport = ReqwestTransport::from_config(config)?;
        let backend = HttpAuthBackend::new(transport.clone(), clock)
            .with_endpoints(config.endpoints.clone());
        Ok(Self::new(Arc::new(transport), Arc::new(backend), store)
            .with_margin(config.refresh_margin)
            .with_timings(config.timings())
            .with_chat_path(config.endpoints.chat.clone()))
    }

    /// Sets how long before expiry a token is refreshed.
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.refresher = self.refresher.with_margin(margin);
        self.rebuild_gateway()
    }

    /// Sets the session timers.
    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Sets the path messages are posted to.
    pub fn with_chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }

    /// Reports refreshes, stream events, and session ends to `logger`.
    pub fn with_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.refresher = self.refresher.with_logger(logger.clone());
        self.logger = Some(logger);
        self.rebuild_gateway()
    }

    fn rebuild_gateway(mut self) -> Self {
        self.gateway = Gateway::new(self.transport.clone(), self.refresher.clone());
        self
    }

    /// Returns the token store.
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns the stored credentials, if any.
    pub fn session(&self) -> Result<Option<CredentialBundle>> {
        self.store.load()
    }

    /// Signs in and stores the issued credentials.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<()> {
        let bundle = self.backend.login(credentials).await?;
        self.store.save(&bundle)?;
        tracing::info!(session_id = %bundle.session_id, "credentials stored");
        Ok(())
    }

    /// Ends the backend session, then clears the stored credentials whatever the backend said.
    pub async fn logout(&self) -> Result<()> {
        match self.store.load() {
            Ok(Some(bundle)) => {
                if let Err(err) = self.backend.logout(&bundle).await {
                    tracing::warn!(error = %err, "backend logout failed; clearing credentials anyway");
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "could not read credentials for logout"),
        }
        self.store.clear()
    }

    /// Spawns the proactive refresher; it stops when `cancel` fires or the session ends.
    pub fn start_proactive_refresh(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.refresher.spawn_proactive(cancel)
    }

    /// Posts `body` to the chat endpoint and drives the reply to a terminal phase.
    ///
    /// Progress is reported to `observer` as it happens.  Failures the user should see (network
    /// errors, error statuses, malformed replies) settle the session as errored rather than
    /// returning `Err`; only a failure to clear rejected credentials is returned as an error.
    pub async fn send_message(
        &self,
        body: Value,
        cancel: &CancellationToken,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<ChatOutcome> {
        let request = RequestSpec::post(&self.chat_path, body).with_accept(Accept::Negotiate);
        let driver = SessionDriver::new(observer.clone(), self.store.clock().clone())
            .with_timings(self.timings)
            .with_logger(self.logger.clone());
        observer.on_phase(driver.session().phase());

        let response = match self.gateway.send_with_cancel(&request, cancel).await {
            Ok(response) => response,
            Err(err) if err.is_abort() => return Ok(ChatOutcome::Settled(driver.cancel())),
            Err(err) => {
                tracing::warn!(error = %err, "chat request failed");
                return Ok(ChatOutcome::Settled(driver.fail(err.to_string())));
            }
        };

        if response.is_unauthorized() {
            tracing::info!(
                synthesized = response.synthesized,
                "credentials refused; sign-in required"
            );
            self.store.clear()?;
            observer.on_reauthentication_required();
            return Ok(ChatOutcome::ReauthenticationRequired);
        }

        let phase = if !response.is_success() {
            let err = response.into_error().await;
            tracing::warn!(error = %err, "chat request rejected");
            driver.fail(err.to_string())
        } else if response.is_event_stream() {
            let events = Box::pin(read_events(response.into_byte_stream(), cancel.clone()));
            driver.run(events, cancel).await
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => driver.cancel(),
                body = json_reply(response) => match body {
                    Ok(result) => driver.complete(result),
                    Err(err) => driver.fail(err.to_string()),
                },
            }
        };
        Ok(ChatOutcome::Settled(phase))
    }
}

async fn json_reply(response: HttpResponse) -> Result<Value> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}
