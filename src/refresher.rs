//! Single-flight token refresh.
//!
//! At most one refresh exchange is in flight at any time.  The pending exchange lives in a shared
//! slot; the first caller fills it and every caller that arrives while it is filled awaits the
//! same shared result.  The exchange runs as its own task, so a caller that gives up waiting does
//! not abort the refresh for everybody else, and the slot is emptied when the task ends however it
//! ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthBackend;
use crate::event_logger::{EventLogger, RefreshOutcome};
use crate::observability::{
    REFRESH_COALESCED, REFRESH_DURATION, REFRESH_EXCHANGES, REFRESH_FAILURES, REFRESH_PROACTIVE,
    REFRESH_REJECTED, REFRESH_SKIPPED,
};
use crate::token_store::TokenStore;
use crate::CredentialBundle;

/// How long before access token expiry a refresh is due.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

type PendingRefresh = Shared<BoxFuture<'static, Option<CredentialBundle>>>;

struct InFlight {
    id: u64,
    pending: PendingRefresh,
}

/// Empties the slot when the exchange task finishes, panics, or is torn down.
struct SettleGuard {
    slot: Arc<Mutex<Option<InFlight>>>,
    id: u64,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|in_flight| in_flight.id) == Some(self.id) {
            *slot = None;
        }
    }
}

/// Coordinates refreshing the current credential bundle.
///
/// Cloning is cheap and every clone shares the same in-flight slot.
#[derive(Clone)]
pub struct Refresher {
    store: TokenStore,
    backend: Arc<dyn AuthBackend>,
    logger: Option<Arc<dyn EventLogger>>,
    margin: Duration,
    slot: Arc<Mutex<Option<InFlight>>>,
    next_id: Arc<AtomicU64>,
}

impl Refresher {
    /// Creates a refresher that saves new bundles to `store`.
    pub fn new(store: TokenStore, backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            store,
            backend,
            logger: None,
            margin: DEFAULT_REFRESH_MARGIN,
            slot: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Sets how long before expiry a refresh is due.
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Reports every settled exchange to `logger`.
    pub fn with_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Returns the refresh margin.
    pub fn margin(&self) -> Duration {
        self.margin
    }

    /// Returns the token store this refresher writes to.
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns true while an exchange is in flight.
    pub fn is_in_flight(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Refreshes the current bundle, joining the exchange already in flight if there is one.
    ///
    /// Returns the new bundle, or `None` if the session cannot be refreshed.  In the latter case
    /// the token store has been cleared.  Never fails: every failure resolves to `None`.
    pub async fn refresh(&self) -> Option<CredentialBundle> {
        self.acquire().await
    }

    fn acquire(&self) -> PendingRefresh {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(in_flight) = slot.as_ref() {
            REFRESH_COALESCED.click();
            tracing::debug!(id = in_flight.id, "joining refresh already in flight");
            return in_flight.pending.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = SettleGuard {
            slot: Arc::clone(&self.slot),
            id,
        };
        let this = self.clone();
        // The slot lock is held until the entry is in place, so the guard cannot run first.
        let task = tokio::spawn(async move {
            let _settle = guard;
            this.exchange().await
        });
        let pending = async move {
            match task.await {
                Ok(bundle) => bundle,
                Err(err) => {
                    tracing::error!(error = %err, "refresh task did not finish");
                    None
                }
            }
        }
        .boxed()
        .shared();
        *slot = Some(InFlight {
            id,
            pending: pending.clone(),
        });
        tracing::debug!(id, "refresh started");
        pending
    }

    async fn exchange(&self) -> Option<CredentialBundle> {
        let (bundle, outcome) = self.try_exchange().await;
        if let Some(logger) = &self.logger {
            logger.log_refresh(outcome);
        }
        bundle
    }

    async fn try_exchange(&self) -> (Option<CredentialBundle>, RefreshOutcome) {
        let current = match self.store.load() {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                REFRESH_SKIPPED.click();
                tracing::debug!("no stored credentials to refresh");
                return (None, RefreshOutcome::Unavailable);
            }
            Err(err) => {
                REFRESH_FAILURES.click();
                tracing::warn!(error = %err, "could not read stored credentials");
                self.discard();
                return (None, RefreshOutcome::Failed);
            }
        };

        if !current.can_refresh(self.store.clock().now()) {
            REFRESH_SKIPPED.click();
            tracing::info!(
                session_id = %current.session_id,
                has_refresh_token = current.has_refresh_token(),
                "session cannot be refreshed; clearing credentials"
            );
            self.discard();
            return (None, RefreshOutcome::Unavailable);
        }

        REFRESH_EXCHANGES.click();
        let started = Instant::now();
        let result = self
            .backend
            .refresh(&current.session_id, &current.refresh_token)
            .await;
        REFRESH_DURATION.add(started.elapsed().as_secs_f64());

        match result {
            Ok(fresh) => match self.store.save(&fresh) {
                Ok(()) => {
                    tracing::info!(session_id = %fresh.session_id, "access token refreshed");
                    (Some(fresh), RefreshOutcome::Refreshed)
                }
                Err(err) => {
                    REFRESH_FAILURES.click();
                    tracing::warn!(error = %err, "could not save refreshed credentials");
                    self.discard();
                    (None, RefreshOutcome::Failed)
                }
            },
            Err(err) if err.is_credential_rejection() => {
                REFRESH_REJECTED.click();
                tracing::info!(error = %err, "refresh token rejected; clearing credentials");
                self.discard();
                (None, RefreshOutcome::Rejected)
            }
            Err(err) => {
                REFRESH_FAILURES.click();
                tracing::warn!(error = %err, "refresh failed; clearing credentials");
                self.discard();
                (None, RefreshOutcome::Failed)
            }
        }
    }

    fn discard(&self) {
        if let Err(err) = self.store.clear() {
            tracing::error!(error = %err, "could not clear credentials");
        }
    }

    /// Keeps the stored bundle fresh by refreshing it `margin` ahead of each expiry.
    ///
    /// The task stops when `cancel` fires, when nothing is stored, or after the first failed
    /// refresh; from then on expiry is caught by the gateway on the next request.
    pub fn spawn_proactive(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_proactive(cancel).await })
    }

    async fn run_proactive(&self, cancel: CancellationToken) {
        loop {
            let scheduled = match self.store.load() {
                Ok(Some(bundle)) => bundle,
                Ok(None) => {
                    tracing::debug!("no stored credentials; proactive refresh stopped");
                    return;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "proactive refresh stopped");
                    return;
                }
            };
            let delay = scheduled.refresh_due_in(self.store.clock().now(), self.margin);
            tracing::debug!(delay_secs = delay.as_secs(), "proactive refresh scheduled");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.store.load() {
                Ok(Some(current)) if current.access_token != scheduled.access_token => {
                    tracing::debug!("credentials changed while waiting; rescheduling");
                    continue;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    tracing::debug!("credentials gone; proactive refresh stopped");
                    return;
                }
            }

            REFRESH_PROACTIVE.click();
            let refreshed = tokio::select! {
                _ = cancel.cancelled() => return,
                refreshed = self.refresh() => refreshed,
            };
            match refreshed {
                Some(fresh) => {
                    if fresh
                        .refresh_due_in(self.store.clock().now(), self.margin)
                        .is_zero()
                    {
                        tracing::warn!(
                            "new access token expires inside the refresh margin; proactive refresh stopped"
                        );
                        return;
                    }
                }
                None => {
                    tracing::info!("proactive refresh failed; expiry will be handled on demand");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::status::Phase;
    use crate::test_support::FakeAuthBackend;
    use crate::token_store::MemoryStorage;
    use crate::StreamEvent;
    use time::macros::datetime;
    use time::OffsetDateTime;
    use tokio::sync::Semaphore;

    const NOW: OffsetDateTime = datetime!(2025-05-01 9:00:00 UTC);

    struct Fixture {
        clock: Arc<ManualClock>,
        storage: Arc<MemoryStorage>,
        store: TokenStore,
        backend: Arc<FakeAuthBackend>,
        refresher: Refresher,
    }

    impl Fixture {
        fn build(gated: bool) -> (Self, Option<Arc<Semaphore>>) {
            let clock = Arc::new(ManualClock::new(NOW));
            let storage = Arc::new(MemoryStorage::new());
            let store = TokenStore::new(storage.clone(), clock.clone());
            let backend = FakeAuthBackend::new(clock.clone());
            let (backend, gate) = if gated {
                let (backend, gate) = backend.gated();
                (backend, Some(gate))
            } else {
                (backend, None)
            };
            let backend = Arc::new(backend);
            let refresher = Refresher::new(store.clone(), backend.clone());
            (
                Self {
                    clock,
                    storage,
                    store,
                    backend,
                    refresher,
                },
                gate,
            )
        }

        fn new() -> Self {
            Self::build(false).0
        }

        fn gated() -> (Self, Arc<Semaphore>) {
            let (fixture, gate) = Self::build(true);
            (fixture, gate.unwrap())
        }

        fn sign_in(&self) -> CredentialBundle {
            let bundle = self.backend.mint();
            self.store.save(&bundle).unwrap();
            bundle
        }
    }

    #[derive(Default)]
    struct RecordingLogger {
        refreshes: Mutex<Vec<RefreshOutcome>>,
    }

    impl EventLogger for RecordingLogger {
        fn log_stream_event(&self, _: &StreamEvent) {}

        fn log_refresh(&self, outcome: RefreshOutcome) {
            self.refreshes.lock().unwrap().push(outcome);
        }

        fn log_session_end(&self, _: &Phase) {}
    }

    #[tokio::test]
    async fn refresh_saves_new_bundle() {
        let f = Fixture::new();
        f.sign_in();
        let fresh = f.refresher.refresh().await.unwrap();
        assert_eq!(fresh.access_token, "access-2");
        assert_eq!(f.store.load().unwrap(), Some(fresh));
        assert_eq!(f.backend.refresh_tokens_seen(), vec!["refresh-1".to_string()]);
        assert!(!f.refresher.is_in_flight());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let (f, gate) = Fixture::gated();
        f.sign_in();

        let callers = futures::future::join_all((0..8).map(|_| f.refresher.refresh()));
        let release = async {
            while f.backend.refresh_calls() == 0 {
                tokio::task::yield_now().await;
            }
            assert!(f.refresher.is_in_flight());
            gate.add_permits(1);
        };
        let (results, ()) = tokio::join!(callers, release);

        assert_eq!(f.backend.refresh_calls(), 1);
        let first = results[0].clone().unwrap();
        assert_eq!(first.access_token, "access-2");
        assert!(results.iter().all(|r| r.as_ref() == Some(&first)));
        assert!(!f.refresher.is_in_flight());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let (f, gate) = Fixture::gated();
        f.sign_in();
        f.backend.push_network_failure();

        let callers = futures::future::join_all((0..4).map(|_| f.refresher.refresh()));
        let release = async {
            while f.backend.refresh_calls() == 0 {
                tokio::task::yield_now().await;
            }
            gate.add_permits(1);
        };
        let (results, ()) = tokio::join!(callers, release);

        assert_eq!(f.backend.refresh_calls(), 1);
        assert!(results.iter().all(Option::is_none));
        assert!(f.storage.snapshot().is_empty());
    }

    #[tokio::test]
    async fn slot_is_cleared_after_settling() {
        let f = Fixture::new();
        f.sign_in();
        f.backend.push_network_failure();
        assert_eq!(f.refresher.refresh().await, None);
        assert!(!f.refresher.is_in_flight());

        // A later attempt starts a new exchange rather than replaying the old result.
        f.sign_in();
        assert!(f.refresher.refresh().await.is_some());
        assert_eq!(f.backend.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_cancel_exchange() {
        let (f, gate) = Fixture::gated();
        f.sign_in();

        let waiting = tokio::time::timeout(Duration::from_millis(10), f.refresher.refresh()).await;
        assert!(waiting.is_err());
        assert!(f.refresher.is_in_flight());

        gate.add_permits(1);
        let fresh = f.refresher.refresh().await.unwrap();
        assert_eq!(fresh.access_token, "access-2");
        assert_eq!(f.backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_network() {
        let f = Fixture::new();
        f.store
            .save(&CredentialBundle::new(
                "legacy",
                "",
                "session-1",
                NOW + Duration::from_secs(60),
                NOW + Duration::from_secs(60),
            ))
            .unwrap();
        assert_eq!(f.refresher.refresh().await, None);
        assert_eq!(f.backend.refresh_calls(), 0);
        assert!(f.storage.snapshot().is_empty());
    }

    #[tokio::test]
    async fn expired_refresh_token_skips_network() {
        let f = Fixture::new();
        f.sign_in();
        f.clock.advance(Duration::from_secs(2 * 86400));
        assert_eq!(f.refresher.refresh().await, None);
        assert_eq!(f.backend.refresh_calls(), 0);
        assert!(f.storage.snapshot().is_empty());
    }

    #[tokio::test]
    async fn empty_store_skips_network() {
        let f = Fixture::new();
        assert_eq!(f.refresher.refresh().await, None);
        assert_eq!(f.backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn outcomes_are_logged_once_per_exchange() {
        let f = Fixture::new();
        let logger = Arc::new(RecordingLogger::default());
        let refresher = f.refresher.clone().with_logger(logger.clone());

        f.sign_in();
        assert!(refresher.refresh().await.is_some());
        f.backend.push_rejection();
        assert!(refresher.refresh().await.is_none());
        assert!(f.storage.snapshot().is_empty());
        assert!(refresher.refresh().await.is_none());
        f.sign_in();
        f.backend.push_network_failure();
        assert!(refresher.refresh().await.is_none());

        assert_eq!(
            *logger.refreshes.lock().unwrap(),
            vec![
                RefreshOutcome::Refreshed,
                RefreshOutcome::Rejected,
                RefreshOutcome::Unavailable,
                RefreshOutcome::Failed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_fires_ahead_of_expiry() {
        let f = Fixture::new();
        f.sign_in();
        let cancel = CancellationToken::new();
        let handle = f.refresher.spawn_proactive(cancel.clone());

        tokio::time::sleep(Duration::from_secs(54 * 60)).await;
        assert_eq!(f.backend.refresh_calls(), 0);

        f.clock.advance(Duration::from_secs(55 * 60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(f.backend.refresh_calls(), 1);
        assert_eq!(f.store.load().unwrap().unwrap().access_token, "access-2");

        // Rescheduled against the new bundle, which again lives an hour.
        f.clock.advance(Duration::from_secs(55 * 60));
        tokio::time::sleep(Duration::from_secs(55 * 60)).await;
        assert_eq!(f.backend.refresh_calls(), 2);
        assert_eq!(f.store.load().unwrap().unwrap().access_token, "access-3");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_stops_after_failure() {
        let f = Fixture::new();
        f.sign_in();
        f.backend.push_rejection();
        let handle = f.refresher.spawn_proactive(CancellationToken::new());

        f.clock.advance(Duration::from_secs(55 * 60));
        handle.await.unwrap();
        assert_eq!(f.backend.refresh_calls(), 1);
        assert_eq!(f.store.load().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_yields_to_on_demand_refresh() {
        let f = Fixture::new();
        f.sign_in();
        let cancel = CancellationToken::new();
        let handle = f.refresher.spawn_proactive(cancel.clone());

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        f.clock.advance(Duration::from_secs(30 * 60));
        assert!(f.refresher.refresh().await.is_some());
        assert_eq!(f.backend.refresh_calls(), 1);

        // The original schedule wakes, sees a different token, and reschedules.
        f.clock.advance(Duration::from_secs(26 * 60));
        tokio::time::sleep(Duration::from_secs(26 * 60)).await;
        assert_eq!(f.backend.refresh_calls(), 1);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_idles_without_credentials() {
        let f = Fixture::new();
        let handle = f.refresher.spawn_proactive(CancellationToken::new());
        handle.await.unwrap();
        assert_eq!(f.backend.refresh_calls(), 0);
    }
}
