use biometrics::{Collector, Counter, Moments};

pub(crate) static TOKEN_STORE_MIGRATIONS: Counter =
    Counter::new("chatline.token_store.legacy_migrations");
pub(crate) static TOKEN_STORE_REJECTS: Counter = Counter::new("chatline.token_store.rejects");
pub(crate) static TOKEN_STORE_CLEARS: Counter = Counter::new("chatline.token_store.clears");

pub(crate) static REFRESH_EXCHANGES: Counter = Counter::new("chatline.refresh.exchanges");
pub(crate) static REFRESH_COALESCED: Counter = Counter::new("chatline.refresh.coalesced");
pub(crate) static REFRESH_SKIPPED: Counter = Counter::new("chatline.refresh.skipped");
pub(crate) static REFRESH_REJECTED: Counter = Counter::new("chatline.refresh.rejected");
pub(crate) static REFRESH_FAILURES: Counter = Counter::new("chatline.refresh.failures");
pub(crate) static REFRESH_PROACTIVE: Counter = Counter::new("chatline.refresh.proactive");
pub(crate) static REFRESH_DURATION: Moments =
    Moments::new("chatline.refresh.duration_seconds");

pub(crate) static GATEWAY_REQUESTS: Counter = Counter::new("chatline.gateway.requests");
pub(crate) static GATEWAY_RETRIES: Counter = Counter::new("chatline.gateway.retries");
pub(crate) static GATEWAY_LOCAL_UNAUTHORIZED: Counter =
    Counter::new("chatline.gateway.local_unauthorized");
pub(crate) static GATEWAY_CANCELLED: Counter = Counter::new("chatline.gateway.cancelled");

pub(crate) static STREAM_FRAMES: Counter = Counter::new("chatline.stream.frames");
pub(crate) static STREAM_DISCARDED: Counter = Counter::new("chatline.stream.discarded");
pub(crate) static STREAM_SALVAGED_ERRORS: Counter =
    Counter::new("chatline.stream.salvaged_errors");
pub(crate) static STREAM_BYTES: Counter = Counter::new("chatline.stream.bytes");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("chatline.stream.errors");

pub(crate) static SESSION_COMPLETED: Counter = Counter::new("chatline.session.completed");
pub(crate) static SESSION_ERRORED: Counter = Counter::new("chatline.session.errored");
pub(crate) static SESSION_CANCELLED: Counter = Counter::new("chatline.session.cancelled");
pub(crate) static SESSION_DUPLICATE_STEPS: Counter =
    Counter::new("chatline.session.duplicate_steps");
pub(crate) static SESSION_DURATION: Moments = Moments::new("chatline.session.duration_seconds");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&TOKEN_STORE_MIGRATIONS);
    collector.register_counter(&TOKEN_STORE_REJECTS);
    collector.register_counter(&TOKEN_STORE_CLEARS);

    collector.register_counter(&REFRESH_EXCHANGES);
    collector.register_counter(&REFRESH_COALESCED);
    collector.register_counter(&REFRESH_SKIPPED);
    collector.register_counter(&REFRESH_REJECTED);
    collector.register_counter(&REFRESH_FAILURES);
    collector.register_counter(&REFRESH_PROACTIVE);
    collector.register_moments(&REFRESH_DURATION);

    collector.register_counter(&GATEWAY_REQUESTS);
    collector.register_counter(&GATEWAY_RETRIES);
    collector.register_counter(&GATEWAY_LOCAL_UNAUTHORIZED);
    collector.register_counter(&GATEWAY_CANCELLED);

    collector.register_counter(&STREAM_FRAMES);
    collector.register_counter(&STREAM_DISCARDED);
    collector.register_counter(&STREAM_SALVAGED_ERRORS);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_ERRORS);

    collector.register_counter(&SESSION_COMPLETED);
    collector.register_counter(&SESSION_ERRORED);
    collector.register_counter(&SESSION_CANCELLED);
    collector.register_counter(&SESSION_DUPLICATE_STEPS);
    collector.register_moments(&SESSION_DURATION);
}
