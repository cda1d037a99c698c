//! End-to-end tests of the session core.
//!
//! The HTTP tests run the reqwest stack against a local mockito server; the rest drive the core
//! through the in-process fakes.

use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Server};
use serde_json::json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use chatline::chat::{ChatCore, ChatOutcome};
use chatline::test_support::{FakeAuthBackend, FakeTransport};
use chatline::{
    Clock, CoreConfig, CredentialBundle, FileStorage, LoginCredentials, ManualClock,
    MemoryStorage, Phase, SystemClock, TokenStore,
};

const SSE_REPLY: &str = concat!(
    "data: {\"type\":\"status\",\"message\":\"Thinking\"}\n\n",
    "data: {\"type\":\"status\",\"message\":\"Searching the web\",\"model_name\":\"m1\"}\n\n",
    "data: {\"type\":\"complete\",\"result\":{\"response\":\"42\"}}\n\n",
);

fn grant(access: &str, refresh: &str) -> String {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "session_id": "session-1",
        "expires_in": 3600,
        "refresh_expires_in": 86400,
    })
    .to_string()
}

struct Harness {
    server: mockito::ServerGuard,
    _dir: tempfile::TempDir,
    path: String,
}

impl Harness {
    async fn new() -> Self {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("credentials.json")
            .to_str()
            .unwrap()
            .to_string();
        Self {
            server,
            _dir: dir,
            path,
        }
    }

    fn core(&self) -> ChatCore {
        let config = CoreConfig::new()
            .with_base_url(self.server.url())
            .with_storage_path(Some(self.path.clone()))
            .with_timeout(Duration::from_secs(5));
        ChatCore::from_config(&config).unwrap()
    }

    fn store(&self) -> TokenStore {
        TokenStore::new(Arc::new(FileStorage::new(&self.path)), Arc::new(SystemClock))
    }

    fn seed(&self, access: &str, expires_in: Duration) {
        let now = OffsetDateTime::now_utc();
        let bundle = CredentialBundle::new(
            access,
            "refresh-1",
            "session-1",
            now + expires_in,
            now + Duration::from_secs(86400),
        );
        self.store().save(&bundle).unwrap();
    }
}

async fn send(core: &ChatCore) -> ChatOutcome {
    core.send_message(
        json!({"message": "what is six times seven?"}),
        &CancellationToken::new(),
        Arc::new(()),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn login_then_stream_a_reply() {
    let mut h = Harness::new().await;
    let login = h
        .server
        .mock("POST", "/auth/login")
        .match_body(Matcher::PartialJson(json!({"username": "alice"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant("access-1", "refresh-1"))
        .create_async()
        .await;
    let chat = h
        .server
        .mock("POST", "/chat")
        .match_header("authorization", "Bearer access-1")
        .match_header("accept", "text/event-stream, application/json")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(SSE_REPLY)
        .create_async()
        .await;

    let core = h.core();
    core.login(&LoginCredentials::new("alice", "hunter2"))
        .await
        .unwrap();
    let outcome = send(&core).await;

    login.assert_async().await;
    chat.assert_async().await;
    let Some(Phase::Complete { result, banner }) = outcome.phase() else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(result["response"], "42");
    assert_eq!(banner.steps.len(), 1);
    assert_eq!(banner.steps[0].message, "Searching the web");
    assert_eq!(banner.steps[0].model_tag.as_deref(), Some("m1"));
}

#[tokio::test]
async fn unauthorized_reply_is_refreshed_and_retried() {
    let mut h = Harness::new().await;
    h.seed("stale", Duration::from_secs(3600));
    let rejected = h
        .server
        .mock("POST", "/chat")
        .match_header("authorization", "Bearer stale")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":{"message":"token revoked"}}"#)
        .expect(1)
        .create_async()
        .await;
    let refresh = h
        .server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(
            json!({"session_id": "session-1", "refresh_token": "refresh-1"}),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant("fresh", "refresh-2"))
        .expect(1)
        .create_async()
        .await;
    let accepted = h
        .server
        .mock("POST", "/chat")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"response":"ok"}"#)
        .expect(1)
        .create_async()
        .await;

    let outcome = send(&h.core()).await;

    rejected.assert_async().await;
    refresh.assert_async().await;
    accepted.assert_async().await;
    assert!(matches!(outcome.phase(), Some(Phase::Complete { .. })));
    let stored = h.store().load().unwrap().unwrap();
    assert_eq!(stored.access_token, "fresh");
    assert_eq!(stored.refresh_token, "refresh-2");
}

#[tokio::test]
async fn expiring_token_is_refreshed_before_sending() {
    let mut h = Harness::new().await;
    h.seed("stale", Duration::from_secs(60));
    let refresh = h
        .server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant("fresh", "refresh-2"))
        .expect(1)
        .create_async()
        .await;
    let stale = h
        .server
        .mock("POST", "/chat")
        .match_header("authorization", "Bearer stale")
        .expect(0)
        .create_async()
        .await;
    let chat = h
        .server
        .mock("POST", "/chat")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(SSE_REPLY)
        .create_async()
        .await;

    let outcome = send(&h.core()).await;

    refresh.assert_async().await;
    stale.assert_async().await;
    chat.assert_async().await;
    assert!(matches!(outcome.phase(), Some(Phase::Complete { .. })));
}

#[tokio::test]
async fn rejected_refresh_requires_sign_in() {
    let mut h = Harness::new().await;
    h.seed("stale", Duration::from_secs(3600));
    let chat = h
        .server
        .mock("POST", "/chat")
        .with_status(401)
        .with_body(r#"{"error":{"message":"token revoked"}}"#)
        .expect(1)
        .create_async()
        .await;
    let refresh = h
        .server
        .mock("POST", "/auth/refresh")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":{"message":"refresh token expired"}}"#)
        .expect(1)
        .create_async()
        .await;

    let outcome = send(&h.core()).await;

    chat.assert_async().await;
    refresh.assert_async().await;
    assert_eq!(outcome, ChatOutcome::ReauthenticationRequired);
    assert_eq!(h.store().load().unwrap(), None);
}

#[tokio::test]
async fn stream_error_event_fails_the_session() {
    let mut h = Harness::new().await;
    h.seed("access-1", Duration::from_secs(3600));
    let _chat = h
        .server
        .mock("POST", "/chat")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(concat!(
            "data: {\"type\":\"status\",\"message\":\"Thinking\"}\n\n",
            "data: {\"type\":\"error\",\"error\":\"model overloaded\"}\n\n",
        ))
        .create_async()
        .await;

    let outcome = send(&h.core()).await;
    let Some(Phase::Errored { cause }) = outcome.phase() else {
        panic!("expected error, got {outcome:?}");
    };
    assert!(cause.contains("model overloaded"));
}

#[tokio::test]
async fn legacy_token_is_upgraded_and_used() {
    let mut h = Harness::new().await;
    std::fs::write(
        &h.path,
        r#"{"token":"legacy-token","session_id":"session-legacy"}"#,
    )
    .unwrap();
    let chat = h
        .server
        .mock("POST", "/chat")
        .match_header("authorization", "Bearer legacy-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"response":"hello again"}"#)
        .create_async()
        .await;

    let core = h.core();
    let outcome = send(&core).await;

    chat.assert_async().await;
    assert!(matches!(outcome.phase(), Some(Phase::Complete { .. })));
    let bundle = core.session().unwrap().unwrap();
    assert_eq!(bundle.access_token, "legacy-token");
    assert_eq!(bundle.session_id, "session-legacy");
}

#[tokio::test]
async fn logout_ends_backend_session() {
    let mut h = Harness::new().await;
    h.seed("access-1", Duration::from_secs(3600));
    let logout = h
        .server
        .mock("POST", "/auth/logout")
        .match_header("authorization", "Bearer access-1")
        .match_body(Matcher::Json(json!({"session_id": "session-1"})))
        .with_status(204)
        .create_async()
        .await;

    let core = h.core();
    core.logout().await.unwrap();

    logout.assert_async().await;
    assert_eq!(core.session().unwrap(), None);
}

#[tokio::test]
async fn bad_password_is_an_authentication_error() {
    let mut h = Harness::new().await;
    let _login = h
        .server
        .mock("POST", "/auth/login")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"detail":"invalid username or password"}"#)
        .create_async()
        .await;

    let core = h.core();
    let err = core
        .login(&LoginCredentials::new("alice", "wrong"))
        .await
        .unwrap_err();
    assert!(err.is_authentication());
    assert!(err.to_string().contains("invalid username or password"));
    assert_eq!(core.session().unwrap(), None);
}

#[tokio::test]
async fn concurrent_messages_share_one_refresh() {
    let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
    let shared: Arc<dyn Clock> = clock.clone();
    let store = TokenStore::new(Arc::new(MemoryStorage::new()), shared.clone());
    let (backend, gate) = FakeAuthBackend::new(shared).gated();
    let backend = Arc::new(backend);
    let core = ChatCore::new(
        Arc::new(FakeTransport::accepting("access-2")),
        backend.clone(),
        store.clone(),
    );
    store.save(&backend.mint()).unwrap();
    clock.advance(Duration::from_secs(3600 - 30));

    let sends = futures::future::join_all((0..4).map(|_| send(&core)));
    let release = async {
        while backend.refresh_calls() == 0 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);
    };
    let (outcomes, ()) = tokio::join!(sends, release);

    assert_eq!(backend.refresh_calls(), 1);
    for outcome in outcomes {
        assert!(matches!(outcome.phase(), Some(Phase::Complete { .. })));
    }
}
