// Public modules
pub mod auth;
pub mod chat;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_logger;
pub mod gateway;
pub mod observer;
pub mod refresher;
pub mod sse;
pub mod status;
pub mod token_store;
pub mod transport;
pub mod types;
pub mod utils;

#[doc(hidden)]
pub mod test_support;

mod observability;

// Re-exports
pub use auth::AuthBackend;
pub use chat::{ChatCore, ChatOutcome};
pub use client::{HttpAuthBackend, ReqwestTransport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoreArgs, CoreConfig};
pub use error::{Error, Result};
pub use event_logger::{EventLogger, RefreshOutcome};
pub use gateway::Gateway;
pub use observability::register_biometrics;
pub use observer::{PlainTextObserver, SessionObserver};
pub use refresher::Refresher;
pub use status::{Phase, SessionDriver, StreamSession};
pub use token_store::{FileStorage, MemoryStorage, Storage, TokenStore};
pub use transport::{HttpResponse, RequestSpec, Transport};
pub use types::*;
