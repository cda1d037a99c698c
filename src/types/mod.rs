// Public modules
pub mod credential_bundle;
pub mod login_credentials;
pub mod status_step;
pub mod stream_event;
pub mod token_grant;

// Re-exports
pub use credential_bundle::CredentialBundle;
pub use login_credentials::LoginCredentials;
pub use status_step::{Banner, BannerKind, StatusStep};
pub use stream_event::StreamEvent;
pub use token_grant::TokenGrant;
