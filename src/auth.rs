use crate::{CredentialBundle, LoginCredentials, Result};

/// The backend's authentication endpoints.
///
/// Implementations report an explicit refusal of the credentials with an error for which
/// [`Error::is_credential_rejection`](crate::Error::is_credential_rejection) holds; every other
/// error is treated as a transport or protocol failure.
#[async_trait::async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchanges a username and password for a fresh bundle.
    async fn login(&self, credentials: &LoginCredentials) -> Result<CredentialBundle>;

    /// Exchanges a session id and refresh token for a new bundle.
    async fn refresh(&self, session_id: &str, refresh_token: &str) -> Result<CredentialBundle>;

    /// Ends the backend session belonging to `bundle`.
    async fn logout(&self, bundle: &CredentialBundle) -> Result<()>;
}
