use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{CredentialBundle, Error, Result};

/// Token grant returned by the login and refresh endpoints.
///
/// Lifetimes are relative to the moment the grant is received; [`TokenGrant::into_bundle`]
/// pins them to absolute instants.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// The new access token.
    pub access_token: String,

    /// The new refresh token, if the backend issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Backend session identifier.
    pub session_id: String,

    /// Seconds until the access token expires.
    pub expires_in: u64,

    /// Seconds until the refresh token expires.  Defaults to the access lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<u64>,
}

impl TokenGrant {
    /// Converts the grant into a bundle anchored at `now`.
    ///
    /// Fails with a validation error when a lifetime lands outside the representable range.
    pub fn into_bundle(self, now: OffsetDateTime) -> Result<CredentialBundle> {
        let expires_at = offset(now, self.expires_in, "expires_in")?;
        let refresh_expires_at = match self.refresh_expires_in {
            Some(secs) => offset(now, secs, "refresh_expires_in")?,
            None => expires_at,
        };
        Ok(CredentialBundle {
            access_token: self.access_token,
            refresh_token: self.refresh_token.unwrap_or_default(),
            session_id: self.session_id,
            expires_at,
            refresh_expires_at,
        })
    }
}

fn offset(now: OffsetDateTime, secs: u64, field: &str) -> Result<OffsetDateTime> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| now.checked_add(time::Duration::seconds(secs)))
        .ok_or_else(|| {
            Error::validation(
                format!("token grant {field} of {secs}s is out of range"),
                Some(field.to_string()),
            )
        })
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("session_id", &self.session_id)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .finish()
    }
}
