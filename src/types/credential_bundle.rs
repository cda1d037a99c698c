use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The complete credential record for one signed-in session.
///
/// A bundle is treated as one atomic unit: it is created by a login or a refresh, replaced
/// wholesale by the next refresh, and never edited field by field.  The access token is an
/// opaque bearer value and is never inspected.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Bearer token attached to every authenticated request.
    pub access_token: String,

    /// Token exchanged for a new bundle.  Empty when the backend did not issue one, in which
    /// case the bundle can never be refreshed.
    #[serde(default)]
    pub refresh_token: String,

    /// Backend session identifier, sent alongside the refresh token.
    pub session_id: String,

    /// Instant after which the access token is no longer accepted.
    #[serde(with = "crate::utils::time")]
    pub expires_at: OffsetDateTime,

    /// Instant after which the refresh token is no longer accepted.
    #[serde(with = "crate::utils::time")]
    pub refresh_expires_at: OffsetDateTime,
}

impl CredentialBundle {
    /// Creates a new bundle.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        session_id: impl Into<String>,
        expires_at: OffsetDateTime,
        refresh_expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            session_id: session_id.into(),
            expires_at,
            refresh_expires_at,
        }
    }

    /// Returns true if the backend issued a refresh token for this bundle.
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Returns true once the refresh token's lifetime has passed.
    pub fn is_refresh_expired(&self, now: OffsetDateTime) -> bool {
        self.refresh_expires_at <= now
    }

    /// Returns true if a refresh exchange may be attempted at `now`.
    pub fn can_refresh(&self, now: OffsetDateTime) -> bool {
        self.has_refresh_token() && !self.is_refresh_expired(now)
    }

    /// Returns true if the access token expires within `margin` of `now` (or already has).
    pub fn expires_within(&self, now: OffsetDateTime, margin: Duration) -> bool {
        self.expires_at <= now + margin
    }

    /// Time left until a proactive refresh should fire, `margin` ahead of access expiry.
    ///
    /// Returns zero when that point has already passed.
    pub fn refresh_due_in(&self, now: OffsetDateTime, margin: Duration) -> Duration {
        let remaining = self.expires_at - margin - now;
        if remaining.is_positive() {
            remaining.unsigned_abs()
        } else {
            Duration::ZERO
        }
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

fn redact(token: &str) -> &'static str {
    if token.is_empty() { "<none>" } else { "<redacted>" }
}
