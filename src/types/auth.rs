//! Access token held by the streaming session.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// A bearer token plus its expiry, if known.
///
/// How the token was obtained (code flow, PKCE, refresh grant) is outside
/// this crate; the session only uses and renews it.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// The raw bearer token.
    pub token: String,
    /// When the token stops being accepted.
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// A token without a known expiry. No renewal is scheduled for it.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    /// A token that expires at `expires_at`.
    pub fn with_expiry(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at: Some(expires_at),
        }
    }

    /// A token that expires `expires_in` from now, as returned in the
    /// `expires_in` field of a token response.
    pub fn expiring_in(token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: chrono::Duration::from_std(expires_in)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d)),
        }
    }

    /// Time from `now` until renewal should start, i.e. `expires_at - margin`.
    ///
    /// Returns `None` when the expiry is unknown and `Some(ZERO)` when the
    /// renewal point has already passed.
    pub fn renewal_delay(&self, margin: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let expires_at = self.expires_at?;
        let renew_at = chrono::Duration::from_std(margin)
            .ok()
            .and_then(|m| expires_at.checked_sub_signed(m))
            .unwrap_or(now);
        Some((renew_at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

// Keep the token out of logs.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_delay_subtracts_margin() {
        let now = Utc::now();
        let token = AccessToken::with_expiry("t", now + chrono::Duration::seconds(1200));
        let delay = token.renewal_delay(Duration::from_secs(60), now).unwrap();
        assert_eq!(delay, Duration::from_secs(1140));
    }

    #[test]
    fn renewal_delay_is_zero_when_inside_margin() {
        let now = Utc::now();
        let token = AccessToken::with_expiry("t", now + chrono::Duration::seconds(30));
        assert_eq!(
            token.renewal_delay(Duration::from_secs(60), now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn no_expiry_means_no_renewal() {
        let token = AccessToken::new("t");
        assert_eq!(token.renewal_delay(Duration::from_secs(60), Utc::now()), None);
    }

    #[test]
    fn debug_redacts_token() {
        let token = AccessToken::new("secret-value");
        assert!(!format!("{token:?}").contains("secret-value"));
    }
}
