//! Gate in front of every state-changing or token-issuing action.
//!
//! An action is admitted only for an authenticated identity that also
//! presents a valid anti-forgery token bound to that identity. Admission
//! yields a [`Caller`], which the services take as an explicit parameter.

use crate::utils::clock::{Clock, SystemClock};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// An authenticated principal that passed the anti-forgery check.
///
/// Only [`ActionGuard::admit`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    identity: String,
}

impl Caller {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Missing or invalid anti-forgery token")]
    Forgery,
}

pub struct ActionGuard {
    secret: Vec<u8>,
    max_age_secs: i64,
    clock: Arc<dyn Clock>,
}

impl ActionGuard {
    pub fn new(secret: &str, max_age_secs: i64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            max_age_secs,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn signature(&self, identity: &str, timestamp: i64, nonce: &str) -> Option<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(format!("{}.{}.{}", identity, timestamp, nonce).as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Anti-forgery token bound to `identity`.
    /// Token format: `<hmac>.<timestamp>.<nonce>`
    pub fn issue_csrf_token(&self, identity: &str) -> Option<String> {
        let timestamp = self.clock.now().timestamp();
        let nonce = Uuid::new_v4().simple().to_string();
        let hmac = self.signature(identity, timestamp, &nonce)?;
        Some(format!("{}.{}.{}", hmac, timestamp, nonce))
    }

    fn verify_csrf_token(&self, identity: &str, token: &str) -> bool {
        let parts: Vec<&str> = token.split('.').collect();
        let [hmac_part, timestamp, nonce] = parts.as_slice() else {
            return false;
        };

        let Ok(timestamp) = timestamp.parse::<i64>() else {
            return false;
        };

        let now = self.clock.now().timestamp();
        if timestamp > now || now - timestamp > self.max_age_secs {
            tracing::debug!("CSRF token expired");
            return false;
        }

        let Some(expected) = self.signature(identity, timestamp, nonce) else {
            return false;
        };
        expected.as_bytes().ct_eq(hmac_part.as_bytes()).into()
    }

    /// Admits an action for `identity` when `csrf_token` was issued to it and is still fresh.
    pub fn admit(
        &self,
        identity: Option<&str>,
        csrf_token: Option<&str>,
    ) -> Result<Caller, GuardError> {
        let identity = identity
            .filter(|i| !i.trim().is_empty())
            .ok_or(GuardError::Unauthenticated)?;

        let token = csrf_token.ok_or(GuardError::Forgery)?;
        if !self.verify_csrf_token(identity, token) {
            tracing::warn!("Rejected action for {}: anti-forgery check failed", identity);
            return Err(GuardError::Forgery);
        }

        Ok(Caller {
            identity: identity.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use chrono::{Duration, Utc};

    #[test]
    fn test_admit_with_valid_token() {
        let guard = ActionGuard::new("secret", 3600);
        let token = guard.issue_csrf_token("analyst@example.org").unwrap();
        let caller = guard
            .admit(Some("analyst@example.org"), Some(&token))
            .unwrap();
        assert_eq!(caller.identity(), "analyst@example.org");
    }

    #[test]
    fn test_unauthenticated_before_forgery() {
        let guard = ActionGuard::new("secret", 3600);
        assert_eq!(guard.admit(None, None), Err(GuardError::Unauthenticated));
        assert_eq!(guard.admit(Some("  "), None), Err(GuardError::Unauthenticated));
        assert_eq!(
            guard.admit(Some("analyst@example.org"), None),
            Err(GuardError::Forgery)
        );
    }

    #[test]
    fn test_token_bound_to_identity() {
        let guard = ActionGuard::new("secret", 3600);
        let token = guard.issue_csrf_token("alice@example.org").unwrap();
        assert_eq!(
            guard.admit(Some("mallory@example.org"), Some(&token)),
            Err(GuardError::Forgery)
        );
    }

    #[test]
    fn test_tampered_and_malformed_tokens() {
        let guard = ActionGuard::new("secret", 3600);
        let token = guard.issue_csrf_token("alice@example.org").unwrap();
        let other = ActionGuard::new("other", 3600)
            .issue_csrf_token("alice@example.org")
            .unwrap();

        for bad in [other.as_str(), "abc", "a.b.c", "", &token[1..]] {
            assert_eq!(
                guard.admit(Some("alice@example.org"), Some(bad)),
                Err(GuardError::Forgery),
                "token {:?} must be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_token_expires() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let guard = ActionGuard::new("secret", 60).with_clock(clock.clone());
        let token = guard.issue_csrf_token("alice@example.org").unwrap();

        clock.advance(Duration::seconds(60));
        assert!(guard.admit(Some("alice@example.org"), Some(&token)).is_ok());

        clock.advance(Duration::seconds(1));
        assert_eq!(
            guard.admit(Some("alice@example.org"), Some(&token)),
            Err(GuardError::Forgery)
        );
    }
}
