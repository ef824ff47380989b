//! Short-lived action tokens.
//!
//! A nonce is an HMAC over `(tick, action, user)` where a tick is half the
//! configured lifetime. A nonce verifies during the tick it was issued in
//! and the following one, so it lives between `ttl / 2` and `ttl`.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use driftfix_common::{Error, Result};
use ring::hmac;
use tracing::debug;

use crate::auth::random_bytes;

/// Action bound to migration requests.
pub const MIGRATE_ACTION: &str = "driftfix_migrate";

pub struct NonceIssuer {
    key: hmac::Key,
    tick_secs: i64,
}

impl NonceIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Security("nonce secret cannot be empty".into()));
        }
        // Halving first keeps this in range: u64::MAX / 2 == i64::MAX.
        let tick_secs = (ttl.as_secs() / 2) as i64;
        if tick_secs == 0 {
            return Err(Error::Security("nonce lifetime must be at least 2 seconds".into()));
        }
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            tick_secs,
        })
    }

    /// An issuer with a random secret; nonces do not survive a restart.
    pub fn ephemeral(ttl: Duration) -> Result<Self> {
        let mut secret = [0u8; 32];
        random_bytes(&mut secret)?;
        debug!("using an ephemeral nonce secret");
        Self::new(&secret, ttl)
    }

    fn tick(&self, now: i64) -> i64 {
        now.div_euclid(self.tick_secs) + 1
    }

    fn message(tick: i64, action: &str, user: &str) -> String {
        format!("{tick}|{action}|{user}")
    }

    pub fn issue(&self, action: &str, user: &str) -> String {
        self.issue_at(action, user, chrono::Utc::now().timestamp())
    }

    pub fn issue_at(&self, action: &str, user: &str, now: i64) -> String {
        let message = Self::message(self.tick(now), action, user);
        URL_SAFE_NO_PAD.encode(hmac::sign(&self.key, message.as_bytes()))
    }

    pub fn verify(&self, nonce: &str, action: &str, user: &str) -> Result<()> {
        self.verify_at(nonce, action, user, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(&self, nonce: &str, action: &str, user: &str, now: i64) -> Result<()> {
        let presented = URL_SAFE_NO_PAD
            .decode(nonce.trim())
            .map_err(|_| Error::Unauthorized("malformed nonce".into()))?;

        let tick = self.tick(now);
        for candidate in [tick, tick - 1] {
            let message = Self::message(candidate, action, user);
            if hmac::verify(&self.key, message.as_bytes(), &presented).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Unauthorized(format!("invalid or expired nonce for {action}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn issuer() -> NonceIssuer {
        NonceIssuer::new(b"test-secret", DAY).unwrap()
    }

    #[test]
    fn nonce_verifies_for_the_same_action_and_user() {
        let issuer = issuer();
        let now = 1_700_000_000;
        let nonce = issuer.issue_at(MIGRATE_ACTION, "alice", now);
        assert!(issuer.verify_at(&nonce, MIGRATE_ACTION, "alice", now).is_ok());
        assert!(issuer.verify_at(&nonce, MIGRATE_ACTION, "bob", now).is_err());
        assert!(issuer.verify_at(&nonce, "other_action", "alice", now).is_err());
    }

    #[test]
    fn nonce_expires_after_two_ticks() {
        let issuer = issuer();
        let now = 1_700_000_000;
        let nonce = issuer.issue_at(MIGRATE_ACTION, "alice", now);
        let half = DAY.as_secs() as i64 / 2;

        assert!(issuer.verify_at(&nonce, MIGRATE_ACTION, "alice", now + half).is_ok());
        assert!(matches!(
            issuer.verify_at(&nonce, MIGRATE_ACTION, "alice", now + 2 * half + 1),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn nonces_from_another_secret_are_rejected() {
        let other = NonceIssuer::new(b"different", DAY).unwrap();
        let now = 1_700_000_000;
        let nonce = other.issue_at(MIGRATE_ACTION, "alice", now);
        assert!(issuer().verify_at(&nonce, MIGRATE_ACTION, "alice", now).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let issuer = issuer();
        assert!(issuer.verify_at("", MIGRATE_ACTION, "alice", 0).is_err());
        assert!(issuer.verify_at("!!!", MIGRATE_ACTION, "alice", 0).is_err());
        assert!(issuer.verify_at("AAAA", MIGRATE_ACTION, "alice", 0).is_err());
    }

    #[test]
    fn invalid_configuration_is_refused() {
        assert!(NonceIssuer::new(b"", DAY).is_err());
        assert!(NonceIssuer::new(b"secret", Duration::from_secs(1)).is_err());
        assert!(NonceIssuer::ephemeral(DAY).is_ok());
    }

    #[test]
    fn longest_lifetime_keeps_a_positive_tick() {
        let issuer = NonceIssuer::new(b"secret", Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(issuer.tick_secs, i64::MAX);

        let nonce = issuer.issue_at(MIGRATE_ACTION, "alice", 1_700_000_000);
        assert!(issuer.verify_at(&nonce, MIGRATE_ACTION, "alice", 1_800_000_000).is_ok());
        assert!(issuer.verify_at(&nonce, MIGRATE_ACTION, "bob", 1_700_000_000).is_err());
    }
}
