//! Remote admin sessions.
//!
//! A correspondent who sends `admin <code>` with the right code is treated
//! as the operator for a fixed window. The window never slides: a session
//! expires `window` after it was granted no matter how active it is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::contacts::normalize::normalize_identifier;
use crate::error::DatabaseError;
use crate::store::{RecordStore, kinds, list_records, put_record};

/// Default session length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30 * 60);

/// A granted operator session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSession {
    pub identity: String,
    pub granted_at: DateTime<Utc>,
}

impl AdminSession {
    pub fn expires_at(&self, window: Duration) -> DateTime<Utc> {
        self.granted_at + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
    }

    pub fn is_active_at(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now < self.expires_at(window) && now >= self.granted_at
    }
}

/// Pull the code out of an `admin <code>` utterance.
pub fn parse_admin_utterance(body: &str) -> Option<&str> {
    let body = body.trim();
    let (head, rest) = body.split_once(char::is_whitespace)?;
    if !head.eq_ignore_ascii_case("admin") {
        return None;
    }
    let code = rest.trim();
    (!code.is_empty() && !code.contains(char::is_whitespace)).then_some(code)
}

/// Session table keyed by normalized identity.
pub struct AdminSessions {
    store: Arc<dyn RecordStore>,
    code: SecretString,
    window: Duration,
    sessions: RwLock<HashMap<String, AdminSession>>,
}

impl AdminSessions {
    /// Load persisted sessions, dropping any that already expired.
    pub async fn load(
        store: Arc<dyn RecordStore>,
        code: SecretString,
        window: Duration,
    ) -> Result<Self, DatabaseError> {
        let now = Utc::now();
        let mut sessions = HashMap::new();
        for session in list_records::<AdminSession>(store.as_ref(), kinds::ADMIN_SESSION).await? {
            if session.is_active_at(window, now) {
                sessions.insert(session.identity.clone(), session);
            } else {
                store.delete(kinds::ADMIN_SESSION, &session.identity).await?;
            }
        }
        Ok(Self {
            store,
            code,
            window,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Grant a session if `secret` matches the admin code.
    ///
    /// An empty configured code disables remote admin entirely.
    pub async fn authenticate(
        &self,
        identity: &str,
        secret: &str,
    ) -> Result<Option<AdminSession>, DatabaseError> {
        self.authenticate_at(identity, secret, Utc::now()).await
    }

    pub async fn authenticate_at(
        &self,
        identity: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AdminSession>, DatabaseError> {
        let expected = self.code.expose_secret();
        if expected.is_empty() || !constant_time_eq(expected.as_bytes(), secret.trim().as_bytes()) {
            warn!(identity, "Admin authentication failed");
            return Ok(None);
        }

        let identity = normalize_identifier(identity);
        let session = AdminSession {
            identity: identity.clone(),
            granted_at: now,
        };
        put_record(self.store.as_ref(), kinds::ADMIN_SESSION, &identity, &session).await?;
        self.sessions
            .write()
            .await
            .insert(identity.clone(), session.clone());
        info!(
            identity = %identity,
            expires_at = %session.expires_at(self.window),
            "Admin session granted"
        );
        Ok(Some(session))
    }

    pub async fn is_active(&self, identity: &str) -> bool {
        self.is_active_at(identity, Utc::now()).await
    }

    pub async fn is_active_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let identity = normalize_identifier(identity);
        self.sessions
            .read()
            .await
            .get(&identity)
            .is_some_and(|s| s.is_active_at(self.window, now))
    }

    /// Identities with a live session.
    pub async fn active_identities(&self) -> Vec<String> {
        let now = Utc::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_active_at(self.window, now))
            .map(|s| s.identity.clone())
            .collect()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn sessions(code: &str) -> (AdminSessions, Arc<dyn RecordStore>) {
        let store: Arc<dyn RecordStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (
            AdminSessions::load(Arc::clone(&store), SecretString::from(code), DEFAULT_WINDOW)
                .await
                .unwrap(),
            store,
        )
    }

    #[test]
    fn parses_admin_utterance() {
        assert_eq!(parse_admin_utterance("admin tulip42"), Some("tulip42"));
        assert_eq!(parse_admin_utterance("  ADMIN   tulip42 "), Some("tulip42"));
        assert_eq!(parse_admin_utterance("admin"), None);
        assert_eq!(parse_admin_utterance("admin two words"), None);
        assert_eq!(parse_admin_utterance("administrator tulip42"), None);
    }

    #[tokio::test]
    async fn wrong_code_fails() {
        let (s, _) = sessions("tulip42").await;
        assert!(s.authenticate("+15551234567", "tulip").await.unwrap().is_none());
        assert!(!s.is_active("+15551234567").await);
    }

    #[tokio::test]
    async fn empty_code_disables_remote_admin() {
        let (s, _) = sessions("").await;
        assert!(s.authenticate("+15551234567", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn window_is_fixed_thirty_minutes() {
        let (s, _) = sessions("tulip42").await;
        let t0 = Utc::now();
        s.authenticate_at("(555) 123-4567", "tulip42", t0)
            .await
            .unwrap()
            .unwrap();

        assert!(s.is_active_at("+15551234567", t0 + chrono::Duration::minutes(29)).await);
        assert!(!s.is_active_at("+15551234567", t0 + chrono::Duration::minutes(30)).await);
        assert!(!s.is_active_at("+15550000000", t0).await);
    }

    #[tokio::test]
    async fn sessions_survive_reload() {
        let (s, store) = sessions("tulip42").await;
        s.authenticate("ann@example.com", "tulip42").await.unwrap();

        let reloaded =
            AdminSessions::load(store, SecretString::from("tulip42"), DEFAULT_WINDOW)
                .await
                .unwrap();
        assert!(reloaded.is_active("Ann@Example.com").await);
    }

    #[tokio::test]
    async fn expired_sessions_are_pruned_on_load() {
        let (s, store) = sessions("tulip42").await;
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        s.authenticate_at("ann@example.com", "tulip42", long_ago)
            .await
            .unwrap();

        let reloaded =
            AdminSessions::load(Arc::clone(&store), SecretString::from("tulip42"), DEFAULT_WINDOW)
                .await
                .unwrap();
        assert!(reloaded.active_identities().await.is_empty());
        assert!(store.list(kinds::ADMIN_SESSION).await.unwrap().is_empty());
    }
}
