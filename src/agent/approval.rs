//! Destructive action gate: two-step confirmation for irreversible actions.
//!
//! `propose` parks one action. The next operator utterance either carries
//! the admin code as a whole word, which hands the action back for
//! execution, or it discards the action. A second `propose` replaces the
//! first without running it.
//!
//! The gate fails closed: an expired proposal, an unset code, or a code
//! that is an everyday word can never confirm anything.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// How long a proposal stays confirmable.
pub const DEFAULT_PENDING_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Words too common to serve as a confirmation code. A code equal to one
/// of these would confirm on ordinary chatter, so confirmation is refused.
const COMMON_WORDS: &[&str] = &[
    "yes", "no", "ok", "okay", "sure", "confirm", "cancel", "y", "n", "go", "do", "it", "the",
    "a", "an", "and", "or", "please", "admin", "delete", "trash", "stop", "yeah", "yep", "nope",
];

/// An irreversible remote-side mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DestructiveAction {
    /// Move every mailbox item from `sender` to the trash.
    TrashMailFrom { sender: String },
    /// Delete every stored rule.
    ClearRules,
}

impl fmt::Display for DestructiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrashMailFrom { sender } => write!(f, "trash all mail from {sender}"),
            Self::ClearRules => f.write_str("delete all rules"),
        }
    }
}

/// A parked action awaiting the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAction {
    pub token: Uuid,
    pub action: DestructiveAction,
    pub created_at: DateTime<Utc>,
}

/// Result of a confirmation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The code matched. The caller runs the returned action exactly once.
    Executed(PendingAction),
    /// Something was pending and has now been discarded.
    Cancelled(PendingAction),
    NothingPending,
}

/// Single-slot gate shared by every operator flow.
pub struct DestructiveGate {
    code: SecretString,
    expiry: Duration,
    pending: Mutex<Option<PendingAction>>,
}

impl DestructiveGate {
    pub fn new(code: SecretString, expiry: Duration) -> Self {
        Self {
            code,
            expiry,
            pending: Mutex::new(None),
        }
    }

    /// Park `action`, replacing anything already pending.
    pub async fn propose(&self, action: DestructiveAction) -> Uuid {
        self.propose_at(action, Utc::now()).await
    }

    pub async fn propose_at(&self, action: DestructiveAction, now: DateTime<Utc>) -> Uuid {
        let pending = PendingAction {
            token: Uuid::new_v4(),
            action,
            created_at: now,
        };
        let token = pending.token;
        let mut slot = self.pending.lock().await;
        if let Some(previous) = slot.replace(pending) {
            info!(
                token = %previous.token,
                action = %previous.action,
                "Pending destructive action replaced before confirmation"
            );
        }
        token
    }

    /// Whether an unexpired action is waiting.
    pub async fn has_pending(&self) -> bool {
        let now = Utc::now();
        self.pending
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !self.is_expired(p, now))
    }

    pub async fn confirm(&self, utterance: &str) -> Confirmation {
        self.confirm_at(utterance, Utc::now()).await
    }

    /// Consume the pending action. Only an utterance containing the admin
    /// code as a whole word executes it; every other outcome discards it.
    pub async fn confirm_at(&self, utterance: &str, now: DateTime<Utc>) -> Confirmation {
        let Some(pending) = self.pending.lock().await.take() else {
            return Confirmation::NothingPending;
        };

        if self.is_expired(&pending, now) {
            info!(token = %pending.token, "Pending destructive action expired");
            return Confirmation::NothingPending;
        }

        let code = self.code.expose_secret();
        if code.is_empty() {
            warn!("No admin code configured; destructive action cancelled");
            return Confirmation::Cancelled(pending);
        }
        if COMMON_WORDS.contains(&code.to_lowercase().as_str()) {
            warn!("Admin code is a common word; destructive action cancelled");
            return Confirmation::Cancelled(pending);
        }

        if contains_code_word(utterance, code) {
            info!(token = %pending.token, action = %pending.action, "Destructive action confirmed");
            Confirmation::Executed(pending)
        } else {
            info!(token = %pending.token, "Destructive action discarded");
            Confirmation::Cancelled(pending)
        }
    }

    fn is_expired(&self, pending: &PendingAction, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(pending.created_at);
        age.to_std().is_ok_and(|age| age >= self.expiry)
    }
}

/// Exact, case-sensitive whole-word match. Edge punctuation on a word is
/// ignored so "tulip42." still counts.
fn contains_code_word(utterance: &str, code: &str) -> bool {
    utterance.split_whitespace().any(|raw| {
        raw == code || raw.trim_matches(|c: char| c.is_ascii_punctuation()) == code
    })
}
