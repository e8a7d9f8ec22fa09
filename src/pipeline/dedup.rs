//! Fingerprint deduplicator.
//!
//! Suppresses redelivery of the same event by several ingestion sources and
//! suppresses transport echoes of our own replies. All state lives in a
//! single actor task; ingestion sources talk to it through a cloneable
//! [`Deduplicator`] handle, so the maps are never touched concurrently.
//!
//! The fingerprint key is (normalized sender, first 100 chars of body). The
//! timestamp is deliberately absent: two paths observe one event with
//! different clocks.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::contacts::normalize::normalize_identifier;
use crate::error::PipelineError;

/// Body prefix length that participates in the fingerprint.
pub const BODY_WINDOW: usize = 100;

/// Default time a fingerprint suppresses redelivery.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default cap on entries per index.
pub const DEFAULT_CAPACITY: usize = 2_000;

/// Run TTL eviction every this many inserts.
const EVICT_EVERY: u32 = 64;

/// Command queue depth for the actor.
const COMMAND_BUFFER: usize = 256;

/// Deterministic id for (sender, body). Timestamp is not an input.
pub fn fingerprint(sender: &str, body: &str) -> String {
    let key = fingerprint_key(sender, body);
    let digest = Sha256::digest(key.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn fingerprint_key(sender: &str, body: &str) -> String {
    let window: String = body.trim().chars().take(BODY_WINDOW).collect();
    format!("{}\u{1f}{}", normalize_identifier(sender), window)
}

fn echo_key(body: &str) -> String {
    body.trim().chars().take(BODY_WINDOW).collect()
}

// ── Index ───────────────────────────────────────────────────────────

/// TTL map from key to first-seen epoch ms, bounded by a size cap.
#[derive(Debug)]
struct TtlIndex {
    entries: HashMap<String, i64>,
    ttl_ms: u64,
    capacity: usize,
    inserts_since_evict: u32,
}

impl TtlIndex {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms: ttl.as_millis() as u64,
            capacity: capacity.max(1),
            inserts_since_evict: 0,
        }
    }

    /// Distance in either direction: a second clock running behind the first
    /// still matches, and a sender-stamped future time cannot pin a key.
    fn within_ttl(&self, seen: i64, now_ms: i64) -> bool {
        now_ms.abs_diff(seen) < self.ttl_ms
    }

    fn is_fresh(&self, key: &str, now_ms: i64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|&seen| self.within_ttl(seen, now_ms))
    }

    fn insert(&mut self, key: String, now_ms: i64) {
        self.entries.insert(key, now_ms);
        self.inserts_since_evict += 1;
        if self.inserts_since_evict >= EVICT_EVERY {
            self.evict_stale(now_ms);
        }
        if self.entries.len() > self.capacity {
            self.evict_stale(now_ms);
            self.evict_oldest();
        }
    }

    fn evict_stale(&mut self, now_ms: i64) {
        let ttl = self.ttl_ms;
        self.entries.retain(|_, &mut seen| now_ms.abs_diff(seen) < ttl);
        self.inserts_since_evict = 0;
    }

    fn evict_oldest(&mut self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Synchronous core of the deduplicator. Owned by the actor; exposed for
/// deterministic tests with explicit clocks.
#[derive(Debug)]
pub struct FingerprintIndex {
    seen: TtlIndex,
    sent: TtlIndex,
}

impl FingerprintIndex {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: TtlIndex::new(ttl, capacity),
            sent: TtlIndex::new(ttl, capacity),
        }
    }

    /// Record-and-return-true for unseen or stale keys; false for fresh ones.
    pub fn is_new(&mut self, sender: &str, body: &str, ts_ms: i64) -> bool {
        let key = fingerprint_key(sender, body);
        if self.seen.is_fresh(&key, ts_ms) {
            return false;
        }
        self.seen.insert(key, ts_ms);
        true
    }

    pub fn mark_sent(&mut self, body: &str, now_ms: i64) {
        let key = echo_key(body);
        if !key.is_empty() {
            self.sent.insert(key, now_ms);
        }
    }

    pub fn was_sent_recently(&self, body: &str, now_ms: i64) -> bool {
        self.sent.is_fresh(&echo_key(body), now_ms)
    }

    /// (fingerprints, sent bodies) currently held.
    pub fn sizes(&self) -> (usize, usize) {
        (self.seen.len(), self.sent.len())
    }
}

// ── Actor ───────────────────────────────────────────────────────────

enum Command {
    IsNew {
        sender: String,
        body: String,
        ts_ms: i64,
        reply: oneshot::Sender<bool>,
    },
    MarkSent {
        body: String,
        now_ms: i64,
    },
    WasSentRecently {
        body: String,
        now_ms: i64,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to the deduplicator actor.
#[derive(Clone)]
pub struct Deduplicator {
    tx: mpsc::Sender<Command>,
}

impl Deduplicator {
    /// Spawn the owning actor task and return a handle to it.
    pub fn spawn(ttl: Duration, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Command>(COMMAND_BUFFER);
        let handle = tokio::spawn(async move {
            let mut index = FingerprintIndex::new(ttl, capacity);
            info!(ttl_secs = ttl.as_secs(), capacity, "Deduplicator started");
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::IsNew {
                        sender,
                        body,
                        ts_ms,
                        reply,
                    } => {
                        let fresh = index.is_new(&sender, &body, ts_ms);
                        let _ = reply.send(fresh);
                    }
                    Command::MarkSent { body, now_ms } => index.mark_sent(&body, now_ms),
                    Command::WasSentRecently {
                        body,
                        now_ms,
                        reply,
                    } => {
                        let _ = reply.send(index.was_sent_recently(&body, now_ms));
                    }
                }
            }
            debug!("Deduplicator stopped: all handles dropped");
        });
        (Self { tx }, handle)
    }

    /// True if (sender, body) has not been seen within the TTL at `ts_ms`.
    pub async fn is_new(&self, sender: &str, body: &str, ts_ms: i64) -> Result<bool, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::IsNew {
                sender: sender.to_string(),
                body: body.to_string(),
                ts_ms,
                reply,
            })
            .await
            .map_err(|_| PipelineError::Dedup("actor stopped".into()))?;
        rx.await
            .map_err(|_| PipelineError::Dedup("actor dropped reply".into()))
    }

    /// Remember an outgoing reply body so its echo is suppressed.
    pub async fn mark_sent(&self, body: &str) -> Result<(), PipelineError> {
        self.tx
            .send(Command::MarkSent {
                body: body.to_string(),
                now_ms: Utc::now().timestamp_millis(),
            })
            .await
            .map_err(|_| PipelineError::Dedup("actor stopped".into()))
    }

    pub async fn was_sent_recently(&self, body: &str) -> Result<bool, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::WasSentRecently {
                body: body.to_string(),
                now_ms: Utc::now().timestamp_millis(),
                reply,
            })
            .await
            .map_err(|_| PipelineError::Dedup("actor stopped".into()))?;
        rx.await
            .map_err(|_| PipelineError::Dedup("actor dropped reply".into()))
    }
}
