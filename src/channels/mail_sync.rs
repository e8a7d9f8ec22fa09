//! Remote mailbox delta sync.
//!
//! [`SyncCursorManager`] owns the delta cursor:
//!
//! ```text
//! Unprimed --baseline ok--> Primed(c) --delta ok--> Primed(c')
//!    ^                          |
//!    +------cursor expired------+
//! ```
//!
//! Every failure comes back as a typed value. Credential problems in
//! particular are never logged-and-dropped: an unnoticed credential failure
//! leaves sync permanently idle with nothing to show for it.
//!
//! [`MailPoller`] runs one cycle at a time on top of the manager: it
//! fetches new item ids, skips ones already processed, converts the rest
//! into messages and hands them to the router. New ids are parked as
//! `pending_item` records before they are fetched, because the cursor has
//! already moved past them; a failed fetch is retried on later cycles.

use std::sync::{Arc, LazyLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::operator::{Notice, OperatorNotifier};
use crate::config::MailConfig;
use crate::error::SyncError;
use crate::pipeline::router::MessageSink;
use crate::pipeline::types::{Channel, Message};
use crate::store::{RecordStore, get_record, kinds, put_record};

const CURSOR_ID: &str = "mail";

/// Fetch attempts before a parked item is dropped and reported.
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

/// Days a processed-item marker is kept.
pub const PROCESSED_RETENTION_DAYS: i64 = 30;

/// Cycles between sweeps of old processed-item markers.
const PRUNE_EVERY: u64 = 100;

static CALLBACK_NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\+?1?[\s.\-]?\(?\d{3}\)?[\s.\-]?\d{3}[\s.\-]?\d{4}").ok()
});

// ── Remote API ──────────────────────────────────────────────────────

/// One page of changes since a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPage {
    pub item_ids: Vec<String>,
    /// Continuation for the next call. `None` when the server sent none.
    pub cursor: Option<String>,
}

/// A fetched mailbox item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailItem {
    pub id: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Delta-sync surface of the remote mail service.
#[async_trait]
pub trait MailApi: Send + Sync {
    /// Take a fresh baseline and return its cursor. Existing items are not reported.
    async fn baseline(&self) -> Result<String, SyncError>;

    /// Changes since `cursor`. `SyncError::CursorExpired` when the server no
    /// longer recognizes it.
    async fn delta(&self, cursor: &str) -> Result<DeltaPage, SyncError>;

    async fn fetch_item(&self, id: &str) -> Result<MailItem, SyncError>;

    /// Move every item from `sender` to the trash. Returns how many moved.
    async fn trash_from(&self, sender: &str) -> Result<usize, SyncError>;
}

#[derive(Deserialize)]
struct GraphPage {
    #[serde(default)]
    value: Vec<GraphRef>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Deserialize)]
struct GraphRef {
    id: String,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    body: Option<GraphBody>,
    #[serde(default)]
    body_preview: String,
    received_date_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphAddress,
}

#[derive(Deserialize)]
struct GraphAddress {
    address: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct GraphBody {
    #[serde(default)]
    content: String,
}

/// Graph-style REST client (`/me/mailFolders/{folder}/messages/delta`).
pub struct GraphMailApi {
    client: Client,
    base: String,
    folder: String,
    token: Option<SecretString>,
}

impl GraphMailApi {
    pub fn new(config: &MailConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: config.api_url.trim_end_matches('/').to_string(),
            folder: config.mailbox_folder.clone(),
            token: config.token.clone(),
        })
    }

    fn authed(&self, req: RequestBuilder) -> Result<RequestBuilder, SyncError> {
        let token = self.token.as_ref().ok_or(SyncError::NoCredential)?;
        Ok(req.bearer_auth(token.expose_secret()))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, req: RequestBuilder) -> Result<T, SyncError> {
        let resp = self
            .authed(req)?
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        resp.json()
            .await
            .map_err(|e| SyncError::Transport(format!("invalid response body: {e}")))
    }

    /// Follow `nextLink` pages until a `deltaLink` appears.
    async fn walk(&self, first: RequestBuilder) -> Result<DeltaPage, SyncError> {
        let mut out = DeltaPage::default();
        let mut page: GraphPage = self.get_json(first).await?;
        loop {
            out.item_ids.extend(
                page.value
                    .into_iter()
                    .filter(|r| r.removed.is_none())
                    .map(|r| r.id),
            );
            if let Some(delta) = page.delta_link {
                out.cursor = Some(delta);
                return Ok(out);
            }
            match page.next_link {
                Some(next) => page = self.get_json(self.client.get(next)).await?,
                None => return Ok(out),
            }
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Unauthorized(body),
        StatusCode::GONE => SyncError::CursorExpired,
        // Some servers report an unknown sync state as 400 with this code.
        StatusCode::BAD_REQUEST if body.contains("syncStateNotFound") => SyncError::CursorExpired,
        _ => SyncError::Remote {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl MailApi for GraphMailApi {
    async fn baseline(&self) -> Result<String, SyncError> {
        let url = format!(
            "{}/me/mailFolders/{}/messages/delta",
            self.base, self.folder
        );
        let req = self
            .client
            .get(url)
            .query(&[("$select", "id")])
            .header("Prefer", "odata.maxpagesize=100");
        self.walk(req)
            .await?
            .cursor
            .ok_or_else(|| SyncError::Remote {
                status: 200,
                body: "baseline ended without a delta link".into(),
            })
    }

    async fn delta(&self, cursor: &str) -> Result<DeltaPage, SyncError> {
        self.walk(self.client.get(cursor)).await
    }

    async fn fetch_item(&self, id: &str) -> Result<MailItem, SyncError> {
        let url = format!("{}/me/messages/{}", self.base, id);
        let req = self
            .client
            .get(url)
            .query(&[(
                "$select",
                "id,subject,from,body,bodyPreview,receivedDateTime",
            )])
            .header("Prefer", "outlook.body-content-type=\"text\"");
        let msg: GraphMessage = self.get_json(req).await?;
        let (from_address, from_name) = match msg.from {
            Some(r) => (
                r.email_address.address.unwrap_or_default(),
                r.email_address.name,
            ),
            None => (String::new(), None),
        };
        let body = msg
            .body
            .map(|b| b.content)
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(msg.body_preview);
        Ok(MailItem {
            id: msg.id,
            from_address,
            from_name,
            subject: msg.subject,
            body: body.trim().to_string(),
            received_at: msg.received_date_time.unwrap_or_else(Utc::now),
        })
    }

    async fn trash_from(&self, sender: &str) -> Result<usize, SyncError> {
        let filter = format!(
            "from/emailAddress/address eq '{}'",
            sender.replace('\'', "''")
        );
        let url = format!("{}/me/messages", self.base);
        let mut moved = 0;
        let mut page: GraphPage = self
            .get_json(
                self.client
                    .get(url)
                    .query(&[("$filter", filter.as_str()), ("$select", "id"), ("$top", "100")]),
            )
            .await?;
        loop {
            for item in &page.value {
                let move_url = format!("{}/me/messages/{}/move", self.base, item.id);
                let resp = self
                    .authed(self.client.post(move_url))?
                    .json(&serde_json::json!({ "destinationId": "deleteditems" }))
                    .send()
                    .await
                    .map_err(|e| SyncError::Transport(e.to_string()))?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(classify_status(status, body));
                }
                moved += 1;
            }
            match page.next_link.take() {
                Some(next) => page = self.get_json(self.client.get(next)).await?,
                None => break,
            }
        }
        info!(sender, moved, "Trashed mail from sender");
        Ok(moved)
    }
}

// ── Cursor state machine ────────────────────────────────────────────

/// Where the manager stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    Unprimed,
    Primed(String),
}

/// Result of [`SyncCursorManager::prime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimeOutcome {
    AlreadyPrimed,
    PrimedOk,
    /// Credential missing or rejected. Needs the operator.
    NoCredential { reason: String },
    RemoteError { status: u16, body: String },
    TransportError(String),
}

#[derive(Serialize, Deserialize)]
struct CursorRecord {
    cursor: String,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ProcessedRecord {
    processed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingRecord {
    parked_at: DateTime<Utc>,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    last_error: Option<String>,
}

pub struct SyncCursorManager {
    api: Arc<dyn MailApi>,
    store: Arc<dyn RecordStore>,
    state: Mutex<CursorState>,
}

impl SyncCursorManager {
    /// Restore the stored cursor, if any.
    pub async fn load(api: Arc<dyn MailApi>, store: Arc<dyn RecordStore>) -> Result<Self, SyncError> {
        let stored: Option<CursorRecord> =
            get_record(store.as_ref(), kinds::SYNC_CURSOR, CURSOR_ID).await?;
        let state = match stored {
            Some(r) if !r.cursor.is_empty() => {
                info!(updated_at = %r.updated_at, "Restored mail sync cursor");
                CursorState::Primed(r.cursor)
            }
            _ => CursorState::Unprimed,
        };
        Ok(Self {
            api,
            store,
            state: Mutex::new(state),
        })
    }

    pub async fn state(&self) -> CursorState {
        self.state.lock().await.clone()
    }

    pub fn api(&self) -> &Arc<dyn MailApi> {
        &self.api
    }

    /// Take a baseline if there is no cursor yet.
    ///
    /// The state lock is not held across the baseline walk; if another
    /// caller primed in the meantime its cursor wins.
    pub async fn prime(&self) -> PrimeOutcome {
        if matches!(*self.state.lock().await, CursorState::Primed(_)) {
            return PrimeOutcome::AlreadyPrimed;
        }

        match self.api.baseline().await {
            Ok(cursor) if cursor.is_empty() => PrimeOutcome::RemoteError {
                status: 200,
                body: "baseline returned an empty cursor".into(),
            },
            Ok(cursor) => {
                let mut state = self.state.lock().await;
                if matches!(*state, CursorState::Primed(_)) {
                    debug!("Mail sync primed concurrently; discarding this baseline");
                    return PrimeOutcome::AlreadyPrimed;
                }
                if let Err(e) = self.persist(&cursor).await {
                    // Still usable in memory; a restart re-baselines.
                    error!(error = %e, "Failed to persist baseline cursor");
                }
                *state = CursorState::Primed(cursor);
                info!("Mail sync primed");
                PrimeOutcome::PrimedOk
            }
            Err(e) => {
                let outcome = prime_failure(e);
                match &outcome {
                    PrimeOutcome::NoCredential { reason } => {
                        error!(reason = %reason, "Mail sync cannot prime: credential problem");
                    }
                    other => warn!(outcome = ?other, "Mail sync prime failed"),
                }
                outcome
            }
        }
    }

    /// Fetch changes since `cursor`, applying whatever advanced cursor the
    /// server returns even when there are no new items.
    ///
    /// On expiry the stored cursor is deleted and the manager goes back to
    /// `Unprimed`; the caller re-primes.
    pub async fn fetch_delta(&self, cursor: &str) -> Result<(Vec<String>, Option<String>), SyncError> {
        match self.api.delta(cursor).await {
            Ok(page) => {
                let advanced = page.cursor.filter(|c| !c.is_empty());
                if let Some(next) = &advanced {
                    let mut state = self.state.lock().await;
                    // Only move forward from the cursor this fetch started at.
                    if *state == CursorState::Primed(cursor.to_string()) && next != cursor {
                        self.persist(next).await?;
                        *state = CursorState::Primed(next.clone());
                        debug!(new_items = page.item_ids.len(), "Mail sync cursor advanced");
                    }
                }
                Ok((page.item_ids, advanced))
            }
            Err(SyncError::CursorExpired) => {
                let mut state = self.state.lock().await;
                self.store.delete(kinds::SYNC_CURSOR, CURSOR_ID).await?;
                *state = CursorState::Unprimed;
                info!("Mail sync cursor expired; cleared for re-baseline");
                Err(SyncError::CursorExpired)
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, cursor: &str) -> Result<(), SyncError> {
        put_record(
            self.store.as_ref(),
            kinds::SYNC_CURSOR,
            CURSOR_ID,
            &CursorRecord {
                cursor: cursor.to_string(),
                updated_at: Utc::now(),
            },
        )
        .await?;
        Ok(())
    }
}

fn prime_failure(e: SyncError) -> PrimeOutcome {
    match e {
        SyncError::NoCredential => PrimeOutcome::NoCredential {
            reason: "no token configured".into(),
        },
        SyncError::Unauthorized(body) => PrimeOutcome::NoCredential { reason: body },
        SyncError::Remote { status, body } => PrimeOutcome::RemoteError { status, body },
        SyncError::CursorExpired => PrimeOutcome::RemoteError {
            status: 410,
            body: "baseline rejected as expired".into(),
        },
        SyncError::Transport(reason) => PrimeOutcome::TransportError(reason),
        SyncError::Database(e) => PrimeOutcome::TransportError(format!("store: {e}")),
    }
}

// ── Poller ──────────────────────────────────────────────────────────

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already running.
    Skipped,
    /// A baseline was taken; nothing to process yet.
    Primed,
    Processed {
        submitted: usize,
        already_seen: usize,
        /// Items still parked for another fetch attempt.
        deferred: usize,
    },
}

/// Turns mailbox items into router messages.
pub struct MailPoller {
    cursor: Arc<SyncCursorManager>,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn MessageSink>,
    notifier: Arc<dyn OperatorNotifier>,
    voice_senders: Vec<String>,
    running: AtomicBool,
    credential_alerted: AtomicBool,
    cycles: AtomicU64,
}

/// Clears the reentrancy flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MailPoller {
    pub fn new(
        cursor: Arc<SyncCursorManager>,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn MessageSink>,
        notifier: Arc<dyn OperatorNotifier>,
        voice_senders: Vec<String>,
    ) -> Self {
        Self {
            cursor,
            store,
            sink,
            notifier,
            voice_senders: voice_senders.into_iter().map(|s| s.to_lowercase()).collect(),
            running: AtomicBool::new(false),
            credential_alerted: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    /// Run one cycle, or skip if one is already in flight.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Mail sync cycle already running; skipping trigger");
            return Ok(CycleOutcome::Skipped);
        }
        let _guard = RunningGuard(&self.running);

        let result = self.cycle().await;
        match &result {
            Ok(_) => {
                if self.credential_alerted.swap(false, Ordering::AcqRel) {
                    info!("Mail sync credential recovered");
                    self.notifier
                        .notify(Notice::CommandResult {
                            text: "Mail sync is working again.".into(),
                        })
                        .await;
                }
            }
            Err(e) if e.is_credential() => {
                error!(error = %e, "Mail sync credential failure");
                // Alert once per failure streak.
                if !self.credential_alerted.swap(true, Ordering::AcqRel) {
                    self.notifier
                        .notify(Notice::Credential {
                            message: format!("Mail sync needs attention: {e}"),
                        })
                        .await;
                }
            }
            Err(e) => warn!(error = %e, "Mail sync cycle failed; will retry next trigger"),
        }
        result
    }

    async fn cycle(&self) -> Result<CycleOutcome, SyncError> {
        let cursor = match self.cursor.state().await {
            CursorState::Primed(c) => c,
            CursorState::Unprimed => {
                self.prime_or_fail().await?;
                return Ok(CycleOutcome::Primed);
            }
        };

        let ids = match self.cursor.fetch_delta(&cursor).await {
            Ok((ids, _)) => ids,
            Err(SyncError::CursorExpired) => {
                self.prime_or_fail().await?;
                return Ok(CycleOutcome::Primed);
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let mut already_seen = 0;
        for id in &ids {
            if self.store.get(kinds::PROCESSED_ITEM, id).await?.is_some() {
                already_seen += 1;
                continue;
            }
            if self.store.get(kinds::PENDING_ITEM, id).await?.is_none() {
                put_record(
                    self.store.as_ref(),
                    kinds::PENDING_ITEM,
                    id,
                    &PendingRecord {
                        parked_at: now,
                        attempts: 0,
                        last_error: None,
                    },
                )
                .await?;
            }
        }

        let (submitted, deferred) = self.drain_pending().await?;

        if self.cycles.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == 0 {
            self.prune_processed(now).await?;
        }

        if submitted > 0 || already_seen > 0 || deferred > 0 {
            info!(submitted, already_seen, deferred, "Mail sync cycle complete");
        }
        Ok(CycleOutcome::Processed {
            submitted,
            already_seen,
            deferred,
        })
    }

    /// Fetch every parked item, oldest first. Returns (submitted, still parked).
    async fn drain_pending(&self) -> Result<(usize, usize), SyncError> {
        let mut submitted = 0;
        let mut deferred = 0;
        for (id, body) in self.store.list(kinds::PENDING_ITEM).await? {
            if self.store.get(kinds::PROCESSED_ITEM, &id).await?.is_some() {
                self.store.delete(kinds::PENDING_ITEM, &id).await?;
                continue;
            }

            let item = match self.cursor.api().fetch_item(&id).await {
                Ok(item) => item,
                Err(e) if e.is_credential() => return Err(e),
                Err(e) => {
                    let mut record: PendingRecord =
                        serde_json::from_value(body).unwrap_or_else(|_| PendingRecord {
                            parked_at: Utc::now(),
                            attempts: 0,
                            last_error: None,
                        });
                    record.attempts += 1;
                    if record.attempts >= MAX_FETCH_ATTEMPTS {
                        error!(id = %id, attempts = record.attempts, error = %e, "Giving up on mail item");
                        self.store.delete(kinds::PENDING_ITEM, &id).await?;
                        self.notifier
                            .notify(Notice::Error {
                                message: format!(
                                    "Could not fetch mail item {id} after {} attempts: {e}",
                                    record.attempts
                                ),
                            })
                            .await;
                    } else {
                        warn!(id = %id, attempts = record.attempts, error = %e, "Failed to fetch mail item; will retry");
                        record.last_error = Some(e.to_string());
                        put_record(self.store.as_ref(), kinds::PENDING_ITEM, &id, &record).await?;
                        deferred += 1;
                    }
                    continue;
                }
            };

            if let Some(msg) = self.to_message(&item) {
                self.sink.deliver(msg);
                submitted += 1;
            }
            put_record(
                self.store.as_ref(),
                kinds::PROCESSED_ITEM,
                &id,
                &ProcessedRecord {
                    processed_at: Utc::now(),
                },
            )
            .await?;
            self.store.delete(kinds::PENDING_ITEM, &id).await?;
        }
        Ok((submitted, deferred))
    }

    /// Drop processed-item markers older than [`PROCESSED_RETENTION_DAYS`].
    pub async fn prune_processed(&self, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let cutoff = now - chrono::Duration::days(PROCESSED_RETENTION_DAYS);
        let mut pruned = 0;
        for (id, body) in self.store.list(kinds::PROCESSED_ITEM).await? {
            let stale = serde_json::from_value::<ProcessedRecord>(body)
                .map(|r| r.processed_at < cutoff)
                .unwrap_or(true);
            if stale && self.store.delete(kinds::PROCESSED_ITEM, &id).await? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "Pruned old processed-item markers");
        }
        Ok(pruned)
    }

    async fn prime_or_fail(&self) -> Result<(), SyncError> {
        match self.cursor.prime().await {
            PrimeOutcome::PrimedOk | PrimeOutcome::AlreadyPrimed => Ok(()),
            PrimeOutcome::NoCredential { reason } => Err(SyncError::Unauthorized(reason)),
            PrimeOutcome::RemoteError { status, body } => Err(SyncError::Remote { status, body }),
            PrimeOutcome::TransportError(reason) => Err(SyncError::Transport(reason)),
        }
    }

    /// Map a mailbox item onto a router message. Items with no sender are skipped.
    pub fn to_message(&self, item: &MailItem) -> Option<Message> {
        let from = item.from_address.trim().to_lowercase();
        if from.is_empty() {
            warn!(id = %item.id, "Mail item has no sender; skipping");
            return None;
        }

        if self.voice_senders.contains(&from)
            && let Some(number) = extract_callback_number(&item.body)
        {
            let msg = Message::new(Channel::ForwardedVoice, &number, item.body.clone())
                .at_millis(item.received_at.timestamp_millis())
                .with_thread(item.id.clone());
            return Some(msg);
        }

        let mut msg = Message::new(Channel::Mail, &from, item.body.clone())
            .at_millis(item.received_at.timestamp_millis())
            .with_thread(item.id.clone());
        if let Some(subject) = &item.subject {
            msg = msg.with_subject(subject.clone());
        }
        if let Some(name) = item.from_name.as_ref().filter(|n| !n.trim().is_empty()) {
            msg = msg.with_sender_name(name.clone());
        }
        Some(msg)
    }
}

/// First phone-number-looking run in a voicemail transcription.
pub fn extract_callback_number(body: &str) -> Option<String> {
    CALLBACK_NUMBER
        .as_ref()?
        .find(body)
        .and_then(|m| crate::contacts::normalize::normalize_phone(m.as_str()))
}

/// Drive [`MailPoller::run_cycle`] on a fixed interval.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop.
pub fn spawn_sync_ticker(
    poller: Arc<MailPoller>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Mail sync started, polling every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Mail sync shutting down");
                return;
            }
            // Errors are logged and surfaced inside run_cycle.
            let _ = poller.run_cycle().await;
        }
    });

    (handle, shutdown_flag)
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::scripted::{ScriptedMailApi, item};
    use super::*;
    use crate::channels::operator::recording::RecordingNotifier;
    use crate::store::LibSqlBackend;

    #[derive(Default)]
    struct CollectingSink {
        messages: StdMutex<Vec<Message>>,
    }

    impl MessageSink for CollectingSink {
        fn deliver(&self, msg: Message) {
            self.messages.lock().unwrap().push(msg);
        }
    }

    fn page(ids: &[&str], cursor: Option<&str>) -> DeltaPage {
        DeltaPage {
            item_ids: ids.iter().map(|s| s.to_string()).collect(),
            cursor: cursor.map(String::from),
        }
    }

    async fn store() -> Arc<dyn RecordStore> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    struct Rig {
        poller: MailPoller,
        cursor: Arc<SyncCursorManager>,
        api: Arc<ScriptedMailApi>,
        sink: Arc<CollectingSink>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<dyn RecordStore>,
    }

    async fn rig(api: ScriptedMailApi) -> Rig {
        let store = store().await;
        let api = Arc::new(api);
        let cursor = Arc::new(
            SyncCursorManager::load(api.clone(), Arc::clone(&store))
                .await
                .unwrap(),
        );
        let sink = Arc::new(CollectingSink::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let poller = MailPoller::new(
            Arc::clone(&cursor),
            Arc::clone(&store),
            sink.clone(),
            notifier.clone(),
            vec!["voicemail@carrier.example".into()],
        );
        Rig {
            poller,
            cursor,
            api,
            sink,
            notifier,
            store,
        }
    }

    #[tokio::test]
    async fn prime_outcomes_are_distinct() {
        let api = ScriptedMailApi::default()
            .with_baseline(Err(SyncError::NoCredential))
            .with_baseline(Err(SyncError::Remote {
                status: 503,
                body: "busy".into(),
            }))
            .with_baseline(Err(SyncError::Transport("dns".into())))
            .with_baseline(Ok("c1".into()));
        let r = rig(api).await;

        assert!(matches!(r.cursor.prime().await, PrimeOutcome::NoCredential { .. }));
        assert!(matches!(
            r.cursor.prime().await,
            PrimeOutcome::RemoteError { status: 503, .. }
        ));
        assert!(matches!(r.cursor.prime().await, PrimeOutcome::TransportError(_)));
        assert_eq!(r.cursor.prime().await, PrimeOutcome::PrimedOk);
        assert_eq!(r.cursor.prime().await, PrimeOutcome::AlreadyPrimed);
        assert_eq!(r.cursor.state().await, CursorState::Primed("c1".into()));
    }

    #[tokio::test]
    async fn cursor_survives_reload() {
        let r = rig(ScriptedMailApi::default().with_baseline(Ok("c1".into()))).await;
        r.cursor.prime().await;

        let reloaded = SyncCursorManager::load(r.api.clone(), Arc::clone(&r.store))
            .await
            .unwrap();
        assert_eq!(reloaded.state().await, CursorState::Primed("c1".into()));
    }

    #[tokio::test]
    async fn empty_delta_still_advances_cursor() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_delta(Ok(page(&[], Some("c2"))));
        let r = rig(api).await;
        r.cursor.prime().await;

        let (ids, advanced) = r.cursor.fetch_delta("c1").await.unwrap();
        assert!(ids.is_empty());
        assert_eq!(advanced.as_deref(), Some("c2"));
        assert_eq!(r.cursor.state().await, CursorState::Primed("c2".into()));
    }

    #[tokio::test]
    async fn stale_fetch_does_not_rewind() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_delta(Ok(page(&[], Some("c2"))))
            .with_delta(Ok(page(&[], Some("c1-late"))));
        let r = rig(api).await;
        r.cursor.prime().await;

        r.cursor.fetch_delta("c1").await.unwrap();
        // A second fetch started from the old cursor must not overwrite c2.
        r.cursor.fetch_delta("c1").await.unwrap();
        assert_eq!(r.cursor.state().await, CursorState::Primed("c2".into()));
    }

    #[tokio::test]
    async fn expiry_clears_stored_cursor() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_delta(Err(SyncError::CursorExpired));
        let r = rig(api).await;
        r.cursor.prime().await;

        let err = r.cursor.fetch_delta("c1").await.unwrap_err();
        assert!(matches!(err, SyncError::CursorExpired));
        assert_eq!(r.cursor.state().await, CursorState::Unprimed);
        assert!(
            r.store
                .get(kinds::SYNC_CURSOR, CURSOR_ID)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn cycle_reprimes_after_expiry() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_baseline(Ok("c9".into()))
            .with_delta(Err(SyncError::CursorExpired));
        let r = rig(api).await;

        assert_eq!(r.poller.run_cycle().await.unwrap(), CycleOutcome::Primed);
        assert_eq!(r.poller.run_cycle().await.unwrap(), CycleOutcome::Primed);
        assert_eq!(r.cursor.state().await, CursorState::Primed("c9".into()));
    }

    #[tokio::test]
    async fn cycle_submits_new_items_once() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_delta(Ok(page(&["m1", "m2"], Some("c2"))))
            .with_delta(Ok(page(&["m2"], Some("c3"))))
            .with_item(item("m1", "ann@example.com", "hello"))
            .with_item(item("m2", "bob@example.com", "hey"));
        let r = rig(api).await;

        r.poller.run_cycle().await.unwrap();
        assert_eq!(
            r.poller.run_cycle().await.unwrap(),
            CycleOutcome::Processed {
                submitted: 2,
                already_seen: 0,
                deferred: 0,
            }
        );
        assert_eq!(
            r.poller.run_cycle().await.unwrap(),
            CycleOutcome::Processed {
                submitted: 0,
                already_seen: 1,
                deferred: 0,
            }
        );
        let messages = r.sink.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].channel, Channel::Mail);
        assert_eq!(messages[0].thread.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_after_cursor_moves_on() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_delta(Ok(page(&["m1"], Some("c2"))))
            .with_delta(Ok(page(&[], Some("c3"))));
        let r = rig(api).await;
        r.poller.run_cycle().await.unwrap();

        // m1 is not fetchable yet: the cursor moves past it anyway.
        assert_eq!(
            r.poller.run_cycle().await.unwrap(),
            CycleOutcome::Processed {
                submitted: 0,
                already_seen: 0,
                deferred: 1,
            }
        );
        assert_eq!(r.cursor.state().await, CursorState::Primed("c2".into()));

        r.api
            .items
            .lock()
            .unwrap()
            .insert("m1".into(), item("m1", "ann@example.com", "hello"));
        assert_eq!(
            r.poller.run_cycle().await.unwrap(),
            CycleOutcome::Processed {
                submitted: 1,
                already_seen: 0,
                deferred: 0,
            }
        );
        assert_eq!(r.sink.messages.lock().unwrap().len(), 1);
        assert!(r.store.list(kinds::PENDING_ITEM).await.unwrap().is_empty());
        assert!(r.store.get(kinds::PROCESSED_ITEM, "m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unfetchable_item_is_reported_after_max_attempts() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_delta(Ok(page(&["gone"], Some("c2"))));
        let r = rig(api).await;
        r.poller.run_cycle().await.unwrap();

        for _ in 0..MAX_FETCH_ATTEMPTS {
            r.poller.run_cycle().await.unwrap();
        }
        assert!(r.store.list(kinds::PENDING_ITEM).await.unwrap().is_empty());
        let errors: Vec<_> = r
            .notifier
            .notices()
            .into_iter()
            .filter(|n| matches!(n, Notice::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn items_after_a_credential_failure_stay_parked() {
        struct RevokedAfterBaseline(ScriptedMailApi);

        #[async_trait]
        impl MailApi for RevokedAfterBaseline {
            async fn baseline(&self) -> Result<String, SyncError> {
                self.0.baseline().await
            }
            async fn delta(&self, cursor: &str) -> Result<DeltaPage, SyncError> {
                self.0.delta(cursor).await
            }
            async fn fetch_item(&self, _id: &str) -> Result<MailItem, SyncError> {
                Err(SyncError::Unauthorized("token revoked".into()))
            }
            async fn trash_from(&self, sender: &str) -> Result<usize, SyncError> {
                self.0.trash_from(sender).await
            }
        }

        let store = store().await;
        let api = Arc::new(RevokedAfterBaseline(
            ScriptedMailApi::default()
                .with_baseline(Ok("c1".into()))
                .with_delta(Ok(page(&["m1", "m2"], Some("c2")))),
        ));
        let cursor = Arc::new(SyncCursorManager::load(api, Arc::clone(&store)).await.unwrap());
        let poller = MailPoller::new(
            cursor,
            Arc::clone(&store),
            Arc::new(CollectingSink::default()),
            Arc::new(RecordingNotifier::default()),
            Vec::new(),
        );
        poller.run_cycle().await.unwrap();

        assert!(poller.run_cycle().await.unwrap_err().is_credential());
        let parked: Vec<String> = store
            .list(kinds::PENDING_ITEM)
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(parked, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn old_processed_markers_are_pruned() {
        let r = rig(ScriptedMailApi::default()).await;
        let now = Utc::now();
        for (id, days) in [("old", PROCESSED_RETENTION_DAYS + 1), ("fresh", 1)] {
            put_record(
                r.store.as_ref(),
                kinds::PROCESSED_ITEM,
                id,
                &ProcessedRecord {
                    processed_at: now - chrono::Duration::days(days),
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(r.poller.prune_processed(now).await.unwrap(), 1);
        assert!(r.store.get(kinds::PROCESSED_ITEM, "old").await.unwrap().is_none());
        assert!(r.store.get(kinds::PROCESSED_ITEM, "fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_prime_keeps_first_cursor() {
        let api = ScriptedMailApi::default()
            .with_baseline(Ok("c1".into()))
            .with_baseline(Ok("c2".into()));
        let r = rig(api).await;

        let (a, b) = tokio::join!(r.cursor.prime(), r.cursor.prime());
        let outcomes = [a, b];
        assert!(outcomes.contains(&PrimeOutcome::PrimedOk));
        assert!(outcomes.contains(&PrimeOutcome::AlreadyPrimed));
        assert!(matches!(r.cursor.state().await, CursorState::Primed(_)));
    }

    #[tokio::test]
    async fn credential_failure_notifies_once_per_streak() {
        let api = ScriptedMailApi::default()
            .with_baseline(Err(SyncError::NoCredential))
            .with_baseline(Err(SyncError::Unauthorized("expired token".into())))
            .with_baseline(Ok("c1".into()));
        let r = rig(api).await;

        assert!(r.poller.run_cycle().await.unwrap_err().is_credential());
        assert!(r.poller.run_cycle().await.unwrap_err().is_credential());
        r.poller.run_cycle().await.unwrap();

        let notices = r.notifier.notices();
        let credential = notices
            .iter()
            .filter(|n| matches!(n, Notice::Credential { .. }))
            .count();
        assert_eq!(credential, 1);
        assert!(matches!(notices.last(), Some(Notice::CommandResult { .. })));
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped() {
        let mut api = ScriptedMailApi::default().with_baseline(Ok("c1".into()));
        api.delta_delay = Some(Duration::from_millis(200));
        let r = rig(api).await;
        r.poller.run_cycle().await.unwrap();

        let (a, b) = tokio::join!(r.poller.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            r.poller.run_cycle().await
        });
        assert!(matches!(a.unwrap(), CycleOutcome::Processed { .. }));
        assert_eq!(b.unwrap(), CycleOutcome::Skipped);
        assert_eq!(r.api.delta_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn voicemail_forward_becomes_forwarded_voice() {
        let r = rig(ScriptedMailApi::default()).await;
        let msg = r
            .poller
            .to_message(&item(
                "v1",
                "VoiceMail@Carrier.example",
                "New voicemail from (555) 867-5309: call me back",
            ))
            .unwrap();
        assert_eq!(msg.channel, Channel::ForwardedVoice);
        assert_eq!(msg.sender, "+15558675309");

        // Without a number it stays mail.
        let msg = r
            .poller
            .to_message(&item("v2", "voicemail@carrier.example", "no number here"))
            .unwrap();
        assert_eq!(msg.channel, Channel::Mail);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::GONE, String::new()),
            SyncError::CursorExpired
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            SyncError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{\"code\":\"syncStateNotFound\"}".into()),
            SyncError::CursorExpired
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            SyncError::Remote { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn graph_client_without_token_is_no_credential() {
        let api = GraphMailApi::new(&MailConfig {
            api_url: "http://127.0.0.1:9".into(),
            token: None,
            mailbox_folder: "inbox".into(),
            poll_interval: Duration::from_secs(60),
            smtp: None,
        })
        .unwrap();
        assert!(matches!(api.baseline().await, Err(SyncError::NoCredential)));
    }
}
