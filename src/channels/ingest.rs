//! HTTP ingestion surface.
//!
//! Two listeners push raw direct-text events: the transport itself
//! (`/ingest/direct`) and the OS notification callback
//! (`/ingest/notification`). They frequently report the same SMS; the
//! router's deduplicator settles that. `/ingest/mail-notify` lets a push
//! notification start a mail sync cycle early, and `/directory/sync` takes
//! a bulk address-book export.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::channels::mail_sync::MailPoller;
use crate::channels::operator::OperatorFeed;
use crate::contacts::{ContactDirectory, DirectoryEntry};
use crate::pipeline::router::MessageSink;
use crate::pipeline::types::{Channel, Message};

/// Body accepted by both direct-text listeners.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub sender: String,
    pub body: String,
    /// Event time as seen by the source, epoch milliseconds.
    pub timestamp_ms: Option<i64>,
    pub display_name: Option<String>,
    pub thread: Option<String>,
}

impl IngestRequest {
    fn into_message(self, channel: Channel) -> Message {
        let mut msg = Message::new(channel, &self.sender, self.body);
        if let Some(ts) = self.timestamp_ms {
            msg = msg.at_millis(ts);
        }
        if let Some(name) = self.display_name.filter(|n| !n.trim().is_empty()) {
            msg = msg.with_sender_name(name);
        }
        if let Some(thread) = self.thread.filter(|t| !t.trim().is_empty()) {
            msg = msg.with_thread(thread);
        }
        msg
    }
}

#[derive(Clone)]
struct IngestState {
    sink: Arc<dyn MessageSink>,
    poller: Option<Arc<MailPoller>>,
    directory: Arc<ContactDirectory>,
}

/// Ingest and directory routes.
pub fn ingest_routes(
    sink: Arc<dyn MessageSink>,
    poller: Option<Arc<MailPoller>>,
    directory: Arc<ContactDirectory>,
) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest/direct", post(ingest_direct))
        .route("/ingest/notification", post(ingest_notification))
        .route("/ingest/mail-notify", post(mail_notify))
        .route("/directory/sync", post(directory_sync))
        .with_state(IngestState {
            sink,
            poller,
            directory,
        })
}

/// Full HTTP app: ingestion plus the operator feed.
pub fn build_app(
    sink: Arc<dyn MessageSink>,
    poller: Option<Arc<MailPoller>>,
    directory: Arc<ContactDirectory>,
    feed: &OperatorFeed,
) -> Router {
    ingest_routes(sink, poller, directory)
        .merge(feed.router())
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ingest_direct(
    State(state): State<IngestState>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    accept(&state, req, "direct")
}

async fn ingest_notification(
    State(state): State<IngestState>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    accept(&state, req, "notification")
}

fn accept(state: &IngestState, req: IngestRequest, source: &str) -> (StatusCode, Json<serde_json::Value>) {
    if req.sender.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "sender is required"})),
        );
    }
    let msg = req.into_message(Channel::Direct);
    let id = msg.id.clone();
    debug!(id = %id, source, sender = %msg.sender, "Ingested direct event");
    state.sink.deliver(msg);
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id })))
}

async fn mail_notify(State(state): State<IngestState>) -> impl IntoResponse {
    let Some(poller) = state.poller else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "mail sync is not configured"})),
        );
    };
    info!("Mail push notification; starting sync cycle");
    tokio::spawn(async move {
        // Outcome is logged and surfaced inside the cycle.
        let _ = poller.run_cycle().await;
    });
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "triggered"})),
    )
}

async fn directory_sync(
    State(state): State<IngestState>,
    Json(entries): Json<Vec<DirectoryEntry>>,
) -> impl IntoResponse {
    match state.directory.sync_directory(entries).await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => {
            error!(error = %e, "Directory sync failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}
