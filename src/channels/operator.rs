//! Operator feed: WebSocket notices out, operator commands in.
//!
//! Notices are broadcast to every connected console. While no console is
//! connected they are held in a bounded backlog and replayed to the next
//! console that connects. Text a console sends as
//! `{"type": "command", "text": "..."}` is queued as an operator message for
//! whoever took the command receiver.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::router::MessageSink;
use crate::pipeline::types::{Channel, Message};

/// Identity recorded on commands typed into the console.
pub const CONSOLE_IDENTITY: &str = "operator";

/// Notices kept for a console that is not connected yet. Oldest go first.
pub const BACKLOG_CAPACITY: usize = 200;

/// Something the operator should see.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// Inbound message summary, no reply sent.
    Summary {
        channel: Channel,
        from: String,
        text: String,
    },
    ReplySent {
        channel: Channel,
        to: String,
        body: String,
    },
    /// The operator has to act: manual review, or a reply that could not be delivered.
    NeedsReview {
        channel: Channel,
        from: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        draft: Option<String>,
        reason: String,
    },
    Error {
        message: String,
    },
    /// Mail credential missing or rejected.
    Credential {
        message: String,
    },
    ConfirmRequired {
        token: String,
        action: String,
    },
    CommandResult {
        text: String,
    },
}

/// Best-effort delivery to the operator.
#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, notice: Notice);
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ConsoleMessage {
    Command { text: String },
}

struct FeedInner {
    notices: broadcast::Sender<Notice>,
    commands: mpsc::UnboundedSender<Message>,
    /// Held across send-or-park and subscribe-and-drain so a notice is
    /// either broadcast to a live console or replayed to the next one.
    backlog: Mutex<VecDeque<Notice>>,
}

impl FeedInner {
    async fn publish(&self, notice: Notice) {
        let mut backlog = self.backlog.lock().await;
        if let Err(broadcast::error::SendError(notice)) = self.notices.send(notice) {
            if backlog.len() == BACKLOG_CAPACITY
                && let Some(dropped) = backlog.pop_front()
            {
                warn!(?dropped, "Operator backlog full; dropping oldest notice");
            }
            backlog.push_back(notice);
        }
    }

    /// Subscribe to live notices and take everything parked so far.
    async fn attach(&self) -> (broadcast::Receiver<Notice>, Vec<Notice>) {
        let mut backlog = self.backlog.lock().await;
        let rx = self.notices.subscribe();
        (rx, backlog.drain(..).collect())
    }
}

#[derive(Clone)]
struct FeedState {
    inner: Arc<FeedInner>,
}

/// Broadcast notifier plus the `/ws/operator` endpoint.
pub struct OperatorFeed {
    inner: Arc<FeedInner>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl OperatorFeed {
    pub fn new() -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(FeedInner {
                notices,
                commands,
                backlog: Mutex::new(VecDeque::new()),
            }),
            commands_rx: Mutex::new(Some(commands_rx)),
        }
    }

    /// Axum router with the `/ws/operator` endpoint.
    pub fn router(&self) -> Router {
        let state = FeedState {
            inner: Arc::clone(&self.inner),
        };
        Router::new()
            .route("/ws/operator", get(ws_operator_handler))
            .with_state(state)
    }

    /// Take the console command stream. Only the first caller gets it.
    pub async fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.commands_rx.lock().await.take()
    }

    /// Subscribe to notices without a socket.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Number of notices waiting for a console.
    pub async fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().await.len()
    }
}

impl Default for OperatorFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorNotifier for OperatorFeed {
    async fn notify(&self, notice: Notice) {
        debug!(?notice, "Operator notice");
        self.inner.publish(notice).await;
    }
}

/// Feed console commands into `sink` until every console sender is gone.
pub fn spawn_command_loop(
    mut commands: mpsc::UnboundedReceiver<Message>,
    sink: Arc<dyn MessageSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = commands.recv().await {
            debug!(id = %msg.id, "Operator command received");
            sink.deliver(msg);
        }
        info!("Operator command loop stopped");
    })
}

async fn ws_operator_handler(
    ws: WebSocketUpgrade,
    State(state): State<FeedState>,
) -> impl IntoResponse {
    info!("Operator console connecting");
    ws.on_upgrade(|socket| handle_operator_socket(socket, state.inner))
}

async fn handle_operator_socket(mut socket: WebSocket, inner: Arc<FeedInner>) {
    info!("Operator console connected");
    let (mut notices, backlog) = inner.attach().await;
    if !backlog.is_empty() {
        info!(count = backlog.len(), "Replaying notices to operator console");
    }
    let mut replay = backlog.into_iter();
    while let Some(notice) = replay.next() {
        let Ok(json) = serde_json::to_string(&notice) else {
            continue;
        };
        if socket.send(WsMessage::Text(json.into())).await.is_err() {
            warn!("Operator console disconnected during replay");
            drop(notices);
            // Undelivered notices go back for the next console.
            for notice in std::iter::once(notice).chain(replay) {
                inner.publish(notice).await;
            }
            return;
        }
    }

    loop {
        tokio::select! {
            result = notices.recv() => {
                match result {
                    Ok(notice) => {
                        if let Ok(json) = serde_json::to_string(&notice)
                            && socket.send(WsMessage::Text(json.into())).await.is_err()
                        {
                            debug!("Operator console disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Operator console lagged behind notices");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ConsoleMessage>(&text) {
                            Ok(ConsoleMessage::Command { text }) => {
                                let text = text.trim();
                                if text.is_empty() {
                                    continue;
                                }
                                let msg = Message::new(Channel::Operator, CONSOLE_IDENTITY, text);
                                if inner.commands.send(msg).is_err() {
                                    warn!("Operator command queue closed");
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "Invalid JSON from operator console");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Operator WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Operator console disconnected");
}
