//! Shared types for the message pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::contacts::normalize::normalize_identifier;
use crate::pipeline::dedup::fingerprint;

// ── Channel ─────────────────────────────────────────────────────────

/// Logical transport class a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Direct text (SMS and similar).
    Direct,
    /// Voicemail forwarded through the mailbox.
    ForwardedVoice,
    Mail,
    /// The operator's own console.
    Operator,
}

impl Channel {
    /// Channels the gate can toggle.
    pub const GATED: [Channel; 3] = [Channel::Direct, Channel::ForwardedVoice, Channel::Mail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::ForwardedVoice => "forwarded_voice",
            Self::Mail => "mail",
            Self::Operator => "operator",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" | "sms" | "text" => Ok(Self::Direct),
            "forwarded_voice" | "voice" | "voicemail" => Ok(Self::ForwardedVoice),
            "mail" | "email" => Ok(Self::Mail),
            "operator" => Ok(Self::Operator),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// Unified inbound message from any ingestion source.
///
/// `id` is the content fingerprint of (normalized sender, truncated body),
/// so the same event seen by two ingestion paths gets the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Normalized phone number or address.
    pub sender: String,
    pub sender_name: Option<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
    /// Channel-native thread or item reference used for replies.
    pub thread: Option<String>,
    pub subject: Option<String>,
}

impl Message {
    pub fn new(channel: Channel, sender: &str, body: impl Into<String>) -> Self {
        let sender = normalize_identifier(sender);
        let body = body.into();
        Self {
            id: fingerprint(&sender, &body),
            sender,
            sender_name: None,
            body,
            timestamp: Utc::now(),
            channel,
            thread: None,
            subject: None,
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    /// Set the event timestamp from epoch milliseconds. The id is unaffected.
    pub fn at_millis(mut self, epoch_ms: i64) -> Self {
        if let Some(ts) = Utc.timestamp_millis_opt(epoch_ms).single() {
            self.timestamp = ts;
        }
        self
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Display name if known, else the raw identifier.
    pub fn display_sender(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender)
    }
}

// ── Routing outcome ─────────────────────────────────────────────────

/// Why a message was dropped without any terminal action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Duplicate,
    /// Our own reply text resurfacing as inbound.
    Echo,
    ChannelDisabled,
    /// Contact policy is NEVER.
    PolicyNever,
    EmptyBody,
}

/// Terminal state of one router invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    Dropped { reason: DropReason },
    /// A rule or policy chose silence; nothing sent, nothing notified.
    Silent,
    /// Operator notified, no reply sent.
    Notified,
    /// Reply dispatched on the originating channel.
    Replied { body: String },
    /// Transport could not reach the recipient; operator got the draft.
    ReplyUndeliverable { body: String },
    /// Operator command handled; `response` went back to the operator.
    OperatorHandled { response: String },
}

impl RouteOutcome {
    pub fn dropped(reason: DropReason) -> Self {
        Self::Dropped { reason }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Dropped { .. } => "dropped",
            Self::Silent => "silent",
            Self::Notified => "notified",
            Self::Replied { .. } => "replied",
            Self::ReplyUndeliverable { .. } => "reply_undeliverable",
            Self::OperatorHandled { .. } => "operator_handled",
        }
    }
}
