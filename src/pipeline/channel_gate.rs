//! Channel gate: per-channel enable/disable with natural-language toggling.
//!
//! State is persisted as `channel_state` records; channels with no record
//! are enabled. The operator channel is never gated.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::DatabaseError;
use crate::pipeline::types::Channel;
use crate::store::{RecordStore, kinds, list_records, put_record};

/// Target of a toggle utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleTarget {
    One(Channel),
    All,
}

/// Parsed toggle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toggle {
    pub target: ToggleTarget,
    pub enable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChannelStateRecord {
    channel: Channel,
    enabled: bool,
}

const ENABLE_WORDS: &[&str] = &["enable", "resume", "start", "unpause", "unmute", "on"];
const DISABLE_WORDS: &[&str] = &["disable", "pause", "stop", "mute", "off", "silence"];
const ALL_WORDS: &[&str] = &["all", "everything", "replies", "autoreply", "auto-reply"];

/// Channel words, checked longest phrase first.
const CHANNEL_WORDS: &[(&str, Channel)] = &[
    ("voicemail", Channel::ForwardedVoice),
    ("voice", Channel::ForwardedVoice),
    ("calls", Channel::ForwardedVoice),
    ("sms", Channel::Direct),
    ("texts", Channel::Direct),
    ("text", Channel::Direct),
    ("messages", Channel::Direct),
    ("email", Channel::Mail),
    ("emails", Channel::Mail),
    ("mail", Channel::Mail),
];

/// Parse "turn off email", "pause texts", "resume everything" and similar.
///
/// Returns `None` when the utterance has no trigger word or no channel word;
/// such utterances are not the gate's business.
pub fn parse_toggle_utterance(text: &str) -> Option<Toggle> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();

    // Disable wins when both appear ("stop, don't turn on email").
    let enable = if words.iter().any(|w| DISABLE_WORDS.contains(w)) {
        false
    } else if words.iter().any(|w| ENABLE_WORDS.contains(w)) {
        true
    } else {
        return None;
    };

    let channel = CHANNEL_WORDS
        .iter()
        .find(|(word, _)| words.contains(word))
        .map(|(_, ch)| *ch);

    let target = match channel {
        Some(ch) => ToggleTarget::One(ch),
        None if words.iter().any(|w| ALL_WORDS.contains(w)) => ToggleTarget::All,
        None => return None,
    };

    Some(Toggle { target, enable })
}

/// Persisted per-channel switch.
pub struct ChannelGate {
    store: Arc<dyn RecordStore>,
    state: RwLock<HashMap<Channel, bool>>,
}

impl ChannelGate {
    /// Load persisted state.
    pub async fn load(store: Arc<dyn RecordStore>) -> Result<Self, DatabaseError> {
        let records: Vec<ChannelStateRecord> =
            list_records(store.as_ref(), kinds::CHANNEL_STATE).await?;
        let state = records
            .into_iter()
            .map(|r| (r.channel, r.enabled))
            .collect();
        Ok(Self {
            store,
            state: RwLock::new(state),
        })
    }

    pub async fn is_enabled(&self, channel: Channel) -> bool {
        if channel == Channel::Operator {
            return true;
        }
        self.state.read().await.get(&channel).copied().unwrap_or(true)
    }

    pub async fn set_enabled(&self, channel: Channel, enabled: bool) -> Result<(), DatabaseError> {
        if channel == Channel::Operator {
            return Ok(());
        }
        put_record(
            self.store.as_ref(),
            kinds::CHANNEL_STATE,
            channel.as_str(),
            &ChannelStateRecord { channel, enabled },
        )
        .await?;
        self.state.write().await.insert(channel, enabled);
        info!(channel = %channel, enabled, "Channel state changed");
        Ok(())
    }

    /// Apply a parsed toggle. Returns the channels that changed.
    pub async fn apply(&self, toggle: Toggle) -> Result<Vec<Channel>, DatabaseError> {
        let targets: Vec<Channel> = match toggle.target {
            ToggleTarget::One(ch) => vec![ch],
            ToggleTarget::All => Channel::GATED.to_vec(),
        };
        for ch in &targets {
            self.set_enabled(*ch, toggle.enable).await?;
        }
        Ok(targets)
    }

    /// Snapshot for status reports.
    pub async fn snapshot(&self) -> Vec<(Channel, bool)> {
        let mut out = Vec::new();
        for ch in Channel::GATED {
            out.push((ch, self.is_enabled(ch).await));
        }
        out
    }
}
