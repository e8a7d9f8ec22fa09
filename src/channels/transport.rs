//! Reply transports and per-channel dispatch.
//!
//! Sending is best effort and reports back. `ChannelError::Unreachable`
//! means the delivery surface is gone; the router hands such replies to
//! the operator instead of dropping them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::pipeline::types::{Channel, Message};

/// One outgoing reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Normalized phone number or address.
    pub target: String,
    pub body: String,
    pub thread: Option<String>,
    pub subject: Option<String>,
}

impl Outbound {
    pub fn new(target: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            body: body.into(),
            thread: None,
            subject: None,
        }
    }

    /// Reply to `msg` on its own thread.
    pub fn reply_to(msg: &Message, body: impl Into<String>) -> Self {
        Self {
            target: msg.sender.clone(),
            body: body.into(),
            thread: msg.thread.clone(),
            subject: msg.subject.clone(),
        }
    }
}

/// A channel-specific sender.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, outbound: &Outbound) -> Result<(), ChannelError>;
}

/// Routes replies to the transport registered for a channel.
#[derive(Default, Clone)]
pub struct Dispatcher {
    transports: HashMap<Channel, Arc<dyn ReplyTransport>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Channel, transport: Arc<dyn ReplyTransport>) -> Self {
        self.transports.insert(channel, transport);
        self
    }

    pub async fn dispatch(&self, channel: Channel, outbound: &Outbound) -> Result<(), ChannelError> {
        let Some(transport) = self.transports.get(&channel) else {
            return Err(ChannelError::Unreachable {
                name: channel.to_string(),
                target: outbound.target.clone(),
            });
        };
        transport.send(outbound).await?;
        tracing::info!(
            channel = %channel,
            transport = transport.name(),
            to = %outbound.target,
            "Reply dispatched"
        );
        Ok(())
    }
}
