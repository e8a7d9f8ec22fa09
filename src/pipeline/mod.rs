//! Inbound message pipeline.
//!
//! Every source hands messages to [`MessageRouter`], which runs:
//! 1. `Deduplicator`: redelivery and echo suppression
//! 2. Operator classification (console, configured ids, admin sessions)
//! 3. Operator commands, or `ChannelGate` -> contact policy -> `RuleEvaluator`
//! 4. Reply generation and dispatch, then an operator notice

pub mod channel_gate;
pub mod dedup;
pub mod router;
pub mod rules;
pub mod types;

pub use router::{MessageRouter, MessageSink, RouterServices};
pub use types::{Channel, DropReason, Message, RouteOutcome};
