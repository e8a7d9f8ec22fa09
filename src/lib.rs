//! Relay Assist: multi-channel message automation core.

pub mod agent;
pub mod channels;
pub mod config;
pub mod contacts;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
