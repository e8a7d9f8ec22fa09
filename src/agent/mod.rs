//! Operator authority: remote admin sessions and destructive-action confirmation.

pub mod admin;
pub mod approval;

pub use admin::{AdminSession, AdminSessions};
pub use approval::{Confirmation, DestructiveAction, DestructiveGate};
