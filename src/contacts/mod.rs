//! Contacts: identity resolution, directory sync and reply policy.

pub mod directory;
pub mod model;
pub mod normalize;

pub use directory::{ContactDirectory, SyncReport};
pub use model::{Contact, ContactSource, DirectoryEntry, Lookup, ReplyPolicy};
