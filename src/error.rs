//! Error types for Relay Assist.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    /// The delivery surface for this recipient no longer exists.
    #[error("Recipient {target} unreachable on channel {name}")]
    Unreachable { name: String, target: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Inference capability errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Inference capability unavailable")]
    Unavailable,
}

/// Remote mail delta-sync errors.
///
/// Every variant is something a caller must branch on; none of these are
/// swallowed inside the sync manager.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Delta cursor rejected as expired")]
    CursorExpired,

    #[error("No credential configured for the mail service")]
    NoCredential,

    #[error("Mail service rejected the credential: {0}")]
    Unauthorized(String),

    #[error("Mail service returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SyncError {
    /// Credential problems need operator action; everything else retries.
    pub fn is_credential(&self) -> bool {
        matches!(self, Self::NoCredential | Self::Unauthorized(_))
    }
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Deduplicator unavailable: {0}")]
    Dedup(String),

    #[error("Rules evaluation failed: {0}")]
    Rules(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
