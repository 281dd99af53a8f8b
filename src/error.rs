use thiserror::Error;

/// Session-level mailbox failures. Any of these aborts the account's run
/// and leaves the sync watermark untouched.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A message whose mandatory structure cannot be decoded. Counted as a
/// per-message error, never aborts the run.
#[derive(Debug, Error)]
#[error("cannot parse message: {0}")]
pub struct NormalizeError(pub String);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync already in progress for account {account_id}")]
    AlreadyInProgress { account_id: i64 },
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI provider not configured")]
    Unavailable,
    #[error("AI request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("AI provider error: {0}")]
    Api(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search backend not configured")]
    Unavailable,
    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search backend error: {0}")]
    Api(String),
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}
