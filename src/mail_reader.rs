use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailboxError;
use crate::models::Account;

pub mod encryption;
pub mod imap;
pub mod message;

/// A message as fetched from the server, before normalization. `uid` is kept
/// as the raw string the server reported; it is the dedup key downstream.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: String,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
}

/// An open, authenticated mailbox session. One `fetch_since` call is one
/// pass over the server; it re-queries every time and is not restartable.
#[async_trait]
pub trait Mailbox: Send {
    async fn list_folders(&mut self) -> Result<Vec<String>, MailboxError>;

    async fn fetch_since(
        &mut self,
        folder: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, MailboxError>;

    /// Release the session. Called on every exit path of a sync run.
    async fn close(&mut self);
}

/// Opens sessions for accounts. The sync engine only ever talks to this
/// seam, so tests can substitute a scripted mailbox.
#[async_trait]
pub trait MailboxConnect: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<Box<dyn Mailbox>, MailboxError>;
}
