use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An IMAP account registered with the aggregator. Owned by the admin layer;
/// the sync engine only ever writes `last_sync`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub email: String,
    // AES-GCM encrypted, base64 encoded (see mail_reader::encryption)
    pub password: String,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A persisted email message. `(account_id, message_id)` is the dedup key;
/// `message_id` holds the mailbox-assigned UID verbatim, `uid` only its
/// numeric form when the string parses.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Email {
    pub id: i64,
    pub account_id: i64,
    pub message_id: String,
    pub folder: String,
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    pub cc: String,
    pub body_text: String,
    pub body_html: Option<String>,
    // Header date; absent, forged or skewed dates stay distinct from receipt
    pub date: Option<DateTime<Utc>>,
    pub received_date: DateTime<Utc>,
    pub category: Option<String>,
    pub uid: Option<i64>,
    pub flags: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attachment {
    pub id: i64,
    pub email_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    #[serde(skip_serializing, default)]
    pub content: Option<Vec<u8>>,
}

/// A webhook subscription. Lifecycle lives outside the sync engine; the
/// engine reads active matching rows and writes `last_triggered`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: i64,
    pub name: String,
    pub url: String,
    // Comma-delimited event names, e.g. "email.new,email.deleted"
    pub events: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
}

/// Append-only RAG context entry; embedding is a JSON-serialized vector.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VectorEntry {
    pub id: i64,
    pub text: String,
    pub embedding: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Normalizer output: a message ready for the persistence gate.
#[derive(Debug, Clone, Default)]
pub struct NewEmail {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    pub cc: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub uid: Option<i64>,
    pub flags: String,
    pub attachments: Vec<NewAttachment>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
}

/// The fixed category label set the AI collaborator may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Interested,
    NotInterested,
    MeetingBooked,
    Spam,
    OutOfOffice,
    Uncategorized,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Interested => "interested",
            Category::NotInterested => "not_interested",
            Category::MeetingBooked => "meeting_booked",
            Category::Spam => "spam",
            Category::OutOfOffice => "out_of_office",
            Category::Uncategorized => "uncategorized",
        }
    }

    /// Parse a provider label. Anything outside the fixed set collapses to
    /// `Uncategorized`.
    pub fn from_label(label: &str) -> Category {
        match label.trim().to_lowercase().as_str() {
            "interested" => Category::Interested,
            "not_interested" => Category::NotInterested,
            "meeting_booked" => Category::MeetingBooked,
            "spam" => Category::Spam,
            "out_of_office" => Category::OutOfOffice,
            _ => Category::Uncategorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_labels_round_trip() {
        for c in [
            Category::Interested,
            Category::NotInterested,
            Category::MeetingBooked,
            Category::Spam,
            Category::OutOfOffice,
        ] {
            assert_eq!(Category::from_label(c.as_str()), c);
        }
    }

    #[test]
    fn unknown_label_is_uncategorized() {
        assert_eq!(Category::from_label("very interested!"), Category::Uncategorized);
        assert_eq!(Category::from_label(""), Category::Uncategorized);
        assert_eq!(Category::from_label(" SPAM "), Category::Spam);
    }
}
