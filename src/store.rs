use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::models::{Account, Attachment, Email, NewEmail, VectorEntry, Webhook};
use log::debug;

/// Outcome of the dedup & persistence gate for one fetched message.
#[derive(Debug)]
pub enum IngestOutcome {
    /// First sighting of this (account, uid): the row and its attachments
    /// were committed in one transaction.
    New(Email),
    /// Known uid re-fetched under a different folder: folder updated in place.
    Updated,
    /// Known uid in the same folder: nothing written.
    Existing,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    "CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL DEFAULT 993,
        use_tls INTEGER NOT NULL DEFAULT 1,
        last_sync TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS emails (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        message_id TEXT NOT NULL,
        folder TEXT NOT NULL DEFAULT 'INBOX',
        subject TEXT NOT NULL,
        sender TEXT NOT NULL,
        recipients TEXT NOT NULL,
        cc TEXT NOT NULL,
        body_text TEXT NOT NULL,
        body_html TEXT,
        date TEXT,
        received_date TEXT NOT NULL,
        category TEXT,
        uid INTEGER,
        flags TEXT NOT NULL
    )",
    // Storage-layer dedup invariant: one row per (account, uid), across folders
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_emails_account_message
        ON emails(account_id, message_id)",
    "CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        content BLOB
    )",
    "CREATE TABLE IF NOT EXISTS webhooks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        events TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_triggered TEXT
    )",
    "CREATE TABLE IF NOT EXISTS vector_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        text TEXT NOT NULL,
        embedding TEXT NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL
    )",
];

impl Database {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new().connect(url).await?;
        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database, one connection so every query sees the
    /// same store. Used by the test suite.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Database { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- accounts -------------------------------------------------------

    pub async fn create_account(
        &self,
        name: &str,
        email: &str,
        password: &str,
        host: &str,
        port: u16,
        use_tls: bool,
    ) -> Result<Account, sqlx::Error> {
        let id = sqlx::query(
            "INSERT INTO accounts (name, email, password, host, port, use_tls, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(email)
        .bind(password)
        .bind(host)
        .bind(port)
        .bind(use_tls)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn account_by_id(&self, id: i64) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn active_accounts(&self) -> Result<Vec<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }

    /// Only the sync orchestrator calls this, and only after a run that
    /// managed to open a session.
    pub async fn set_last_sync(
        &self,
        account_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET last_sync = ? WHERE id = ?")
            .bind(at)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- dedup & persistence gate ---------------------------------------

    pub async fn find_email(
        &self,
        account_id: i64,
        message_id: &str,
    ) -> Result<Option<Email>, sqlx::Error> {
        sqlx::query_as::<_, Email>(
            "SELECT * FROM emails WHERE account_id = ? AND message_id = ?",
        )
        .bind(account_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Decide new vs existing vs folder-moved for a normalized message and
    /// commit accordingly. The insert of the email and all its attachments is
    /// a single transaction; on failure nothing is visible.
    pub async fn ingest_email(
        &self,
        account_id: i64,
        folder: &str,
        message: &NewEmail,
    ) -> Result<IngestOutcome, sqlx::Error> {
        if let Some(existing) = self.find_email(account_id, &message.message_id).await? {
            if existing.folder != folder {
                sqlx::query("UPDATE emails SET folder = ? WHERE id = ?")
                    .bind(folder)
                    .bind(existing.id)
                    .execute(&self.pool)
                    .await?;
                debug!(
                    "email {} moved {} -> {}",
                    existing.id, existing.folder, folder
                );
                return Ok(IngestOutcome::Updated);
            }
            return Ok(IngestOutcome::Existing);
        }

        let received_date = Utc::now();
        let mut tx = self.pool.begin().await?;

        let email_id = sqlx::query(
            "INSERT INTO emails (
                account_id, message_id, folder, subject, sender, recipients,
                cc, body_text, body_html, date, received_date, uid, flags
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(&message.message_id)
        .bind(folder)
        .bind(&message.subject)
        .bind(&message.sender)
        .bind(&message.recipients)
        .bind(&message.cc)
        .bind(&message.body_text)
        .bind(&message.body_html)
        .bind(message.date)
        .bind(received_date)
        .bind(message.uid)
        .bind(&message.flags)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for attachment in &message.attachments {
            sqlx::query(
                "INSERT INTO attachments (email_id, filename, content_type, size)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(email_id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.size)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(IngestOutcome::New(Email {
            id: email_id,
            account_id,
            message_id: message.message_id.clone(),
            folder: folder.to_string(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            cc: message.cc.clone(),
            body_text: message.body_text.clone(),
            body_html: message.body_html.clone(),
            date: message.date,
            received_date,
            category: None,
            uid: message.uid,
            flags: message.flags.clone(),
        }))
    }

    /// Single-field category update, separate from the insert transaction.
    pub async fn set_category(&self, email_id: i64, category: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE emails SET category = ? WHERE id = ?")
            .bind(category)
            .bind(email_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- email reads ----------------------------------------------------

    pub async fn email_by_id(&self, id: i64) -> Result<Option<Email>, sqlx::Error> {
        sqlx::query_as::<_, Email>("SELECT * FROM emails WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn attachments_for(&self, email_id: i64) -> Result<Vec<Attachment>, sqlx::Error> {
        sqlx::query_as::<_, Attachment>(
            "SELECT * FROM attachments WHERE email_id = ? ORDER BY id",
        )
        .bind(email_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_emails(
        &self,
        account_id: Option<i64>,
        folder: Option<&str>,
        category: Option<&str>,
    ) -> Result<Vec<Email>, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM emails WHERE 1=1");
        if let Some(account_id) = account_id {
            qb.push(" AND account_id = ").push_bind(account_id);
        }
        if let Some(folder) = folder {
            qb.push(" AND folder = ").push_bind(folder);
        }
        if let Some(category) = category {
            qb.push(" AND category = ").push_bind(category);
        }
        qb.push(" ORDER BY received_date DESC LIMIT 100");
        qb.build_query_as::<Email>().fetch_all(&self.pool).await
    }

    /// Substring search over subject/body/sender, used when the search
    /// backend is unavailable. Filters are equality, newest first, capped.
    pub async fn search_emails(
        &self,
        query: &str,
        account_id: Option<i64>,
        category: Option<&str>,
    ) -> Result<Vec<Email>, sqlx::Error> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM emails WHERE 1=1");
        if let Some(account_id) = account_id {
            qb.push(" AND account_id = ").push_bind(account_id);
        }
        if let Some(category) = category {
            qb.push(" AND category = ").push_bind(category);
        }
        if !query.is_empty() {
            let pattern = format!("%{}%", query);
            qb.push(" AND (subject LIKE ")
                .push_bind(pattern.clone())
                .push(" OR body_text LIKE ")
                .push_bind(pattern.clone())
                .push(" OR sender LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        qb.push(" ORDER BY date DESC LIMIT 100");
        qb.build_query_as::<Email>().fetch_all(&self.pool).await
    }

    // ---- webhooks --------------------------------------------------------

    pub async fn create_webhook(
        &self,
        name: &str,
        url: &str,
        events: &str,
    ) -> Result<Webhook, sqlx::Error> {
        let id = sqlx::query(
            "INSERT INTO webhooks (name, url, events, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(url)
        .bind(events)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn webhook_by_id(&self, id: i64) -> Result<Option<Webhook>, sqlx::Error> {
        sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Active subscriptions whose comma-delimited event list contains the
    /// event name.
    pub async fn webhooks_for_event(&self, event: &str) -> Result<Vec<Webhook>, sqlx::Error> {
        sqlx::query_as::<_, Webhook>(
            "SELECT * FROM webhooks WHERE active = 1 AND events LIKE ? ORDER BY id",
        )
        .bind(format!("%{}%", event))
        .fetch_all(&self.pool)
        .await
    }

    /// Updated after every dispatch attempt, delivered or not.
    pub async fn touch_webhook(&self, webhook_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE webhooks SET last_triggered = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- vector entries --------------------------------------------------

    pub async fn add_vector_entry(
        &self,
        text: &str,
        embedding: &str,
        description: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO vector_entries (text, embedding, description, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(text)
        .bind(embedding)
        .bind(description)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn vector_entries(&self) -> Result<Vec<VectorEntry>, sqlx::Error> {
        sqlx::query_as::<_, VectorEntry>("SELECT * FROM vector_entries ORDER BY id")
            .fetch_all(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewAttachment;

    fn sample_message(uid: &str) -> NewEmail {
        NewEmail {
            message_id: uid.to_string(),
            subject: "Hello".to_string(),
            sender: "alice@example.com".to_string(),
            recipients: "bob@example.com".to_string(),
            body_text: "Hi Bob".to_string(),
            uid: uid.parse().ok(),
            flags: "\\Seen".to_string(),
            ..Default::default()
        }
    }

    async fn db_with_account() -> (Database, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let account = db
            .create_account("Work", "bob@example.com", "secret", "imap.example.com", 993, true)
            .await
            .unwrap();
        (db, account.id)
    }

    #[tokio::test]
    async fn gate_reports_new_then_existing() {
        let (db, account_id) = db_with_account().await;
        let msg = sample_message("101");

        let first = db.ingest_email(account_id, "INBOX", &msg).await.unwrap();
        assert!(matches!(first, IngestOutcome::New(_)));

        let second = db.ingest_email(account_id, "INBOX", &msg).await.unwrap();
        assert!(matches!(second, IngestOutcome::Existing));

        let rows = db.list_emails(Some(account_id), None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn gate_updates_folder_on_move() {
        let (db, account_id) = db_with_account().await;
        let msg = sample_message("202");

        db.ingest_email(account_id, "INBOX", &msg).await.unwrap();
        let moved = db.ingest_email(account_id, "Archive", &msg).await.unwrap();
        assert!(matches!(moved, IngestOutcome::Updated));

        let stored = db.find_email(account_id, "202").await.unwrap().unwrap();
        assert_eq!(stored.folder, "Archive");

        let rows = db.list_emails(Some(account_id), None, None).await.unwrap();
        assert_eq!(rows.len(), 1, "a move must not create a second row");
    }

    #[tokio::test]
    async fn attachments_persist_with_their_email() {
        let (db, account_id) = db_with_account().await;
        let mut msg = sample_message("303");
        msg.attachments = vec![
            NewAttachment {
                filename: "report.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                size: 2048,
            },
            NewAttachment {
                filename: "logo.png".to_string(),
                content_type: "image/png".to_string(),
                size: 512,
            },
        ];

        let outcome = db.ingest_email(account_id, "INBOX", &msg).await.unwrap();
        let IngestOutcome::New(email) = outcome else {
            panic!("expected new email");
        };

        let attachments = db.attachments_for(email.id).await.unwrap();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].filename, "report.pdf");
        assert_eq!(attachments[1].size, 512);
    }

    #[tokio::test]
    async fn fallback_search_filters_and_matches_substrings() {
        let (db, account_id) = db_with_account().await;
        let mut first = sample_message("1");
        first.subject = "Quarterly report".to_string();
        let mut second = sample_message("2");
        second.subject = "Lunch?".to_string();
        db.ingest_email(account_id, "INBOX", &first).await.unwrap();
        let outcome = db.ingest_email(account_id, "INBOX", &second).await.unwrap();

        let hits = db.search_emails("report", None, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject, "Quarterly report");

        if let IngestOutcome::New(email) = outcome {
            db.set_category(email.id, "spam").await.unwrap();
        }
        let hits = db.search_emails("", None, Some("spam")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject, "Lunch?");
    }

    #[tokio::test]
    async fn webhook_event_matching_is_substring_over_events() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_webhook("crm", "http://crm/hook", "email.new,email.deleted")
            .await
            .unwrap();
        db.create_webhook("other", "http://other/hook", "account.created")
            .await
            .unwrap();

        let matching = db.webhooks_for_event("email.new").await.unwrap();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].name, "crm");
    }
}
