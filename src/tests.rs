use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::ai::Categorizer;
use crate::error::{AiError, MailboxError, SearchError, SyncError, WebhookError};
use crate::integrations::{WebhookDispatcher, WebhookTransport};
use crate::mail_reader::{Mailbox, MailboxConnect, RawMessage};
use crate::models::{Account, Email};
use crate::search::SearchIndex;
use crate::store::Database;
use crate::sync::pipeline::FanoutPipeline;
use crate::sync::SyncEngine;

// ---- scripted collaborators ---------------------------------------------

#[derive(Clone, Default)]
struct FakeServer {
    folders: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<HashMap<String, Vec<RawMessage>>>>,
    failing_folders: Arc<Mutex<HashSet<String>>>,
    fail_connect: Arc<AtomicBool>,
}

impl FakeServer {
    fn set_folders(&self, folders: &[&str]) {
        *self.folders.lock().unwrap() = folders.iter().map(|f| f.to_string()).collect();
    }

    fn put_message(&self, folder: &str, raw: RawMessage) {
        self.messages
            .lock()
            .unwrap()
            .entry(folder.to_string())
            .or_default()
            .push(raw);
    }

    fn clear_folder(&self, folder: &str) {
        self.messages.lock().unwrap().remove(folder);
    }

    fn fail_folder(&self, folder: &str) {
        self.failing_folders
            .lock()
            .unwrap()
            .insert(folder.to_string());
    }
}

struct FakeSession {
    server: FakeServer,
}

#[async_trait]
impl MailboxConnect for FakeServer {
    async fn connect(&self, _account: &Account) -> Result<Box<dyn Mailbox>, MailboxError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MailboxError::Connect("server unreachable".to_string()));
        }
        Ok(Box::new(FakeSession {
            server: self.clone(),
        }))
    }
}

#[async_trait]
impl Mailbox for FakeSession {
    async fn list_folders(&mut self) -> Result<Vec<String>, MailboxError> {
        Ok(self.server.folders.lock().unwrap().clone())
    }

    async fn fetch_since(
        &mut self,
        folder: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<RawMessage>, MailboxError> {
        if self.server.failing_folders.lock().unwrap().contains(folder) {
            return Err(MailboxError::Protocol(format!(
                "cannot select {}",
                folder
            )));
        }
        Ok(self
            .server
            .messages
            .lock()
            .unwrap()
            .get(folder)
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&mut self) {}
}

/// Returns the scripted label, or a provider error when none is set.
struct ScriptedCategorizer {
    reply: Mutex<Result<String, String>>,
}

impl ScriptedCategorizer {
    fn with_label(label: &str) -> Arc<Self> {
        Arc::new(ScriptedCategorizer {
            reply: Mutex::new(Ok(label.to_string())),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(ScriptedCategorizer {
            reply: Mutex::new(Err("provider exploded".to_string())),
        })
    }
}

#[async_trait]
impl Categorizer for ScriptedCategorizer {
    async fn categorize(
        &self,
        _subject: &str,
        _sender: &str,
        _body_text: &str,
    ) -> Result<String, AiError> {
        self.reply.lock().unwrap().clone().map_err(AiError::Api)
    }
}

#[derive(Default)]
struct RecordingSearch {
    indexed: Mutex<Vec<i64>>,
    fail: AtomicBool,
}

#[async_trait]
impl SearchIndex for RecordingSearch {
    async fn index_email(&self, email: &Email) -> Result<(), SearchError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SearchError::Unavailable);
        }
        self.indexed.lock().unwrap().push(email.id);
        Ok(())
    }
}

/// Answers every POST with a fixed status and records the payloads.
struct ScriptedTransport {
    status: u16,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    fn with_status(status: u16) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            status,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn post(&self, url: &str, payload: &Value) -> Result<u16, WebhookError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        Ok(self.status)
    }
}

// ---- harness -------------------------------------------------------------

struct Harness {
    db: Database,
    engine: SyncEngine,
    account: Account,
    server: FakeServer,
    search: Arc<RecordingSearch>,
    transport: Arc<ScriptedTransport>,
}

async fn harness(categorizer: Arc<dyn Categorizer>, webhook_status: u16) -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let account = db
        .create_account("Work", "bob@example.com", "opaque", "imap.example.com", 993, true)
        .await
        .unwrap();

    let server = FakeServer::default();
    server.set_folders(&["INBOX"]);

    let search = Arc::new(RecordingSearch::default());
    let transport = ScriptedTransport::with_status(webhook_status);
    let webhooks = Arc::new(WebhookDispatcher::new(db.clone(), transport.clone()));
    let pipeline = FanoutPipeline::new(db.clone(), categorizer, search.clone(), webhooks);
    let engine = SyncEngine::new(db.clone(), Arc::new(server.clone()), pipeline);

    Harness {
        db,
        engine,
        account,
        server,
        search,
        transport,
    }
}

fn raw_message(uid: &str, subject: &str) -> RawMessage {
    let body = format!(
        "Subject: {}\r\n\
         From: alice@example.com\r\n\
         To: bob@example.com\r\n\
         Date: {}\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         Looking forward to it.\r\n",
        subject,
        Utc::now().to_rfc2822()
    );
    RawMessage {
        uid: uid.to_string(),
        flags: vec!["\\Seen".to_string()],
        internal_date: Some(Utc::now()),
        body: body.into_bytes(),
    }
}

async fn reload_account(h: &Harness) -> Account {
    h.db.account_by_id(h.account.id).await.unwrap().unwrap()
}

// ---- properties ----------------------------------------------------------

#[tokio::test]
async fn first_sync_ingests_second_is_idempotent() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server.put_message("INBOX", raw_message("1", "Demo request"));

    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 1);
    assert_eq!(report.updated_emails, 0);
    assert_eq!(report.errors, 0);

    // Same fixture again: everything becomes `existing`
    let account = reload_account(&h).await;
    let report = h.engine.sync_account(&account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 0);
    assert_eq!(report.updated_emails, 0);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn duplicate_uid_in_one_batch_stores_one_row() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server.put_message("INBOX", raw_message("5", "First copy"));
    h.server.put_message("INBOX", raw_message("5", "Second copy"));

    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 1);

    let rows = h.db.list_emails(Some(h.account.id), None, None).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn refetch_under_new_folder_is_an_update() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server.set_folders(&["INBOX", "Archive"]);
    h.server.put_message("INBOX", raw_message("9", "Contract"));

    h.engine.sync_account(&h.account, 30, false).await.unwrap();

    // The message moved server-side between runs
    h.server.clear_folder("INBOX");
    h.server.put_message("Archive", raw_message("9", "Contract"));

    let account = reload_account(&h).await;
    let report = h.engine.sync_account(&account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 0);
    assert_eq!(report.updated_emails, 1);

    let stored = h.db.find_email(h.account.id, "9").await.unwrap().unwrap();
    assert_eq!(stored.folder, "Archive");
}

#[tokio::test]
async fn watermark_advances_even_on_empty_run() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    assert!(h.account.last_sync.is_none());

    let started = Utc::now();
    h.engine.sync_account(&h.account, 30, false).await.unwrap();

    let account = reload_account(&h).await;
    let last_sync = account.last_sync.expect("watermark must be set");
    assert!(last_sync >= started);
}

#[tokio::test]
async fn watermark_holds_when_session_cannot_open() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server.fail_connect.store(true, Ordering::SeqCst);

    let result = h.engine.sync_account(&h.account, 30, false).await;
    assert!(matches!(
        result,
        Err(SyncError::Mailbox(MailboxError::Connect(_)))
    ));

    let account = reload_account(&h).await;
    assert!(account.last_sync.is_none(), "watermark must not advance");
}

#[tokio::test]
async fn concurrent_sync_for_same_account_is_rejected() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server.put_message("INBOX", raw_message("1", "Hello"));

    let permit = h.engine.guard().try_acquire(h.account.id).unwrap();
    let result = h.engine.sync_account(&h.account, 30, false).await;
    assert!(matches!(result, Err(SyncError::AlreadyInProgress { .. })));

    // Nothing was fetched or persisted
    let rows = h.db.list_emails(Some(h.account.id), None, None).await.unwrap();
    assert!(rows.is_empty());
    assert!(reload_account(&h).await.last_sync.is_none());

    drop(permit);
    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 1);
}

#[tokio::test]
async fn junk_trash_and_deleted_folders_are_skipped() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server
        .set_folders(&["INBOX", "Junk", "[Gmail]/Trash", "Deleted Items"]);
    h.server.put_message("INBOX", raw_message("1", "Keep me"));
    h.server.put_message("Junk", raw_message("2", "Skip me"));
    h.server
        .put_message("[Gmail]/Trash", raw_message("3", "Skip me too"));

    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 1);

    let rows = h.db.list_emails(Some(h.account.id), None, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].folder, "INBOX");
}

#[tokio::test]
async fn folder_failure_is_counted_and_does_not_abort_the_run() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server.set_folders(&["Broken", "INBOX"]);
    h.server.fail_folder("Broken");
    h.server.put_message("INBOX", raw_message("1", "Still here"));

    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.new_emails, 1);

    // The partially failed run still advances the watermark
    assert!(reload_account(&h).await.last_sync.is_some());
}

#[tokio::test]
async fn webhook_failure_leaves_category_and_index_intact() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 500).await;
    h.db
        .create_webhook("crm", "http://crm.example.com/hook", "email.new")
        .await
        .unwrap();
    h.server.put_message("INBOX", raw_message("1", "Demo request"));

    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 1);
    assert_eq!(report.errors, 0, "webhook failure is not a sync error");

    let email = h.db.find_email(h.account.id, "1").await.unwrap().unwrap();
    assert_eq!(email.category.as_deref(), Some("interested"));
    assert_eq!(h.search.indexed.lock().unwrap().as_slice(), &[email.id]);

    // last_triggered records the attempt, not the delivery
    let webhook = h.db.webhook_by_id(1).await.unwrap().unwrap();
    assert!(webhook.last_triggered.is_some());
}

#[tokio::test]
async fn webhook_envelope_and_event_filtering() {
    let h = harness(ScriptedCategorizer::with_label("meeting_booked"), 200).await;
    h.db
        .create_webhook("crm", "http://crm.example.com/hook", "email.new,email.deleted")
        .await
        .unwrap();
    h.db
        .create_webhook("billing", "http://billing.example.com/hook", "invoice.paid")
        .await
        .unwrap();
    h.server.put_message("INBOX", raw_message("1", "Booked!"));

    h.engine.sync_account(&h.account, 30, false).await.unwrap();

    let calls = h.transport.calls.lock().unwrap();
    assert_eq!(calls.len(), 1, "only the matching subscription fires");
    let (url, payload) = &calls[0];
    assert_eq!(url, "http://crm.example.com/hook");
    assert_eq!(payload["event"], "email.new");
    assert!(payload["timestamp"].is_string());
    assert_eq!(payload["data"]["category"], "meeting_booked");
    assert_eq!(payload["data"]["account_id"], h.account.id);
}

#[tokio::test]
async fn provider_failure_falls_back_to_uncategorized() {
    let h = harness(ScriptedCategorizer::failing(), 200).await;
    h.server.put_message("INBOX", raw_message("1", "Whatever"));

    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 1);
    assert_eq!(report.errors, 0, "categorization failure is swallowed");

    let email = h.db.find_email(h.account.id, "1").await.unwrap().unwrap();
    assert_eq!(email.category.as_deref(), Some("uncategorized"));
}

#[tokio::test]
async fn invalid_label_falls_back_to_uncategorized() {
    let h = harness(ScriptedCategorizer::with_label("super interested!!"), 200).await;
    h.server.put_message("INBOX", raw_message("1", "Whatever"));

    h.engine.sync_account(&h.account, 30, false).await.unwrap();

    let email = h.db.find_email(h.account.id, "1").await.unwrap().unwrap();
    assert_eq!(email.category.as_deref(), Some("uncategorized"));
}

#[tokio::test]
async fn index_failure_does_not_block_categorization_or_webhooks() {
    let h = harness(ScriptedCategorizer::with_label("spam"), 200).await;
    h.db
        .create_webhook("crm", "http://crm.example.com/hook", "email.new")
        .await
        .unwrap();
    h.search.fail.store(true, Ordering::SeqCst);
    h.server.put_message("INBOX", raw_message("1", "Buy now"));

    let report = h.engine.sync_account(&h.account, 30, false).await.unwrap();
    assert_eq!(report.new_emails, 1);
    assert_eq!(report.errors, 0);

    let email = h.db.find_email(h.account.id, "1").await.unwrap().unwrap();
    assert_eq!(email.category.as_deref(), Some("spam"));
    assert_eq!(h.transport.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn fleet_run_isolates_failing_accounts() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.server.put_message("INBOX", raw_message("1", "Hello"));

    // Second account that the guard rejects: its slot is already taken
    let second = h
        .db
        .create_account("Spare", "eve@example.com", "opaque", "imap.example.com", 993, true)
        .await
        .unwrap();
    let _permit = h.engine.guard().try_acquire(second.id).unwrap();

    let results = h.engine.sync_all_accounts(30, false).await.unwrap();
    assert_eq!(results.len(), 2);

    assert!(results[0].success);
    assert_eq!(results[0].new_emails, 1);

    assert!(!results[1].success);
    assert!(results[1].message.contains("already in progress"));
}

#[tokio::test]
async fn forced_sync_ignores_the_watermark() {
    let h = harness(ScriptedCategorizer::with_label("interested"), 200).await;
    h.engine.sync_account(&h.account, 30, false).await.unwrap();

    let account = reload_account(&h).await;
    assert!(account.last_sync.is_some());

    // A forced run still succeeds and re-advances the watermark
    let before = account.last_sync;
    let report = h.engine.sync_account(&account, 30, true).await.unwrap();
    assert_eq!(report.errors, 0);
    assert!(reload_account(&h).await.last_sync >= before);
}
