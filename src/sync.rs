pub mod pipeline;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::error::SyncError;
use crate::mail_reader::{message, MailboxConnect, RawMessage};
use crate::models::Account;
use crate::store::{Database, IngestOutcome};
use crate::sync::pipeline::FanoutPipeline;
use anyhow::Context;
use log::{error, info};

/// Accounting for one account's completed run. A run that opened a session
/// always reports counts, even when every message errored.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub account_id: i64,
    pub new_emails: u64,
    pub updated_emails: u64,
    pub errors: u64,
}

/// One row of a fleet run. Failed accounts carry the failure text; they
/// never abort the rest of the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSyncResult {
    pub account_id: i64,
    pub email: String,
    pub success: bool,
    pub message: String,
    pub new_emails: u64,
    pub updated_emails: u64,
    pub errors: u64,
}

/// Process-lifetime reentrancy guard: at most one running sync per account.
/// Membership test-and-insert is atomic under the mutex.
#[derive(Clone, Default)]
pub struct SyncGuard {
    in_progress: Arc<Mutex<HashSet<i64>>>,
}

impl SyncGuard {
    pub fn try_acquire(&self, account_id: i64) -> Option<SyncPermit> {
        let mut set = self.in_progress.lock().unwrap();
        if !set.insert(account_id) {
            return None;
        }
        Some(SyncPermit {
            in_progress: Arc::clone(&self.in_progress),
            account_id,
        })
    }
}

/// Releases the account's slot on drop, so the guard frees on every exit
/// path of a run, panics included.
pub struct SyncPermit {
    in_progress: Arc<Mutex<HashSet<i64>>>,
    account_id: i64,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.in_progress.lock().unwrap().remove(&self.account_id);
    }
}

pub struct SyncEngine {
    db: Database,
    connector: Arc<dyn MailboxConnect>,
    pipeline: FanoutPipeline,
    guard: SyncGuard,
}

// System folders never synced, matched case-insensitively as substrings
const EXCLUDED_FOLDERS: [&str; 3] = ["junk", "trash", "deleted"];

fn is_excluded_folder(name: &str) -> bool {
    let lowered = name.to_lowercase();
    EXCLUDED_FOLDERS.iter().any(|x| lowered.contains(x))
}

impl SyncEngine {
    pub fn new(db: Database, connector: Arc<dyn MailboxConnect>, pipeline: FanoutPipeline) -> Self {
        SyncEngine {
            db,
            connector,
            pipeline,
            guard: SyncGuard::default(),
        }
    }

    pub fn guard(&self) -> &SyncGuard {
        &self.guard
    }

    /// Sync one account's folders from its watermark (or `now - days` on the
    /// first or forced run). Per-message and per-folder failures are counted
    /// and skipped; only reentrancy and session establishment fail the call.
    pub async fn sync_account(
        &self,
        account: &Account,
        days: i64,
        force: bool,
    ) -> Result<SyncReport, SyncError> {
        let _permit = self
            .guard
            .try_acquire(account.id)
            .ok_or(SyncError::AlreadyInProgress {
                account_id: account.id,
            })?;

        let run_started = Utc::now();
        let since = match (account.last_sync, force) {
            (Some(last_sync), false) => last_sync,
            _ => run_started - ChronoDuration::days(days),
        };

        info!("Syncing account {} from {}", account.email, since);

        let mut session = self.connector.connect(account).await?;

        let folders = match session.list_folders().await {
            Ok(folders) => folders,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        let mut new_emails = 0u64;
        let mut updated_emails = 0u64;
        let mut errors = 0u64;

        for folder in folders.iter().filter(|f| !is_excluded_folder(f)) {
            info!("Searching folder {}", folder);
            match session.fetch_since(folder, since).await {
                Ok(messages) => {
                    for raw in &messages {
                        match self.process_message(account, folder, raw).await {
                            Ok(IngestOutcome::New(_)) => new_emails += 1,
                            Ok(IngestOutcome::Updated) => updated_emails += 1,
                            Ok(IngestOutcome::Existing) => {}
                            Err(e) => {
                                error!("Error processing email in {}: {:#}", folder, e);
                                errors += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Error processing folder {}: {}", folder, e);
                    errors += 1;
                }
            }
        }

        session.close().await;

        // The watermark moves to the run's start time, never mid-run
        self.db.set_last_sync(account.id, run_started).await?;

        info!(
            "Sync completed for {}: {} new, {} updated, {} errors",
            account.email, new_emails, updated_emails, errors
        );

        Ok(SyncReport {
            account_id: account.id,
            new_emails,
            updated_emails,
            errors,
        })
    }

    /// Normalizer -> gate -> (if new) fan-out, for a single fetched message.
    async fn process_message(
        &self,
        account: &Account,
        folder: &str,
        raw: &RawMessage,
    ) -> anyhow::Result<IngestOutcome> {
        let normalized = message::normalize(raw).context("normalization failed")?;

        let outcome = self
            .db
            .ingest_email(account.id, folder, &normalized)
            .await
            .context("persistence failed")?;

        // Fan-out only after a committed insert; moves and re-sightings
        // never re-trigger it
        if let IngestOutcome::New(email) = &outcome {
            self.pipeline.run(email).await;
        }

        Ok(outcome)
    }

    /// Fleet driver: run every active account, isolating failures per
    /// account, and return results in account order.
    pub async fn sync_all_accounts(
        &self,
        days: i64,
        force: bool,
    ) -> Result<Vec<AccountSyncResult>, sqlx::Error> {
        let accounts = self.db.active_accounts().await?;
        let mut results = Vec::with_capacity(accounts.len());

        for account in accounts {
            match self.sync_account(&account, days, force).await {
                Ok(report) => results.push(AccountSyncResult {
                    account_id: account.id,
                    email: account.email.clone(),
                    success: true,
                    message: String::new(),
                    new_emails: report.new_emails,
                    updated_emails: report.updated_emails,
                    errors: report.errors,
                }),
                Err(e) => {
                    error!("Error syncing account {}: {}", account.email, e);
                    results.push(AccountSyncResult {
                        account_id: account.id,
                        email: account.email.clone(),
                        success: false,
                        message: e.to_string(),
                        new_emails: 0,
                        updated_emails: 0,
                        errors: 0,
                    });
                }
            }
        }

        Ok(results)
    }
}

/// Periodic fleet sync on a fixed interval.
pub async fn entrypoint(
    engine: Arc<SyncEngine>,
    days: i64,
    interval_seconds: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let sched = JobScheduler::new().await?;

    // Clone the engine handle for the closure
    let engine_for_job = engine.clone();

    sched
        .add(Job::new_repeated_async(
            Duration::from_secs(interval_seconds),
            move |_uuid, _l| {
                let engine = engine_for_job.clone();
                Box::pin(async move {
                    match engine.sync_all_accounts(days, false).await {
                        Ok(results) => {
                            let failed = results.iter().filter(|r| !r.success).count();
                            info!(
                                "Scheduled sync finished: {} accounts, {} failed",
                                results.len(),
                                failed
                            );
                        }
                        Err(e) => error!("Scheduled sync failed: {}", e),
                    }
                })
            },
        )?)
        .await?;

    // Start the scheduler
    tokio::spawn(async move {
        if let Err(e) = sched.start().await {
            eprintln!("Scheduler error: {}", e);
        }
    });

    Ok(())
}
