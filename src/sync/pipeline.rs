use serde_json::json;
use std::sync::Arc;

use crate::ai::Categorizer;
use crate::integrations::WebhookDispatcher;
use crate::models::{Category, Email};
use crate::search::SearchIndex;
use crate::store::Database;
use log::{error, info, warn};

pub const EVENT_EMAIL_NEW: &str = "email.new";

/// Post-persistence side effects for a freshly inserted email: search
/// indexing, AI categorization, webhook dispatch. The three steps are
/// independent; a failure in one is logged and never stops the others, and
/// nothing here can roll back the already committed insert.
pub struct FanoutPipeline {
    db: Database,
    categorizer: Arc<dyn Categorizer>,
    search: Arc<dyn SearchIndex>,
    webhooks: Arc<WebhookDispatcher>,
}

impl FanoutPipeline {
    pub fn new(
        db: Database,
        categorizer: Arc<dyn Categorizer>,
        search: Arc<dyn SearchIndex>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        FanoutPipeline {
            db,
            categorizer,
            search,
            webhooks,
        }
    }

    pub async fn run(&self, email: &Email) {
        // Search staleness is acceptable; the query path has a DB fallback
        if let Err(e) = self.search.index_email(email).await {
            error!("Error indexing email {}: {}", email.id, e);
        }

        let category = self.categorize(email).await;

        let results = self
            .webhooks
            .trigger_webhooks(
                EVENT_EMAIL_NEW,
                json!({
                    "email_id": email.id,
                    "account_id": email.account_id,
                    "subject": email.subject,
                    "sender": email.sender,
                    "category": category.as_str(),
                }),
            )
            .await;
        if !results.is_empty() {
            info!(
                "Dispatched {} to {} webhook(s), {} delivered",
                EVENT_EMAIL_NEW,
                results.len(),
                results.iter().filter(|r| r.success).count()
            );
        }
    }

    /// Ask the collaborator for a label and persist it. Provider failure or
    /// an out-of-set label both degrade to `uncategorized`; this step is
    /// treated as a success either way.
    async fn categorize(&self, email: &Email) -> Category {
        let category = match self
            .categorizer
            .categorize(&email.subject, &email.sender, &email.body_text)
            .await
        {
            Ok(label) => {
                let category = Category::from_label(&label);
                if category == Category::Uncategorized {
                    warn!("Invalid category returned: {}", label.trim());
                } else {
                    info!("Categorized email {} as '{}'", email.id, category.as_str());
                }
                category
            }
            Err(e) => {
                error!("Error categorizing email {}: {}", email.id, e);
                Category::Uncategorized
            }
        };

        if let Err(e) = self.db.set_category(email.id, category.as_str()).await {
            error!("Cannot persist category for email {}: {}", email.id, e);
        }

        category
    }
}
