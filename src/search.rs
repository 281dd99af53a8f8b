use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::error::SearchError;
use crate::models::Email;
use crate::settings::SearchConfig;
use crate::store::Database;
use log::{debug, info, warn};

/// Seam the fan-out pipeline indexes through.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_email(&self, email: &Email) -> Result<(), SearchError>;
}

/// One search result row, identical shape for backend and fallback hits.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub score: f32,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
}

/// Elasticsearch-backed search with a database fallback: whenever the
/// backend is unconfigured or errors, queries degrade to a substring scan
/// over the store.
pub struct SearchService {
    client: reqwest::Client,
    base_url: Option<String>,
    index: String,
    db: Database,
}

#[derive(Deserialize)]
struct EsSearchResponse {
    hits: EsHits,
}

#[derive(Deserialize)]
struct EsHits {
    hits: Vec<EsHit>,
}

#[derive(Deserialize)]
struct EsHit {
    #[serde(rename = "_score")]
    score: Option<f32>,
    #[serde(rename = "_source")]
    source: EsDoc,
}

#[derive(Deserialize)]
struct EsDoc {
    id: i64,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

impl SearchService {
    pub fn new(config: SearchConfig, db: Database) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        if config.url.is_none() {
            warn!("search backend not configured; falling back to database queries");
        }
        Ok(SearchService {
            client,
            base_url: config.url.map(|u| u.trim_end_matches('/').to_string()),
            index: config.index,
            db,
        })
    }

    fn index_url(&self) -> Result<String, SearchError> {
        let base = self.base_url.as_deref().ok_or(SearchError::Unavailable)?;
        Ok(format!("{}/{}", base, self.index))
    }

    /// Create the index with explicit mappings if it does not exist yet.
    pub async fn ensure_index(&self) -> Result<(), SearchError> {
        let url = self.index_url()?;

        let exists = self.client.head(&url).send().await?;
        if exists.status().is_success() {
            return Ok(());
        }

        let mapping = json!({
            "mappings": {
                "properties": {
                    "subject": {"type": "text"},
                    "body_text": {"type": "text"},
                    "sender": {"type": "text"},
                    "recipients": {"type": "text"},
                    "date": {"type": "date"},
                    "category": {"type": "keyword"},
                    "account_id": {"type": "keyword"},
                    "folder": {"type": "keyword"}
                }
            }
        });

        let response = self.client.put(&url).json(&mapping).send().await?;
        if !response.status().is_success() {
            return Err(SearchError::Api(format!(
                "index creation returned {}",
                response.status()
            )));
        }
        info!("Created search index '{}'", self.index);
        Ok(())
    }

    /// Full-text search with backend-or-fallback semantics: filters apply in
    /// both paths, results are newest first, capped at 100.
    pub async fn search(
        &self,
        query: &str,
        account_id: Option<i64>,
        category: Option<&str>,
    ) -> Result<Vec<SearchHit>, sqlx::Error> {
        if self.base_url.is_some() {
            match self.backend_search(query, account_id, category).await {
                Ok(hits) => return Ok(hits),
                Err(e) => {
                    warn!("Search error: {}; falling back to database query", e);
                }
            }
        }

        let emails = self.db.search_emails(query, account_id, category).await?;
        Ok(emails
            .into_iter()
            .map(|e| SearchHit {
                id: e.id,
                // No real relevance score in a SQL scan
                score: 1.0,
                subject: e.subject,
                sender: e.sender,
                date: e.date,
            })
            .collect())
    }

    async fn backend_search(
        &self,
        query: &str,
        account_id: Option<i64>,
        category: Option<&str>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let mut must = Vec::new();
        if !query.is_empty() {
            must.push(json!({
                "multi_match": {
                    "query": query,
                    "fields": ["subject^2", "body_text", "sender", "recipients"]
                }
            }));
        }
        if let Some(account_id) = account_id {
            must.push(json!({"term": {"account_id": account_id.to_string()}}));
        }
        if let Some(category) = category {
            must.push(json!({"term": {"category": category}}));
        }

        let body = json!({
            "query": {"bool": {"must": must}},
            "sort": [{"date": {"order": "desc"}}],
            "size": 100
        });

        let response = self
            .client
            .post(format!("{}/_search", self.index_url()?))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::Api(format!(
                "search returned {}",
                response.status()
            )));
        }

        let parsed: EsSearchResponse = response.json().await?;
        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| SearchHit {
                id: hit.source.id,
                score: hit.score.unwrap_or(0.0),
                subject: hit.source.subject,
                sender: hit.source.sender,
                date: hit.source.date,
            })
            .collect())
    }
}

#[async_trait]
impl SearchIndex for SearchService {
    async fn index_email(&self, email: &Email) -> Result<(), SearchError> {
        let url = format!("{}/_doc/{}", self.index_url()?, email.id);

        let doc = json!({
            "id": email.id,
            "account_id": email.account_id,
            "subject": email.subject,
            "body_text": email.body_text,
            "sender": email.sender,
            "recipients": email.recipients,
            "folder": email.folder,
            "date": email.date,
            "category": email.category,
        });

        let response = self.client.put(&url).json(&doc).send().await?;
        if !response.status().is_success() {
            return Err(SearchError::Api(format!(
                "indexing returned {}",
                response.status()
            )));
        }
        debug!("Indexed email {} in search backend", email.id);
        Ok(())
    }
}
