use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AiError;
use crate::models::Email;
use crate::settings::AiConfig;
use crate::store::Database;
use log::{debug, info, warn};

/// Seam the fan-out pipeline categorizes through. Returns the provider's raw
/// label; validation against the fixed category set happens at the call site.
#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn categorize(
        &self,
        subject: &str,
        sender: &str,
        body_text: &str,
    ) -> Result<String, AiError>;
}

const CATEGORIZE_SYSTEM_PROMPT: &str =
    "You are an email categorization assistant. Categorize the email into exactly one category.";

const CATEGORIZE_PROMPT: &str = "Categorize the following email into exactly one of these categories:
- interested: Shows genuine interest in the product/service
- not_interested: Clearly not interested
- meeting_booked: Has booked or wants to book a meeting
- spam: Unsolicited or irrelevant
- out_of_office: Automated out of office reply

Email:
Subject: {subject}
From: {sender}

{body}

Category (return only the category name):";

const REPLY_SYSTEM_PROMPT: &str =
    "You are an email assistant. Draft professional, helpful, and concise replies.";

const REPLY_UNAVAILABLE: &str =
    "Unable to generate reply suggestion. OpenAI API not available.";
const REPLY_FAILED: &str = "Unable to generate reply suggestion. Error occurred.";

/// OpenAI-backed categorization, reply suggestion and embedding storage.
/// Without an API key every operation degrades to its fixed fallback.
pub struct AiService {
    client: reqwest::Client,
    config: AiConfig,
    db: Database,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl AiService {
    pub fn new(config: AiConfig, db: Database) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        if config.api_key.is_none() {
            warn!("AI provider API key not configured; categorization disabled");
        }
        Ok(AiService { client, config, db })
    }

    fn api_key(&self) -> Result<&str, AiError> {
        self.config.api_key.as_deref().ok_or(AiError::Unavailable)
    }

    async fn chat(
        &self,
        system: &str,
        user: String,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AiError> {
        let key = self.api_key()?;
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AiError::Api(format!(
                "chat completion returned {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| AiError::Api("empty completion".to_string()))
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let key = self.api_key()?;
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: text,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .bearer_auth(key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AiError::Api(format!(
                "embedding returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AiError::Api("empty embedding".to_string()))
    }

    /// Store a text with its embedding in the RAG context table.
    pub async fn store_for_rag(
        &self,
        text: &str,
        description: Option<&str>,
    ) -> Result<(), AiError> {
        let embedding = self.embed(text).await?;
        let serialized =
            serde_json::to_string(&embedding).map_err(|e| AiError::Api(e.to_string()))?;
        self.db
            .add_vector_entry(text, &serialized, description)
            .await
            .map_err(|e| AiError::Api(e.to_string()))?;
        info!("Stored text in vector database: {}", description.unwrap_or("unnamed"));
        Ok(())
    }

    /// Draft a reply for an email, seeding the prompt with the most similar
    /// stored RAG texts. Never fails: degraded service yields fallback text.
    pub async fn suggest_reply(&self, email: &Email) -> String {
        if self.config.api_key.is_none() {
            return REPLY_UNAVAILABLE.to_string();
        }

        let context_texts = self.find_similar(&email.body_text, 3).await;
        let mut prompt = format!(
            "Here is an email I've received:\n\nSubject: {}\nFrom: {}\n\n{}\n\n",
            email.subject, email.sender, email.body_text
        );
        if !context_texts.is_empty() {
            prompt.push_str(&format!(
                "Here is some additional context that might be relevant:\n\n{}\n\n",
                context_texts.join("\n\n")
            ));
        }
        prompt.push_str("Please draft a professional, helpful, and concise reply to this email.");

        match self.chat(REPLY_SYSTEM_PROMPT, prompt, 0.7, 500).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Error generating reply for email {}: {}", email.id, e);
                REPLY_FAILED.to_string()
            }
        }
    }

    /// Nearest stored texts by cosine similarity over the vector table.
    async fn find_similar(&self, query: &str, limit: usize) -> Vec<String> {
        let query_embedding = match self.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                debug!("cannot embed RAG query: {}", e);
                return Vec::new();
            }
        };

        let entries = match self.db.vector_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot load vector entries: {}", e);
                return Vec::new();
            }
        };

        let mut scored: Vec<(f32, String)> = entries
            .into_iter()
            .filter_map(|entry| {
                let embedding: Vec<f32> = serde_json::from_str(&entry.embedding).ok()?;
                Some((cosine_similarity(&query_embedding, &embedding), entry.text))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, text)| text).collect()
    }
}

#[async_trait]
impl Categorizer for AiService {
    async fn categorize(
        &self,
        subject: &str,
        sender: &str,
        body_text: &str,
    ) -> Result<String, AiError> {
        let prompt = CATEGORIZE_PROMPT
            .replace("{subject}", subject)
            .replace("{sender}", sender)
            .replace("{body}", body_text);

        // Deterministic output, short response
        self.chat(CATEGORIZE_SYSTEM_PROMPT, prompt, 0.0, 20).await
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
