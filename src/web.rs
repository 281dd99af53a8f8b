use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::ai::AiService;
use crate::error::SyncError;
use crate::models::{Attachment, Email};
use crate::search::{SearchHit, SearchService};
use crate::store::Database;
use crate::sync::{AccountSyncResult, SyncEngine};
use log::info;

/// Thin request/response glue over the engine; all logic lives below it.
pub struct AppState {
    pub db: Database,
    pub engine: Arc<SyncEngine>,
    pub ai: Arc<AiService>,
    pub search: Arc<SearchService>,
    pub sync_days: i64,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found(what: &str) -> Self {
        AppError {
            status: StatusCode::NOT_FOUND,
            message: format!("{} not found", what),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct EmailListParams {
    account_id: Option<i64>,
    folder: Option<String>,
    category: Option<String>,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    account_id: Option<i64>,
    category: Option<String>,
}

#[derive(Deserialize, Default)]
struct SyncParams {
    days: Option<i64>,
    force: Option<bool>,
}

#[derive(Serialize)]
struct EmailDetail {
    #[serde(flatten)]
    email: Email,
    attachments: Vec<Attachment>,
}

#[derive(Deserialize)]
struct RagRequest {
    text: String,
    description: Option<String>,
}

async fn list_emails(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EmailListParams>,
) -> Result<Json<Vec<Email>>, AppError> {
    let emails = state
        .db
        .list_emails(
            params.account_id,
            params.folder.as_deref(),
            params.category.as_deref(),
        )
        .await?;
    Ok(Json(emails))
}

async fn get_email(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<EmailDetail>, AppError> {
    let email = state
        .db
        .email_by_id(id)
        .await?
        .ok_or_else(|| AppError::not_found("email"))?;
    let attachments = state.db.attachments_for(email.id).await?;
    Ok(Json(EmailDetail { email, attachments }))
}

async fn search_emails(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let hits = state
        .search
        .search(&params.q, params.account_id, params.category.as_deref())
        .await?;
    Ok(Json(hits))
}

async fn sync_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
    params: Option<Json<SyncParams>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(params) = params.unwrap_or_default();
    let account = state
        .db
        .account_by_id(account_id)
        .await?
        .ok_or_else(|| AppError::not_found("account"))?;

    let days = params.days.unwrap_or(state.sync_days);
    let force = params.force.unwrap_or(false);

    match state.engine.sync_account(&account, days, force).await {
        Ok(report) => Ok(Json(json!({
            "success": true,
            "account_id": report.account_id,
            "new_emails": report.new_emails,
            "updated_emails": report.updated_emails,
            "errors": report.errors,
        }))),
        Err(e @ SyncError::AlreadyInProgress { .. }) => Err(AppError {
            status: StatusCode::CONFLICT,
            message: e.to_string(),
        }),
        Err(e) => Ok(Json(json!({ "success": false, "message": e.to_string() }))),
    }
}

async fn sync_all(
    State(state): State<Arc<AppState>>,
    params: Option<Json<SyncParams>>,
) -> Result<Json<Vec<AccountSyncResult>>, AppError> {
    let Json(params) = params.unwrap_or_default();
    let days = params.days.unwrap_or(state.sync_days);
    let force = params.force.unwrap_or(false);
    let results = state.engine.sync_all_accounts(days, force).await?;
    Ok(Json(results))
}

async fn suggest_reply(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let email = state
        .db
        .email_by_id(id)
        .await?
        .ok_or_else(|| AppError::not_found("email"))?;
    let reply = state.ai.suggest_reply(&email).await;
    Ok(Json(json!({ "email_id": id, "reply": reply })))
}

async fn store_rag_text(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RagRequest>,
) -> Json<serde_json::Value> {
    match state
        .ai
        .store_for_rag(&request.text, request.description.as_deref())
        .await
    {
        Ok(()) => Json(json!({ "success": true })),
        Err(e) => Json(json!({ "success": false, "message": e.to_string() })),
    }
}

fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/emails", get(list_emails))
        .route("/emails/:id", get(get_email))
        .route("/emails/:id/suggest-reply", post(suggest_reply))
        .route("/search", get(search_emails))
        .route("/sync", post(sync_all))
        .route("/sync/:account_id", post(sync_account))
        .route("/rag", post(store_rag_text))
        .with_state(state)
}

pub async fn entrypoint(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Server running on http://{}:{}", host, port);
    axum::serve(listener, router).await?;
    Ok(())
}
