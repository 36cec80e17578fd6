// SPDX-License-Identifier: MIT
//! REST API server.
//!
//! Endpoints:
//!   POST   /api/v1/reviews                  start (or resume) a review
//!   GET    /api/v1/reviews                  list saved reviews
//!   GET    /api/v1/reviews/{id}             fetch one saved review
//!   GET    /api/v1/reviews/{id}/events      live/replayed event stream (SSE)
//!   DELETE /api/v1/reviews/{id}             abort an in-flight review
//!   POST   /api/v1/reviews/{id}/drilldown   deep-dive one issue
//!   GET    /api/v1/health
//!
//! Starting a review whose identity (project path, head commit, status hash,
//! mode) matches an in-flight session resumes that session instead of
//! spawning a duplicate run.

pub mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::ReviewError;
use crate::git::{Git2Access, GitAccess};
use crate::model::ReviewMode;
use crate::pipeline::{Pipeline, ReviewRequest};
use crate::session::SessionIdentity;
use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/reviews", post(start_review).get(list_reviews))
        .route("/api/v1/reviews/{id}", get(get_review).delete(abort_review))
        .route("/api/v1/reviews/{id}/events", get(sse::review_events_sse))
        .route("/api/v1/reviews/{id}/drilldown", post(drilldown))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(ctx)
}

// ─── Error mapping ────────────────────────────────────────────────────────────

/// `ReviewError` → HTTP response with a stable machine-readable code.
pub struct ApiError(pub ReviewError);

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match &self.0 {
            ReviewError::ReviewNotFound(_) | ReviewError::IssueNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ReviewError::NoDiff { .. }
            | ReviewError::DiffTooLarge { .. }
            | ReviewError::FilterMatchedNothing => StatusCode::UNPROCESSABLE_ENTITY,
            ReviewError::Ai(e) if e.code == crate::ai::AiErrorCode::UnsupportedProvider => {
                StatusCode::BAD_REQUEST
            }
            ReviewError::Aborted => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": { "code": code, "message": self.0.to_string() } });
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    let body = json!({ "error": { "code": "BAD_REQUEST", "message": message.into() } });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReviewBody {
    pub project_path: String,
    pub mode: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub lenses: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReviewResponse {
    pub review_id: String,
    /// True when an identical in-flight review was joined instead of started.
    pub resumed: bool,
}

async fn start_review(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<StartReviewBody>,
) -> Result<Response, ApiError> {
    let mode: ReviewMode = match body.mode.parse() {
        Ok(m) => m,
        Err(e) => return Ok(bad_request(e)),
    };
    if body.project_path.is_empty() {
        return Ok(bad_request("projectPath is required"));
    }

    let git: Arc<dyn GitAccess> = Arc::new(Git2Access::new(&body.project_path));
    let status = git.get_status().await?;
    let identity = SessionIdentity {
        project_path: body.project_path.clone(),
        head_commit: status.head_commit.clone(),
        status_hash: status.status_hash(),
        mode,
    };

    // Same tree state, same mode, still running: hand back the existing
    // stream instead of racing a second run against it.
    if let Some(existing) = ctx.sessions.get_active_for_project(&identity).await {
        info!(review_id = %existing, "resuming in-flight review");
        return Ok(Json(StartReviewResponse {
            review_id: existing,
            resumed: true,
        })
        .into_response());
    }

    let review_id = Uuid::new_v4().to_string();
    ctx.sessions.create(&review_id, identity).await;
    let cancel = ctx.register_cancel(&review_id).await;

    let pipeline = Pipeline {
        git,
        ai: Arc::clone(&ctx.ai),
        store: Arc::clone(&ctx.store),
        sessions: Arc::clone(&ctx.sessions),
        context: Arc::clone(&ctx.context),
        review_cfg: ctx.config.review.clone(),
    };
    let request = ReviewRequest {
        project_path: body.project_path,
        mode,
        files: body.files,
        lenses: body.lenses,
        categories: body.categories,
    };
    let spawn_ctx = Arc::clone(&ctx);
    let spawn_id = review_id.clone();
    tokio::spawn(async move {
        // Outcome is delivered through the event stream; nothing to return.
        let _ = pipeline.run(&spawn_id, request, status, cancel).await;
        spawn_ctx.forget_cancel(&spawn_id).await;
    });

    Ok(Json(StartReviewResponse {
        review_id,
        resumed: false,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub project_path: Option<String>,
}

async fn list_reviews(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let reviews = ctx.store.list(query.project_path.as_deref()).await?;
    Ok(Json(json!({ "reviews": reviews })).into_response())
}

async fn get_review(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let review = ctx.store.get(&id).await?;
    Ok(Json(review).into_response())
}

async fn abort_review(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    if ctx.abort(&id).await {
        StatusCode::ACCEPTED.into_response()
    } else {
        ApiError(ReviewError::ReviewNotFound(id)).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrilldownBody {
    pub issue_id: String,
}

async fn drilldown(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<DrilldownBody>,
) -> Result<Response, ApiError> {
    // The drilldown reads the repository recorded on the saved review, not
    // whatever the caller happens to point at.
    let review = ctx.store.get(&id).await?;
    let dd = crate::drilldown::Drilldown {
        git: Arc::new(Git2Access::new(&review.metadata.project_path)),
        ai: Arc::clone(&ctx.ai),
        store: Arc::clone(&ctx.store),
    };
    let record = dd
        .analyze(&id, &body.issue_id, &tokio_util::sync::CancellationToken::new())
        .await?;
    Ok(Json(record).into_response())
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": ctx.uptime_secs(),
    }))
    .into_response()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
