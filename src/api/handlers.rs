use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, RpcResponse};
use crate::catalog::{CreateUserInput, CreateVideoInput, UserRecord, VideoRecord};
use crate::error::{Error, Result};
use crate::metrics;

type RpcResult<T> = std::result::Result<Json<RpcResponse<T>>, ApiError>;

/// Count the call and wrap its outcome
fn respond<T>(procedure: &str, result: Result<T>) -> RpcResult<T> {
    match result {
        Ok(data) => {
            metrics::record_catalog(procedure, "ok");
            Ok(Json(RpcResponse::new(data)))
        }
        Err(e) => {
            metrics::record_catalog(procedure, e.kind());
            Err(ApiError(e))
        }
    }
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(input)| input)
        .map_err(|e| Error::ValidationError(e.body_text()))
}

pub(super) async fn create_video(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateVideoInput>, JsonRejection>,
) -> RpcResult<VideoRecord> {
    let result = match body(payload) {
        Ok(input) => state.catalog.create_video(input).await,
        Err(e) => Err(e),
    };
    respond("video.create", result)
}

/// Same input and effect as `video.create`, used by the admin panel
pub(super) async fn admin_create_video(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateVideoInput>, JsonRejection>,
) -> RpcResult<VideoRecord> {
    let result = match body(payload) {
        Ok(input) => state.catalog.create_video(input).await,
        Err(e) => Err(e),
    };
    respond("admin.createVideo", result)
}

pub(super) async fn create_user(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateUserInput>, JsonRejection>,
) -> RpcResult<UserRecord> {
    let result = match body(payload) {
        Ok(input) => state.catalog.create_user(input).await,
        Err(e) => Err(e),
    };
    respond("user.create", result)
}

pub(super) async fn list_videos(State(state): State<AppState>) -> RpcResult<Vec<VideoRecord>> {
    respond("video.getAll", state.catalog.list_videos().await)
}

#[derive(Debug, Deserialize)]
pub(super) struct GetByIdQuery {
    id: String,
}

pub(super) async fn get_video(
    State(state): State<AppState>,
    query: std::result::Result<Query<GetByIdQuery>, QueryRejection>,
) -> RpcResult<VideoRecord> {
    let result = match query {
        Ok(Query(q)) if !q.id.trim().is_empty() => state.catalog.get_video(q.id.trim()).await,
        Ok(_) => Err(Error::ValidationError("id is required".to_string())),
        Err(e) => Err(Error::ValidationError(e.body_text())),
    };
    respond("video.getById", result)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Health {
    status: &'static str,
    version: &'static str,
    git_sha: &'static str,
    database: &'static str,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<Health> {
    let database = match state.catalog.health_check().await {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        git_sha: env!("GIT_SHA"),
        database,
    })
}

pub(super) async fn export_metrics() -> std::result::Result<impl IntoResponse, ApiError> {
    let text = metrics::encode_metrics()?;
    Ok((
        [(
            CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        text,
    ))
}
