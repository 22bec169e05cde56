//! Catalog RPC server
//!
//! Procedures are served tRPC-style: mutations as `POST /trpc/<procedure>` with a
//! JSON body, queries as `GET /trpc/<procedure>`. Successful calls answer
//! `{"result":{"data":...}}`, failures `{"error":{"code","message"}}`.

mod handlers;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::catalog::CatalogStore;
use crate::config::AppConfig;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
}

/// Success envelope
#[derive(Debug, Serialize)]
pub struct RpcResponse<T> {
    pub result: RpcData<T>,
}

#[derive(Debug, Serialize)]
pub struct RpcData<T> {
    pub data: T,
}

impl<T> RpcResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            result: RpcData { data },
        }
    }
}

/// Error wrapper turning crate errors into HTTP responses
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

fn status_of(error: &Error) -> StatusCode {
    match error {
        Error::ValidationError(_) => StatusCode::BAD_REQUEST,
        Error::NotFoundError(_) => StatusCode::NOT_FOUND,
        Error::SharedError(inner) => status_of(inner),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_of(&self.0)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = json!({
            "error": {
                "code": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/trpc/video.create", post(handlers::create_video))
        .route("/trpc/video.getAll", get(handlers::list_videos))
        .route("/trpc/video.getById", get(handlers::get_video))
        .route("/trpc/user.create", post(handlers::create_user))
        .route("/trpc/admin.createVideo", post(handlers::admin_create_video))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::export_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the catalog and serve until the process is stopped
pub async fn run_server(config: &AppConfig) -> Result<()> {
    let catalog = CatalogStore::connect(&config.database_url).await?;
    let app = router(AppState {
        catalog: Arc::new(catalog),
    });

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Catalog API listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
