//! HTTP endpoints for rootsync-server.
//!
//! Provides health checks, Prometheus metrics, and the optional admin API.

mod admin;
pub mod health;
mod metrics;

use crate::error::SyncError;
use crate::server::SyncServer;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use sync_types::ErrorKind;

pub use health::HealthStatus;

/// Build the HTTP router with all enabled endpoints.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    let http = &server.config().http;
    let mut router = Router::new().route("/health", get(health::health_handler));

    if http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    if http.admin_enabled {
        router = router
            .route("/admin/clients", get(admin::list_clients))
            .route("/admin/clients/:uuid", delete(admin::remove_client))
            .route(
                "/admin/rootdirs",
                get(admin::list_root_dirs).delete(admin::remove_root_dir),
            )
            .route(
                "/admin/files",
                get(admin::list_files).delete(admin::remove_file),
            )
            .route("/admin/history", get(admin::list_history))
            .route("/admin/download", get(admin::download))
            .route("/share/:link", get(admin::redeem_share));
    }

    router.layer(Extension(server))
}

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Error kind, as on the wire.
    pub kind: ErrorKind,
    /// Human-readable reason.
    pub reason: String,
}

/// A [`SyncError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Validation | ErrorKind::ProtocolDecode => StatusCode::BAD_REQUEST,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if self.0.is_client_error() {
            tracing::debug!("admin request failed: {}", self.0);
        } else {
            tracing::error!("admin request failed: {}", self.0);
        }
        let body = ErrorBody {
            kind,
            reason: self.0.to_string(),
        };
        (status_for(kind), Json(body)).into_response()
    }
}
