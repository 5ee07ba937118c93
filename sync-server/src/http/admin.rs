//! Administrative endpoints.
//!
//! Thin pass-throughs to the registrar, engine and history satellite. Reads
//! return JSON; removals return the removed record or 204.

use super::ApiError;
use crate::error::SyncError;
use crate::model::{Client, FileRecord, RootDirectory};
use crate::server::SyncServer;
use axum::extract::{Path, Query};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use sync_types::{ClientUuid, FileHistory, ShareLink, SyncTimestamp};

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct RootQuery {
    root: String,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    path: String,
    timestamp: u64,
}

pub async fn list_clients(
    Extension(server): Extension<Arc<SyncServer>>,
) -> ApiResult<Json<Vec<Client>>> {
    Ok(Json(server.registrar().list_clients().await?))
}

pub async fn remove_client(
    Extension(server): Extension<Arc<SyncServer>>,
    Path(uuid): Path<String>,
) -> ApiResult<StatusCode> {
    server
        .registrar()
        .disconnect(&ClientUuid::new(uuid))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_root_dirs(
    Extension(server): Extension<Arc<SyncServer>>,
) -> ApiResult<Json<Vec<RootDirectory>>> {
    Ok(Json(server.registrar().list_root_dirs().await?))
}

pub async fn remove_root_dir(
    Extension(server): Extension<Arc<SyncServer>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<StatusCode> {
    server.registrar().remove_root_dir(&query.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_files(
    Extension(server): Extension<Arc<SyncServer>>,
    Query(query): Query<RootQuery>,
) -> ApiResult<Json<Vec<FileRecord>>> {
    Ok(Json(server.registrar().list_files(&query.root).await?))
}

pub async fn remove_file(
    Extension(server): Extension<Arc<SyncServer>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<FileRecord>> {
    Ok(Json(server.engine().remove_file(&query.path).await?))
}

pub async fn list_history(
    Extension(server): Extension<Arc<SyncServer>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<Vec<FileHistory>>> {
    Ok(Json(server.history().list_history(&query.path).await?))
}

pub async fn download(
    Extension(server): Extension<Arc<SyncServer>>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<impl IntoResponse> {
    let (_, bytes) = server
        .history()
        .history_content(&query.path, SyncTimestamp::new(query.timestamp))
        .await?;
    Ok(([(CONTENT_TYPE, "application/octet-stream")], bytes))
}

pub async fn redeem_share(
    Extension(server): Extension<Arc<SyncServer>>,
    Path(link): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let link = ShareLink::from_str(&link)
        .map_err(|e| SyncError::Validation(format!("bad share link: {e}")))?;
    let (entry, bytes) = server.history().redeem_share(&link).await?;
    tracing::info!("Share {} downloaded {}@{}", link, entry.after_path, entry.timestamp);
    Ok(([(CONTENT_TYPE, "application/octet-stream")], bytes))
}
