/// API Request Handlers
/// Thin wrappers that map query parameters onto `VolumeService` calls

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{RunningContainer, TransferJob, VolumeError, VolumeService, VolumeSummary};

type AppState = State<Arc<VolumeService>>;

// ============================================================================
// Response Types
// ============================================================================

/// Error body understood by the extension UI
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub status_code: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

pub struct ApiError(VolumeError);

impl From<VolumeError> for ApiError {
    fn from(e: VolumeError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!("request rejected: {}", self.0);
        }

        let body = ErrorBody {
            message: self.0.to_string(),
            status_code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(VolumeError::invalid(format!("missing query parameter '{}'", name)).into()),
    }
}

// ============================================================================
// Query Types
// ============================================================================

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    sizes: bool,
}

#[derive(Deserialize)]
pub struct PathQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
pub struct ImageQuery {
    image: Option<String>,
}

#[derive(Deserialize)]
pub struct RunQuery {
    image: Option<String>,
    target: Option<String>,
}

#[derive(Deserialize)]
pub struct CloneQuery {
    destination: Option<String>,
}

// ============================================================================
// Volume Handlers
// ============================================================================

pub async fn health_check() -> Json<&'static str> {
    Json("ok")
}

pub async fn list_volumes(
    State(service): AppState,
    Query(query): Query<ListQuery>,
) -> ApiResult<BTreeMap<String, VolumeSummary>> {
    Ok(Json(service.list_volumes(query.sizes).await?))
}

pub async fn volume_size(State(service): AppState, Path(name): Path<String>) -> ApiResult<String> {
    Ok(Json(service.size_string(&name).await?))
}

pub async fn export_volume(
    State(service): AppState,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<TransferJob> {
    let path = required(query.path, "path")?;
    Ok(Json(service.export_volume(&name, &path).await?))
}

pub async fn import_volume(
    State(service): AppState,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<TransferJob> {
    let path = required(query.path, "path")?;
    Ok(Json(service.import_volume(&name, &path).await?))
}

pub async fn clone_volume(
    State(service): AppState,
    Path(name): Path<String>,
    Query(query): Query<CloneQuery>,
) -> ApiResult<TransferJob> {
    let destination = required(query.destination, "destination")?;
    Ok(Json(service.clone_volume(&name, &destination).await?))
}

pub async fn save_volume(
    State(service): AppState,
    Path(name): Path<String>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<TransferJob> {
    Ok(Json(service.save_volume(&name, query.image.as_deref()).await?))
}

pub async fn load_volume(
    State(service): AppState,
    Path(name): Path<String>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<TransferJob> {
    let image = required(query.image, "image")?;
    Ok(Json(service.load_volume(&name, &image).await?))
}

pub async fn transfer_volume(
    State(service): AppState,
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<TransferJob> {
    let path = required(query.path, "path")?;
    Ok(Json(service.transfer_volume(&name, &path).await?))
}

pub async fn empty_volume(State(service): AppState, Path(name): Path<String>) -> ApiResult<MessageBody> {
    service.empty_volume(&name).await?;
    Ok(Json(MessageBody {
        message: format!("volume {} emptied", name),
    }))
}

pub async fn delete_volume(State(service): AppState, Path(name): Path<String>) -> ApiResult<MessageBody> {
    service.delete_volume(&name).await?;
    Ok(Json(MessageBody {
        message: format!("volume {} deleted", name),
    }))
}

pub async fn run_container(
    State(service): AppState,
    Path(name): Path<String>,
    Query(query): Query<RunQuery>,
) -> ApiResult<RunningContainer> {
    let image = required(query.image, "image")?;
    Ok(Json(
        service
            .run_container(&name, &image, query.target.as_deref())
            .await?,
    ))
}

pub async fn not_found() -> ApiError {
    ApiError(VolumeError::NotFound("no such endpoint".to_string()))
}
