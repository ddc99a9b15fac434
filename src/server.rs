//! HTTP surface over [`TaskManager`].
//!
//! | Method | Path | Action |
//! |--------|------|--------|
//! | `POST`   | `/tasks` | multipart upload (`file`, optional `webhook_url`), `?describe_images=` |
//! | `GET`    | `/tasks` | list tasks |
//! | `GET`    | `/tasks/:id` | task status |
//! | `POST`   | `/tasks/:id/cancel` | cancel |
//! | `DELETE` | `/tasks/:id` | delete a finished task |
//! | `GET`    | `/tasks/:id/files/*path` | one output file |
//! | `GET`    | `/tasks/:id/download.zip` | all outputs as zip |
//! | `GET`    | `/health` | liveness |
//!
//! Errors are `{ "error": "...", "code": "..." }` with the status from
//! [`status_for`].

use crate::error::ServiceError;
use crate::manager::{TaskManager, Upload};
use crate::task::{Task, TaskId, TaskState};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::net::TcpListener;
use tracing::{error, warn};

/// Multipart framing allowance on top of `max_upload_size`.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

pub fn router(manager: TaskManager) -> Router {
    let limit = manager
        .config()
        .max_upload_size
        .saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit).get(list))
        .route("/tasks/:id", get(status).delete(delete))
        .route("/tasks/:id/cancel", post(cancel))
        .route("/tasks/:id/files/*path", get(file))
        .route("/tasks/:id/download.zip", get(download))
        .layer(DefaultBodyLimit::max(
            usize::try_from(limit).unwrap_or(usize::MAX),
        ))
        .with_state(manager)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, manager: TaskManager, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
}

pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Validation { .. } => StatusCode::BAD_REQUEST,
        ServiceError::UnsupportedType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
        ServiceError::Conflict { .. } => StatusCode::CONFLICT,
        ServiceError::Conversion { .. }
        | ServiceError::Storage { .. }
        | ServiceError::InvalidConfig(_)
        | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!("Request failed: {err}");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        let status = err.status();
        let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
            "PAYLOAD_TOO_LARGE"
        } else {
            "VALIDATION_ERROR"
        };
        Self {
            status,
            code,
            message: err.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse::<TaskId>()
        .map_err(|_| ServiceError::task_not_found(raw).into())
}

// ── Handlers ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Health {
    status: &'static str,
    descriptions: bool,
}

async fn health(State(manager): State<TaskManager>) -> Json<Health> {
    Json(Health {
        status: "ok",
        descriptions: manager.descriptions_enabled(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct SubmitParams {
    #[serde(default)]
    describe_images: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub task_id: TaskId,
    pub status: TaskState,
}

async fn submit(
    State(manager): State<TaskManager>,
    Query(params): Query<SubmitParams>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let mut upload = Upload {
        describe_images: params.describe_images,
        ..Upload::default()
    };
    let mut has_file = false;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                upload.filename = field.file_name().unwrap_or("upload").to_string();
                upload.content_type = field.content_type().unwrap_or_default().to_string();
                upload.bytes = field.bytes().await?.to_vec();
                has_file = true;
            }
            Some("webhook_url") => {
                let url = field.text().await?;
                let url = url.trim();
                if !url.is_empty() {
                    upload.webhook_url = Some(url.to_string());
                }
            }
            Some(other) => warn!("Ignoring unknown multipart field '{other}'"),
            None => {}
        }
    }

    if !has_file {
        return Err(ServiceError::Validation {
            reason: "multipart field 'file' is required".into(),
        }
        .into());
    }

    let task_id = manager.submit(upload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            task_id,
            status: TaskState::Queued,
        }),
    ))
}

async fn list(State(manager): State<TaskManager>) -> Json<Vec<Task>> {
    Json(manager.list().await)
}

async fn status(State(manager): State<TaskManager>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    Ok(Json(manager.status(parse_id(&id)?).await?))
}

async fn cancel(State(manager): State<TaskManager>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    Ok(Json(manager.cancel(parse_id(&id)?).await?))
}

async fn delete(State(manager): State<TaskManager>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    manager.delete(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn file(
    State(manager): State<TaskManager>,
    Path((id, path)): Path<(String, String)>,
) -> ApiResult<Response> {
    let bytes = manager.read_output(parse_id(&id)?, &path).await?;
    let name = path.rsplit('/').next().unwrap_or(&path);
    Ok((
        [
            (header::CONTENT_TYPE, media_type(&path).to_string()),
            (header::CONTENT_DISPOSITION, format!("inline; filename=\"{name}\"")),
        ],
        bytes,
    )
        .into_response())
}

async fn download(State(manager): State<TaskManager>, Path(id): Path<String>) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let bytes = manager.archive(id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{id}.zip\"")),
        ],
        bytes,
    )
        .into_response())
}

fn media_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("md") => "text/markdown; charset=utf-8",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
