use crate::assistant::{AssistantReply, AssistantRequest, run_assistant};
use crate::changes::ChangeOp;
use crate::config::ServerConfig;
use crate::errors::{AssistantUnavailable, InvalidParamsError, SessionNotFound, UploadError};
use crate::export::ExportMode;
use crate::grid::GridView;
use crate::model::{ChangeSummary, SessionId, WorkbookSummary};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;

const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = match state.config().max_upload_bytes() {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };
    Router::new()
        .route("/api/health", get(health))
        .route("/api/workbooks", post(upload_workbook))
        .route(
            "/api/workbooks/{id}",
            get(workbook_summary).delete(close_workbook),
        )
        .route("/api/workbooks/{id}/sheets/{sheet}", get(sheet_view))
        .route("/api/workbooks/{id}/active-sheet", post(switch_sheet))
        .route("/api/workbooks/{id}/cells", post(set_cell))
        .route("/api/workbooks/{id}/changes", post(apply_changes))
        .route("/api/workbooks/{id}/chat", post(chat))
        .route("/api/workbooks/{id}/export", get(export_workbook))
        .layer(body_limit)
        .with_state(state)
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    config.ensure_workspace_root()?;
    let bind = config.http_bind_address;
    let state = Arc::new(AppState::new(Arc::new(config))?);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow!("failed to bind {bind}: {e}"))?;
    tracing::info!(address = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

/// Error wrapper that picks the HTTP status from the underlying error type.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error = self.0;
        let mut body = json!({ "error": error.to_string() });

        let status = if let Some(inv) = error.downcast_ref::<InvalidParamsError>() {
            body["error"] = json!(inv.message());
            body["tool"] = json!(inv.tool());
            if let Some(path) = inv.path() {
                body["path"] = json!(path);
            }
            StatusCode::BAD_REQUEST
        } else if error.is::<SessionNotFound>() {
            StatusCode::NOT_FOUND
        } else if let Some(upload) = error.downcast_ref::<UploadError>() {
            match upload {
                UploadError::TooLarge { .. } | UploadError::OverLimit { .. } => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                _ => StatusCode::BAD_REQUEST,
            }
        } else if error.is::<AssistantUnavailable>() {
            StatusCode::SERVICE_UNAVAILABLE
        } else if error.is::<serde_json::Error>() {
            StatusCode::BAD_REQUEST
        } else {
            tracing::error!(error = ?error, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, AppError>;

async fn with_timeout<T, F>(state: &AppState, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match state.config().request_timeout() {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{} timed out after {}ms", what, limit.as_millis())),
        },
        None => fut.await,
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.session_count(),
        "assistant": state.assistant_enabled(),
    }))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: Option<String>,
}

async fn upload_workbook(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> ApiResult<WorkbookSummary> {
    let body = body.map_err(|rejection| upload_rejection(&state, rejection))?;
    let file_name = params
        .filename
        .map(|name| crate::security::sanitize_filename_component(name.trim()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "workbook.xlsx".to_string());
    let summary = state.open_session(body.to_vec(), file_name).await?;
    Ok(Json(summary))
}

/// Body-limit and read failures from the extractor, as JSON errors like everything else.
fn upload_rejection(state: &AppState, rejection: BytesRejection) -> AppError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        let limit = state.config().max_upload_bytes().unwrap_or_default();
        return UploadError::OverLimit { limit }.into();
    }
    UploadError::Unreadable(rejection.body_text()).into()
}

async fn workbook_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkbookSummary> {
    let id = SessionId(id);
    let summary = state.with_session(&id, |s| Ok(s.summary())).await?;
    Ok(Json(summary))
}

async fn close_workbook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let id = SessionId(id);
    state.close_session(&id)?;
    Ok(Json(json!({ "closed": id })))
}

async fn sheet_view(
    State(state): State<Arc<AppState>>,
    Path((id, sheet)): Path<(String, String)>,
) -> ApiResult<GridView> {
    let id = SessionId(id);
    let view = state
        .with_session(&id, move |s| s.view(Some(&sheet)))
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct SwitchSheetBody {
    sheet: String,
}

async fn switch_sheet(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SwitchSheetBody>,
) -> ApiResult<GridView> {
    let id = SessionId(id);
    let view = state
        .with_session(&id, move |s| s.switch_sheet(&body.sheet))
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct SetCellBody {
    #[serde(default)]
    sheet: Option<String>,
    cell: String,
    /// Raw text as typed; `=` starts a formula.
    input: String,
}

#[derive(Debug, Serialize)]
struct EditResponse {
    summary: ChangeSummary,
    revision: u64,
    view: GridView,
}

async fn set_cell(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetCellBody>,
) -> ApiResult<EditResponse> {
    let id = SessionId(id);
    let response = state
        .with_session(&id, move |s| {
            let summary = s.set_cell(body.sheet.as_deref(), &body.cell, &body.input)?;
            Ok(EditResponse {
                summary,
                revision: s.revision(),
                view: s.view(None)?,
            })
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ChangesBody {
    changes: Vec<ChangeOp>,
}

async fn apply_changes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ChangesBody>,
) -> ApiResult<EditResponse> {
    if body.changes.is_empty() {
        return Err(InvalidParamsError::new("apply_changes", "changes must not be empty")
            .with_path("changes")
            .into());
    }
    let id = SessionId(id);
    let response = state
        .with_session(&id, move |s| {
            let summary = s.apply_changes(&body.changes);
            Ok(EditResponse {
                summary,
                revision: s.revision(),
                view: s.view(None)?,
            })
        })
        .await?;
    Ok(Json(response))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<AssistantRequest>,
) -> ApiResult<AssistantReply> {
    if request.message.trim().is_empty() {
        return Err(InvalidParamsError::new("chat", "message must not be empty")
            .with_path("message")
            .into());
    }
    let llm = state.llm()?;
    let id = SessionId(id);
    let (workbook, active_sheet) = state
        .with_session(&id, |s| {
            Ok((s.workbook().clone(), s.active_sheet().to_string()))
        })
        .await?;

    let settings = state.config().assistant.clone();
    let mut reply = with_timeout(
        &state,
        "chat",
        run_assistant(llm.as_ref(), &workbook, &active_sheet, &request, &settings),
    )
    .await?;

    if request.auto_apply && !reply.changes.is_empty() {
        let changes = reply.changes.clone();
        let applied = state
            .with_session(&id, move |s| Ok(s.apply_changes(&changes)))
            .await?;
        reply.summary = applied;
        reply.applied = true;
    }
    Ok(Json(reply))
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    #[serde(default)]
    mode: Option<ExportMode>,
}

async fn export_workbook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ExportParams>,
) -> std::result::Result<Response, AppError> {
    let id = SessionId(id);
    let mode = params.mode.unwrap_or_default();
    let (bytes, file_name) = state
        .with_session(&id, move |s| {
            Ok((s.export(mode)?, s.file_name().to_string()))
        })
        .await?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        file_name.replace(['"', '\\'], "_")
    );
    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(XLSX_CONTENT_TYPE),
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
