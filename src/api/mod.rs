use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::request::Parts,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum::extract::{ConnectInfo, FromRequestParts, Query};
use chrono::{Duration as ChronoDuration, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::security::audit::{AuditAction, AuditLog, AuditQuery};
use crate::security::gatekeeper::{is_canonical_file_id, Denial, Gatekeeper};
use crate::security::throttle::{AttemptThrottle, SWEEP_INTERVAL};
use crate::store::{FileStore, FileUpdate, NewFile};

type SharedState = Arc<AppState>;

// Matches encodeURIComponent: keep unreserved marks, encode the rest
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

// Extract client IP from proxy headers, then connect info, fallback "unknown"
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
            if let Ok(s) = forwarded.to_str() {
                // Take the first IP if multiple
                let ip = s.split(',').next().unwrap_or(s).trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }
        if let Some(real_ip) = parts.headers.get("x-real-ip") {
            if let Ok(s) = real_ip.to_str() {
                let ip = s.trim().to_string();
                if !ip.is_empty() {
                    return Ok(ClientIp(ip));
                }
            }
        }

        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientIp(addr.ip().to_string()));
        }

        Ok(ClientIp("unknown".to_string()))
    }
}

#[derive(Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<FileStore>,
    pub audit: AuditLog,
    pub gatekeeper: Gatekeeper,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        Self::with_throttle(config, AttemptThrottle::new())
    }

    /// Build state with an explicit throttle policy (tests compress time).
    pub fn with_throttle(config: Arc<Config>, throttle: AttemptThrottle) -> Result<Self> {
        let store = Arc::new(FileStore::open(std::path::Path::new(&config.db_path))?);
        let audit = AuditLog::new(std::path::Path::new(&config.log_dir));
        let gatekeeper = Gatekeeper::new(
            store.clone(),
            throttle,
            audit.clone(),
            PathBuf::from(&config.upload_dir),
        );
        Ok(Self {
            config,
            store,
            audit,
            gatekeeper,
        })
    }

    fn upload_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.upload_dir)
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn deny(denial: Denial) -> ApiError {
    match denial {
        Denial::BadRequest(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        Denial::TooManyAttempts { retry_secs } => api_error(
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "Too many failed attempts. Please try again in {} minutes.",
                retry_secs.div_ceil(60)
            ),
        ),
        Denial::InvalidCredentials { just_blocked: true } => api_error(
            StatusCode::UNAUTHORIZED,
            "Too many failed attempts. Please try again later.",
        ),
        Denial::InvalidCredentials { just_blocked: false } => {
            api_error(StatusCode::UNAUTHORIZED, "Invalid file or password")
        }
        Denial::Disabled => api_error(
            StatusCode::FORBIDDEN,
            "This file has been disabled by the administrator",
        ),
        Denial::LimitReached => api_error(
            StatusCode::FORBIDDEN,
            "Download limit reached. This file is no longer available for download.",
        ),
        Denial::Internal => api_error(StatusCode::INTERNAL_SERVER_ERROR, "Download failed"),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": crate::VERSION}))
}

// ------- download --------

#[derive(Deserialize, Default)]
struct DownloadRequest {
    password: Option<String>,
}

async fn download_file(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    // Tolerate an absent or non-JSON body; it just means no password
    let password = serde_json::from_slice::<DownloadRequest>(&body)
        .unwrap_or_default()
        .password;

    let grant = state
        .gatekeeper
        .authorize(&id, password.as_deref(), &ip, user_agent)
        .await
        .map_err(deny)?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        grant
            .mime_type
            .parse()
            .unwrap_or_else(|_| header::HeaderValue::from_static("application/octet-stream")),
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        grant.file_size.to_string().parse().unwrap(),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        format!(
            "attachment; filename=\"{}\"",
            utf8_percent_encode(&grant.file_name, FILENAME_ENCODE_SET)
        )
        .parse()
        .unwrap(),
    );
    response_headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));

    let stream = ReaderStream::new(grant.file);
    Ok((StatusCode::OK, response_headers, Body::from_stream(stream)))
}

// ------- upload --------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    id: String,
    file_name: String,
    file_size: i64,
    download_url: String,
    download_url_with_password: String,
}

async fn upload_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<(String, String, Bytes)> = None;
    let mut password: Option<String> = None;
    let mut download_limit: Option<i64> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid form data: {e}"),
        )
    })? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or("unnamed").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(|e| {
                    api_error(StatusCode::BAD_REQUEST, format!("Failed to read file: {e}"))
                })?;
                file = Some((file_name, content_type, data));
            }
            Some("password") => {
                password = field.text().await.ok();
            }
            Some("downloadLimit") => {
                if let Ok(text) = field.text().await {
                    if let Ok(limit) = text.trim().parse::<i64>() {
                        if limit > 0 {
                            download_limit = Some(limit);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let Some((file_name, content_type, data)) = file else {
        return Err(api_error(StatusCode::BAD_REQUEST, "No file provided"));
    };
    let Some(password) = password.filter(|p| !p.is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "No password provided"));
    };

    let stored_name = format!("{}-{}", Uuid::new_v4(), Utc::now().timestamp_millis());
    let upload_dir = state.upload_dir();
    let stored_path = upload_dir.join(&stored_name);

    let pw = password.clone();
    let password_hash =
        match tokio::task::spawn_blocking(move || bcrypt::hash(pw, bcrypt::DEFAULT_COST)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                error!("password hashing failed: {e}");
                return Err(api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to upload file",
                ));
            }
            Err(e) => {
                error!("password hashing task failed: {e}");
                return Err(api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to upload file",
                ));
            }
        };

    let file_size = data.len() as i64;
    let write_result = async {
        tokio::fs::create_dir_all(&upload_dir).await?;
        tokio::fs::write(&stored_path, &data).await
    }
    .await;
    if let Err(e) = write_result {
        error!("failed to write uploaded blob: {e}");
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to upload file",
        ));
    }

    let record = state
        .store
        .insert(NewFile {
            original_name: file_name,
            stored_name,
            password_hash,
            file_size,
            mime_type: content_type,
            download_limit,
        })
        .map_err(|e| {
            error!("failed to insert file record: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to upload file")
        })?;

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let download_url = format!("http://{host}/download/{}", record.id);
    let download_url_with_password = format!(
        "{download_url}?pwd={}",
        utf8_percent_encode(&password, FILENAME_ENCODE_SET)
    );

    info!(file_id = %record.id, size = file_size, "file uploaded");

    Ok(Json(UploadResponse {
        success: true,
        id: record.id,
        file_name: record.original_name,
        file_size: record.file_size,
        download_url,
        download_url_with_password,
    }))
}

// ------- public file info --------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileInfoResponse {
    id: String,
    file_name: String,
    file_size: i64,
    mime_type: String,
    download_count: i64,
    download_limit: Option<i64>,
    limit_reached: bool,
    created_at: chrono::DateTime<Utc>,
}

async fn file_info(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<FileInfoResponse>, ApiError> {
    if !is_canonical_file_id(&id) {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid file ID format"));
    }

    let record = state
        .store
        .get(&id)
        .map_err(|e| {
            error!("file info lookup failed: {e:#}");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to get file information",
            )
        })?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "File not found"))?;

    if !record.is_enabled {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "This file has been disabled",
        ));
    }

    Ok(Json(FileInfoResponse {
        limit_reached: record.limit_reached(),
        id: record.id,
        file_name: record.original_name,
        file_size: record.file_size,
        mime_type: record.mime_type,
        download_count: record.download_count,
        download_limit: record.download_limit,
        created_at: record.created_at,
    }))
}

// ------- admin: files --------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminFileEntry {
    id: String,
    file_name: String,
    file_size: i64,
    mime_type: String,
    download_count: i64,
    download_limit: Option<i64>,
    is_enabled: bool,
    created_at: chrono::DateTime<Utc>,
}

async fn list_files(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let files = state.store.list().map_err(|e| {
        error!("failed to fetch files: {e:#}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch files")
    })?;

    let files: Vec<AdminFileEntry> = files
        .into_iter()
        .map(|r| AdminFileEntry {
            id: r.id,
            file_name: r.original_name,
            file_size: r.file_size,
            mime_type: r.mime_type,
            download_count: r.download_count,
            download_limit: r.download_limit,
            is_enabled: r.is_enabled,
            created_at: r.created_at,
        })
        .collect();

    Ok(Json(json!({ "files": files })))
}

// Distinguishes an absent field from an explicit null
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateFileRequest {
    is_enabled: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    download_limit: Option<Option<i64>>,
    new_password: Option<String>,
}

async fn update_file(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut update = FileUpdate {
        is_enabled: req.is_enabled,
        download_limit: req.download_limit,
        password_hash: None,
    };

    if let Some(new_password) = &req.new_password {
        let pw = new_password.clone();
        update.password_hash =
            match tokio::task::spawn_blocking(move || bcrypt::hash(pw, bcrypt::DEFAULT_COST)).await
            {
                Ok(Ok(hash)) => Some(hash),
                _ => {
                    return Err(api_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to update file",
                    ))
                }
            };
    }

    if update.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No fields to update"));
    }

    let record = state
        .store
        .update(&id, &update)
        .map_err(|e| {
            error!("failed to update file: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update file")
        })?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "File not found"))?;

    let mut response = json!({
        "success": true,
        "file": {
            "id": record.id,
            "isEnabled": record.is_enabled,
            "downloadLimit": record.download_limit,
        }
    });
    if let Some(new_password) = req.new_password {
        response["newPassword"] = json!(new_password);
    }

    Ok(Json(response))
}

async fn delete_file(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_canonical_file_id(&id) {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid file ID format"));
    }

    let stored_name = state
        .store
        .delete(&id)
        .map_err(|e| {
            error!("failed to delete file: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete file")
        })?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "File not found"))?;

    let blob_path = state.upload_dir().join(stored_name);
    if let Err(e) = tokio::fs::remove_file(&blob_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("failed to remove blob {}: {}", blob_path.display(), e);
        }
    }

    info!(file_id = %id, "file deleted");
    Ok(Json(json!({"success": true, "message": "File deleted"})))
}

// ------- admin: logs --------

#[derive(Deserialize)]
struct LogsQueryParams {
    limit: Option<usize>,
    #[serde(rename = "fileId")]
    file_id: Option<String>,
}

async fn get_logs(
    State(state): State<SharedState>,
    Query(params): Query<LogsQueryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state
        .audit
        .query(&AuditQuery {
            file_id: params.file_id,
            limit: params.limit.unwrap_or(100),
        })
        .await
        .map_err(|e| {
            error!("failed to read logs: {e:#}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read logs")
        })?;

    Ok(Json(json!({ "logs": logs })))
}

// ------- admin: stats --------

async fn get_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats_error = |e: anyhow::Error| {
        error!("stats error: {e:#}");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to load statistics",
        )
    };

    let overview = state.store.overview().map_err(stats_error)?;
    let file_types = state.store.file_types().map_err(stats_error)?;
    let top_files = state.store.top_files(5).map_err(stats_error)?;

    // Success rate over the last 30 days of attempt history
    let logs = state
        .audit
        .query(&AuditQuery {
            file_id: None,
            limit: usize::MAX,
        })
        .await
        .map_err(stats_error)?;
    let cutoff = Utc::now() - ChronoDuration::days(30);
    let mut success_count: u64 = 0;
    let mut failed_count: u64 = 0;
    for entry in logs.iter().filter(|e| e.timestamp >= cutoff) {
        match entry.action {
            AuditAction::Success => success_count += 1,
            AuditAction::Failed => failed_count += 1,
            _ => {}
        }
    }
    let total_attempts = success_count + failed_count;
    let success_rate = if total_attempts > 0 {
        (success_count * 100 + total_attempts / 2) / total_attempts
    } else {
        100
    };

    Ok(Json(json!({
        "overview": overview,
        "charts": {
            "fileTypes": file_types,
            "successRate": success_rate,
            "totalAttempts": total_attempts,
        },
        "topFiles": top_files,
    })))
}

// ------- router --------

pub fn create_router(state: SharedState) -> Router {
    let max_upload = state.config.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/api/upload", post(upload_file))
        .route("/api/files/{id}", get(file_info))
        .route("/api/download/{id}", post(download_file))
        .route("/api/admin/files", get(list_files))
        .route(
            "/api/admin/files/{id}",
            axum::routing::patch(update_file).delete(delete_file),
        )
        .route("/api/admin/logs", get(get_logs))
        .route("/api/admin/stats", get(get_stats))
        .layer(DefaultBodyLimit::max(max_upload))
        .with_state(state)
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(Arc::new(config))?);

    // Recurring cleanup of stale throttle entries, tied to server lifetime
    let sweeper = state.gatekeeper.throttle().spawn_sweeper(SWEEP_INTERVAL);

    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;

    sweeper.abort();
    Ok(())
}
