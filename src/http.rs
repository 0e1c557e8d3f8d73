#![forbid(unsafe_code)]

//! Axum routes for the gateway.
//!
//! Handlers are thin: they validate query parameters, call into the
//! [`Gateway`] and shape the JSON envelope. Every failure that reaches a
//! caller carries `"status": "error"` so clients never parse prose. The
//! login endpoints keep their older bare `{"error": ..}` body.

use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::config::DEFAULT_RECENT_LIMIT;
use crate::error::GatewayError;
use crate::gateway::{Gateway, GatewayStatus};
use crate::session::{CodeOutcome, LoginOutcome};

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/videos/recent", get(recent_videos))
        .route("/videos/search", get(search_videos))
        .route("/videos/download/{doc_id}/{*filename}", get(download_video))
        .route("/status", get(status))
        .route("/login", get(login))
        .route("/code", get(code))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    bare: bool,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            bare: false,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            bare: false,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            bare: false,
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
            bare: false,
        }
    }

    /// `{"error": message}` instead of the status envelope.
    fn bare(mut self) -> Self {
        self.bare = true;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.bare {
            json!({ "error": self.message })
        } else {
            json!({ "status": "error", "message": self.message })
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Public video gateway is running.",
        "endpoints": {
            "/videos/recent": "Latest videos posted by the configured publishers.",
            "/videos/search?query=<query>": "Search publisher videos by caption.",
            "/videos/download/<doc_id>/<filename>": "Download a video (URL returned by /search or /recent).",
            "/status": "Session and publisher status.",
        },
        "bots_configurados": state.gateway.publishers(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct RecentParams {
    limit: Option<String>,
}

async fn recent_videos(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Json<Value> {
    let limit = params
        .limit
        .as_deref()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_RECENT_LIMIT);
    let result = state.gateway.recent(limit);
    Json(json!({
        "status": "ok",
        "message": format!("Showing the latest {} cached video(s).", result.len()),
        "result": result,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    query: Option<String>,
}

async fn search_videos(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let query = crate::search::validate_query(params.query.as_deref())
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    match state.gateway.search(query).await {
        Ok(result) => Ok(Json(json!({
            "status": "ok",
            "message": format!("Search succeeded. {} videos found for '{query}'.", result.len()),
            "query": query,
            "result": result,
        }))),
        Err(GatewayError::Timeout { duration }) => Err(ApiError::internal(format!(
            "Search timed out after {}s; matching videos may exist but were not collected in time.",
            duration.as_secs()
        ))),
        Err(GatewayError::ExternalUnavailable(reason)) => {
            warn!(query, reason = %reason, "search refused, network unavailable");
            Err(ApiError::unavailable(format!("Search unavailable: {reason}")))
        }
        Err(err) => {
            error!(query, error = %err, "search failed");
            Err(ApiError::internal(format!("Search failed: {err}")))
        }
    }
}

async fn download_video(
    State(state): State<AppState>,
    Path((doc_id, filename)): Path<(i64, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = match state.gateway.download(doc_id, &filename).await {
        Ok(path) => path,
        Err(GatewayError::NotFound(message)) => return Err(ApiError::not_found(message)),
        Err(err) => {
            error!(doc_id, error = %err, "download failed");
            return Err(ApiError::internal(format!("Internal download error: {err}")));
        }
    };
    send_attachment(path, &filename, &headers).await
}

async fn status(State(state): State<AppState>) -> Json<GatewayStatus> {
    Json(state.gateway.status().await)
}

#[derive(Debug, Default, Deserialize)]
struct LoginParams {
    phone: Option<String>,
}

async fn login(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> ApiResult<Json<LoginOutcome>> {
    let phone = params
        .phone
        .filter(|phone| !phone.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Falta parámetro phone").bare())?;
    let outcome = state
        .gateway
        .login(&phone)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
struct CodeParams {
    code: Option<String>,
}

async fn code(
    State(state): State<AppState>,
    Query(params): Query<CodeParams>,
) -> ApiResult<Json<CodeOutcome>> {
    let code = params
        .code
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Falta parámetro code").bare())?;
    match state.gateway.submit_code(&code).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(GatewayError::Validation(message)) => Err(ApiError::bad_request(message).bare()),
        Err(err) => Err(ApiError::internal(err.to_string())),
    }
}

/// Streams a downloaded file as an attachment. Honours a single
/// `Range: bytes=` request so players can seek.
async fn send_attachment(
    path: PathBuf,
    file_name: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| ByteRange::parse(value, size));

    let mut response = match range {
        Some(range) if range.start >= size => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            insert_header(&mut response, header::CONTENT_RANGE, format!("bytes */{size}"));
            return Ok(response);
        }
        Some(range) => {
            let end = range.end.min(size.saturating_sub(1));
            let length = end - range.start + 1;
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes {}-{end}/{size}", range.start),
            );
            insert_header(&mut response, header::CONTENT_LENGTH, length.to_string());
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            insert_header(&mut response, header::CONTENT_LENGTH, size.to_string());
            response
        }
    };

    insert_header(&mut response, header::ACCEPT_RANGES, "bytes".to_string());
    let mime = MimeGuess::from_path(file_name).first_or_octet_stream();
    insert_header(&mut response, header::CONTENT_TYPE, mime.to_string());
    insert_header(
        &mut response,
        header::CONTENT_DISPOSITION,
        content_disposition(file_name),
    );
    Ok(response)
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            response.headers_mut().insert(name, value);
        }
        Err(_) => warn!(header = name.as_str(), "dropping header with invalid value"),
    }
}

/// `attachment; filename="..."`, falling back to the RFC 5987 form for names
/// that are not plain printable ASCII.
fn content_disposition(file_name: &str) -> String {
    if file_name
        .chars()
        .all(|c| c.is_ascii_graphic() || c == ' ')
    {
        let escaped = file_name.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{escaped}\"")
    } else {
        format!(
            "attachment; filename*=UTF-8''{}",
            utf8_percent_encode(file_name, NON_ALPHANUMERIC)
        )
    }
}

/// Inclusive byte range from a `Range: bytes=a-b` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    fn parse(value: &str, size: u64) -> Option<Self> {
        let ranges = value.trim().strip_prefix("bytes=")?.trim();
        let (start, end) = ranges.split_once('-')?;
        let last = size.saturating_sub(1);
        if start.is_empty() {
            let suffix: u64 = end.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            return Some(Self {
                start: size.saturating_sub(suffix),
                end: last,
            });
        }
        let start: u64 = start.parse().ok()?;
        let end = if end.is_empty() { last } else { end.parse().ok()? };
        (end >= start).then_some(Self { start, end })
    }
}
