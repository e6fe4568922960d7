use std::collections::HashMap;

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use fieldpost_contract::{error_codes, fields, parse_visibility, UploadMetadata, UploadResponse};
use fieldpost_contract::{HEALTH_LIVE_PATH, UPLOAD_PATH};
use fieldpost_media::{normalize_for_storage, sniff, MediaKind, ReencodeSettings};
use fieldpost_storage::{AssetStore, NewStoredAsset, Session};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::blobs::{sanitize_filename, BlobStore};
use crate::rejection::IngestRejection;

type ApiError = (StatusCode, Json<Value>);

const BODY_LIMIT_SLACK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestLimits {
    pub max_file_bytes: usize,
    pub max_files_per_request: usize,
    pub reencode_jpeg_quality: u8,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 20 * 1024 * 1024,
            max_files_per_request: 10,
            reencode_jpeg_quality: 85,
        }
    }
}

impl IngestLimits {
    pub fn body_limit(&self) -> usize {
        self.max_file_bytes
            .saturating_mul(self.max_files_per_request.max(1))
            .saturating_add(BODY_LIMIT_SLACK)
    }

    fn reencode(&self) -> ReencodeSettings {
        ReencodeSettings {
            jpeg_quality: self.reencode_jpeg_quality.clamp(1, 100),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub assets: AssetStore,
    pub blobs: BlobStore,
    pub limits: IngestLimits,
}

impl AppState {
    pub fn new(assets: AssetStore, blobs: BlobStore, limits: IngestLimits) -> Self {
        Self {
            assets,
            blobs,
            limits,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.limits.body_limit();
    Router::new()
        .route(HEALTH_LIVE_PATH, get(health_live))
        .route("/health/ready", get(health_ready))
        .route(UPLOAD_PATH, post(post_upload))
        .route("/v1/assets/{asset_id}", get(get_asset))
        .route("/v1/owners/{owner_type}/{owner_id}/assets", get(list_owner_assets))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = match state.assets.ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "readiness probe failed");
            false
        }
    };
    let payload = Json(json!({
        "status": if ready { "ready" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339()
    }));

    if ready {
        (StatusCode::OK, payload).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, payload).into_response()
    }
}

struct Candidate {
    kind: MediaKind,
    original_name: String,
    content: Vec<u8>,
}

async fn post_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let session = authorize(&state, &headers).await?;
    let limits = state.limits;

    let mut text: HashMap<String, String> = HashMap::new();
    let mut accepted: Vec<Candidate> = Vec::new();
    let mut rejected: Vec<IngestRejection> = Vec::new();
    let mut file_parts = 0usize;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(transfer_failure(err.status(), err.body_text())),
        };
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name == fields::FILE {
            file_parts += 1;
            if file_parts > limits.max_files_per_request {
                return Err(IngestRejection::TooManyFiles {
                    limit: limits.max_files_per_request,
                }
                .into_response_parts());
            }
            match read_file_part(field, limits.max_file_bytes).await? {
                Ok(candidate) => accepted.push(candidate),
                Err(rejection) => {
                    info!(code = rejection.code(), detail = %rejection, "file part rejected");
                    rejected.push(rejection);
                }
            }
        } else {
            let value = field
                .text()
                .await
                .map_err(|err| transfer_failure(err.status(), err.body_text()))?;
            text.insert(name, value);
        }
    }

    let metadata = parse_metadata(&text).map_err(IngestRejection::into_response_parts)?;
    if file_parts == 0 {
        return Err(IngestRejection::NoFile.into_response_parts());
    }
    if accepted.is_empty() {
        let first = rejected.into_iter().next().unwrap_or(IngestRejection::NoFile);
        return Err(first.into_response_parts());
    }

    let mut ids = Vec::with_capacity(accepted.len());
    let mut failed = rejected.len();
    for candidate in accepted {
        match store_candidate(&state, &session, &metadata, candidate).await {
            Ok(id) => ids.push(id),
            Err(err) => {
                error!(error = %err, "failed to store accepted file");
                failed += 1;
            }
        }
    }

    if ids.is_empty() {
        return Err(internal_error(anyhow::anyhow!(
            "none of {failed} files could be stored"
        )));
    }

    info!(
        user_id = %session.user_id,
        owner_type = %metadata.owner_type,
        owner_id = metadata.owner_id,
        stage = %metadata.stage,
        stored = ids.len(),
        failed,
        "upload ingested"
    );
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            ids,
            failed: u32::try_from(failed).unwrap_or(u32::MAX),
        }),
    ))
}

// Outer error aborts the request, inner one rejects only this part.
async fn read_file_part(
    mut field: Field<'_>,
    max_bytes: usize,
) -> Result<Result<Candidate, IngestRejection>, ApiError> {
    let original_name = sanitize_filename(field.file_name().unwrap_or_default());
    let declared = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut content = Vec::new();
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if content.len() + chunk.len() > max_bytes {
                    return Ok(Err(IngestRejection::TooLarge { limit: max_bytes }));
                }
                content.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(err) => return Err(transfer_failure(err.status(), err.body_text())),
        }
    }

    if content.is_empty() {
        return Ok(Err(IngestRejection::Transfer("empty file part".to_string())));
    }

    let Some(kind) = sniff(&content) else {
        return Ok(Err(IngestRejection::UnsupportedMediaType { declared }));
    };

    Ok(Ok(Candidate {
        kind,
        original_name,
        content,
    }))
}

fn parse_metadata(text: &HashMap<String, String>) -> Result<UploadMetadata, IngestRejection> {
    let required = |name: &'static str| {
        text.get(name)
            .map(|value| value.trim().to_string())
            .ok_or(IngestRejection::MissingField(name))
    };

    let owner_type = required(fields::OWNER_TYPE)?;
    if owner_type.is_empty() {
        return Err(IngestRejection::InvalidField {
            field: fields::OWNER_TYPE,
            detail: "must not be empty".to_string(),
        });
    }
    let owner_id = required(fields::OWNER_ID)?
        .parse::<i64>()
        .map_err(|err| IngestRejection::InvalidField {
            field: fields::OWNER_ID,
            detail: err.to_string(),
        })?;
    let stage = required(fields::STAGE)?;
    let client_visible = match text.get(fields::CLIENT_VISIBLE) {
        Some(raw) => parse_visibility(raw)?,
        None => false,
    };

    Ok(UploadMetadata {
        owner_type,
        owner_id,
        stage,
        client_visible,
    })
}

async fn store_candidate(
    state: &AppState,
    session: &Session,
    metadata: &UploadMetadata,
    candidate: Candidate,
) -> anyhow::Result<i64> {
    let kind = candidate.kind;
    let settings = state.limits.reencode();
    let content = tokio::task::spawn_blocking(move || {
        normalize_for_storage(kind, candidate.content, &settings)
    })
    .await?;

    let key = state.blobs.put(kind, &content).await?;
    let asset = NewStoredAsset {
        owner_type: metadata.owner_type.clone(),
        owner_id: metadata.owner_id,
        stage: metadata.stage.clone(),
        storage_path: key.clone(),
        mime_type: kind.to_string(),
        original_name: candidate.original_name,
        size_bytes: i64::try_from(content.len())?,
        uploaded_by: session.user_id.clone(),
        client_visible: metadata.client_visible,
    };

    match state.assets.insert_asset(&asset).await {
        Ok(id) => Ok(id),
        Err(err) => {
            state.blobs.remove(&key).await;
            Err(err)
        }
    }
}

async fn get_asset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(asset_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers).await?;
    match state.assets.get_asset(asset_id).await.map_err(internal_error)? {
        Some(asset) => Ok(Json(asset)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": error_codes::NOT_FOUND })),
        )),
    }
}

async fn list_owner_assets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((owner_type, owner_id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers).await?;
    let assets = state
        .assets
        .list_for_owner(&owner_type, owner_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(assets))
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": error_codes::UNAUTHORIZED })),
        )
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(unauthorized)?;

    state
        .assets
        .resolve_session(token)
        .await
        .map_err(internal_error)?
        .ok_or_else(unauthorized)
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn transfer_failure(status: StatusCode, detail: String) -> ApiError {
    let rejection = if status == StatusCode::PAYLOAD_TOO_LARGE {
        (StatusCode::PAYLOAD_TOO_LARGE, error_codes::FILE_TOO_LARGE)
    } else {
        (StatusCode::BAD_REQUEST, error_codes::TRANSFER_ERROR)
    };
    info!(status = %rejection.0, detail = %detail, "upload transfer failed");
    (
        rejection.0,
        Json(json!({ "error": rejection.1, "detail": detail })),
    )
}

fn internal_error(error: anyhow::Error) -> ApiError {
    error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error_codes::INTERNAL, "detail": error.to_string() })),
    )
}
