use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use savor_types::api::{Claims, Envelope, UploadResponse};

use crate::auth::{AppState, with_db};
use crate::error::ApiError;

/// 50 MB upload limit for media
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

const BUCKETS: &[&str] = &["media", "avatars"];

/// PUT /storage/{bucket}/{file_name} — raw bytes in, storage path out.
///
/// Objects are content addressed: `{bucket}/{user_id}/{sha256}.{ext}`, so
/// re-uploading the same bytes yields the same path.
pub async fn upload(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((bucket, file_name)): Path<(String, String)>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if !BUCKETS.contains(&bucket.as_str()) {
        return Err(ApiError::NotFound("Bucket"));
    }
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("File is empty".to_string()));
    }
    if bytes.len() > MAX_FILE_SIZE {
        return Err(ApiError::PayloadTooLarge);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let ext = extension(&file_name).ok_or_else(|| {
        ApiError::BadRequest("File name needs an extension".to_string())
    })?;

    let digest = hex::encode(Sha256::digest(&bytes));
    let path = format!("{}/{}/{}.{}", bucket, claims.sub, digest, ext);

    let dir = state.storage_dir.join(&bucket).join(claims.sub.to_string());
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        error!("Failed to create storage directory {}: {}", dir.display(), e);
        ApiError::Internal(e.into())
    })?;

    let file_path = state.storage_dir.join(&path);
    let mut file = tokio::fs::File::create(&file_path).await.map_err(|e| {
        error!("Failed to create file {}: {}", file_path.display(), e);
        ApiError::Internal(e.into())
    })?;
    file.write_all(&bytes).await.map_err(|e| {
        error!("Failed to write file {}: {}", file_path.display(), e);
        ApiError::Internal(e.into())
    })?;

    let size = bytes.len() as i64;
    let owner = claims.sub.to_string();
    let stored = path.clone();
    with_db(&state, move |db| {
        db.insert_file(&stored, &owner, &bucket, &content_type, size)
    })
    .await?;

    info!("Stored {} ({} bytes)", path, size);
    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok(UploadResponse {
            path,
            size: size as u64,
        })),
    ))
}

/// Lowercased extension of `file_name`, limited to plain alphanumerics so it
/// is safe to splice into a path.
fn extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ok = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then(|| ext.to_ascii_lowercase())
}
