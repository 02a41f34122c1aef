use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use chrono::Utc;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_db::models::NewMessage;
use parley_types::api::{FileUploadedEvent, UploadFileResponse};
use parley_types::models::{FileMetadata, MessageType};

use crate::AppState;
use crate::membership::require_member;
use crate::middleware::identity;

/// Upload ceiling, matching the client-side guard.
pub const MAX_UPLOAD_SIZE: usize = 5 * 1024 * 1024;

/// GET /groups/{groupId}/files — metadata for the group's files, newest
/// upload first.
pub async fn list_files(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = identity(&headers)?;
    require_member(&state, &group_id, &user_id).await?;

    let st = state.clone();
    let gid = group_id.clone();
    let rows = tokio::task::spawn_blocking(move || st.db.list_files(&gid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("file listing error for '{}': {}", group_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let files: Vec<FileMetadata> = rows
        .into_iter()
        .filter_map(|row| match row.into_metadata() {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("skipping corrupt file row: {}", e);
                None
            }
        })
        .collect();

    Ok(Json(files))
}

/// GET /groups/{groupId}/files/{fileId} — stream the blob back as an
/// attachment with its original filename.
pub async fn download_file(
    State(state): State<AppState>,
    Path((group_id, file_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = identity(&headers)?;
    require_member(&state, &group_id, &user_id).await?;

    let st = state.clone();
    let gid = group_id.clone();
    let row = tokio::task::spawn_blocking(move || st.db.get_file(&gid, file_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("file lookup error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let file = state.blobs.open(file_id).await.map_err(|e| {
        error!("blob {} missing from storage: {}", file_id, e);
        StatusCode::NOT_FOUND
    })?;

    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!("attachment; filename=\"{}\"", sanitize_filename(&row.name));

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

/// POST /groups/{groupId}/files — multipart upload of a raw file part or a
/// base64 `image` field, plus the filename. Stores the blob, records the
/// metadata, then announces the upload in the group's chat thread as a
/// structured event message.
pub async fn upload_file(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = identity(&headers)?;
    let appointment = require_member(&state, &group_id, &user_id).await?;

    let mut file_bytes: Option<Bytes> = None;
    let mut image_b64: Option<String> = None;
    let mut file_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let name = field.name().map(ToString::to_string);
        match name.as_deref() {
            Some("file") => {
                if file_name.is_none() {
                    if let Some(n) = field.file_name() {
                        file_name = Some(n.to_string());
                    }
                }
                file_bytes = Some(field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            Some("image") => {
                image_b64 = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            Some("filename") | Some("fileName") => {
                file_name = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            _ => {}
        }
    }

    let data: Bytes = match (file_bytes, image_b64) {
        (Some(bytes), _) => bytes,
        (None, Some(b64)) => B64
            .decode(b64.trim())
            .map(Bytes::from)
            .map_err(|_| StatusCode::BAD_REQUEST)?,
        (None, None) => return Err(StatusCode::BAD_REQUEST),
    };

    let Some(file_name) = file_name.filter(|n| !n.trim().is_empty()) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    if data.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if data.len() > MAX_UPLOAD_SIZE {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let file_id = Uuid::new_v4();
    let uploaded_at = Utc::now();

    state.blobs.write(file_id, &data).await.map_err(|e| {
        error!("blob write failed for {}: {}", file_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let event_content = serde_json::to_string(&FileUploadedEvent::new(file_id, &file_name))
        .map_err(|e| {
            error!("event serialization failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let st = state.clone();
    let gid = group_id.clone();
    let uid = user_id.clone();
    let name_for_db = file_name.clone();
    let thread_id = appointment.chat_thread_id;
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        st.db.insert_file(&gid, file_id, &name_for_db, uploaded_at)?;

        let uploader = st
            .db
            .get_user(&uid)?
            .ok_or_else(|| anyhow::anyhow!("uploader '{}' missing", uid))?;
        st.db.insert_message(&NewMessage {
            id: Uuid::new_v4(),
            thread_id,
            sender_id: uploader.chat_user_id.parse()?,
            sender_display_name: &uid,
            message_type: MessageType::Event,
            content: &event_content,
            created_on: uploaded_at,
        })?;
        Ok(())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| {
        error!("file upload bookkeeping failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!("stored file {} ({} bytes) for group '{}'", file_id, data.len(), group_id);

    Ok((
        StatusCode::CREATED,
        Json(UploadFileResponse {
            id: file_id,
            name: file_name,
            upload_date_time: uploaded_at,
        }),
    ))
}

/// Keeps the attachment filename header well-formed: no quotes, control
/// characters, or path separators.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '"' || c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_sanitized_for_the_disposition_header() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("a/b\\c\"d.txt"), "a_b_c_d.txt");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }
}
