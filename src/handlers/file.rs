use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use futures::StreamExt;

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{DuplicateCleanup, FileListResponse, FileQuery, FileResponse, StorageStats};
use crate::services::FileService;
use crate::AppState;

/// Upload a file
/// POST /api/v1/files
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<FileResponse>>> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::InvalidInput(format!("Failed to process multipart: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let declared_name = field.file_name().map(|s| s.to_string()).unwrap_or_default();
        let declared_mime = field.content_type().map(|s| s.to_string());

        // The field body streams straight into the spool; the payload is
        // never held in memory.
        let source = Box::pin(field.map(|chunk| {
            chunk.map_err(|e| AppError::InvalidInput(format!("Failed to read upload: {}", e)))
        }));

        let response = FileService::upload(
            &state.db,
            state.storage.as_ref(),
            &state.config,
            source,
            &declared_name,
            declared_mime.as_deref(),
        )
        .await?;
        return Ok(Json(ApiResponse::success(response)));
    }

    Err(AppError::InvalidInput(
        "Multipart field \"file\" is required".to_string(),
    ))
}

/// List files
/// GET /api/v1/files?page=1&page_size=20&q=name
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<ApiResponse<FileListResponse>>> {
    let files = FileService::list(&state.db, &query).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Get a specific file's metadata
/// GET /api/v1/files/:id
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let file = FileService::get(&state.db, &id).await?;
    Ok(Json(ApiResponse::success(file)))
}

/// Download a file's content
/// GET /api/v1/files/:id/download
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (file, data) = FileService::download(&state.db, state.storage.as_ref(), &id).await?;

    let fallback_name = file.original_name.replace(['"', '\\'], "_");
    let encoded_name = urlencoding::encode(&file.original_name);

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.mime_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}

/// Delete a file record, reclaiming its content when unreferenced
/// DELETE /api/v1/files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    FileService::delete(&state.db, state.storage.as_ref(), &id).await?;
    Ok(Json(ApiResponse::<()>::success_message("File deleted")))
}

/// Deduplication statistics
/// GET /api/v1/stats/storage
pub async fn storage_stats(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StorageStats>>> {
    let stats = FileService::storage_stats(&state.db).await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// Remove redundant records sharing the same content
/// POST /api/v1/files/duplicates/cleanup
pub async fn cleanup_duplicates(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<DuplicateCleanup>>> {
    let cleanup = FileService::remove_duplicates(&state.db, state.storage.as_ref()).await?;
    Ok(Json(ApiResponse::success(cleanup)))
}
