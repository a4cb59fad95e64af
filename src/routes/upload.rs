use axum::extract::{Multipart, State};
use axum::Json;

use crate::app_state::AppState;
use crate::error::{AppError, AppResult};
use crate::models::api::UploadResponse;

/// POST /api/upload: Store an image (multipart field `file`) and return its id.
///
/// The body is streamed to disk chunk by chunk.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original = field.file_name().map(str::to_owned);
        let mut upload = state.uploads.begin(original.as_deref()).await?;

        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = upload.write_chunk(&chunk).await {
                        upload.discard().await;
                        return Err(e.into());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    upload.discard().await;
                    return Err(AppError::BadRequest(e.body_text()));
                }
            }
        }

        let stored = upload.finish().await?;
        return Ok(Json(UploadResponse {
            filename: original.unwrap_or_else(|| stored.image_id.clone()),
            image_id: stored.image_id,
            size: stored.size,
        }));
    }

    Err(AppError::BadRequest("No file uploaded".to_string()))
}
