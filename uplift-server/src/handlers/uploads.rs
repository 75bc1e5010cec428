use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use uplift_core::{
    objects::WritableLocation,
    types::{RecordId, UploadRecord},
};

use crate::{
    errors::{AppError, AppResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub record_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub record_id: RecordId,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

/// Issue a single-use writable location for `fileId`.
pub async fn generate_presigned_url(
    State(state): State<AppState>,
    payload: Result<Json<PresignRequest>, JsonRejection>,
) -> AppResult<Json<WritableLocation>> {
    let request = body(payload)?;
    let location = state.ingestion.issue_upload_target(&request.file_id)?;
    Ok(Json(location))
}

/// Record the metadata row for an uploaded file. Processing happens
/// asynchronously; the response only confirms the write.
pub async fn record_upload(
    State(state): State<AppState>,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> AppResult<Json<UploadResponse>> {
    let request = body(payload)?;
    let record_id = RecordId::new(request.record_id)?;
    let record = UploadRecord {
        id: record_id.clone(),
        attributes: request.attributes,
    };
    state.ingestion.record_upload_metadata(record).await?;
    Ok(Json(UploadResponse { record_id }))
}
