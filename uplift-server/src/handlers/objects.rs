use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use uplift_core::{objects::UploadParams, types::ObjectLocator};

use crate::{
    errors::{AppError, AppResult},
    state::AppState,
};

/// Redeem an issued location by writing the request body to `key`.
pub async fn put_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    state
        .ingestion
        .issuer()
        .redeem(&key, &params, body.to_vec(), content_type)
        .await?;
    Ok(StatusCode::CREATED)
}

pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Response> {
    let locator = ObjectLocator::new(&state.storage.bucket, key);
    let object = state
        .objects
        .get(&locator)
        .await?
        .ok_or_else(|| AppError::not_found(format!("object {locator} not found")))?;

    let content_type = object
        .meta
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], object.body).into_response())
}
