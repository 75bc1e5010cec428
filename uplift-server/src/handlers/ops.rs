use axum::{Json, extract::State};
use serde_json::{Value, json};
use uplift_core::{dead_letter::DeadLetterEntry, runtime::PipelineStatus};

use crate::{errors::AppResult, state::AppState};

/// Backlog per partition plus the dead-letter count, so "still retrying"
/// can be told apart from "gave up".
pub async fn pipeline_status(
    State(state): State<AppState>,
) -> AppResult<Json<PipelineStatus>> {
    Ok(Json(state.runtime.status().await?))
}

pub async fn dead_letters(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<DeadLetterEntry>>> {
    Ok(Json(state.dead_letters.entries().await?))
}

/// The authorization graph, one line per grant or invocation edge.
pub async fn access_table(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "grants": state.authz.describe() }))
}
