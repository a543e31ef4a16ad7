//! Weekly bonus import handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{ImportListParams, ImportRequest};
use crate::middleware::Actor;
use crate::models::ImportLog;
use crate::services::bonus_import::ImportSummary;
use crate::startup::AppState;

pub async fn import_bonuses(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ImportSummary>), AppError> {
    payload.validate()?;

    tracing::info!(
        actor = %actor.id(),
        week_date = %payload.week_date,
        file_name = %payload.file_name,
        rows = payload.rows.len(),
        "Importing weekly bonuses"
    );

    let summary = state
        .imports
        .import(actor.id(), payload.week_date, &payload.file_name, &payload.rows)
        .await?;

    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn list_imports(
    State(state): State<AppState>,
    Query(params): Query<ImportListParams>,
) -> Result<Json<Vec<ImportLog>>, AppError> {
    let logs = state.db.list_import_logs(params.limit.unwrap_or(50)).await?;
    Ok(Json(logs))
}

pub async fn get_import(
    State(state): State<AppState>,
    Path(import_id): Path<Uuid>,
) -> Result<Json<ImportLog>, AppError> {
    let log = state
        .db
        .get_import_log(import_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Import {} not found", import_id)))?;
    Ok(Json(log))
}
