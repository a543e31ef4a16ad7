//! Settlement reconciliation handlers.

use axum::{
    extract::{Multipart, State},
    Json,
};
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::ProcessSettlementRequest;
use crate::middleware::Actor;
use crate::services::reconciliation::{ProcessReport, ValidationReport};
use crate::startup::AppState;

/// Upload a settlement document for checking. Takes the first file field.
pub async fn validate_settlement(
    State(state): State<AppState>,
    actor: Actor,
    mut multipart: Multipart,
) -> Result<Json<ValidationReport>, AppError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Failed to read multipart field: {}", e))
        })?
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("No file uploaded")))?;

    let file_name = field.file_name().unwrap_or("settlement.csv").to_string();
    let data = field
        .bytes()
        .await
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Failed to read file bytes: {}", e)))?;

    tracing::info!(
        actor = %actor.id(),
        file_name = %file_name,
        size = data.len(),
        "Validating settlement document"
    );

    let report = state.reconciliation.validate(&file_name, &data).await?;
    Ok(Json(report))
}

pub async fn process_settlement(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<ProcessSettlementRequest>,
) -> Result<Json<ProcessReport>, AppError> {
    payload.validate()?;

    tracing::info!(
        actor = %actor.id(),
        file_token = %payload.file_token,
        "Processing settlement document"
    );

    let report = state
        .reconciliation
        .process(actor.id(), &payload.file_token)
        .await?;
    Ok(Json(report))
}
