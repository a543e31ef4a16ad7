//! Batch export handlers.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;

use crate::dtos::BatchReport;
use crate::middleware::Actor;
use crate::services::batch_export::ExportPreview;
use crate::startup::AppState;

pub async fn preview_export(State(state): State<AppState>) -> Result<Json<ExportPreview>, AppError> {
    Ok(Json(state.exports.preview().await?))
}

/// Export every eligible bonus. The body is the CSV instruction document;
/// batch details travel in headers.
pub async fn export_batch(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!(actor = %actor.id(), "Exporting payment batch");
    let result = state.exports.export(actor.id()).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&format!("attachment; filename=\"{}.csv\"", result.batch.batch_id))?,
    );
    headers.insert(
        HeaderName::from_static("x-batch-id"),
        header_value(&result.batch.batch_id)?,
    );
    headers.insert(
        HeaderName::from_static("x-batch-total"),
        header_value(&result.batch.total_amount.to_string())?,
    );
    headers.insert(
        HeaderName::from_static("x-payment-count"),
        header_value(&result.payments.len().to_string())?,
    );

    Ok((StatusCode::CREATED, headers, result.document))
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Invalid header value: {}", e)))
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchReport>, AppError> {
    let (batch, payments) = state
        .db
        .get_batch(&batch_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))?;

    Ok(Json(BatchReport::new(batch, payments)))
}
