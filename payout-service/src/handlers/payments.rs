//! Penalty release and revert handlers. Both require credential re-entry.

use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use service_core::utils::Password;
use validator::Validate;

use crate::dtos::CredentialRequest;
use crate::middleware::Actor;
use crate::services::payout_release::{ReleaseResult, RevertResult};
use crate::startup::AppState;

pub async fn release_unverified(
    State(state): State<AppState>,
    actor: Actor,
    Path(driver_id): Path<String>,
    Json(payload): Json<CredentialRequest>,
) -> Result<Json<ReleaseResult>, AppError> {
    payload.validate()?;

    tracing::info!(actor = %actor.id(), driver_id = %driver_id, "Releasing unverified payout");

    let result = state
        .releaser
        .release_unverified_payout(actor.id(), &Password::new(payload.password), &driver_id)
        .await?;
    Ok(Json(result))
}

pub async fn revert_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(payment_id): Path<i64>,
    Json(payload): Json<CredentialRequest>,
) -> Result<Json<RevertResult>, AppError> {
    payload.validate()?;

    tracing::info!(actor = %actor.id(), payment_id, "Reverting payment");

    let result = state
        .releaser
        .revert_payment(actor.id(), &Password::new(payload.password), payment_id)
        .await?;
    Ok(Json(result))
}
