//! Driver bonus and debt handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{BonusView, CreateDebtRequest, DebtWithDeductions, DriverBonusesResponse};
use crate::middleware::Actor;
use crate::models::DriverDebt;
use crate::services::debt_ledger::DebtCreated;
use crate::startup::AppState;

async fn require_driver(state: &AppState, driver_id: &str) -> Result<(), AppError> {
    state
        .db
        .get_driver(driver_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Driver {} not found", driver_id)))
}

pub async fn list_bonuses(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
) -> Result<Json<DriverBonusesResponse>, AppError> {
    require_driver(&state, &driver_id).await?;
    let bonuses = state.db.list_bonuses(&driver_id).await?;

    Ok(Json(DriverBonusesResponse {
        driver_id,
        bonuses: bonuses.into_iter().map(BonusView::from).collect(),
    }))
}

pub async fn list_debts(
    State(state): State<AppState>,
    Path(driver_id): Path<String>,
) -> Result<Json<Vec<DebtWithDeductions>>, AppError> {
    require_driver(&state, &driver_id).await?;
    let debts = state.db.list_debts(&driver_id).await?;

    Ok(Json(
        debts
            .into_iter()
            .map(|(debt, deductions)| DebtWithDeductions { debt, deductions })
            .collect(),
    ))
}

pub async fn create_debt(
    State(state): State<AppState>,
    actor: Actor,
    Path(driver_id): Path<String>,
    Json(payload): Json<CreateDebtRequest>,
) -> Result<(StatusCode, Json<DebtCreated>), AppError> {
    payload.validate()?;

    tracing::info!(
        actor = %actor.id(),
        driver_id = %driver_id,
        amount = %payload.amount,
        "Creating driver debt"
    );

    let created = state
        .debts
        .create_debt(actor.id(), &driver_id, payload.amount, &payload.reason)
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn void_debt(
    State(state): State<AppState>,
    actor: Actor,
    Path(debt_id): Path<i64>,
) -> Result<Json<DriverDebt>, AppError> {
    tracing::info!(actor = %actor.id(), debt_id, "Voiding driver debt");
    let debt = state.debts.void_debt(actor.id(), debt_id).await?;
    Ok(Json(debt))
}
