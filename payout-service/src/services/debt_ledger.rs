//! Debt ledger: one active debt per driver, swept FIFO against bonuses.
//!
//! Two directions exist. Creating a debt sweeps it across the driver's
//! pending bonuses, earliest week first. Importing a bonus sweeps that bonus
//! across the driver's active debts, oldest first. Both run inside the unit of
//! work of the event that triggered them and are not meant to be replayed on
//! their own.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};

use crate::models::{DebtKind, DebtStatus, DeductionSource, DriverDebt};
use crate::services::audit::{AuditEntry, AuditSink};
use crate::services::database::{
    db_error, lock_active_debts, lock_driver, lock_pending_bonuses, Database, DEBT_COLUMNS,
};
use crate::services::metrics::record_ledger_operation;
use crate::services::tax::round_money;

/// Split `supply` across `demands` in order.
///
/// Returns the amount taken by each demand. Stops once the supply is used up;
/// later demands get zero. Non-positive demands take nothing.
pub fn fifo_allocate(supply: Decimal, demands: &[Decimal]) -> Vec<Decimal> {
    let mut left = round_money(supply.max(Decimal::ZERO));
    demands
        .iter()
        .map(|demand| {
            let take = if *demand > Decimal::ZERO {
                round_money(left.min(*demand))
            } else {
                Decimal::ZERO
            };
            left -= take;
            take
        })
        .collect()
}

/// A deduction written by a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedDeduction {
    pub bonus_id: i64,
    pub debt_id: i64,
    pub week_date: Option<NaiveDate>,
    pub amount_deducted: Decimal,
    pub final_payout: Option<Decimal>,
}

/// Result of creating a debt and sweeping it retroactively.
#[derive(Debug, Clone, Serialize)]
pub struct DebtCreated {
    pub debt: DriverDebt,
    pub deductions: Vec<AppliedDeduction>,
}

pub struct DebtLedger {
    db: Arc<Database>,
    audit: Arc<dyn AuditSink>,
}

impl DebtLedger {
    pub fn new(db: Arc<Database>, audit: Arc<dyn AuditSink>) -> Self {
        Self { db, audit }
    }

    /// Open a debt for a driver and immediately recover what it can from the
    /// driver's pending bonuses.
    ///
    /// Refused while any of the driver's payments is still processing, or
    /// while another debt is active.
    #[instrument(skip(self, reason), fields(driver_id = %driver_id, amount = %amount))]
    pub async fn create_debt(
        &self,
        actor_id: &str,
        driver_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<DebtCreated, AppError> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Debt amount must be positive"
            )));
        }
        if reason.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Debt reason is required"
            )));
        }

        let mut uow = self.db.begin("create_debt").await?;

        lock_driver(uow.conn(), driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Driver {} not found", driver_id)))?;

        let processing: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM payments WHERE driver_id = $1 AND status = 'processing')",
        )
        .bind(driver_id)
        .fetch_one(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to check processing payments"))?;

        if processing {
            record_ledger_operation("create_debt", "rejected");
            warn!("Debt refused: driver has a processing payment");
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Driver {} has a payment in processing; reconcile or revert it first",
                driver_id
            )));
        }

        if !lock_active_debts(uow.conn(), driver_id).await?.is_empty() {
            record_ledger_operation("create_debt", "rejected");
            warn!("Debt refused: driver already has an active debt");
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Driver {} already has an active debt",
                driver_id
            )));
        }

        let debt = sqlx::query_as::<_, DriverDebt>(&format!(
            r#"
            INSERT INTO driver_debts (driver_id, amount, remaining_amount, status, kind, reason, created_by)
            VALUES ($1, $2, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            DEBT_COLUMNS
        ))
        .bind(driver_id)
        .bind(amount)
        .bind(DebtStatus::Active.as_str())
        .bind(DebtKind::Standard.as_str())
        .bind(reason.trim())
        .bind(actor_id)
        .fetch_one(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to create debt"))?;

        let pending = lock_pending_bonuses(uow.conn(), driver_id).await?;
        let available: Vec<Decimal> = pending.iter().map(|b| b.available()).collect();
        let allocation = fifo_allocate(debt.remaining_amount, &available);

        let mut deductions = Vec::new();
        let mut recovered = Decimal::ZERO;
        for ((bonus, available), deducted) in pending.iter().zip(&available).zip(allocation) {
            if deducted <= Decimal::ZERO {
                continue;
            }
            let final_payout = round_money(*available - deducted);
            record_deduction(
                uow.conn(),
                bonus.bonus_id,
                debt.debt_id,
                deducted,
                DeductionSource::DebtCreated,
            )
            .await?;
            set_final_payout(uow.conn(), bonus.bonus_id, Some(final_payout)).await?;
            recovered += deducted;
            deductions.push(AppliedDeduction {
                bonus_id: bonus.bonus_id,
                debt_id: debt.debt_id,
                week_date: Some(bonus.week_date),
                amount_deducted: deducted,
                final_payout: Some(final_payout),
            });
        }

        let debt = apply_to_debt(uow.conn(), &debt, recovered).await?;
        uow.commit().await?;

        record_ledger_operation("create_debt", "ok");
        info!(
            debt_id = debt.debt_id,
            recovered = %recovered,
            remaining = %debt.remaining_amount,
            bonuses_swept = deductions.len(),
            "Debt created"
        );

        self.audit
            .record(AuditEntry::new(
                actor_id,
                "debt.create",
                "driver_debt",
                debt.debt_id.to_string(),
                json!({
                    "driver_id": driver_id,
                    "amount": amount,
                    "recovered": recovered,
                    "remaining_amount": debt.remaining_amount,
                    "reason": debt.reason,
                }),
            ))
            .await;

        Ok(DebtCreated { debt, deductions })
    }

    /// Write off the rest of an active debt. Deductions already recorded stay
    /// in place.
    #[instrument(skip(self))]
    pub async fn void_debt(&self, actor_id: &str, debt_id: i64) -> Result<DriverDebt, AppError> {
        let mut uow = self.db.begin("void_debt").await?;

        let debt = sqlx::query_as::<_, DriverDebt>(&format!(
            "SELECT {} FROM driver_debts WHERE debt_id = $1 FOR UPDATE",
            DEBT_COLUMNS
        ))
        .bind(debt_id)
        .fetch_optional(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to lock debt"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Debt {} not found", debt_id)))?;

        if debt.parsed_status() != DebtStatus::Active || debt.parsed_kind() != DebtKind::Standard {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Only active debts can be voided (debt {} is {})",
                debt_id,
                debt.status
            )));
        }

        let voided = sqlx::query_as::<_, DriverDebt>(&format!(
            r#"
            UPDATE driver_debts SET status = $2, updated_utc = NOW()
            WHERE debt_id = $1
            RETURNING {}
            "#,
            DEBT_COLUMNS
        ))
        .bind(debt_id)
        .bind(DebtStatus::Void.as_str())
        .fetch_one(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to void debt"))?;

        uow.commit().await?;
        record_ledger_operation("void_debt", "ok");
        info!(debt_id, written_off = %voided.remaining_amount, "Debt voided");

        self.audit
            .record(AuditEntry::new(
                actor_id,
                "debt.void",
                "driver_debt",
                debt_id.to_string(),
                json!({
                    "driver_id": voided.driver_id,
                    "written_off": voided.remaining_amount,
                }),
            ))
            .await;

        Ok(voided)
    }
}

/// Sweep a freshly computed bonus amount across the driver's active debts.
///
/// Returns the total deducted; the caller owns the bonus row and decides what
/// to store as its final payout.
pub(crate) async fn sweep_on_import(
    conn: &mut PgConnection,
    driver_id: &str,
    bonus_id: i64,
    amount: Decimal,
    source: DeductionSource,
) -> Result<Vec<AppliedDeduction>, AppError> {
    let debts = lock_active_debts(conn, driver_id).await?;
    if debts.is_empty() || amount <= Decimal::ZERO {
        return Ok(Vec::new());
    }

    let remaining: Vec<Decimal> = debts.iter().map(|d| d.remaining_amount).collect();
    let allocation = fifo_allocate(amount, &remaining);

    let mut applied = Vec::new();
    for (debt, deducted) in debts.iter().zip(allocation) {
        if deducted <= Decimal::ZERO {
            continue;
        }
        record_deduction(conn, bonus_id, debt.debt_id, deducted, source).await?;
        apply_to_debt(conn, debt, deducted).await?;
        applied.push(AppliedDeduction {
            bonus_id,
            debt_id: debt.debt_id,
            week_date: None,
            amount_deducted: deducted,
            final_payout: None,
        });
    }

    Ok(applied)
}

pub(crate) async fn record_deduction(
    conn: &mut PgConnection,
    bonus_id: i64,
    debt_id: i64,
    amount: Decimal,
    source: DeductionSource,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO bonus_deductions (bonus_id, debt_id, amount_deducted, source)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(bonus_id)
    .bind(debt_id)
    .bind(amount)
    .bind(source.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to record deduction"))?;
    Ok(())
}

/// Reduce a debt's remaining balance and settle its status.
pub(crate) async fn apply_to_debt(
    conn: &mut PgConnection,
    debt: &DriverDebt,
    deducted: Decimal,
) -> Result<DriverDebt, AppError> {
    let remaining = round_money((debt.remaining_amount - deducted).max(Decimal::ZERO));
    sqlx::query_as::<_, DriverDebt>(&format!(
        r#"
        UPDATE driver_debts
        SET remaining_amount = $2, status = $3, updated_utc = NOW()
        WHERE debt_id = $1
        RETURNING {}
        "#,
        DEBT_COLUMNS
    ))
    .bind(debt.debt_id)
    .bind(remaining)
    .bind(DebtStatus::for_remaining(remaining).as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to update debt balance"))
}

pub(crate) async fn set_final_payout(
    conn: &mut PgConnection,
    bonus_id: i64,
    final_payout: Option<Decimal>,
) -> Result<(), AppError> {
    sqlx::query("UPDATE bonuses SET final_payout = $2 WHERE bonus_id = $1")
        .bind(bonus_id)
        .bind(final_payout)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to update final payout"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn debt_sweeps_earliest_bonus_first() {
        // 3,000 against two 2,000 bonuses.
        let taken = fifo_allocate(dec!(3000), &[dec!(2000), dec!(2000)]);
        assert_eq!(taken, vec![dec!(2000), dec!(1000)]);
    }

    #[test]
    fn supply_larger_than_demands_leaves_remainder_untouched() {
        let taken = fifo_allocate(dec!(5000), &[dec!(1200.50), dec!(800)]);
        assert_eq!(taken, vec![dec!(1200.50), dec!(800)]);
        let used: Decimal = taken.iter().sum();
        assert_eq!(dec!(5000) - used, dec!(2999.50));
    }

    #[test]
    fn exhausted_supply_gives_zero_to_later_demands() {
        let taken = fifo_allocate(dec!(100), &[dec!(100), dec!(50), dec!(25)]);
        assert_eq!(taken, vec![dec!(100), dec!(0), dec!(0)]);
    }

    #[test]
    fn zero_and_negative_demands_take_nothing() {
        let taken = fifo_allocate(dec!(100), &[dec!(0), dec!(-10), dec!(40)]);
        assert_eq!(taken, vec![dec!(0), dec!(0), dec!(40)]);
    }

    #[test]
    fn no_supply_allocates_nothing() {
        assert_eq!(fifo_allocate(Decimal::ZERO, &[dec!(10)]), vec![dec!(0)]);
        assert!(fifo_allocate(dec!(10), &[]).is_empty());
    }
}
