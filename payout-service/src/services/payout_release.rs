//! Penalty release for unverified drivers, and payment revert.
//!
//! Both paths require the operator to re-enter their credential; nothing in
//! the ledger is read before that check passes.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use service_core::utils::Password;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};

use crate::models::{Bonus, DebtKind, DebtStatus, DeductionSource, Payment, PaymentStatus};
use crate::services::audit::{AuditEntry, AuditSink};
use crate::services::credentials::CredentialVerifier;
use crate::services::database::{
    db_error, lock_driver, Database, BONUS_COLUMNS, PAYMENT_COLUMNS,
};
use crate::services::debt_ledger::{record_deduction, sweep_on_import};
use crate::services::metrics::record_ledger_operation;
use crate::services::reconciliation::settle_batch_if_complete;
use crate::services::tax::{self, round_money};

/// Amounts for one bonus released under penalty tax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReleasePlan {
    pub additional_tax: Decimal,
    /// Left for the driver and their debts after tax and earlier deductions.
    pub available: Decimal,
}

/// Penalty figures for a bonus that already carries `prior_deductions`.
pub fn plan_release(bonus: &Bonus, prior_deductions: Decimal) -> ReleasePlan {
    let penalty = tax::penalty(bonus.gross_payout, bonus.withholding_tax);
    ReleasePlan {
        additional_tax: penalty.additional,
        available: round_money((penalty.available - prior_deductions).max(Decimal::ZERO)),
    }
}

/// Final payout left after a revert: the standard net less the deductions the
/// bonus still carries, or unset when it carries none.
pub fn final_payout_after_revert(net_payout: Decimal, remaining_deductions: Decimal) -> Option<Decimal> {
    if remaining_deductions > Decimal::ZERO {
        Some(round_money((net_payout - remaining_deductions).max(Decimal::ZERO)))
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleasedBonus {
    pub bonus_id: i64,
    pub week_date: NaiveDate,
    pub gross_payout: Decimal,
    pub penalty_tax: Decimal,
    pub debt_deducted: Decimal,
    pub final_payout: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseResult {
    pub driver_id: String,
    pub bonuses: Vec<ReleasedBonus>,
    pub total_penalty_tax: Decimal,
    pub total_payout: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevertResult {
    pub payment_id: i64,
    pub bonus_id: i64,
    pub batch_id: String,
    pub previous_status: PaymentStatus,
    pub was_unverified_payout: bool,
    pub penalty_debts_removed: usize,
    pub final_payout: Option<Decimal>,
}

pub struct PayoutReleaser {
    db: Arc<Database>,
    audit: Arc<dyn AuditSink>,
    credentials: CredentialVerifier,
}

impl PayoutReleaser {
    pub fn new(db: Arc<Database>, audit: Arc<dyn AuditSink>, credentials: CredentialVerifier) -> Self {
        Self {
            db,
            audit,
            credentials,
        }
    }

    /// Release a Telebirr-verified but document-unverified driver's pending
    /// bonuses under 30% withholding.
    #[instrument(skip(self, password))]
    pub async fn release_unverified_payout(
        &self,
        actor_id: &str,
        password: &Password,
        driver_id: &str,
    ) -> Result<ReleaseResult, AppError> {
        self.credentials.verify(actor_id, password).await?;

        let mut uow = self.db.begin("unverified_release").await?;

        let driver = lock_driver(uow.conn(), driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Driver {} not found", driver_id)))?;

        if !driver.qualifies_for_unverified_release() {
            record_ledger_operation("unverified_release", "rejected");
            let mut reasons = Vec::new();
            if !driver.is_telebirr_verified {
                reasons.push(format!("driver {}: not Telebirr verified", driver_id));
            }
            if driver.verified {
                reasons.push(format!("driver {}: already fully verified; use the standard export", driver_id));
            }
            if driver.is_blocked {
                reasons.push(format!("driver {}: blocked", driver_id));
            }
            return Err(AppError::business_rule(
                "Driver does not qualify for unverified release",
                reasons,
            ));
        }

        let bonuses = sqlx::query_as::<_, Bonus>(&format!(
            r#"
            SELECT {} FROM bonuses
            WHERE driver_id = $1 AND payment_id IS NULL AND is_unverified_payout = FALSE
            ORDER BY week_date, bonus_id
            FOR UPDATE
            "#,
            BONUS_COLUMNS
        ))
        .bind(driver_id)
        .fetch_all(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to lock releasable bonuses"))?;

        if bonuses.is_empty() {
            record_ledger_operation("unverified_release", "rejected");
            return Err(AppError::business_rule(
                "No pending bonuses to release",
                vec![format!("driver {}: no unreleased pending bonuses", driver_id)],
            ));
        }

        let mut released = Vec::with_capacity(bonuses.len());
        for bonus in &bonuses {
            let prior = deductions_on(uow.conn(), bonus.bonus_id).await?;
            let plan = plan_release(bonus, prior);

            if plan.additional_tax > Decimal::ZERO {
                record_penalty_tax(uow.conn(), actor_id, bonus, plan.additional_tax).await?;
            }

            let applied = sweep_on_import(
                uow.conn(),
                driver_id,
                bonus.bonus_id,
                plan.available,
                DeductionSource::PenaltyRelease,
            )
            .await?;
            let debt_deducted: Decimal = applied.iter().map(|d| d.amount_deducted).sum();
            let final_payout = round_money(plan.available - debt_deducted);

            sqlx::query(
                r#"
                UPDATE bonuses
                SET final_payout = $2, force_pay = TRUE, is_unverified_payout = TRUE, penalty_tax = $3
                WHERE bonus_id = $1
                "#,
            )
            .bind(bonus.bonus_id)
            .bind(final_payout)
            .bind(plan.additional_tax)
            .execute(&mut *uow.conn())
            .await
            .map_err(db_error("Failed to mark bonus released"))?;

            released.push(ReleasedBonus {
                bonus_id: bonus.bonus_id,
                week_date: bonus.week_date,
                gross_payout: bonus.gross_payout,
                penalty_tax: plan.additional_tax,
                debt_deducted,
                final_payout,
            });
        }

        uow.commit().await?;

        let total_penalty_tax = round_money(released.iter().map(|b| b.penalty_tax).sum());
        let total_payout = round_money(released.iter().map(|b| b.final_payout).sum());
        record_ledger_operation("unverified_release", "ok");
        info!(
            bonuses = released.len(),
            penalty_tax = %total_penalty_tax,
            payout = %total_payout,
            "Unverified payout released"
        );

        self.audit
            .record(AuditEntry::new(
                actor_id,
                "payout.unverified_release",
                "driver",
                driver_id,
                json!({
                    "bonus_ids": released.iter().map(|b| b.bonus_id).collect::<Vec<_>>(),
                    "penalty_tax": total_penalty_tax,
                    "payout": total_payout,
                }),
            ))
            .await;

        Ok(ReleaseResult {
            driver_id: driver_id.to_string(),
            bonuses: released,
            total_penalty_tax,
            total_payout,
        })
    }

    /// Undo an export: the bonus returns to the pending pool and the payment
    /// disappears from its batch.
    #[instrument(skip(self, password))]
    pub async fn revert_payment(
        &self,
        actor_id: &str,
        password: &Password,
        payment_id: i64,
    ) -> Result<RevertResult, AppError> {
        self.credentials.verify(actor_id, password).await?;

        let mut uow = self.db.begin("revert_payment").await?;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE payment_id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to lock payment"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))?;

        let previous_status = payment.parsed_status();
        if previous_status == PaymentStatus::Paid {
            warn!(payment_id, "Reverting a payment already marked paid");
        }

        let bonus = sqlx::query_as::<_, Bonus>(&format!(
            "SELECT {} FROM bonuses WHERE bonus_id = $1 FOR UPDATE",
            BONUS_COLUMNS
        ))
        .bind(payment.bonus_id)
        .fetch_one(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to lock bonus"))?;

        let mut penalty_debts_removed = 0;
        let mut final_payout = bonus.final_payout;
        if bonus.is_unverified_payout {
            penalty_debts_removed = remove_penalty_debts(uow.conn(), bonus.bonus_id).await?;
            let remaining = deductions_on(uow.conn(), bonus.bonus_id).await?;
            final_payout = final_payout_after_revert(bonus.net_payout, remaining);

            sqlx::query(
                r#"
                UPDATE bonuses
                SET payment_id = NULL, final_payout = $2, force_pay = FALSE,
                    is_unverified_payout = FALSE, penalty_tax = 0
                WHERE bonus_id = $1
                "#,
            )
            .bind(bonus.bonus_id)
            .bind(final_payout)
            .execute(&mut *uow.conn())
            .await
            .map_err(db_error("Failed to reset released bonus"))?;
        } else {
            sqlx::query("UPDATE bonuses SET payment_id = NULL WHERE bonus_id = $1")
                .bind(bonus.bonus_id)
                .execute(&mut *uow.conn())
                .await
                .map_err(db_error("Failed to unlink bonus"))?;
        }

        sqlx::query("DELETE FROM payments WHERE payment_id = $1")
            .bind(payment_id)
            .execute(&mut *uow.conn())
            .await
            .map_err(db_error("Failed to delete payment"))?;

        shrink_batch(uow.conn(), &payment).await?;
        uow.commit().await?;

        record_ledger_operation("revert_payment", "ok");
        info!(
            payment_id,
            bonus_id = bonus.bonus_id,
            batch_id = %payment.batch_id,
            penalty_debts_removed,
            "Payment reverted"
        );

        self.audit
            .record(AuditEntry::new(
                actor_id,
                "payment.revert",
                "payment",
                payment_id.to_string(),
                json!({
                    "bonus_id": bonus.bonus_id,
                    "driver_id": payment.driver_id,
                    "batch_id": payment.batch_id,
                    "amount": payment.total_amount,
                    "previous_status": previous_status,
                    "was_unverified_payout": bonus.is_unverified_payout,
                    "penalty_debts_removed": penalty_debts_removed,
                }),
            ))
            .await;

        Ok(RevertResult {
            payment_id,
            bonus_id: bonus.bonus_id,
            batch_id: payment.batch_id,
            previous_status,
            was_unverified_payout: bonus.is_unverified_payout,
            penalty_debts_removed,
            final_payout,
        })
    }
}

async fn deductions_on(conn: &mut PgConnection, bonus_id: i64) -> Result<Decimal, AppError> {
    let total: Option<Decimal> = sqlx::query_scalar(
        "SELECT SUM(amount_deducted) FROM bonus_deductions WHERE bonus_id = $1",
    )
    .bind(bonus_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to sum bonus deductions"))?;
    Ok(total.unwrap_or(Decimal::ZERO))
}

/// Book the extra withholding as a settled penalty-tax debt so the bonus's
/// deduction ledger explains the lower payout.
async fn record_penalty_tax(
    conn: &mut PgConnection,
    actor_id: &str,
    bonus: &Bonus,
    additional: Decimal,
) -> Result<(), AppError> {
    let debt_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO driver_debts (driver_id, amount, remaining_amount, status, kind, reason, created_by)
        VALUES ($1, $2, 0, $3, $4, $5, $6)
        RETURNING debt_id
        "#,
    )
    .bind(&bonus.driver_id)
    .bind(additional)
    .bind(DebtStatus::Paid.as_str())
    .bind(DebtKind::PenaltyTax.as_str())
    .bind(format!("Penalty tax for unverified release of week {}", bonus.week_date))
    .bind(actor_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to record penalty tax"))?;

    record_deduction(conn, bonus.bonus_id, debt_id, additional, DeductionSource::PenaltyRelease).await
}

/// Delete the penalty-tax debts written for a bonus, with their deductions.
async fn remove_penalty_debts(conn: &mut PgConnection, bonus_id: i64) -> Result<usize, AppError> {
    let debt_ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT d.debt_id
        FROM driver_debts d
        JOIN bonus_deductions bd ON bd.debt_id = d.debt_id
        WHERE bd.bonus_id = $1 AND d.kind = 'penalty_tax'
        "#,
    )
    .bind(bonus_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to find penalty debts"))?;

    if debt_ids.is_empty() {
        return Ok(0);
    }

    sqlx::query("DELETE FROM bonus_deductions WHERE debt_id = ANY($1)")
        .bind(&debt_ids)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to delete penalty deductions"))?;

    sqlx::query("DELETE FROM driver_debts WHERE debt_id = ANY($1) AND kind = 'penalty_tax'")
        .bind(&debt_ids)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to delete penalty debts"))?;

    Ok(debt_ids.len())
}

/// Take a deleted payment out of its batch totals.
async fn shrink_batch(conn: &mut PgConnection, payment: &Payment) -> Result<(), AppError> {
    let remaining: i64 = sqlx::query_scalar(
        r#"
        UPDATE payment_batches b
        SET total_amount = GREATEST(b.total_amount - $2, 0),
            driver_count = (SELECT COUNT(DISTINCT p.driver_id) FROM payments p
                            WHERE p.batch_internal_id = b.batch_internal_id)
        WHERE b.batch_internal_id = $1
        RETURNING (SELECT COUNT(*) FROM payments p WHERE p.batch_internal_id = $1)
        "#,
    )
    .bind(payment.batch_internal_id)
    .bind(payment.total_amount)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to update batch totals"))?;

    // An emptied batch keeps its last status as a record of what was sent.
    if remaining > 0 {
        settle_batch_if_complete(conn, payment.batch_internal_id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn bonus(gross: Decimal, withholding: Decimal, net: Decimal) -> Bonus {
        Bonus {
            bonus_id: 1,
            driver_id: "D-1".to_string(),
            import_id: None,
            week_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            gross_payout: gross,
            withholding_tax: withholding,
            net_payout: net,
            final_payout: None,
            payment_id: None,
            force_pay: false,
            is_unverified_payout: false,
            penalty_tax: Decimal::ZERO,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn taxed_bonus_pays_seventy_percent() {
        let plan = plan_release(&bonus(dec!(20000.00), dec!(600.00), dec!(19400.00)), Decimal::ZERO);
        assert_eq!(plan.additional_tax, dec!(5400.00));
        assert_eq!(plan.available, dec!(14000.00));
    }

    #[test]
    fn earlier_deductions_reduce_release() {
        let plan = plan_release(&bonus(dec!(20000.00), dec!(600.00), dec!(19400.00)), dec!(2000.00));
        assert_eq!(plan.available, dec!(12000.00));
    }

    #[test]
    fn release_never_goes_negative() {
        let plan = plan_release(&bonus(dec!(20000.00), dec!(600.00), dec!(19400.00)), dec!(19400.00));
        assert_eq!(plan.available, Decimal::ZERO);
    }

    #[test]
    fn untaxed_bonus_releases_in_full() {
        let plan = plan_release(&bonus(dec!(8000.00), Decimal::ZERO, dec!(8000.00)), Decimal::ZERO);
        assert_eq!(plan.additional_tax, Decimal::ZERO);
        assert_eq!(plan.available, dec!(8000.00));
    }

    #[test]
    fn revert_keeps_real_debt_deductions_in_final_payout() {
        assert_eq!(final_payout_after_revert(dec!(19400.00), Decimal::ZERO), None);
        assert_eq!(
            final_payout_after_revert(dec!(19400.00), dec!(1000.00)),
            Some(dec!(18400.00))
        );
    }
}
