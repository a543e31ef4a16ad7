//! Batch export of eligible bonuses as payment instructions.
//!
//! One payment per bonus, never per driver. Selection, batch creation and
//! payment creation share one unit of work, so a failed precondition on any
//! row leaves nothing behind.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};

use crate::models::{BatchStatus, PaymentBatch, PaymentStatus, PendingBonus};
use crate::services::audit::{AuditEntry, AuditSink};
use crate::services::database::{db_error, Database, BATCH_COLUMNS};
use crate::services::metrics::{record_ledger_operation, record_payments_exported, DB_QUERY_DURATION};
use crate::services::tax::round_money;

const CANDIDATES_SQL: &str = r#"
    SELECT b.bonus_id, b.driver_id, d.full_name, d.phone_number, b.week_date,
           COALESCE(b.final_payout, b.net_payout) AS amount,
           d.verified, d.is_telebirr_verified, d.is_blocked, b.force_pay, b.payment_id
    FROM bonuses b
    JOIN drivers d ON d.driver_id = b.driver_id
    WHERE b.payment_id IS NULL
    ORDER BY b.driver_id, b.week_date, b.bonus_id
"#;

/// Whether a pending bonus may be exported now.
pub fn is_eligible(bonus: &PendingBonus) -> bool {
    bonus.payment_id.is_none()
        && bonus.amount > Decimal::ZERO
        && (bonus.verified || bonus.force_pay)
        && !bonus.is_blocked
        && bonus.is_telebirr_verified
}

/// `BATCH-<YYYYMMDD>-<HHMM>-<NNNNN>`, UTC.
pub fn format_batch_id(at: DateTime<Utc>, sequence: i32) -> String {
    format!("BATCH-{}-{:05}", at.format("%Y%m%d-%H%M"), sequence)
}

/// Token written into each instruction's remark so a settlement row can be
/// traced back to its bonus.
pub fn trace_token(driver_id: &str, bonus_id: i64, week_date: NaiveDate, batch_id: &str) -> String {
    format!(
        "{},{},{},{}",
        driver_id,
        bonus_id,
        week_date.format("%Y-%m-%d"),
        batch_id
    )
}

/// One line of the instruction document handed to the payment provider.
#[derive(Debug, Clone, Serialize)]
pub struct InstructionLine {
    #[serde(rename = "Phone Number")]
    pub phone_number: String,
    #[serde(rename = "Full Name")]
    pub full_name: String,
    #[serde(rename = "Amount")]
    pub amount: Decimal,
    #[serde(rename = "Remark")]
    pub remark: String,
}

pub fn render_instructions(lines: &[InstructionLine]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for line in lines {
        writer
            .serialize(line)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to write instruction: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to finish instruction document: {}", e)))
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewLine {
    pub bonus_id: i64,
    pub driver_id: String,
    pub full_name: String,
    pub week_date: NaiveDate,
    pub amount: Decimal,
    pub has_phone: bool,
    pub unverified_release: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportPreview {
    pub bonuses: Vec<PreviewLine>,
    pub total_amount: Decimal,
    pub driver_count: usize,
    /// Eligible drivers without a phone; an export would be refused.
    pub missing_phone: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedPayment {
    pub payment_id: i64,
    pub bonus_id: i64,
    pub driver_id: String,
    pub amount: Decimal,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub batch: PaymentBatch,
    pub payments: Vec<ExportedPayment>,
    #[serde(skip)]
    pub document: Vec<u8>,
}

fn summarize(eligible: &[PendingBonus]) -> (Decimal, usize) {
    let total = round_money(eligible.iter().map(|b| b.amount).sum());
    let drivers: HashSet<&str> = eligible.iter().map(|b| b.driver_id.as_str()).collect();
    (total, drivers.len())
}

fn missing_phones(eligible: &[PendingBonus]) -> Vec<String> {
    let mut missing: Vec<String> = eligible
        .iter()
        .filter(|b| b.phone_number.as_deref().map_or(true, |p| p.trim().is_empty()))
        .map(|b| b.driver_id.clone())
        .collect();
    missing.dedup();
    missing
}

pub struct BatchExportService {
    db: Arc<Database>,
    audit: Arc<dyn AuditSink>,
}

impl BatchExportService {
    pub fn new(db: Arc<Database>, audit: Arc<dyn AuditSink>) -> Self {
        Self { db, audit }
    }

    /// What an export would contain right now. Read only.
    #[instrument(skip(self))]
    pub async fn preview(&self) -> Result<ExportPreview, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["export_preview"])
            .start_timer();

        let candidates = sqlx::query_as::<_, PendingBonus>(CANDIDATES_SQL)
            .fetch_all(self.db.pool())
            .await
            .map_err(db_error("Failed to load export candidates"))?;
        timer.observe_duration();

        let eligible: Vec<PendingBonus> = candidates.into_iter().filter(is_eligible).collect();
        let (total_amount, driver_count) = summarize(&eligible);
        let missing_phone = missing_phones(&eligible);

        Ok(ExportPreview {
            bonuses: eligible
                .into_iter()
                .map(|b| PreviewLine {
                    has_phone: b.phone_number.as_deref().is_some_and(|p| !p.trim().is_empty()),
                    unverified_release: !b.verified && b.force_pay,
                    bonus_id: b.bonus_id,
                    driver_id: b.driver_id,
                    full_name: b.full_name,
                    week_date: b.week_date,
                    amount: b.amount,
                })
                .collect(),
            total_amount,
            driver_count,
            missing_phone,
        })
    }

    /// Export every eligible bonus into a new batch.
    #[instrument(skip(self))]
    pub async fn export(&self, actor_id: &str) -> Result<ExportResult, AppError> {
        let mut uow = self.db.begin("batch_export").await?;

        let candidates =
            sqlx::query_as::<_, PendingBonus>(&format!("{} FOR UPDATE OF b", CANDIDATES_SQL))
                .fetch_all(&mut *uow.conn())
                .await
                .map_err(db_error("Failed to lock export candidates"))?;

        let eligible: Vec<PendingBonus> = candidates.into_iter().filter(is_eligible).collect();
        if eligible.is_empty() {
            record_ledger_operation("batch_export", "empty");
            return Err(AppError::business_rule(
                "No eligible bonuses to export",
                Vec::new(),
            ));
        }

        let missing = missing_phones(&eligible);
        if !missing.is_empty() {
            record_ledger_operation("batch_export", "rejected");
            warn!(drivers = missing.len(), "Export aborted: drivers without phone number");
            return Err(AppError::business_rule(
                "Export aborted: eligible drivers have no phone number",
                missing
                    .into_iter()
                    .map(|driver_id| format!("driver {}: phone number missing", driver_id))
                    .collect(),
            ));
        }

        let now = Utc::now();
        let sequence = next_sequence(uow.conn(), now.date_naive()).await?;
        let batch_id = format_batch_id(now, sequence);
        let (total_amount, driver_count) = summarize(&eligible);

        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            r#"
            INSERT INTO payment_batches (batch_id, total_amount, driver_count, status, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(&batch_id)
        .bind(total_amount)
        .bind(driver_count as i32)
        .bind(BatchStatus::Processing.as_str())
        .bind(actor_id)
        .fetch_one(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to create payment batch"))?;

        let mut payments = Vec::with_capacity(eligible.len());
        let mut lines = Vec::with_capacity(eligible.len());
        let mut unverified = 0usize;
        for bonus in &eligible {
            let token = trace_token(&bonus.driver_id, bonus.bonus_id, bonus.week_date, &batch_id);
            let payment_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO payments (driver_id, bonus_id, total_amount, status, batch_id, batch_internal_id, notes)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING payment_id
                "#,
            )
            .bind(&bonus.driver_id)
            .bind(bonus.bonus_id)
            .bind(bonus.amount)
            .bind(PaymentStatus::Processing.as_str())
            .bind(&batch_id)
            .bind(batch.batch_internal_id)
            .bind(&token)
            .fetch_one(&mut *uow.conn())
            .await
            .map_err(db_error("Failed to create payment"))?;

            sqlx::query("UPDATE bonuses SET payment_id = $2 WHERE bonus_id = $1 AND payment_id IS NULL")
                .bind(bonus.bonus_id)
                .bind(payment_id)
                .execute(&mut *uow.conn())
                .await
                .map_err(db_error("Failed to link bonus to payment"))?;

            if !bonus.verified {
                unverified += 1;
            }
            lines.push(InstructionLine {
                phone_number: bonus.phone_number.clone().unwrap_or_default(),
                full_name: bonus.full_name.clone(),
                amount: bonus.amount,
                remark: token.clone(),
            });
            payments.push(ExportedPayment {
                payment_id,
                bonus_id: bonus.bonus_id,
                driver_id: bonus.driver_id.clone(),
                amount: bonus.amount,
                token,
            });
        }

        let document = render_instructions(&lines)?;
        uow.commit().await?;

        record_ledger_operation("batch_export", "ok");
        record_payments_exported("standard", payments.len() - unverified);
        record_payments_exported("unverified", unverified);
        info!(
            batch_id = %batch.batch_id,
            payments = payments.len(),
            drivers = driver_count,
            total = %total_amount,
            "Payment batch exported"
        );

        self.audit
            .record(AuditEntry::new(
                actor_id,
                "batch.export",
                "payment_batch",
                batch.batch_id.clone(),
                json!({
                    "payments": payments.len(),
                    "driver_count": driver_count,
                    "total_amount": total_amount,
                }),
            ))
            .await;

        Ok(ExportResult {
            batch,
            payments,
            document,
        })
    }
}

/// Advance the per-day batch counter. Starts at 1 each UTC day.
async fn next_sequence(conn: &mut PgConnection, day: NaiveDate) -> Result<i32, AppError> {
    sqlx::query_scalar(
        r#"
        INSERT INTO batch_sequences (sequence_date, last_value)
        VALUES ($1, 1)
        ON CONFLICT (sequence_date)
        DO UPDATE SET last_value = batch_sequences.last_value + 1
        RETURNING last_value
        "#,
    )
    .bind(day)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to advance batch sequence"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn pending() -> PendingBonus {
        PendingBonus {
            bonus_id: 42,
            driver_id: "D-7".to_string(),
            full_name: "Abebe Kebede".to_string(),
            phone_number: Some("251911000007".to_string()),
            week_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            amount: dec!(1500.00),
            verified: true,
            is_telebirr_verified: true,
            is_blocked: false,
            force_pay: false,
            payment_id: None,
        }
    }

    #[test]
    fn verified_unblocked_telebirr_driver_is_eligible() {
        assert!(is_eligible(&pending()));
    }

    #[test]
    fn force_pay_stands_in_for_verification() {
        let mut b = pending();
        b.verified = false;
        assert!(!is_eligible(&b));
        b.force_pay = true;
        assert!(is_eligible(&b));
    }

    #[test]
    fn blocked_unlinked_exported_or_zero_are_excluded() {
        let mut blocked = pending();
        blocked.is_blocked = true;
        let mut no_telebirr = pending();
        no_telebirr.is_telebirr_verified = false;
        let mut exported = pending();
        exported.payment_id = Some(9);
        let mut zero = pending();
        zero.amount = Decimal::ZERO;

        for b in [blocked, no_telebirr, exported, zero] {
            assert!(!is_eligible(&b));
        }
    }

    #[test]
    fn batch_id_pads_daily_sequence() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
        assert_eq!(format_batch_id(at, 3), "BATCH-20240309-0705-00003");
        assert_eq!(format_batch_id(at, 12345), "BATCH-20240309-0705-12345");
    }

    #[test]
    fn token_carries_four_comma_separated_parts() {
        let token = trace_token(
            "D-7",
            42,
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            "BATCH-20240309-0705-00003",
        );
        assert_eq!(token, "D-7,42,2024-03-04,BATCH-20240309-0705-00003");
    }

    #[test]
    fn summary_counts_distinct_drivers() {
        let mut second_week = pending();
        second_week.bonus_id = 43;
        second_week.amount = dec!(499.995);
        let mut other = pending();
        other.driver_id = "D-8".to_string();
        other.amount = dec!(100);

        let (total, drivers) = summarize(&[pending(), second_week, other]);
        assert_eq!(drivers, 2);
        assert_eq!(total, dec!(2100.00));
    }

    #[test]
    fn missing_phone_is_reported_once_per_driver() {
        let mut a = pending();
        a.phone_number = None;
        let mut b = a.clone();
        b.bonus_id = 43;
        let mut c = pending();
        c.driver_id = "D-8".to_string();
        c.phone_number = Some("  ".to_string());
        assert_eq!(missing_phones(&[a, b, c, pending()]), vec!["D-7", "D-8"]);
    }

    #[test]
    fn instruction_document_has_header_and_token_remark() {
        let doc = render_instructions(&[InstructionLine {
            phone_number: "251911000007".to_string(),
            full_name: "Abebe Kebede".to_string(),
            amount: dec!(1500.00),
            remark: "D-7,42,2024-03-04,BATCH-20240309-0705-00003".to_string(),
        }])
        .unwrap();
        let text = String::from_utf8(doc).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Phone Number,Full Name,Amount,Remark"));
        assert_eq!(
            lines.next(),
            Some("251911000007,Abebe Kebede,1500.00,\"D-7,42,2024-03-04,BATCH-20240309-0705-00003\"")
        );
    }
}
