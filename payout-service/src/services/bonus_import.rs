//! Weekly bonus import.
//!
//! An import is keyed by its week date. The log row walks
//! `pending -> processing -> success | partial | failed`; the unique index on
//! live statuses is the lock that keeps two imports of one week apart. All
//! validation runs before the first ledger write, and any failure rolls the
//! whole week back.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{DeductionSource, ImportStatus};
use crate::services::audit::{AuditEntry, AuditSink};
use crate::services::database::{db_error, Database};
use crate::services::debt_ledger::{set_final_payout, sweep_on_import};
use crate::services::metrics::record_import;
use crate::services::tax::{self, round_money};

/// One row of the weekly bonus source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BonusRow {
    pub driver_id: String,
    pub full_name: String,
    pub phone_number: String,
    pub week_date: NaiveDate,
    pub base_net_payout: Decimal,
}

/// A row that passed field validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRow {
    pub driver_id: String,
    pub full_name: String,
    pub phone_number: String,
    pub base_net_payout: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub import_id: Uuid,
    pub week_date: NaiveDate,
    pub status: ImportStatus,
    pub total_rows: i32,
    pub bonuses_created: i32,
    pub drivers_created: i32,
    pub rows_skipped: i32,
    pub deductions_applied: Decimal,
}

/// Normalise an Ethiopian mobile number to `251XXXXXXXXX`.
///
/// Accepts `0XXXXXXXXX`, `+251XXXXXXXXX`, `251XXXXXXXXX` and the bare nine
/// digit subscriber number, with spaces or dashes anywhere.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let subscriber = match digits.len() {
        12 if digits.starts_with("251") => &digits[3..],
        10 if digits.starts_with('0') => &digits[1..],
        9 => digits.as_str(),
        _ => return None,
    };

    // Mobile ranges start with 9 (ethio telecom) or 7 (safaricom).
    if !subscriber.starts_with('9') && !subscriber.starts_with('7') {
        return None;
    }

    Some(format!("251{}", subscriber))
}

/// Field-level checks that need no database access.
///
/// Covers empty fields, unparseable phones, a week date that differs from the
/// import's, negative payouts, and driver ids or phones repeated within the
/// file. Row numbers in violations are 1-based.
pub fn validate_rows(week_date: NaiveDate, rows: &[BonusRow]) -> Result<Vec<ValidRow>, Vec<String>> {
    let mut violations = Vec::new();
    let mut valid = Vec::with_capacity(rows.len());
    let mut seen_drivers: HashMap<String, usize> = HashMap::new();
    let mut seen_phones: HashMap<String, usize> = HashMap::new();

    for (index, row) in rows.iter().enumerate() {
        let line = index + 1;
        let driver_id = row.driver_id.trim();
        let mut ok = true;

        if driver_id.is_empty() {
            violations.push(format!("row {}: driver id is empty", line));
            ok = false;
        }
        if row.full_name.trim().is_empty() {
            violations.push(format!("row {}: full name is empty", line));
            ok = false;
        }
        if row.week_date != week_date {
            violations.push(format!(
                "row {}: week date {} does not match import week {}",
                line, row.week_date, week_date
            ));
            ok = false;
        }
        if row.base_net_payout < Decimal::ZERO {
            violations.push(format!("row {}: base net payout is negative", line));
            ok = false;
        }

        let phone = normalize_phone(&row.phone_number);
        if phone.is_none() {
            violations.push(format!(
                "row {}: phone number '{}' is not a valid mobile number",
                line, row.phone_number
            ));
            ok = false;
        }

        if !driver_id.is_empty() {
            if let Some(first) = seen_drivers.insert(driver_id.to_string(), line) {
                violations.push(format!(
                    "row {}: driver {} already appears in row {}",
                    line, driver_id, first
                ));
                ok = false;
            }
        }
        if let Some(phone) = &phone {
            if let Some(first) = seen_phones.insert(phone.clone(), line) {
                violations.push(format!(
                    "row {}: phone {} already appears in row {}",
                    line, phone, first
                ));
                ok = false;
            }
        }

        if let (true, Some(phone_number)) = (ok, phone) {
            valid.push(ValidRow {
                driver_id: driver_id.to_string(),
                full_name: row.full_name.trim().to_string(),
                phone_number,
                base_net_payout: round_money(row.base_net_payout),
            });
        }
    }

    if violations.is_empty() {
        Ok(valid)
    } else {
        Err(violations)
    }
}

pub struct BonusImportProcessor {
    db: Arc<Database>,
    audit: Arc<dyn AuditSink>,
}

impl BonusImportProcessor {
    pub fn new(db: Arc<Database>, audit: Arc<dyn AuditSink>) -> Self {
        Self { db, audit }
    }

    /// Import one week of bonuses.
    ///
    /// Returns the committed summary, or the error that marked the log failed.
    #[instrument(skip(self, rows), fields(week_date = %week_date, rows = rows.len()))]
    pub async fn import(
        &self,
        actor_id: &str,
        week_date: NaiveDate,
        file_name: &str,
        rows: &[BonusRow],
    ) -> Result<ImportSummary, AppError> {
        if rows.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Import contains no rows"
            )));
        }

        let import_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO import_logs (import_id, week_date, file_name, status, total_rows, imported_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(import_id)
        .bind(week_date)
        .bind(file_name)
        .bind(ImportStatus::Pending.as_str())
        .bind(rows.len() as i32)
        .bind(actor_id)
        .execute(self.db.pool())
        .await
        .map_err(db_error("Failed to create import log"))?;

        match self.run(import_id, week_date, rows).await {
            Ok(summary) => {
                record_import(summary.status.as_str());
                info!(
                    import_id = %import_id,
                    status = summary.status.as_str(),
                    bonuses_created = summary.bonuses_created,
                    drivers_created = summary.drivers_created,
                    rows_skipped = summary.rows_skipped,
                    "Bonus import committed"
                );
                self.audit
                    .record(AuditEntry::new(
                        actor_id,
                        "import.commit",
                        "import_log",
                        import_id.to_string(),
                        json!({
                            "week_date": week_date,
                            "file_name": file_name,
                            "status": summary.status,
                            "bonuses_created": summary.bonuses_created,
                            "drivers_created": summary.drivers_created,
                            "rows_skipped": summary.rows_skipped,
                            "deductions_applied": summary.deductions_applied,
                        }),
                    ))
                    .await;
                Ok(summary)
            }
            Err(err) => {
                record_import(ImportStatus::Failed.as_str());
                warn!(import_id = %import_id, error = %err, "Bonus import failed");
                self.mark_failed(import_id, &err).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        import_id: Uuid,
        week_date: NaiveDate,
        rows: &[BonusRow],
    ) -> Result<ImportSummary, AppError> {
        let mut uow = self.db.begin("bonus_import").await?;

        claim_week(uow.conn(), import_id, week_date).await?;

        let valid = validate_rows(week_date, rows)
            .map_err(|violations| AppError::business_rule("Import rows failed validation", violations))?;

        let (payable, skipped): (Vec<ValidRow>, Vec<ValidRow>) = valid
            .into_iter()
            .partition(|row| row.base_net_payout > Decimal::ZERO);

        let violations = check_against_ledger(uow.conn(), week_date, &payable).await?;
        if !violations.is_empty() {
            return Err(AppError::business_rule(
                "Import conflicts with existing ledger",
                violations,
            ));
        }

        let drivers_created = insert_new_drivers(uow.conn(), &payable).await?;

        let mut bonuses_created = 0;
        let mut deductions_applied = Decimal::ZERO;
        for row in &payable {
            let breakdown = tax::standard(row.base_net_payout);
            let bonus_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO bonuses (driver_id, import_id, week_date, gross_payout, withholding_tax, net_payout)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING bonus_id
                "#,
            )
            .bind(&row.driver_id)
            .bind(import_id)
            .bind(week_date)
            .bind(breakdown.gross)
            .bind(breakdown.withholding)
            .bind(breakdown.net)
            .fetch_one(&mut *uow.conn())
            .await
            .map_err(db_error("Failed to insert bonus"))?;
            bonuses_created += 1;

            let applied = sweep_on_import(
                uow.conn(),
                &row.driver_id,
                bonus_id,
                breakdown.net,
                DeductionSource::Import,
            )
            .await?;
            let deducted: Decimal = applied.iter().map(|d| d.amount_deducted).sum();
            if deducted > Decimal::ZERO {
                set_final_payout(uow.conn(), bonus_id, Some(round_money(breakdown.net - deducted)))
                    .await?;
                deductions_applied += deducted;
            }
        }

        let status = if skipped.is_empty() {
            ImportStatus::Success
        } else {
            ImportStatus::Partial
        };
        let rows_skipped = skipped.len() as i32;

        sqlx::query(
            r#"
            UPDATE import_logs
            SET status = $2, bonuses_created = $3, drivers_created = $4, rows_skipped = $5,
                error_details = $6, completed_utc = NOW()
            WHERE import_id = $1
            "#,
        )
        .bind(import_id)
        .bind(status.as_str())
        .bind(bonuses_created)
        .bind(drivers_created)
        .bind(rows_skipped)
        .bind(skipped_details(&skipped))
        .execute(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to complete import log"))?;

        uow.commit().await?;

        Ok(ImportSummary {
            import_id,
            week_date,
            status,
            total_rows: rows.len() as i32,
            bonuses_created,
            drivers_created,
            rows_skipped,
            deductions_applied: round_money(deductions_applied),
        })
    }

    /// Record why an import failed. Runs outside the rolled back unit.
    async fn mark_failed(&self, import_id: Uuid, err: &AppError) {
        let details = match err {
            AppError::BusinessRule {
                message,
                violations,
            } => json!({ "error": message, "violations": violations }),
            other => json!({ "error": other.to_string() }),
        };

        let result = sqlx::query(
            r#"
            UPDATE import_logs
            SET status = $2, error_details = $3, completed_utc = NOW()
            WHERE import_id = $1
            "#,
        )
        .bind(import_id)
        .bind(ImportStatus::Failed.as_str())
        .bind(details)
        .execute(self.db.pool())
        .await;

        if let Err(e) = result {
            error!(import_id = %import_id, error = %e, "Failed to mark import log failed");
        }
    }
}

/// Move the log to `processing`. The partial unique index on live statuses
/// rejects a second live import of the same week.
async fn claim_week(
    conn: &mut PgConnection,
    import_id: Uuid,
    week_date: NaiveDate,
) -> Result<(), AppError> {
    let existing: Option<String> = sqlx::query_scalar(
        r#"
        SELECT status FROM import_logs
        WHERE week_date = $1 AND import_id <> $2
          AND status IN ('processing', 'success', 'partial')
        LIMIT 1
        "#,
    )
    .bind(week_date)
    .bind(import_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to check import lock"))?;

    if let Some(status) = existing {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Week {} already has an import in status {}",
            week_date,
            status
        )));
    }

    sqlx::query("UPDATE import_logs SET status = $2 WHERE import_id = $1")
        .bind(import_id)
        .bind(ImportStatus::Processing.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict(
                anyhow::anyhow!("Week {} is already being imported", week_date),
            ),
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to claim import week: {}", e)),
        })?;

    Ok(())
}

/// Phone collisions with other drivers and chronology per driver.
async fn check_against_ledger(
    conn: &mut PgConnection,
    week_date: NaiveDate,
    rows: &[ValidRow],
) -> Result<Vec<String>, AppError> {
    let driver_ids: Vec<String> = rows.iter().map(|r| r.driver_id.clone()).collect();
    let phones: Vec<String> = rows.iter().map(|r| r.phone_number.clone()).collect();

    // Lock existing drivers so a concurrent debt or release waits for us.
    let _: Vec<String> = sqlx::query_scalar(
        "SELECT driver_id FROM drivers WHERE driver_id = ANY($1) ORDER BY driver_id FOR UPDATE",
    )
    .bind(&driver_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to lock drivers"))?;

    let phone_owners: Vec<(String, String)> = sqlx::query_as(
        "SELECT phone_number, driver_id FROM drivers WHERE phone_number = ANY($1)",
    )
    .bind(&phones)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to check phone ownership"))?;
    let phone_owners: HashMap<String, String> = phone_owners.into_iter().collect();

    let latest: Vec<(String, NaiveDate)> = sqlx::query_as(
        r#"
        SELECT driver_id, MAX(week_date) FROM bonuses
        WHERE driver_id = ANY($1)
        GROUP BY driver_id
        "#,
    )
    .bind(&driver_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load latest bonus dates"))?;
    let latest: HashMap<String, NaiveDate> = latest.into_iter().collect();

    Ok(ledger_violations(week_date, rows, &phone_owners, &latest))
}

fn ledger_violations(
    week_date: NaiveDate,
    rows: &[ValidRow],
    phone_owners: &HashMap<String, String>,
    latest: &HashMap<String, NaiveDate>,
) -> Vec<String> {
    let mut violations = Vec::new();
    for row in rows {
        if let Some(owner) = phone_owners.get(&row.phone_number) {
            if owner != &row.driver_id {
                violations.push(format!(
                    "driver {}: phone {} is already registered to driver {}",
                    row.driver_id, row.phone_number, owner
                ));
            }
        }
        if let Some(last) = latest.get(&row.driver_id) {
            if week_date <= *last {
                violations.push(format!(
                    "driver {}: week {} is not after latest recorded week {}",
                    row.driver_id, week_date, last
                ));
            }
        }
    }
    violations
}

async fn insert_new_drivers(conn: &mut PgConnection, rows: &[ValidRow]) -> Result<i32, AppError> {
    let mut created = 0;
    for row in rows {
        let result = sqlx::query(
            r#"
            INSERT INTO drivers (driver_id, full_name, phone_number, verified, is_telebirr_verified, is_blocked)
            VALUES ($1, $2, $3, FALSE, FALSE, FALSE)
            ON CONFLICT (driver_id) DO NOTHING
            "#,
        )
        .bind(&row.driver_id)
        .bind(&row.full_name)
        .bind(&row.phone_number)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to insert driver"))?;
        created += result.rows_affected() as i32;
    }
    Ok(created)
}

fn skipped_details(skipped: &[ValidRow]) -> Option<serde_json::Value> {
    if skipped.is_empty() {
        return None;
    }
    let drivers: Vec<&str> = skipped.iter().map(|r| r.driver_id.as_str()).collect();
    Some(json!({ "skipped_zero_payout": drivers }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn week() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn row(driver_id: &str, phone: &str, amount: Decimal) -> BonusRow {
        BonusRow {
            driver_id: driver_id.to_string(),
            full_name: format!("Driver {}", driver_id),
            phone_number: phone.to_string(),
            week_date: week(),
            base_net_payout: amount,
        }
    }

    #[test]
    fn phone_formats_normalise_to_country_code() {
        assert_eq!(normalize_phone("0911234567").as_deref(), Some("251911234567"));
        assert_eq!(normalize_phone("+251911234567").as_deref(), Some("251911234567"));
        assert_eq!(normalize_phone("251911234567").as_deref(), Some("251911234567"));
        assert_eq!(normalize_phone("911234567").as_deref(), Some("251911234567"));
        assert_eq!(normalize_phone(" 091-123 4567 ").as_deref(), Some("251911234567"));
        assert_eq!(normalize_phone("0711234567").as_deref(), Some("251711234567"));
    }

    #[test]
    fn malformed_phones_are_rejected() {
        assert_eq!(normalize_phone(""), None);
        assert_eq!(normalize_phone("09112345"), None);
        assert_eq!(normalize_phone("0111234567"), None);
        assert_eq!(normalize_phone("09112345ab"), None);
    }

    #[test]
    fn clean_rows_pass_validation() {
        let rows = vec![
            row("D-1", "0911000001", dec!(5000)),
            row("D-2", "0911000002", dec!(19400)),
        ];
        let valid = validate_rows(week(), &rows).unwrap();
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].phone_number, "251911000001");
    }

    #[test]
    fn duplicate_driver_and_phone_in_file_are_reported() {
        let rows = vec![
            row("D-1", "0911000001", dec!(100)),
            row("D-1", "0911000002", dec!(100)),
            row("D-3", "+251911000001", dec!(100)),
        ];
        let violations = validate_rows(week(), &rows).unwrap_err();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains("driver D-1 already appears in row 1"));
        assert!(violations[1].contains("phone 251911000001 already appears in row 1"));
    }

    #[test]
    fn wrong_week_and_negative_amount_are_reported() {
        let mut late = row("D-1", "0911000001", dec!(100));
        late.week_date = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
        let negative = row("D-2", "0911000002", dec!(-1));
        let violations = validate_rows(week(), &[late, negative]).unwrap_err();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].starts_with("row 1: week date"));
        assert!(violations[1].starts_with("row 2: base net payout"));
    }

    #[test]
    fn ledger_checks_flag_foreign_phone_and_stale_week() {
        let rows = validate_rows(
            week(),
            &[
                row("D-1", "0911000001", dec!(100)),
                row("D-2", "0911000002", dec!(100)),
            ],
        )
        .unwrap();

        let phone_owners = HashMap::from([
            ("251911000001".to_string(), "D-1".to_string()),
            ("251911000002".to_string(), "D-9".to_string()),
        ]);
        let latest = HashMap::from([("D-1".to_string(), week())]);

        let violations = ledger_violations(week(), &rows, &phone_owners, &latest);
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.contains("registered to driver D-9")));
        assert!(violations.iter().any(|v| v.contains("not after latest recorded week")));
    }

    #[test]
    fn own_phone_and_later_week_are_fine() {
        let rows = validate_rows(week(), &[row("D-1", "0911000001", dec!(100))]).unwrap();
        let phone_owners = HashMap::from([("251911000001".to_string(), "D-1".to_string())]);
        let latest = HashMap::from([(
            "D-1".to_string(),
            NaiveDate::from_ymd_opt(2024, 2, 26).unwrap(),
        )]);
        assert!(ledger_violations(week(), &rows, &phone_owners, &latest).is_empty());
    }

    #[test]
    fn zero_payout_rows_are_skipped_not_rejected() {
        let rows = vec![row("D-1", "0911000001", dec!(0))];
        let valid = validate_rows(week(), &rows).unwrap();
        assert_eq!(valid[0].base_net_payout, Decimal::ZERO);
    }
}
