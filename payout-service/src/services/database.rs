//! Database service for payout-service.

use crate::models::{
    Bonus, BonusDeduction, Driver, DriverDebt, ImportLog, Payment, PaymentBatch,
};
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// One ledger mutation's transaction.
///
/// Enclosed operations borrow the connection through [`UnitOfWork::conn`].
/// `commit` consumes the unit; dropping it on any other path rolls back.
pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
    operation: &'static str,
}

impl UnitOfWork {
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), AppError> {
        let operation = self.operation;
        self.tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to commit {}: {}",
                operation,
                e
            ))
        })?;
        debug!(operation, "Unit of work committed");
        Ok(())
    }
}

/// Wrap an sqlx error with a short description of what was attempted.
pub(crate) fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

pub(crate) const DRIVER_COLUMNS: &str = "driver_id, full_name, phone_number, verified, is_telebirr_verified, is_blocked, created_utc, updated_utc";

pub(crate) const BONUS_COLUMNS: &str = "bonus_id, driver_id, import_id, week_date, gross_payout, withholding_tax, net_payout, final_payout, payment_id, force_pay, is_unverified_payout, penalty_tax, created_utc";

pub(crate) const DEBT_COLUMNS: &str = "debt_id, driver_id, amount, remaining_amount, status, kind, reason, created_by, created_utc, updated_utc";

pub(crate) const PAYMENT_COLUMNS: &str = "payment_id, driver_id, bonus_id, total_amount, status, batch_id, batch_internal_id, notes, payment_date, created_utc";

pub(crate) const BATCH_COLUMNS: &str = "batch_internal_id, batch_id, total_amount, driver_count, status, created_by, created_utc, paid_utc";

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "payout-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Open a unit of work for one ledger mutation.
    pub async fn begin(&self, operation: &'static str) -> Result<UnitOfWork, AppError> {
        let tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to begin {}: {}",
                operation,
                e
            ))
        })?;
        Ok(UnitOfWork { tx, operation })
    }

    // =========================================================================
    // Read models
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn get_driver(&self, driver_id: &str) -> Result<Option<Driver>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_driver"])
            .start_timer();

        let driver = sqlx::query_as::<_, Driver>(&format!(
            "SELECT {} FROM drivers WHERE driver_id = $1",
            DRIVER_COLUMNS
        ))
        .bind(driver_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get driver"))?;

        timer.observe_duration();
        Ok(driver)
    }

    #[instrument(skip(self))]
    pub async fn list_bonuses(&self, driver_id: &str) -> Result<Vec<Bonus>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_bonuses"])
            .start_timer();

        let bonuses = sqlx::query_as::<_, Bonus>(&format!(
            "SELECT {} FROM bonuses WHERE driver_id = $1 ORDER BY week_date DESC",
            BONUS_COLUMNS
        ))
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list bonuses"))?;

        timer.observe_duration();
        Ok(bonuses)
    }

    #[instrument(skip(self))]
    pub async fn get_bonus(&self, bonus_id: i64) -> Result<Option<Bonus>, AppError> {
        sqlx::query_as::<_, Bonus>(&format!(
            "SELECT {} FROM bonuses WHERE bonus_id = $1",
            BONUS_COLUMNS
        ))
        .bind(bonus_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get bonus"))
    }

    /// Debts for a driver, newest first, with their deduction ledger.
    #[instrument(skip(self))]
    pub async fn list_debts(
        &self,
        driver_id: &str,
    ) -> Result<Vec<(DriverDebt, Vec<BonusDeduction>)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_debts"])
            .start_timer();

        let debts = sqlx::query_as::<_, DriverDebt>(&format!(
            "SELECT {} FROM driver_debts WHERE driver_id = $1 ORDER BY created_utc DESC, debt_id DESC",
            DEBT_COLUMNS
        ))
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list debts"))?;

        let debt_ids: Vec<i64> = debts.iter().map(|d| d.debt_id).collect();
        let deductions = sqlx::query_as::<_, BonusDeduction>(
            r#"
            SELECT deduction_id, bonus_id, debt_id, amount_deducted, source, created_utc
            FROM bonus_deductions
            WHERE debt_id = ANY($1)
            ORDER BY deduction_id
            "#,
        )
        .bind(&debt_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list deductions"))?;

        timer.observe_duration();

        Ok(debts
            .into_iter()
            .map(|debt| {
                let own = deductions
                    .iter()
                    .filter(|d| d.debt_id == debt.debt_id)
                    .cloned()
                    .collect();
                (debt, own)
            })
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn list_import_logs(&self, limit: i64) -> Result<Vec<ImportLog>, AppError> {
        sqlx::query_as::<_, ImportLog>(
            r#"
            SELECT import_id, week_date, file_name, status, total_rows, bonuses_created,
                   drivers_created, rows_skipped, error_details, imported_by, created_utc, completed_utc
            FROM import_logs
            ORDER BY created_utc DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list import logs"))
    }

    #[instrument(skip(self))]
    pub async fn get_import_log(&self, import_id: uuid::Uuid) -> Result<Option<ImportLog>, AppError> {
        sqlx::query_as::<_, ImportLog>(
            r#"
            SELECT import_id, week_date, file_name, status, total_rows, bonuses_created,
                   drivers_created, rows_skipped, error_details, imported_by, created_utc, completed_utc
            FROM import_logs
            WHERE import_id = $1
            "#,
        )
        .bind(import_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get import log"))
    }

    #[instrument(skip(self))]
    pub async fn get_payment(&self, payment_id: i64) -> Result<Option<Payment>, AppError> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE payment_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get payment"))
    }

    /// A batch by its display id together with its payments.
    #[instrument(skip(self))]
    pub async fn get_batch(
        &self,
        batch_id: &str,
    ) -> Result<Option<(PaymentBatch, Vec<Payment>)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_batch"])
            .start_timer();

        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {} FROM payment_batches WHERE batch_id = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get batch"))?;

        let Some(batch) = batch else {
            timer.observe_duration();
            return Ok(None);
        };

        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE batch_internal_id = $1 ORDER BY payment_id",
            PAYMENT_COLUMNS
        ))
        .bind(batch.batch_internal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list batch payments"))?;

        timer.observe_duration();
        Ok(Some((batch, payments)))
    }
}

// =============================================================================
// Shared locking helpers used inside units of work
// =============================================================================

/// Lock a driver row for the rest of the transaction.
pub(crate) async fn lock_driver(
    conn: &mut PgConnection,
    driver_id: &str,
) -> Result<Option<Driver>, AppError> {
    sqlx::query_as::<_, Driver>(&format!(
        "SELECT {} FROM drivers WHERE driver_id = $1 FOR UPDATE",
        DRIVER_COLUMNS
    ))
    .bind(driver_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to lock driver"))
}

/// Lock a driver's active standard debts, oldest first.
pub(crate) async fn lock_active_debts(
    conn: &mut PgConnection,
    driver_id: &str,
) -> Result<Vec<DriverDebt>, AppError> {
    sqlx::query_as::<_, DriverDebt>(&format!(
        r#"
        SELECT {} FROM driver_debts
        WHERE driver_id = $1 AND status = 'active' AND kind = 'standard'
        ORDER BY created_utc, debt_id
        FOR UPDATE
        "#,
        DEBT_COLUMNS
    ))
    .bind(driver_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to lock active debts"))
}

/// Lock a driver's unexported bonuses, earliest week first.
pub(crate) async fn lock_pending_bonuses(
    conn: &mut PgConnection,
    driver_id: &str,
) -> Result<Vec<Bonus>, AppError> {
    sqlx::query_as::<_, Bonus>(&format!(
        r#"
        SELECT {} FROM bonuses
        WHERE driver_id = $1 AND payment_id IS NULL
        ORDER BY week_date, bonus_id
        FOR UPDATE
        "#,
        BONUS_COLUMNS
    ))
    .bind(driver_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to lock pending bonuses"))
}
