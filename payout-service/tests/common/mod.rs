//! Common test utilities for payout-service integration tests.
//!
//! Tests need a disposable PostgreSQL database in `TEST_DATABASE_URL`. When
//! it is not set the tests return early.

#![allow(dead_code)]

use chrono::NaiveDate;
use payout_service::config::{DatabaseConfig, PayoutConfig, SettlementConfig};
use payout_service::services::bonus_import::BonusRow;
use payout_service::services::{AuditSink, CredentialVerifier, Database, MemoryAuditSink};
use payout_service::startup::{AppState, Application};
use rust_decimal::Decimal;
use service_core::config::Config as CommonConfig;
use service_core::utils::Password;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

pub const ACTOR: &str = "ops-test";
pub const ACTOR_PASSWORD: &str = "correct horse battery staple";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,payout_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_config() -> Option<PayoutConfig> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;

    Some(PayoutConfig {
        common: CommonConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        service_name: "payout-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url,
            max_connections: 4,
            min_connections: 1,
        },
        settlement: SettlementConfig {
            upload_dir: std::env::temp_dir().join(format!("payout-settlements-test-{}", std::process::id())),
            transaction_type: "Bulk Payment".to_string(),
            max_upload_bytes: SettlementConfig::DEFAULT_MAX_UPLOAD_BYTES,
            retention_secs: SettlementConfig::DEFAULT_RETENTION_SECS,
        },
    })
}

/// Services wired to a clean database and an in-memory audit sink.
pub struct TestContext {
    pub state: AppState,
    pub db: Arc<Database>,
    pub audit: Arc<MemoryAuditSink>,
}

impl TestContext {
    /// `None` when no test database is configured.
    pub async fn new() -> Option<Self> {
        init_tracing();
        let config = test_config()?;

        let db = Database::new(&config.database.url, 4, 1)
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");
        reset(&db).await;

        let db = Arc::new(db);
        let audit = Arc::new(MemoryAuditSink::default());
        let sink: Arc<dyn AuditSink> = audit.clone();
        let state = AppState::new(config, db.clone(), sink).expect("Failed to build state");

        CredentialVerifier::new(db.pool().clone())
            .set_credential(ACTOR, &Password::new(ACTOR_PASSWORD))
            .await
            .expect("Failed to seed operator credential");

        Some(Self { state, db, audit })
    }

    pub fn password(&self) -> Password {
        Password::new(ACTOR_PASSWORD)
    }

    /// Import one week for the given `(driver_id, phone, base_net)` rows.
    pub async fn import_week(&self, week: NaiveDate, rows: &[(&str, &str, Decimal)]) {
        let rows: Vec<BonusRow> = rows
            .iter()
            .map(|(driver_id, phone, amount)| bonus_row(driver_id, phone, week, *amount))
            .collect();
        self.state
            .imports
            .import(ACTOR, week, &format!("bonus-{}.xlsx", week), &rows)
            .await
            .expect("Import failed");
    }

    pub async fn set_driver_flags(&self, driver_id: &str, verified: bool, telebirr: bool, blocked: bool) {
        sqlx::query(
            r#"
            UPDATE drivers
            SET verified = $2, is_telebirr_verified = $3, is_blocked = $4, updated_utc = NOW()
            WHERE driver_id = $1
            "#,
        )
        .bind(driver_id)
        .bind(verified)
        .bind(telebirr)
        .bind(blocked)
        .execute(self.db.pool())
        .await
        .expect("Failed to update driver flags");
    }

    /// `amount - remaining_amount` against the deduction ledger, per debt.
    pub async fn assert_debt_ledger_balanced(&self) {
        let rows: Vec<(i64, Decimal, Decimal, Option<Decimal>)> = sqlx::query_as(
            r#"
            SELECT d.debt_id, d.amount, d.remaining_amount,
                   (SELECT SUM(amount_deducted) FROM bonus_deductions bd WHERE bd.debt_id = d.debt_id)
            FROM driver_debts d
            "#,
        )
        .fetch_all(self.db.pool())
        .await
        .expect("Failed to load debts");

        for (debt_id, amount, remaining, deducted) in rows {
            assert!(remaining >= Decimal::ZERO, "debt {} went negative", debt_id);
            assert_eq!(
                amount - remaining,
                deducted.unwrap_or(Decimal::ZERO),
                "debt {} out of balance",
                debt_id
            );
        }
    }
}

pub fn bonus_row(driver_id: &str, phone: &str, week: NaiveDate, amount: Decimal) -> BonusRow {
    BonusRow {
        driver_id: driver_id.to_string(),
        full_name: format!("Driver {}", driver_id),
        phone_number: phone.to_string(),
        week_date: week,
        base_net_payout: amount,
    }
}

pub fn week(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 4).unwrap() + chrono::Days::new(7 * (n as u64 - 1))
}

async fn reset(db: &Database) {
    sqlx::query(
        r#"
        TRUNCATE bonus_deductions, driver_debts, payments, bonuses, payment_batches,
                 batch_sequences, import_logs, drivers, operator_credentials, audit_logs
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(db.pool())
    .await
    .expect("Failed to reset test database");
}

/// HTTP test application.
pub struct TestApp {
    pub http_address: String,
}

impl TestApp {
    pub async fn spawn() -> Option<Self> {
        init_tracing();
        let config = test_config()?;

        let app = Application::build(config)
            .await
            .expect("Failed to build application");
        let http_address = format!("http://127.0.0.1:{}", app.http_port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        Some(Self { http_address })
    }
}
