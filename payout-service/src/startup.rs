//! Application startup and lifecycle management.

use crate::config::PayoutConfig;
use crate::handlers;
use crate::services::{
    init_metrics, AuditSink, BatchExportService, BonusImportProcessor, CredentialVerifier,
    Database, DebtLedger, PayoutReleaser, PgAuditSink, ReconciliationMatcher, SettlementStore,
};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{request_id_middleware, request_span};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: PayoutConfig,
    pub db: Arc<Database>,
    pub imports: Arc<BonusImportProcessor>,
    pub debts: Arc<DebtLedger>,
    pub exports: Arc<BatchExportService>,
    pub reconciliation: Arc<ReconciliationMatcher>,
    pub releaser: Arc<PayoutReleaser>,
}

impl AppState {
    /// Wire every ledger component to one database and audit sink.
    pub fn new(
        config: PayoutConfig,
        db: Arc<Database>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, AppError> {
        let store = SettlementStore::new(
            config.settlement.upload_dir.clone(),
            config.settlement.max_upload_bytes,
        )?
        .with_retention(Duration::from_secs(config.settlement.retention_secs));
        let credentials = CredentialVerifier::new(db.pool().clone());

        Ok(Self {
            imports: Arc::new(BonusImportProcessor::new(db.clone(), audit.clone())),
            debts: Arc::new(DebtLedger::new(db.clone(), audit.clone())),
            exports: Arc::new(BatchExportService::new(db.clone(), audit.clone())),
            reconciliation: Arc::new(ReconciliationMatcher::new(
                db.clone(),
                audit.clone(),
                store,
                config.settlement.transaction_type.clone(),
            )),
            releaser: Arc::new(PayoutReleaser::new(db.clone(), audit, credentials)),
            db,
            config,
        })
    }
}

/// HTTP routes with the workspace's standard middleware stack.
pub fn router(state: AppState) -> Router {
    // Multipart framing needs a little room above the file itself.
    let upload_limit = state.reconciliation.store().max_bytes() + 64 * 1024;

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics_handler))
        .route(
            "/imports",
            post(handlers::imports::import_bonuses).get(handlers::imports::list_imports),
        )
        .route("/imports/:import_id", get(handlers::imports::get_import))
        .route(
            "/drivers/:driver_id/bonuses",
            get(handlers::drivers::list_bonuses),
        )
        .route(
            "/drivers/:driver_id/debts",
            post(handlers::drivers::create_debt).get(handlers::drivers::list_debts),
        )
        .route("/debts/:debt_id/void", post(handlers::drivers::void_debt))
        .route("/exports/preview", get(handlers::exports::preview_export))
        .route("/exports", post(handlers::exports::export_batch))
        .route("/batches/:batch_id", get(handlers::exports::get_batch))
        .route(
            "/reconciliation/validate",
            post(handlers::reconciliation::validate_settlement)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/reconciliation/process",
            post(handlers::reconciliation::process_settlement),
        )
        .route(
            "/drivers/:driver_id/unverified-release",
            post(handlers::payments::release_unverified),
        )
        .route(
            "/payments/:payment_id/revert",
            post(handlers::payments::revert_payment),
        )
        .layer(TraceLayer::new_for_http().make_span_with(request_span::<axum::body::Body>))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: PayoutConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: PayoutConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: PayoutConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let audit: Arc<dyn AuditSink> = Arc::new(PgAuditSink::new(db.pool().clone()));
        let state = AppState::new(config.clone(), db, audit)?;

        let http_addr = config.common.bind_addr()?;
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            settlement_dir = %state.reconciliation.store().dir().display(),
            "Payout service listener bound"
        );

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let http_router = router(self.state);

        tracing::info!(
            service = "payout-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, http_router)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
