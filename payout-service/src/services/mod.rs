//! Business logic services for payout-service.

pub mod audit;
pub mod batch_export;
pub mod bonus_import;
pub mod credentials;
pub mod database;
pub mod debt_ledger;
pub mod metrics;
pub mod payout_release;
pub mod reconciliation;
pub mod settlement;
pub mod tax;

pub use audit::{AuditEntry, AuditSink, MemoryAuditSink, PgAuditSink};
pub use batch_export::BatchExportService;
pub use bonus_import::BonusImportProcessor;
pub use credentials::CredentialVerifier;
pub use database::{Database, UnitOfWork};
pub use debt_ledger::DebtLedger;
pub use metrics::{get_metrics, init_metrics};
pub use payout_release::PayoutReleaser;
pub use reconciliation::{ReconciliationMatcher, SettlementStore};
