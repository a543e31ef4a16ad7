//! Settlement reconciliation: validate, then process.
//!
//! `validate` never writes to the ledger. When the document's structure
//! passes, the upload is kept under a content-derived name and that name is
//! the only handle `process` accepts. `process` commits each row on its own so
//! a partially processed file can simply be run again; rows already settled
//! come back as already-paid.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use tracing::{info, instrument, warn};

use crate::models::{BatchStatus, Payment, PaymentStatus};
use crate::services::audit::{AuditEntry, AuditSink};
use crate::services::database::{db_error, Database, PAYMENT_COLUMNS};
use crate::services::metrics::{record_ledger_operation, record_settlement_row};
use crate::services::settlement::{
    append_receipt, classify, parse_token, read_rows, Classification, ParsedSettlement,
    SettlementRow, TraceToken,
};

const FILE_PREFIX: &str = "settlement-";
const FILE_SUFFIX: &str = ".csv";

/// Name a validated upload is stored under.
pub fn file_token_for(bytes: &[u8]) -> String {
    format!("{}{}{}", FILE_PREFIX, hex::encode(Sha256::digest(bytes)), FILE_SUFFIX)
}

/// Accept only names this service could have produced.
pub fn is_valid_file_token(token: &str) -> bool {
    token
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
        .is_some_and(|digest| {
            digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        })
}

/// Kept uploads older than this are swept unless configured otherwise.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Directory of validated settlement uploads.
#[derive(Debug, Clone)]
pub struct SettlementStore {
    dir: PathBuf,
    max_bytes: usize,
    retention: Duration,
}

impl SettlementStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Result<Self, AppError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "Cannot create settlement upload dir {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            max_bytes,
            retention: DEFAULT_RETENTION,
        })
    }

    /// How long a validated upload waits for process before it is swept.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Remove kept uploads that were never processed within the retention
    /// window. Only names this store produces are touched.
    pub async fn sweep_expired(&self) -> Result<usize, AppError> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_str().is_some_and(is_valid_file_token) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if now.duration_since(modified).unwrap_or_default() < self.retention {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to sweep settlement file");
                }
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "Swept expired settlement files");
        }
        Ok(removed)
    }

    /// Stage an upload as a temporary file. It is removed when dropped unless
    /// [`StagedUpload::keep`] persists it.
    pub fn stage(&self, bytes: &[u8]) -> Result<StagedUpload, AppError> {
        if bytes.len() > self.max_bytes {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Settlement file exceeds {} bytes",
                self.max_bytes
            )));
        }
        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(FILE_SUFFIX)
            .tempfile_in(&self.dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(StagedUpload {
            file,
            token: file_token_for(bytes),
        })
    }

    /// Claim a previously validated upload. The file is deleted when the
    /// returned guard drops, whatever the outcome of processing.
    pub async fn claim(&self, token: &str) -> Result<ClaimedUpload, AppError> {
        if !is_valid_file_token(token) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Malformed settlement file token"
            )));
        }
        let path = self.dir.join(token);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Settlement file {} not found; validate it first",
                    token
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ClaimedUpload {
            guard: RemoveOnDrop { path },
            bytes,
        })
    }
}

pub struct StagedUpload {
    file: tempfile::NamedTempFile,
    token: String,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Move the staged file to its content-derived name.
    pub fn keep(self, store: &SettlementStore) -> Result<String, AppError> {
        let target = store.dir.join(&self.token);
        self.file
            .persist(&target)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to keep settlement file: {}", e.error)))?;
        Ok(self.token)
    }
}

struct RemoveOnDrop {
    path: PathBuf,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove settlement file");
            }
        }
    }
}

pub struct ClaimedUpload {
    guard: RemoveOnDrop,
    bytes: Vec<u8>,
}

impl ClaimedUpload {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckItem {
    pub check: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckItem {
    fn new(check: &'static str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            check,
            passed,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RowReport {
    pub line: usize,
    pub remark: String,
    pub amount: Option<Decimal>,
    pub receipt: Option<String>,
    pub payment_id: Option<i64>,
    #[serde(flatten)]
    pub classification: RowOutcome,
}

/// Per-row result. `Reconciled` only appears after process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RowOutcome {
    Classified(Classification),
    Reconciled { outcome: &'static str },
}

impl RowOutcome {
    fn reconciled() -> Self {
        Self::Reconciled {
            outcome: "reconciled",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Classified(c) => c.label(),
            Self::Reconciled { outcome } => outcome,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub considered: usize,
    pub ignored: usize,
    pub candidate: usize,
    pub reconciled: usize,
    pub already_paid: usize,
    pub unmatched: usize,
    pub amount_mismatch: usize,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: &RowOutcome) {
        match outcome.label() {
            "candidate" => self.candidate += 1,
            "reconciled" => self.reconciled += 1,
            "already_paid" => self.already_paid += 1,
            "unmatched" => self.unmatched += 1,
            _ => self.amount_mismatch += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub file_name: String,
    pub structure_ok: bool,
    pub checklist: Vec<CheckItem>,
    /// Present only when structure passed; hand it to process.
    pub file_token: Option<String>,
    pub counts: OutcomeCounts,
    pub rows: Vec<RowReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub file_token: String,
    pub counts: OutcomeCounts,
    pub rows: Vec<RowReport>,
}

/// Structural checklist for a document. Returns the parsed document when the
/// required columns were found.
pub fn structural_checks(bytes: &[u8]) -> (Vec<CheckItem>, Option<ParsedSettlement>) {
    let mut checklist = Vec::new();

    let raw = match read_rows(bytes) {
        Ok(raw) if !raw.is_empty() => {
            checklist.push(CheckItem::new("file_readable", true, format!("{} rows read", raw.len())));
            raw
        }
        Ok(_) => {
            checklist.push(CheckItem::new("file_readable", false, "document is empty"));
            return (checklist, None);
        }
        Err(e) => {
            checklist.push(CheckItem::new("file_readable", false, e.to_string()));
            return (checklist, None);
        }
    };

    match ParsedSettlement::from_rows(&raw) {
        Ok(parsed) => {
            let c = parsed.columns;
            checklist.push(CheckItem::new(
                "header_row",
                true,
                format!("header found on line {}", c.header_row + 1),
            ));
            checklist.push(CheckItem::new("status_column", true, format!("column {}", c.status + 1)));
            checklist.push(CheckItem::new("amount_column", true, format!("column {}", c.amount + 1)));
            checklist.push(CheckItem::new("remark_column", true, format!("column {}", c.remark + 1)));
            checklist.push(CheckItem::new(
                "transaction_type_column",
                true,
                match c.transaction_type {
                    Some(i) => format!("column {}", i + 1),
                    None => "not present; rows are not filtered by type".to_string(),
                },
            ));
            checklist.push(CheckItem::new(
                "receipt_column",
                true,
                match c.receipt {
                    Some(i) => format!("column {}", i + 1),
                    None => "not present; receipts will not be recorded".to_string(),
                },
            ));
            (checklist, Some(parsed))
        }
        Err(missing) => {
            for detail in missing {
                let check = if detail.starts_with("status") {
                    "status_column"
                } else if detail.starts_with("amount") {
                    "amount_column"
                } else {
                    "remark_column"
                };
                checklist.push(CheckItem::new(check, false, detail));
            }
            (checklist, None)
        }
    }
}

pub struct ReconciliationMatcher {
    db: Arc<Database>,
    audit: Arc<dyn AuditSink>,
    store: SettlementStore,
    expected_type: String,
}

impl ReconciliationMatcher {
    pub fn new(
        db: Arc<Database>,
        audit: Arc<dyn AuditSink>,
        store: SettlementStore,
        expected_type: impl Into<String>,
    ) -> Self {
        Self {
            db,
            audit,
            store,
            expected_type: expected_type.into(),
        }
    }

    pub fn store(&self) -> &SettlementStore {
        &self.store
    }

    /// Check a settlement document and classify its rows without writing.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn validate(&self, file_name: &str, bytes: &[u8]) -> Result<ValidationReport, AppError> {
        self.store.sweep_expired().await?;
        let staged = self.store.stage(bytes)?;
        let (mut checklist, parsed) = structural_checks(bytes);

        let Some(parsed) = parsed else {
            record_ledger_operation("settlement_validate", "rejected");
            warn!(file_name, "Settlement document failed structural checks");
            return Ok(ValidationReport {
                file_name: file_name.to_string(),
                structure_ok: false,
                checklist,
                file_token: None,
                counts: OutcomeCounts::default(),
                rows: Vec::new(),
            });
        };

        let mut counts = OutcomeCounts::default();
        let mut rows = Vec::new();
        for row in &parsed.rows {
            if !row.is_candidate(&self.expected_type) {
                counts.ignored += 1;
                continue;
            }
            counts.considered += 1;
            let token = parse_token(&row.remark);
            let payment = match &token {
                Some(t) => find_payment(self.db.pool(), t).await?,
                None => None,
            };
            let outcome = RowOutcome::Classified(classify(token.as_ref(), row.amount, payment.as_ref()));
            record_settlement_row("validate", outcome.label());
            counts.add(&outcome);
            rows.push(report(row, payment.as_ref(), outcome));
        }

        checklist.push(CheckItem::new(
            "success_rows",
            counts.considered > 0,
            format!(
                "{} rows with a success status and expected type, {} ignored",
                counts.considered, counts.ignored
            ),
        ));
        checklist.push(CheckItem::new(
            "tokens_matched",
            counts.unmatched == 0,
            format!("{} rows without a matching payment", counts.unmatched),
        ));

        let file_token = staged.keep(&self.store)?;
        record_ledger_operation("settlement_validate", "ok");
        info!(
            file_name,
            file_token = %file_token,
            candidates = counts.candidate,
            unmatched = counts.unmatched,
            "Settlement document validated"
        );

        Ok(ValidationReport {
            file_name: file_name.to_string(),
            structure_ok: true,
            checklist,
            file_token: Some(file_token),
            counts,
            rows,
        })
    }

    /// Mark every matching processing payment paid. The stored file is gone
    /// once this returns, whether it succeeded or not.
    #[instrument(skip(self))]
    pub async fn process(&self, actor_id: &str, file_token: &str) -> Result<ProcessReport, AppError> {
        let upload = self.store.claim(file_token).await?;

        let (_, parsed) = structural_checks(upload.bytes());
        let parsed = parsed.ok_or_else(|| {
            AppError::business_rule(
                "Settlement file no longer passes structural checks",
                vec![file_token.to_string()],
            )
        })?;

        let mut counts = OutcomeCounts::default();
        let mut rows = Vec::new();
        for row in &parsed.rows {
            if !row.is_candidate(&self.expected_type) {
                counts.ignored += 1;
                continue;
            }
            counts.considered += 1;
            let (payment, outcome) = match parse_token(&row.remark) {
                Some(token) => self.settle_row(actor_id, &token, row).await?,
                None => (None, RowOutcome::Classified(classify(None, row.amount, None))),
            };
            record_settlement_row("process", outcome.label());
            counts.add(&outcome);
            rows.push(report(row, payment.as_ref(), outcome));
        }

        record_ledger_operation("settlement_process", "ok");
        info!(
            file_token,
            reconciled = counts.reconciled,
            already_paid = counts.already_paid,
            unmatched = counts.unmatched,
            amount_mismatch = counts.amount_mismatch,
            "Settlement document processed"
        );
        drop(upload);

        Ok(ProcessReport {
            file_token: file_token.to_string(),
            counts,
            rows,
        })
    }

    /// One row, one unit of work.
    async fn settle_row(
        &self,
        actor_id: &str,
        token: &TraceToken,
        row: &SettlementRow,
    ) -> Result<(Option<Payment>, RowOutcome), AppError> {
        let mut uow = self.db.begin("reconcile_row").await?;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE bonus_id = $1 AND driver_id = $2 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(token.bonus_id)
        .bind(&token.driver_id)
        .fetch_optional(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to lock payment"))?;

        let classification = classify(Some(token), row.amount, payment.as_ref());
        let payment = match (classification, payment) {
            (Classification::Candidate, Some(payment)) => payment,
            // Nothing written; dropping the unit rolls back the row lock.
            (classification, payment) => {
                return Ok((payment, RowOutcome::Classified(classification)));
            }
        };

        let notes = append_receipt(payment.notes.as_deref(), row.receipt.as_deref());
        let paid = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments SET status = $2, payment_date = NOW(), notes = $3
            WHERE payment_id = $1
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment.payment_id)
        .bind(PaymentStatus::Paid.as_str())
        .bind(notes)
        .fetch_one(&mut *uow.conn())
        .await
        .map_err(db_error("Failed to mark payment paid"))?;

        let batch_paid = settle_batch_if_complete(uow.conn(), paid.batch_internal_id).await?;
        uow.commit().await?;

        info!(
            payment_id = paid.payment_id,
            bonus_id = paid.bonus_id,
            batch_id = %paid.batch_id,
            batch_paid,
            "Payment reconciled"
        );
        self.audit
            .record(AuditEntry::new(
                actor_id,
                "payment.reconcile",
                "payment",
                paid.payment_id.to_string(),
                json!({
                    "bonus_id": paid.bonus_id,
                    "driver_id": paid.driver_id,
                    "batch_id": paid.batch_id,
                    "amount": paid.total_amount,
                    "receipt": row.receipt,
                    "batch_paid": batch_paid,
                }),
            ))
            .await;

        Ok((Some(paid), RowOutcome::reconciled()))
    }
}

async fn find_payment(pool: &sqlx::PgPool, token: &TraceToken) -> Result<Option<Payment>, AppError> {
    sqlx::query_as::<_, Payment>(&format!(
        "SELECT {} FROM payments WHERE bonus_id = $1 AND driver_id = $2",
        PAYMENT_COLUMNS
    ))
    .bind(token.bonus_id)
    .bind(&token.driver_id)
    .fetch_optional(pool)
    .await
    .map_err(db_error("Failed to look up payment"))
}

/// Flip the batch to paid once none of its payments is still processing.
/// Returns whether the batch is paid afterwards.
pub(crate) async fn settle_batch_if_complete(
    conn: &mut PgConnection,
    batch_internal_id: i64,
) -> Result<bool, AppError> {
    sqlx::query("SELECT batch_internal_id FROM payment_batches WHERE batch_internal_id = $1 FOR UPDATE")
        .bind(batch_internal_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to lock batch"))?;

    let (total, open): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COUNT(*) FILTER (WHERE status <> 'paid')
        FROM payments WHERE batch_internal_id = $1
        "#,
    )
    .bind(batch_internal_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to count batch payments"))?;

    let paid = total > 0 && open == 0;
    let status = if paid {
        BatchStatus::Paid
    } else {
        BatchStatus::Processing
    };

    sqlx::query(
        r#"
        UPDATE payment_batches
        SET status = $2,
            paid_utc = CASE WHEN $2 = 'paid' THEN COALESCE(paid_utc, NOW()) ELSE NULL END
        WHERE batch_internal_id = $1
        "#,
    )
    .bind(batch_internal_id)
    .bind(status.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to update batch status"))?;

    Ok(paid)
}

fn report(row: &SettlementRow, payment: Option<&Payment>, outcome: RowOutcome) -> RowReport {
    RowReport {
        line: row.line,
        remark: row.remark.clone(),
        amount: row.amount,
        receipt: row.receipt.clone(),
        payment_id: payment.map(|p| p.payment_id),
        classification: outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "Status,Amount,Remark\nCompleted,100.00,\"D-1,1,2024-03-04,BATCH-20240309-0705-00001\"\n";

    #[test]
    fn file_token_is_content_derived() {
        let a = file_token_for(b"one");
        assert_eq!(a, file_token_for(b"one"));
        assert_ne!(a, file_token_for(b"two"));
        assert!(is_valid_file_token(&a));
    }

    #[test]
    fn foreign_or_traversal_tokens_are_rejected() {
        assert!(!is_valid_file_token("../etc/passwd"));
        assert!(!is_valid_file_token("settlement-abc.csv"));
        let upper = format!("settlement-{}.csv", "A".repeat(64));
        assert!(!is_valid_file_token(&upper));
        let sneaky = format!("settlement-{}/x.csv", "a".repeat(63));
        assert!(!is_valid_file_token(&sneaky));
    }

    #[test]
    fn structural_checks_pass_for_minimal_document() {
        let (checklist, parsed) = structural_checks(DOC.as_bytes());
        assert!(parsed.is_some());
        assert!(checklist.iter().all(|c| c.passed));
    }

    #[test]
    fn structural_checks_fail_without_status() {
        let (checklist, parsed) = structural_checks(b"Amount,Remark\n1,x\n");
        assert!(parsed.is_none());
        assert!(checklist
            .iter()
            .any(|c| c.check == "status_column" && !c.passed));
    }

    #[test]
    fn empty_document_is_unreadable() {
        let (checklist, parsed) = structural_checks(b"");
        assert!(parsed.is_none());
        assert_eq!(checklist[0].check, "file_readable");
        assert!(!checklist[0].passed);
    }

    #[tokio::test]
    async fn kept_upload_is_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettlementStore::new(dir.path(), 1024).unwrap();

        let staged = store.stage(DOC.as_bytes()).unwrap();
        let token = staged.keep(&store).unwrap();
        assert!(dir.path().join(&token).exists());

        let claimed = store.claim(&token).await.unwrap();
        assert_eq!(claimed.bytes(), DOC.as_bytes());
        assert_eq!(claimed.path(), dir.path().join(&token));
        drop(claimed);
        assert!(!dir.path().join(&token).exists());

        assert!(matches!(store.claim(&token).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn expired_uploads_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettlementStore::new(dir.path(), 1024).unwrap();
        let token = store.stage(DOC.as_bytes()).unwrap().keep(&store).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 0);
        assert!(dir.path().join(&token).exists());

        let eager = store.clone().with_retention(Duration::ZERO);
        assert_eq!(eager.sweep_expired().await.unwrap(), 1);
        assert!(!eager.dir().join(&token).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn dropped_stage_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettlementStore::new(dir.path(), 1024).unwrap();
        let staged = store.stage(b"junk").unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        drop(staged);
        assert!(!path.exists());
    }

    #[test]
    fn oversized_upload_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettlementStore::new(dir.path(), 4).unwrap();
        assert!(matches!(store.stage(b"too large"), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn counts_follow_outcomes() {
        let mut counts = OutcomeCounts::default();
        counts.add(&RowOutcome::reconciled());
        counts.add(&RowOutcome::Classified(Classification::AlreadyPaid));
        counts.add(&RowOutcome::Classified(Classification::Unmatched {
            reason: "x".to_string(),
        }));
        assert_eq!(counts.reconciled, 1);
        assert_eq!(counts.already_paid, 1);
        assert_eq!(counts.unmatched, 1);
    }
}
