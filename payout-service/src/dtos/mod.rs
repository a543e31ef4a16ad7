//! Request and response bodies for the HTTP API.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{Bonus, BonusDeduction, DriverDebt, PaymentBatch, Payment};
use crate::services::bonus_import::BonusRow;

#[derive(Debug, Deserialize, Validate)]
pub struct ImportRequest {
    pub week_date: NaiveDate,
    #[validate(length(min = 1, max = 255, message = "File name is required"))]
    pub file_name: String,
    #[validate(length(min = 1, message = "At least one row is required"))]
    pub rows: Vec<BonusRow>,
}

#[derive(Debug, Deserialize)]
pub struct ImportListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDebtRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 500, message = "Reason is required"))]
    pub reason: String,
}

/// Body for operations that need the operator's credential again.
#[derive(Deserialize, Validate)]
pub struct CredentialRequest {
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ProcessSettlementRequest {
    #[validate(length(min = 1, message = "File token is required"))]
    pub file_token: String,
}

#[derive(Debug, Serialize)]
pub struct DebtWithDeductions {
    #[serde(flatten)]
    pub debt: DriverDebt,
    pub deductions: Vec<BonusDeduction>,
}

#[derive(Debug, Serialize)]
pub struct DriverBonusesResponse {
    pub driver_id: String,
    pub bonuses: Vec<BonusView>,
}

#[derive(Debug, Serialize)]
pub struct BonusView {
    #[serde(flatten)]
    pub bonus: Bonus,
    pub payable_amount: Decimal,
    pub exported: bool,
}

impl From<Bonus> for BonusView {
    fn from(bonus: Bonus) -> Self {
        Self {
            payable_amount: bonus.payable_amount(),
            exported: bonus.is_exported(),
            bonus,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchReport {
    #[serde(flatten)]
    pub batch: PaymentBatch,
    pub payments: Vec<Payment>,
    pub paid_count: usize,
    pub processing_count: usize,
    /// Sum of member payments; equals the batch total.
    pub payments_total: Decimal,
}

impl BatchReport {
    pub fn new(batch: PaymentBatch, payments: Vec<Payment>) -> Self {
        use crate::models::PaymentStatus;

        let paid_count = payments
            .iter()
            .filter(|p| p.parsed_status() == PaymentStatus::Paid)
            .count();
        Self {
            processing_count: payments.len() - paid_count,
            payments_total: payments.iter().map(|p| p.total_amount).sum(),
            paid_count,
            batch,
            payments,
        }
    }
}
