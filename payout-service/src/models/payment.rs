use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Processing,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Paid => "paid",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            _ => Self::Processing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processing,
    Paid,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Paid => "paid",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            _ => Self::Processing,
        }
    }
}

/// One exported bonus. Created by batch export, removed only by revert.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Payment {
    pub payment_id: i64,
    pub driver_id: String,
    pub bonus_id: i64,
    pub total_amount: Decimal,
    pub status: String,
    pub batch_id: String,
    pub batch_internal_id: i64,
    pub notes: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl Payment {
    pub fn parsed_status(&self) -> PaymentStatus {
        PaymentStatus::from_str(&self.status)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentBatch {
    pub batch_internal_id: i64,
    pub batch_id: String,
    pub total_amount: Decimal,
    pub driver_count: i32,
    pub status: String,
    pub created_by: String,
    pub created_utc: DateTime<Utc>,
    pub paid_utc: Option<DateTime<Utc>>,
}

impl PaymentBatch {
    pub fn parsed_status(&self) -> BatchStatus {
        BatchStatus::from_str(&self.status)
    }
}
