use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Import attempt lifecycle: pending, then processing, then one of
/// success, partial or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Pending,
    Processing,
    Success,
    Partial,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "success" => Self::Success,
            "partial" => Self::Partial,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failed)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ImportLog {
    pub import_id: Uuid,
    pub week_date: NaiveDate,
    pub file_name: String,
    pub status: String,
    pub total_rows: i32,
    pub bonuses_created: i32,
    pub drivers_created: i32,
    pub rows_skipped: i32,
    pub error_details: Option<serde_json::Value>,
    pub imported_by: String,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl ImportLog {
    pub fn parsed_status(&self) -> ImportStatus {
        ImportStatus::from_str(&self.status)
    }
}
