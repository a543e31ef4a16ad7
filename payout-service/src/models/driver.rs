use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A driver as seen by the ledger: identity, payout flags and the single
/// active phone number instructions are sent to.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Driver {
    pub driver_id: String,
    pub full_name: String,
    pub phone_number: Option<String>,
    pub verified: bool,
    pub is_telebirr_verified: bool,
    pub is_blocked: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Driver {
    /// Telebirr-verified but still missing document verification: the only
    /// drivers the penalty release path applies to.
    pub fn qualifies_for_unverified_release(&self) -> bool {
        self.is_telebirr_verified && !self.verified && !self.is_blocked
    }
}
