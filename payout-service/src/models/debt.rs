use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DebtStatus {
    Active,
    Paid,
    Void,
}

impl DebtStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paid => "paid",
            Self::Void => "void",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            "void" => Self::Void,
            _ => Self::Active,
        }
    }

    /// Status implied by a remaining balance.
    pub fn for_remaining(remaining: Decimal) -> Self {
        if remaining <= Decimal::ZERO {
            Self::Paid
        } else {
            Self::Active
        }
    }
}

/// Standard debts are real receivables. Penalty-tax debts are bookkeeping
/// rows written by an unverified release and removed again on revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtKind {
    Standard,
    PenaltyTax,
}

impl DebtKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::PenaltyTax => "penalty_tax",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "penalty_tax" => Self::PenaltyTax,
            _ => Self::Standard,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DriverDebt {
    pub debt_id: i64,
    pub driver_id: String,
    pub amount: Decimal,
    pub remaining_amount: Decimal,
    pub status: String,
    pub kind: String,
    pub reason: String,
    pub created_by: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl DriverDebt {
    pub fn parsed_status(&self) -> DebtStatus {
        DebtStatus::from_str(&self.status)
    }

    pub fn parsed_kind(&self) -> DebtKind {
        DebtKind::from_str(&self.kind)
    }
}

/// Which ledger event wrote a deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionSource {
    Import,
    DebtCreated,
    PenaltyRelease,
}

impl DeductionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::DebtCreated => "debt_created",
            Self::PenaltyRelease => "penalty_release",
        }
    }
}

/// Append-only link between a bonus and the debt it paid down.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BonusDeduction {
    pub deduction_id: i64,
    pub bonus_id: i64,
    pub debt_id: i64,
    pub amount_deducted: Decimal,
    pub source: String,
    pub created_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_follows_remaining_balance() {
        assert_eq!(DebtStatus::for_remaining(dec!(0)), DebtStatus::Paid);
        assert_eq!(DebtStatus::for_remaining(dec!(-0.01)), DebtStatus::Paid);
        assert_eq!(DebtStatus::for_remaining(dec!(0.01)), DebtStatus::Active);
    }

    #[test]
    fn unknown_strings_fall_back() {
        assert_eq!(DebtStatus::from_str("weird"), DebtStatus::Active);
        assert_eq!(DebtKind::from_str("weird"), DebtKind::Standard);
        assert_eq!(DebtKind::from_str("penalty_tax"), DebtKind::PenaltyTax);
    }
}
