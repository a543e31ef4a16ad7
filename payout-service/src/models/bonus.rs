use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::tax::round_money;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Bonus {
    pub bonus_id: i64,
    pub driver_id: String,
    pub import_id: Option<Uuid>,
    pub week_date: NaiveDate,
    pub gross_payout: Decimal,
    pub withholding_tax: Decimal,
    pub net_payout: Decimal,
    pub final_payout: Option<Decimal>,
    pub payment_id: Option<i64>,
    pub force_pay: bool,
    pub is_unverified_payout: bool,
    pub penalty_tax: Decimal,
    pub created_utc: DateTime<Utc>,
}

impl Bonus {
    /// Amount still owed to the driver for this week.
    ///
    /// `final_payout` wins once a sweep or release has touched the bonus;
    /// before that it is gross minus withholding.
    pub fn available(&self) -> Decimal {
        self.final_payout
            .unwrap_or_else(|| round_money(self.gross_payout - self.withholding_tax))
    }

    /// Amount a payment instruction for this bonus would carry.
    pub fn payable_amount(&self) -> Decimal {
        self.final_payout.unwrap_or(self.net_payout)
    }

    pub fn is_exported(&self) -> bool {
        self.payment_id.is_some()
    }
}

/// A bonus joined with the driver fields export needs.
#[derive(Debug, Clone, FromRow)]
pub struct PendingBonus {
    pub bonus_id: i64,
    pub driver_id: String,
    pub full_name: String,
    pub phone_number: Option<String>,
    pub week_date: NaiveDate,
    pub amount: Decimal,
    pub verified: bool,
    pub is_telebirr_verified: bool,
    pub is_blocked: bool,
    pub force_pay: bool,
    pub payment_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bonus(final_payout: Option<Decimal>) -> Bonus {
        Bonus {
            bonus_id: 1,
            driver_id: "D-100".to_string(),
            import_id: None,
            week_date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            gross_payout: dec!(20000.00),
            withholding_tax: dec!(600.00),
            net_payout: dec!(19400.00),
            final_payout,
            payment_id: None,
            force_pay: false,
            is_unverified_payout: false,
            penalty_tax: Decimal::ZERO,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn available_falls_back_to_gross_minus_withholding() {
        assert_eq!(bonus(None).available(), dec!(19400.00));
        assert_eq!(bonus(None).payable_amount(), dec!(19400.00));
    }

    #[test]
    fn final_payout_overrides_available_and_payable() {
        let b = bonus(Some(dec!(1000.00)));
        assert_eq!(b.available(), dec!(1000.00));
        assert_eq!(b.payable_amount(), dec!(1000.00));
    }

    #[test]
    fn zero_final_payout_is_not_treated_as_unset() {
        assert_eq!(bonus(Some(Decimal::ZERO)).available(), Decimal::ZERO);
    }
}
