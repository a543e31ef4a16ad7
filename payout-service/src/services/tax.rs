//! Withholding tax arithmetic.
//!
//! Every monetary figure the ledger derives goes through [`round_money`], so
//! export amounts and settlement amounts agree to the cent.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

/// Payouts strictly above this figure are taxed.
pub const TAX_THRESHOLD: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// 3% standard withholding.
pub const STANDARD_RATE: Decimal = Decimal::from_parts(3, 0, 0, false, 2);

/// 30% withholding applied when paying out a driver who is not fully verified.
pub const PENALTY_RATE: Decimal = Decimal::from_parts(30, 0, 0, false, 2);

/// Round to cents, halves away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Standard-mode result for one bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaxBreakdown {
    pub gross: Decimal,
    pub withholding: Decimal,
    pub net: Decimal,
}

/// Penalty-mode result for one bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PenaltyBreakdown {
    pub target_withholding: Decimal,
    pub additional: Decimal,
    pub available: Decimal,
}

/// Gross up a base net payout.
///
/// Above the threshold the driver is meant to receive `base` after 3%
/// withholding, so gross is `base / 0.97`. At or below it nothing is withheld.
pub fn standard(base_net: Decimal) -> TaxBreakdown {
    let base_net = round_money(base_net);
    if base_net > TAX_THRESHOLD {
        let gross = round_money(base_net / (Decimal::ONE - STANDARD_RATE));
        let withholding = round_money(gross * STANDARD_RATE);
        TaxBreakdown {
            gross,
            withholding,
            net: round_money(gross - withholding),
        }
    } else {
        TaxBreakdown {
            gross: base_net,
            withholding: Decimal::ZERO,
            net: base_net,
        }
    }
}

/// Recompute a bonus under the 30% rate.
///
/// `current_withholding` is what standard mode already withheld; only the
/// difference is additional tax.
pub fn penalty(gross: Decimal, current_withholding: Decimal) -> PenaltyBreakdown {
    let target_withholding = if gross > TAX_THRESHOLD {
        round_money(gross * PENALTY_RATE)
    } else {
        Decimal::ZERO
    };
    let additional = round_money((target_withholding - current_withholding).max(Decimal::ZERO));

    PenaltyBreakdown {
        target_withholding,
        additional,
        available: round_money(gross - target_withholding),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn below_threshold_is_untaxed() {
        let t = standard(dec!(5000));
        assert_eq!(t.gross, dec!(5000.00));
        assert_eq!(t.withholding, dec!(0.00));
        assert_eq!(t.net, dec!(5000.00));
    }

    #[test]
    fn threshold_itself_is_untaxed() {
        let t = standard(dec!(10000.00));
        assert_eq!(t.withholding, Decimal::ZERO);
        assert_eq!(t.gross, dec!(10000.00));
    }

    #[test]
    fn above_threshold_grosses_up() {
        let t = standard(dec!(19400));
        assert_eq!(t.gross, dec!(20000.00));
        assert_eq!(t.withholding, dec!(600.00));
        assert_eq!(t.net, dec!(19400.00));
    }

    #[test]
    fn gross_up_rounds_each_step_to_cents() {
        // 10001 / 0.97 = 10310.3092...
        let t = standard(dec!(10001));
        assert_eq!(t.gross, dec!(10310.31));
        assert_eq!(t.withholding, dec!(309.31));
        assert_eq!(t.net, dec!(10001.00));
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_money(dec!(2.345)), dec!(2.35));
        assert_eq!(round_money(dec!(2.344)), dec!(2.34));
        assert_eq!(round_money(dec!(-2.345)), dec!(-2.35));
    }

    #[test]
    fn penalty_tops_up_existing_withholding() {
        let p = penalty(dec!(20000.00), dec!(600.00));
        assert_eq!(p.target_withholding, dec!(6000.00));
        assert_eq!(p.additional, dec!(5400.00));
        assert_eq!(p.available, dec!(14000.00));
    }

    #[test]
    fn penalty_below_threshold_withholds_nothing() {
        let p = penalty(dec!(8000.00), Decimal::ZERO);
        assert_eq!(p.target_withholding, Decimal::ZERO);
        assert_eq!(p.additional, Decimal::ZERO);
        assert_eq!(p.available, dec!(8000.00));
    }

    #[test]
    fn penalty_never_refunds_withholding() {
        let p = penalty(dec!(9000.00), dec!(270.00));
        assert_eq!(p.additional, Decimal::ZERO);
    }
}
