//! Domain models for payout-service.

#![allow(clippy::should_implement_trait)]

mod bonus;
mod debt;
mod driver;
mod import_log;
mod payment;

pub use bonus::{Bonus, PendingBonus};
pub use debt::{BonusDeduction, DebtKind, DebtStatus, DeductionSource, DriverDebt};
pub use driver::Driver;
pub use import_log::{ImportLog, ImportStatus};
pub use payment::{BatchStatus, Payment, PaymentBatch, PaymentStatus};
