//! HTTP handlers for payout-service.

pub mod drivers;
pub mod exports;
pub mod health;
pub mod imports;
pub mod payments;
pub mod reconciliation;
