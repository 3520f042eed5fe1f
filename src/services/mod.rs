pub mod dispatch;
pub mod orders;
pub mod payouts;
pub mod reconciliation;
pub mod settlement;
