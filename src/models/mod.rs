pub mod dispatch;
pub mod order;
pub mod payout;
pub mod settlement;

pub use dispatch::{Destination, Dispatch, DispatchStatus};
pub use order::{Actor, LineItem, Order, OrderStatus, TransitionRecord};
pub use payout::{PayoutRecord, PayoutStatus};
pub use settlement::{SettlementSnapshot, SettlementTotals, SettlementWindow};
