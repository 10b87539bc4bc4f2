pub mod ledger_traits;
pub mod sync_traits;

pub use ledger_traits::PointsLedger;
pub use sync_traits::{ChannelCallback, ChannelEvent, StampedValue, SubscriptionId, SyncChannel};
