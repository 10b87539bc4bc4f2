use async_trait::async_trait;

use crate::error::Error;
use crate::models::{User, UserUpdate};

/// Storage for balances, usage counters and bans.
///
/// `update_user` must apply its deltas atomically per user: two updates for
/// the same id racing each other both land. Implementations get this from
/// their store (a single SQL statement, a transaction, a lock), never from a
/// read-modify-write done by the caller.
#[async_trait]
pub trait PointsLedger: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<User>, Error>;

    /// Creates the row on first use.
    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<(), Error>;

    async fn ban(&self, id: &str) -> Result<(), Error>;
    async fn unban(&self, id: &str) -> Result<(), Error>;

    /// Users whose current display name matches exactly.
    async fn find_by_display_name(&self, name: &str) -> Result<Vec<User>, Error>;

    async fn top_users(&self, limit: i64) -> Result<Vec<User>, Error>;
}
