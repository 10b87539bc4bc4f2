// File: toybox-core/src/test_utils/helpers.rs

use std::sync::Arc;

use toybox_common::traits::SyncChannel;

use crate::db::Database;
use crate::sync::LocalChannel;
use crate::Error;

/// Fresh in-memory SQLite database with migrations applied.
pub async fn setup_test_database() -> Result<Database, Error> {
    let db = Database::new_in_memory().await?;
    db.migrate().await?;
    Ok(db)
}

pub fn local_channel() -> Arc<dyn SyncChannel> {
    Arc::new(LocalChannel::in_memory())
}
