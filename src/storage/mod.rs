pub mod postgres;
pub mod sqlite;
pub mod trait_def;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use trait_def::{
    DurableStore, HeatmapRollupRow, RollupDelta, RollupRow, StorageError, StorageResult,
};

use std::future::Future;
use std::time::Duration;

/// Upper bound on any single durable-store call; a hung backend degrades
/// to the next tier instead of hanging the caller.
pub const DURABLE_CALL_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn bounded<T>(fut: impl Future<Output = StorageResult<T>>) -> StorageResult<T> {
    match tokio::time::timeout(DURABLE_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout),
    }
}
