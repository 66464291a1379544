//! Persistence Adapters
//!
//! SQLite implementation of the alert history port.

mod schema;
mod sqlite_store;

pub use sqlite_store::SqliteAlertStore;

use crate::application::ports::StoreError;

/// Run a synchronous store operation on the blocking thread pool.
///
/// # Errors
///
/// Returns the operation's error, or `StoreError::Io` if the task panicked.
pub async fn run_blocking<T, F>(operation: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| StoreError::Io(format!("store task failed: {e}")))?
}
