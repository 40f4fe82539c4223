//! Get command implementation.

use super::{CliStore, CommandResult};
use keysync_engine::SyncError;

/// Reads `key`, from the remote too unless `local_only`.
pub async fn lookup(
    store: &CliStore,
    key: &str,
    local_only: bool,
) -> Result<Option<serde_json::Value>, Box<dyn std::error::Error>> {
    if local_only {
        return Ok(store.ledger().read(key)?.map(|r| r.value));
    }
    Ok(store.try_read_local_then_remote(key).await?)
}

/// Runs the get command.
pub async fn run(store: &CliStore, key: &str, local_only: bool) -> CommandResult {
    match lookup(store, key, local_only).await? {
        Some(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        None => Err(SyncError::NotFound {
            key: key.to_string(),
        }
        .into()),
    }
}
