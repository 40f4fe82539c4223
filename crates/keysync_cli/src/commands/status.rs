//! Status command implementation.

use super::{CliStore, CommandResult};
use serde::Serialize;

/// Local sync status.
#[derive(Debug, Serialize)]
pub struct StatusInfo {
    /// Keys with local changes not yet uploaded.
    pub unsynced: Vec<String>,
    /// Keys removed locally whose remote delete is outstanding.
    pub pending_removal: Vec<String>,
}

/// Collects the status of `store`.
pub fn collect(store: &CliStore) -> StatusInfo {
    StatusInfo {
        unsynced: store.unsynced_keys(),
        pending_removal: store.pending_removal_keys(),
    }
}

/// Runs the status command.
pub fn run(store: &CliStore, format: &str) -> CommandResult {
    let info = collect(store);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&info)?),
        _ => {
            println!("Sync Status");
            println!("===========");
            println!("Unsynced:        {}", info.unsynced.len());
            for key in &info.unsynced {
                println!("  {key}");
            }
            println!("Pending removal: {}", info.pending_removal.len());
            for key in &info.pending_removal {
                println!("  {key}");
            }
        }
    }
    Ok(())
}
