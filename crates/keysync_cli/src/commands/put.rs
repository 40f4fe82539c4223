//! Put command implementation.

use super::{CliStore, CommandResult};

/// Runs the put command.
pub async fn run(store: &CliStore, key: &str, value: &str, sync: bool) -> CommandResult {
    let value: serde_json::Value =
        serde_json::from_str(value).map_err(|e| format!("value is not valid JSON: {e}"))?;

    let stored = store.write_batch(vec![(key, value)])?;
    if let Some(record) = stored.first() {
        println!("stored {} (version {})", record.key, record.version);
    }

    if sync {
        let report = store.trigger([key]).await?;
        if let Some((_, e)) = report.failed.first() {
            return Err(format!("sync failed: {e}").into());
        }
        println!("synced {key}");
    }
    Ok(())
}
