//! Rm command implementation.

use super::{CliStore, CommandResult};

/// Runs the rm command.
pub async fn run(store: &CliStore, keys: &[String], force: bool) -> CommandResult {
    if force {
        store.force_remove(keys)?;
        println!("removed {} key(s) locally", keys.len());
        return Ok(());
    }

    let report = store.remove_batch(keys)?.await?;
    println!("removed {} key(s)", report.removed.len());

    let pending = store.pending_removal_keys();
    if !pending.is_empty() {
        println!("remote delete pending for: {}", pending.join(", "));
    }
    Ok(())
}
