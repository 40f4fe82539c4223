//! Sync command implementation.

use super::{CliStore, CommandResult};
use keysync_engine::SyncReport;
use serde::Serialize;

/// Sync pass summary.
#[derive(Debug, Serialize)]
pub struct SyncSummary {
    /// Keys pulled from the remote.
    pub pulled: Vec<String>,
    /// Keys resolved by merging.
    pub merged: Vec<String>,
    /// Keys uploaded.
    pub pushed: Vec<String>,
    /// Keys removed remotely.
    pub removed: Vec<String>,
    /// Keys that failed, with the reason.
    pub failed: Vec<FailedKey>,
    /// Pass duration in milliseconds.
    pub duration_ms: u128,
}

/// A key the pass could not reconcile.
#[derive(Debug, Serialize)]
pub struct FailedKey {
    /// Entity key.
    pub key: String,
    /// Failure message.
    pub error: String,
}

impl From<&SyncReport> for SyncSummary {
    fn from(report: &SyncReport) -> Self {
        Self {
            pulled: report.pulled.clone(),
            merged: report.merged.clone(),
            pushed: report.pushed.clone(),
            removed: report.removed.clone(),
            failed: report
                .failed
                .iter()
                .map(|(key, e)| FailedKey {
                    key: key.clone(),
                    error: e.to_string(),
                })
                .collect(),
            duration_ms: report.duration.as_millis(),
        }
    }
}

/// Runs one pass over `keys`, or over every unsynced key if empty.
pub async fn reconcile(store: &CliStore, keys: Vec<String>) -> Result<SyncSummary, Box<dyn std::error::Error>> {
    let report = if keys.is_empty() {
        store.trigger_unsynced().await?
    } else {
        store.trigger(keys).await?
    };
    Ok(SyncSummary::from(&report))
}

/// Runs the sync command.
pub async fn run(store: &CliStore, keys: Vec<String>, format: &str) -> CommandResult {
    let summary = reconcile(store, keys).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_text(&summary),
    }

    if summary.failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} key(s) failed to sync", summary.failed.len()).into())
    }
}

fn print_text(summary: &SyncSummary) {
    println!("Sync Pass");
    println!("=========");
    println!("Pulled:   {}", summary.pulled.len());
    println!("Merged:   {}", summary.merged.len());
    println!("Pushed:   {}", summary.pushed.len());
    println!("Removed:  {}", summary.removed.len());
    println!("Duration: {} ms", summary.duration_ms);
    for failed in &summary.failed {
        println!("  FAILED {}: {}", failed.key, failed.error);
    }
}
