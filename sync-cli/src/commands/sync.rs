//! Talk to the server: sync, compaction, restore points.

use anyhow::Result;
use opsync_client::{ClientError, SyncReport};
use std::path::Path;

use super::Session;

fn explain(err: &ClientError) -> Option<&'static str> {
    match err {
        ClientError::QuotaExceeded { .. } => {
            Some("Your edits are kept locally. Run 'opsync compact' or free space on the server.")
        }
        ClientError::Decryption { .. } => Some(
            "The account password was changed on another device. Re-run 'opsync init' with the new password.",
        ),
        _ => None,
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "Pushed: {} accepted, {} duplicate, {} rejected",
        report.push.accepted, report.push.duplicates, report.push.rejected
    );
    println!(
        "Pulled: {} applied, {} unchanged, {} conflicts resolved",
        report.pull.applied, report.pull.skipped, report.pull.conflicts
    );
    if report.pull.errors > 0 {
        println!("  {} operations could not be applied", report.pull.errors);
    }
    if report.pull.held_back > 0 {
        println!(
            "  {} operations need a newer client and were kept for later",
            report.pull.held_back
        );
    }
    if report.pull.gap_resets > 0 {
        println!("  Server history was compacted; resynced from the start");
    }
}

/// Run the sync command.
pub async fn run(data_dir: &Path) -> Result<()> {
    let session = Session::open(data_dir).await?;

    let result = session.client.sync().await;
    // Partial progress (accepted uploads, applied pages) is kept either way.
    session.save().await?;

    match result {
        Ok(report) => {
            print_report(&report);
            let status = session.client.status();
            println!("Cursor: {}", status.cursor);
            Ok(())
        }
        Err(err) => {
            tracing::debug!(error = ?err, "sync failed");
            if let Some(hint) = explain(&err) {
                eprintln!("{hint}");
            }
            Err(err.into())
        }
    }
}

/// Run the compact command.
pub async fn compact(data_dir: &Path) -> Result<()> {
    let session = Session::open(data_dir).await?;
    let result = session.client.compact().await?;

    if result.success {
        println!(
            "Compacted: {} operations removed, {} bytes freed",
            result.deleted_count, result.freed_bytes
        );
    } else {
        println!("Nothing to compact (need at least two restore points).");
    }
    Ok(())
}

/// Run the restore-points command.
pub async fn restore_points(data_dir: &Path, limit: u32) -> Result<()> {
    let session = Session::open(data_dir).await?;
    let points = session.client.restore_points(limit).await?.restore_points;

    if points.is_empty() {
        println!("No restore points.");
        return Ok(());
    }
    for point in points {
        println!(
            "#{:<6} {:<12} from {} ({})",
            point.server_seq.value(),
            point.op_type.to_string(),
            point.client_id,
            super::status::format_timestamp(point.created_at.max(0) as u64 / 1000)
        );
    }
    Ok(())
}
