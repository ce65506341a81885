//! Show sync status.

use anyhow::Result;
use std::path::Path;

use super::Session;
use crate::config::{unix_now, DeviceConfig};

/// Run the status command.
pub async fn run(data_dir: &Path, remote: bool) -> Result<()> {
    println!("=== opsync status ===");
    println!();

    if !DeviceConfig::exists(data_dir).await {
        println!("Device: NOT INITIALIZED");
        println!();
        println!("Run 'opsync init --server <url> --user <account>' to initialize.");
        return Ok(());
    }

    let session = Session::open(data_dir).await?;
    let device = &session.device;
    println!("Device:");
    println!("  Account:    {}", device.user_id);
    println!("  Client ID:  {}", session.client.client_id());
    println!("  Server:     {}", device.server_url);
    println!(
        "  Encryption: {}",
        if device.key_hex.is_some() { "on" } else { "off" }
    );
    println!("  Init:       {}", format_timestamp(device.created_at));
    println!();

    let status = session.client.status();
    println!("Local:");
    println!("  Pending:    {}", status.pending_count);
    if status.rejected_count > 0 {
        println!("  Rejected:   {}", status.rejected_count);
    }
    if status.held_back_count > 0 {
        println!("  Held back:  {}", status.held_back_count);
    }
    println!(
        "  Cursor:     {} of {}",
        status.cursor, status.latest_server_seq
    );
    match status.last_remote_check {
        Some(ms) => println!(
            "  Last sync:  {}",
            format_timestamp(ms.max(0) as u64 / 1000)
        ),
        None => println!("  Last sync:  never"),
    }
    if let Some(err) = &status.last_error {
        println!("  Last error: {err}");
    }
    for recorded in session.client.recorded_errors().iter().rev().take(3) {
        println!("  Failed op:  {} ({})", recorded.op_id, recorded.reason);
    }

    if remote {
        println!();
        let server = session.client.server_status().await?;
        session.save().await?;
        println!("Server:");
        println!("  Latest seq: {}", server.latest_seq);
        println!("  Online:     {} devices", server.devices_online);
        println!(
            "  Storage:    {} of {} bytes",
            server.storage_used_bytes, server.storage_quota_bytes
        );
    } else if status.is_up_to_date() {
        println!();
        println!("Up to date as of the last sync.");
    }

    Ok(())
}

/// Format a Unix timestamp as a human-readable string.
pub fn format_timestamp(ts: u64) -> String {
    let diff = unix_now().saturating_sub(ts);

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init::{self, KeySource};
    use tempfile::tempdir;

    #[tokio::test]
    async fn status_without_init() {
        let dir = tempdir().unwrap();

        // Should succeed but show "not initialized"
        let result = run(dir.path(), false).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn status_with_device() {
        let dir = tempdir().unwrap();
        init::run(dir.path(), "http://127.0.0.1:9", "alice", KeySource::None)
            .await
            .unwrap();

        let result = run(dir.path(), false).await;
        assert!(result.is_ok());
    }

    #[test]
    fn format_timestamp_works() {
        let now = unix_now();

        assert_eq!(format_timestamp(now), "just now");
        assert!(format_timestamp(now - 120).contains("minutes"));
        assert!(format_timestamp(now - 7200).contains("hours"));
        assert!(format_timestamp(now - 172800).contains("days"));
    }
}
