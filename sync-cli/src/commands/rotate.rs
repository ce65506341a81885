//! Change the account password.

use anyhow::{Context, Result};
use opsync_client::PayloadKey;
use opsync_types::UserId;
use std::path::Path;

use super::{check_password, prompt_new_password, Session};

/// Run the rotate-password command.
///
/// Re-encrypts the account on the server under the new password, then
/// stores the new key. Other devices must run `opsync init` again.
pub async fn run(data_dir: &Path, password: Option<String>) -> Result<()> {
    let mut session = Session::open(data_dir).await?;
    let password = match password {
        Some(password) => password,
        None => prompt_new_password()?,
    };
    check_password(&password)?;

    let key = PayloadKey::from_password(&password, &UserId::new(session.device.user_id.as_str()))?;
    session
        .client
        .rotate_key(key.clone())
        .await
        .context("Password change failed; run the command again")?;

    session.device.set_key(&key);
    session.save_device().await?;
    session.save().await?;

    println!("Password changed (key id {}).", key.key_id());
    println!("Other devices must re-run 'opsync init' with the new password.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::init::{self, KeySource};
    use crate::config::DeviceConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn rejects_empty_password_before_network() {
        let dir = tempdir().unwrap();
        init::run(dir.path(), "http://127.0.0.1:9", "alice", KeySource::None)
            .await
            .unwrap();

        let result = run(dir.path(), Some(String::new())).await;
        assert!(result.unwrap_err().to_string().contains("empty"));
        assert!(DeviceConfig::load(dir.path()).await.unwrap().key_hex.is_none());
    }
}
