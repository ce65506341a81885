//! Initialize this device for an account.

use anyhow::Result;
use opsync_client::{ClientState, PayloadKey, SyncConfig};
use opsync_types::{ClientId, UserId};
use std::path::Path;

use super::{check_password, prompt_new_password};
use crate::config::{self, DeviceConfig};

/// How the payload key is obtained.
#[derive(Debug)]
pub enum KeySource {
    /// Store payloads in plaintext.
    None,
    /// Derive from this password.
    Password(String),
    /// Ask on the terminal.
    Prompt,
}

/// Run the init command.
pub async fn run(data_dir: &Path, server_url: &str, user: &str, key_source: KeySource) -> Result<()> {
    if DeviceConfig::exists(data_dir).await {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            data_dir.join("device.json").display()
        );
    }
    if user.trim().is_empty() {
        anyhow::bail!("Account id must not be empty");
    }

    let user_id = UserId::new(user);
    let password = match key_source {
        KeySource::None => None,
        KeySource::Password(password) => Some(password),
        KeySource::Prompt => Some(prompt_new_password()?),
    };
    let key = match password {
        Some(password) => {
            check_password(&password)?;
            Some(PayloadKey::from_password(&password, &user_id)?)
        }
        None => None,
    };

    let device = DeviceConfig::new(server_url, user, key.as_ref());
    device.save(data_dir).await?;

    let client_id = ClientId::random();
    let state = ClientState::new(user_id, client_id.clone(), SyncConfig::default().max_pending);
    config::save_state(data_dir, &state).await?;

    println!("Device initialized successfully!");
    println!();
    println!("  Account:    {}", device.user_id);
    println!("  Client ID:  {}", client_id);
    println!("  Server:     {}", device.server_url);
    match &key {
        Some(key) => println!("  Encryption: on (key id {})", key.key_id()),
        None => println!("  Encryption: off"),
    }
    println!("  Data dir:   {}", data_dir.display());
    println!();
    println!("Next steps:");
    println!("  1. Add a task:   opsync add \"Buy milk\"");
    println!("  2. Sync:         opsync sync");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_device_and_state() {
        let dir = tempdir().unwrap();
        run(dir.path(), "http://localhost:8080", "alice", KeySource::None)
            .await
            .unwrap();

        assert!(dir.path().join("device.json").exists());
        let device = DeviceConfig::load(dir.path()).await.unwrap();
        assert_eq!(device.user_id, "alice");
        assert!(device.key_hex.is_none());

        let state = config::load_state(dir.path()).await.unwrap().unwrap();
        assert_eq!(state.status.user_id().as_str(), "alice");
    }

    #[tokio::test]
    async fn init_with_password_stores_derived_key() {
        let dir = tempdir().unwrap();
        run(
            dir.path(),
            "http://localhost:8080",
            "alice",
            KeySource::Password("hunter2".into()),
        )
        .await
        .unwrap();

        let device = DeviceConfig::load(dir.path()).await.unwrap();
        let stored = device.payload_key().unwrap().unwrap();
        let expected = PayloadKey::from_password("hunter2", &UserId::new("alice")).unwrap();
        assert_eq!(stored.key_id(), expected.key_id());
    }

    #[tokio::test]
    async fn init_rejects_empty_password() {
        let dir = tempdir().unwrap();
        let result = run(
            dir.path(),
            "http://localhost:8080",
            "alice",
            KeySource::Password(String::new()),
        )
        .await;
        assert!(result.is_err());
        assert!(!dir.path().join("device.json").exists());
    }

    #[tokio::test]
    async fn init_fails_if_already_initialized() {
        let dir = tempdir().unwrap();

        run(dir.path(), "http://localhost:8080", "alice", KeySource::None)
            .await
            .unwrap();

        let result = run(dir.path(), "http://localhost:8080", "bob", KeySource::None).await;
        assert!(result.is_err());
    }
}
