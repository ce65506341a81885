//! Configuration management for the opsync CLI.
//!
//! Two files live in the data directory, both readable only by the owner:
//!
//! - `device.json`: server, account and the derived payload key
//! - `state.json`: the client's operation log, entity state and cursor

use anyhow::{Context, Result};
use opsync_client::{ClientState, PayloadKey};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEVICE_FILE: &str = "device.json";
const STATE_FILE: &str = "state.json";

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Device configuration stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Base URL of the sync server.
    pub server_url: String,
    /// Account this device syncs.
    pub user_id: String,
    /// When the device was initialized.
    pub created_at: u64,
    /// Hex-encoded payload key; absent when encryption is off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hex: Option<String>,
}

impl DeviceConfig {
    /// Create a new device configuration.
    pub fn new(server_url: &str, user_id: &str, key: Option<&PayloadKey>) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            created_at: unix_now(),
            key_hex: key.map(PayloadKey::to_hex),
        }
    }

    /// The stored payload key, if encryption is on.
    pub fn payload_key(&self) -> Result<Option<PayloadKey>> {
        self.key_hex
            .as_deref()
            .map(PayloadKey::from_hex)
            .transpose()
            .context("Stored payload key is corrupt")
    }

    /// Replace the stored payload key.
    pub fn set_key(&mut self, key: &PayloadKey) {
        self.key_hex = Some(key.to_hex());
    }

    /// Load device configuration from a directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Device not initialized. Run 'opsync init' first.")?;
        serde_json::from_str(&contents).context("Invalid device configuration")
    }

    /// Save device configuration to a directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(DEVICE_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to save device configuration")?;
        set_file_permissions_0600(&path).await?;
        Ok(())
    }

    /// Check if device is initialized.
    pub async fn exists(data_dir: &Path) -> bool {
        tokio::fs::try_exists(data_dir.join(DEVICE_FILE))
            .await
            .unwrap_or(false)
    }
}

/// Load the persisted client state, if any.
pub async fn load_state(data_dir: &Path) -> Result<Option<ClientState>> {
    let path = data_dir.join(STATE_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .context("Invalid client state"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context("Failed to read client state"),
    }
}

/// Persist client state, replacing the previous file atomically.
pub async fn save_state(data_dir: &Path, state: &ClientState) -> Result<()> {
    let path = data_dir.join(STATE_FILE);
    let tmp = data_dir.join(format!("{STATE_FILE}.tmp"));
    let contents = serde_json::to_vec(state)?;
    tokio::fs::write(&tmp, contents)
        .await
        .context("Failed to write client state")?;
    set_file_permissions_0600(&tmp).await?;
    tokio::fs::rename(&tmp, &path)
        .await
        .context("Failed to save client state")?;
    Ok(())
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms)
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Create the data directory with permissions 0700 on Unix.
pub async fn ensure_data_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .context("Failed to create data directory")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        tokio::fs::set_permissions(path, perms)
            .await
            .context("Failed to set directory permissions")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_types::{ClientId, UserId};
    use tempfile::tempdir;

    #[tokio::test]
    async fn device_config_roundtrip() {
        let dir = tempdir().unwrap();
        let config = DeviceConfig::new("http://localhost:8080/", "alice", None);
        config.save(dir.path()).await.unwrap();

        let loaded = DeviceConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded.server_url, "http://localhost:8080");
        assert_eq!(loaded.user_id, "alice");
        assert!(loaded.payload_key().unwrap().is_none());
    }

    #[tokio::test]
    async fn stored_key_survives_reload() {
        let dir = tempdir().unwrap();
        let key = PayloadKey::random();
        let config = DeviceConfig::new("http://localhost:8080", "alice", Some(&key));
        config.save(dir.path()).await.unwrap();

        let loaded = DeviceConfig::load(dir.path()).await.unwrap();
        let restored = loaded.payload_key().unwrap().unwrap();
        assert_eq!(restored.key_id(), key.key_id());
    }

    #[tokio::test]
    async fn load_missing_device_fails() {
        let dir = tempdir().unwrap();
        let err = DeviceConfig::load(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("opsync init"));
        assert!(!DeviceConfig::exists(dir.path()).await);
    }

    #[tokio::test]
    async fn state_roundtrip() {
        let dir = tempdir().unwrap();
        assert!(load_state(dir.path()).await.unwrap().is_none());

        let state = ClientState::new(UserId::new("alice"), ClientId::new("laptop"), 100);
        save_state(dir.path(), &state).await.unwrap();

        let loaded = load_state(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        ensure_data_dir(&data_dir).await.unwrap();
        DeviceConfig::new("http://localhost:8080", "alice", None)
            .save(&data_dir)
            .await
            .unwrap();

        let dir_mode = std::fs::metadata(&data_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(data_dir.join("device.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
