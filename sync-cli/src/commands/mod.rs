//! CLI command implementations.

pub mod init;
pub mod rotate;
pub mod status;
pub mod sync;
pub mod tasks;

use anyhow::{Context, Result};
use opsync_client::{ClientState, HttpTransport, SyncClient, SyncConfig};
use opsync_core::RetryPolicy;
use opsync_types::{ClientId, UserId};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{self, DeviceConfig};

/// Retry schedule for interactive use: give up within a few seconds.
fn cli_sync_config() -> SyncConfig {
    SyncConfig::default().with_retry(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        max_jitter: Duration::from_millis(250),
    })
}

/// A loaded device: its configuration and a client over its saved state.
pub struct Session {
    data_dir: PathBuf,
    /// Device configuration.
    pub device: DeviceConfig,
    /// Client bound to the configured server.
    pub client: SyncClient<HttpTransport>,
}

impl Session {
    /// Load the device in `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let device = DeviceConfig::load(data_dir).await?;
        let user_id = UserId::new(device.user_id.as_str());
        let sync_config = cli_sync_config();

        let state = match config::load_state(data_dir).await? {
            Some(state) => state,
            None => ClientState::new(user_id.clone(), ClientId::random(), sync_config.max_pending),
        };
        let transport = HttpTransport::new(device.server_url.as_str(), user_id)
            .context("Invalid server URL")?;

        let mut client = SyncClient::from_state(sync_config, state, transport);
        if let Some(key) = device.payload_key()? {
            client = client.with_key(key);
        }

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            device,
            client,
        })
    }

    /// Write the client state back to disk.
    pub async fn save(&self) -> Result<()> {
        config::save_state(&self.data_dir, &self.client.export_state()).await
    }

    /// Write the device configuration back to disk.
    pub async fn save_device(&self) -> Result<()> {
        self.device.save(&self.data_dir).await
    }
}

/// Read a password from the terminal without echo, asking twice.
pub fn prompt_new_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let confirm =
        rpassword::prompt_password("Confirm password: ").context("Failed to read password")?;
    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }
    Ok(password)
}

/// Reject passwords that cannot protect anything.
pub fn check_password(password: &str) -> Result<()> {
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    Ok(())
}
