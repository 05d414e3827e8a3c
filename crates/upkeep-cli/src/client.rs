//! Connection and session management for the command-line client

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tracing::{debug, info};
use upkeep_config::ClientSettings;
use upkeep_core::{
    CoreError, CredentialBundle, CredentialStore, FileCredentialStore, Session, log_in, resume,
};
use upkeep_ipc::IpcClient;
use upkeep_util::credentials_path;

/// Opens connections to upkeepd and keeps the saved credential bundle
pub struct DaemonClient {
    settings: ClientSettings,
    credentials: FileCredentialStore,
}

impl DaemonClient {
    pub fn new(settings: ClientSettings) -> Self {
        let credentials = FileCredentialStore::new(credentials_path(&settings.data_dir));
        Self {
            settings,
            credentials,
        }
    }

    pub fn credentials(&self) -> &FileCredentialStore {
        &self.credentials
    }

    async fn connect(&self) -> Result<Arc<IpcClient>> {
        let path = &self.settings.socket_path;
        debug!(path = %path.display(), "Connecting to daemon");
        let client = IpcClient::connect(path)
            .await
            .with_context(|| format!("Failed to connect to upkeepd at {}", path.display()))?;
        Ok(Arc::new(client))
    }

    /// Log in with a password and save the bundle for later commands
    pub async fn log_in(&self, username: &str, password: &str) -> Result<CredentialBundle> {
        std::fs::create_dir_all(&self.settings.data_dir).with_context(|| {
            format!(
                "Failed to create data directory {}",
                self.settings.data_dir.display()
            )
        })?;
        let transport = self.connect().await?;
        let bundle = log_in(transport.as_ref(), &self.credentials, username, password).await?;
        info!(username = %bundle.username, "Logged in");
        Ok(bundle)
    }

    pub fn log_out(&self) -> Result<()> {
        self.credentials.clear()?;
        Ok(())
    }

    /// Reconnect with the saved bundle and load the planner
    pub async fn open_session(&self) -> Result<Session> {
        let Some(bundle) = self.credentials.load()? else {
            bail!(CoreError::NotLoggedIn);
        };
        let transport = self.connect().await?;
        match resume(transport.as_ref(), &bundle).await {
            Err(e @ CoreError::KeyVersionMismatch { .. }) => {
                // Password changed elsewhere; the saved key is useless now
                self.credentials.clear()?;
                return Err(e.into());
            }
            other => other?,
        }
        let session = Session::open(transport, &bundle, &self.settings).await?;
        debug!(username = %session.username(), "Session opened");
        Ok(session)
    }
}
