use std::time::Duration;

use anyhow::Context;
use filebox_core::FileboxClient;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ClientConfig, SettingsHandle};
use crate::monitor::{
    AnyConnector, HttpSnapshotSource, MonitorConfig, MonitorHandle, spawn_monitor,
};
use crate::transfer::{
    Direction, HttpTransferExecutor, TransferHandle, TransferLimits, spawn_transfer_queue,
};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Owns the shared HTTP client and settings, and the background tasks
/// spawned from them.
pub struct ClientRuntime {
    config: ClientConfig,
    settings: SettingsHandle,
    http: reqwest::Client,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientRuntime {
    pub fn bootstrap(config: ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")?;
        let settings = SettingsHandle::new(config.connection.clone());
        debug!(
            base_url = ?config.connection.base_url,
            transport = ?config.push_transport,
            "client runtime ready"
        );
        Ok(Self {
            config,
            settings,
            http,
            tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// A backend client for one-off calls with the current settings.
    pub fn client(&self) -> anyhow::Result<FileboxClient> {
        self.settings
            .current()
            .client(&self.http)
            .context("FILEBOX_API_BASE_URL is not set")
    }

    pub fn start_transfers(&mut self, direction: Direction) -> TransferHandle {
        let executor = HttpTransferExecutor::new(self.http.clone(), self.settings.subscribe());
        let limits = TransferLimits {
            max_upload_bytes: self.config.upload_max_bytes,
            download_dir: self.config.download_dir.clone(),
        };
        let (handle, task) = spawn_transfer_queue(direction, executor, limits);
        info!(%direction, "transfer queue started");
        self.tasks.push(task);
        handle
    }

    pub fn start_monitor(&mut self) -> MonitorHandle {
        let (handle, task) = spawn_monitor(
            MonitorConfig::from_client_config(&self.config),
            AnyConnector::for_transport(self.config.push_transport),
            HttpSnapshotSource::new(self.http.clone()),
            self.settings.subscribe(),
        );
        info!(
            transport = ?self.config.push_transport,
            poll_mode = ?self.config.poll_mode,
            "connectivity monitor started"
        );
        self.tasks.push(task);
        handle
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        debug!("client runtime stopped");
    }
}
