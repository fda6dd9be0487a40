use std::future::Future;

use filebox_core::FileboxError;
use thiserror::Error;

use super::router::DeviceDescriptor;
use crate::config::ConnectionSettings;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("backend address is not configured")]
    NotConfigured,
    #[error("not authenticated: {0}")]
    Unauthorized(#[source] FileboxError),
    #[error(transparent)]
    Backend(FileboxError),
}

impl From<FileboxError> for SnapshotError {
    fn from(err: FileboxError) -> Self {
        if err.is_auth() {
            SnapshotError::Unauthorized(err)
        } else {
            SnapshotError::Backend(err)
        }
    }
}

/// Point-in-time list of mounted devices.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch(
        &self,
        settings: &ConnectionSettings,
    ) -> impl Future<Output = Result<Vec<DeviceDescriptor>, SnapshotError>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct HttpSnapshotSource {
    http: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Vec<DeviceDescriptor>, SnapshotError> {
        let client = settings
            .client(&self.http)
            .ok_or(SnapshotError::NotConfigured)?;
        let devices = client.list_usb_devices().await?;
        Ok(devices
            .into_iter()
            .map(|device| {
                let label = device.display_label().to_string();
                DeviceDescriptor::new(device.device, label)
            })
            .collect())
    }
}
