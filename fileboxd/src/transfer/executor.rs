use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use filebox_core::FileboxError;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio_util::io::ReaderStream;

use super::queue::RunId;
use super::task::TransferSpec;
use crate::config::ConnectionSettings;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("backend address is not configured")]
    NotConfigured,
    #[error(transparent)]
    Api(#[from] FileboxError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Progress {
        run: RunId,
        percent: u8,
    },
    Done {
        run: RunId,
        result: Result<(), TransferError>,
    },
}

/// Forwards byte counts from a running transfer as whole percentages.
pub struct ProgressSink {
    run: RunId,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    last: Option<u8>,
}

impl ProgressSink {
    pub(crate) fn new(run: RunId, tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { run, tx, last: None }
    }

    /// Unknown totals produce no updates.
    pub fn report(&mut self, transferred: u64, total: Option<u64>) {
        let Some(percent) = percent(transferred, total) else {
            return;
        };
        if self.last.is_some_and(|last| last >= percent) {
            return;
        }
        self.last = Some(percent);
        let _ = self.tx.send(WorkerMessage::Progress {
            run: self.run,
            percent,
        });
    }
}

pub fn percent(transferred: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|total| *total > 0)?;
    let done = transferred.min(total) as u128 * 100 / total as u128;
    Some(done as u8)
}

/// Moves the bytes of one transfer. Implementations must leave no partial
/// local file behind when they fail or when their future is dropped.
pub trait TransferExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        spec: &TransferSpec,
        progress: ProgressSink,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Executes transfers against the backend currently named by the settings.
pub struct HttpTransferExecutor {
    http: reqwest::Client,
    settings: watch::Receiver<ConnectionSettings>,
}

impl HttpTransferExecutor {
    pub fn new(http: reqwest::Client, settings: watch::Receiver<ConnectionSettings>) -> Self {
        Self { http, settings }
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_dir: &str,
        size: u64,
        mut progress: ProgressSink,
    ) -> Result<(), TransferError> {
        let client = self.client()?;
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = tokio::fs::File::open(local_path).await?;

        let mut sent = 0u64;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                progress.report(sent, Some(size));
            }
            chunk
        });
        let body = reqwest::Body::wrap_stream(stream);
        client.upload(remote_dir, &file_name, body, size).await?;
        Ok(())
    }

    async fn download(
        &self,
        relpath: &str,
        target: &Path,
        mut progress: ProgressSink,
    ) -> Result<(), TransferError> {
        let client = self.client()?;
        let response = client.download(relpath).await?;
        let total = response.content_length();

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = PartialFile::new(partial_path(target));
        let mut file = tokio::fs::File::create(partial.path()).await?;
        let mut stream = response.bytes_stream();
        let mut received = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            progress.report(received, total);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(partial.path(), target).await?;
        partial.commit();
        Ok(())
    }

    fn client(&self) -> Result<filebox_core::FileboxClient, TransferError> {
        self.settings
            .borrow()
            .client(&self.http)
            .ok_or(TransferError::NotConfigured)
    }
}

impl TransferExecutor for HttpTransferExecutor {
    async fn execute(&self, spec: &TransferSpec, progress: ProgressSink) -> Result<(), TransferError> {
        match spec {
            TransferSpec::Upload {
                local_path,
                remote_dir,
                size,
            } => self.upload(local_path, remote_dir, *size, progress).await,
            TransferSpec::Download { relpath, save_path } => {
                self.download(relpath, save_path, progress).await
            }
        }
    }
}

/// Removes the in-progress download unless it was committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}
