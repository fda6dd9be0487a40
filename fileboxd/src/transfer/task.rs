use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transfer as requested by the front end, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRequest {
    Upload {
        local_path: PathBuf,
        remote_dir: String,
    },
    /// Without `save_path` the file lands in the configured download directory.
    Download {
        relpath: String,
        save_path: Option<PathBuf>,
    },
}

impl TransferRequest {
    pub fn upload(local_path: impl Into<PathBuf>, remote_dir: impl Into<String>) -> Self {
        Self::Upload {
            local_path: local_path.into(),
            remote_dir: remote_dir.into(),
        }
    }

    pub fn download(relpath: impl Into<String>) -> Self {
        Self::Download {
            relpath: relpath.into(),
            save_path: None,
        }
    }

    pub fn download_to(relpath: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self::Download {
            relpath: relpath.into(),
            save_path: Some(save_path.into()),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Upload { .. } => Direction::Upload,
            Self::Download { .. } => Direction::Download,
        }
    }

    pub fn source(&self) -> String {
        match self {
            Self::Upload { local_path, .. } => local_path.display().to_string(),
            Self::Download { relpath, .. } => relpath.clone(),
        }
    }
}

/// A validated transfer: both ends are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSpec {
    Upload {
        local_path: PathBuf,
        remote_dir: String,
        size: u64,
    },
    Download {
        relpath: String,
        save_path: PathBuf,
    },
}

impl TransferSpec {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Upload { .. } => Direction::Upload,
            Self::Download { .. } => Direction::Download,
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            Self::Upload { local_path, .. } => local_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| local_path.display().to_string()),
            Self::Download { relpath, .. } => remote_basename(relpath).to_string(),
        }
    }

    pub(crate) fn same_source(&self, other: &TransferSpec) -> bool {
        match (self, other) {
            (
                Self::Upload { local_path: a, .. },
                Self::Upload { local_path: b, .. },
            ) => a == b,
            (
                Self::Download {
                    relpath: a,
                    save_path: sa,
                },
                Self::Download {
                    relpath: b,
                    save_path: sb,
                },
            ) => a == b && sa == sb,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Active,
    Succeeded,
    Failed { error: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub id: TaskId,
    pub spec: TransferSpec,
    pub progress: u8,
    pub status: TaskStatus,
}

impl TransferTask {
    pub fn direction(&self) -> Direction {
        self.spec.direction()
    }

    pub fn name(&self) -> String {
        self.spec.file_name()
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("file path must not be empty")]
    EmptyPath,
    #[error("file does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("path is not a file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("file is not readable: {}: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },
    #[error("file exceeds the upload limit ({size} > {max} bytes)")]
    TooLarge { size: u64, max: u64 },
    #[error("remote path must not be empty")]
    EmptyRemotePath,
    #[error("already queued: {0}")]
    AlreadyQueued(String),
}

#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub max_upload_bytes: u64,
    pub download_dir: PathBuf,
}

/// Checks a request against the local filesystem and resolves defaults.
pub async fn validate(
    request: TransferRequest,
    limits: &TransferLimits,
) -> Result<TransferSpec, ValidationError> {
    match request {
        TransferRequest::Upload {
            local_path,
            remote_dir,
        } => {
            if local_path.as_os_str().is_empty() {
                return Err(ValidationError::EmptyPath);
            }
            let metadata = tokio::fs::metadata(&local_path)
                .await
                .map_err(|err| unreadable(&local_path, err))?;
            if !metadata.is_file() {
                return Err(ValidationError::NotAFile(local_path));
            }
            let size = metadata.len();
            if size > limits.max_upload_bytes {
                return Err(ValidationError::TooLarge {
                    size,
                    max: limits.max_upload_bytes,
                });
            }
            tokio::fs::File::open(&local_path)
                .await
                .map_err(|err| unreadable(&local_path, err))?;
            Ok(TransferSpec::Upload {
                local_path,
                remote_dir,
                size,
            })
        }
        TransferRequest::Download { relpath, save_path } => {
            let relpath = relpath.trim().to_string();
            let name = remote_basename(&relpath);
            if name.is_empty() {
                return Err(ValidationError::EmptyRemotePath);
            }
            let save_path = save_path.unwrap_or_else(|| limits.download_dir.join(name));
            Ok(TransferSpec::Download { relpath, save_path })
        }
    }
}

fn unreadable(path: &Path, err: io::Error) -> ValidationError {
    if err.kind() == io::ErrorKind::NotFound {
        ValidationError::NotFound(path.to_path_buf())
    } else {
        ValidationError::Unreadable {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

fn remote_basename(relpath: &str) -> &str {
    relpath
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}
