//! Remote offload of finished backups over SSH (SFTP), Amazon S3 or Azure
//! Blob Storage.
//!
//! Every driver presents the same three-phase surface: `setup` opens and
//! checks the connection, `execute`-style uploads push one file at a time,
//! `teardown` releases the connection. [`GenericRemoteStorage`] hides the
//! concrete driver behind one enum, mirrored by the storage kind in the
//! engine configuration. All uploads draw from the shared network token
//! bucket when one is configured.

mod azure_blob;
mod s3_bucket;
mod ssh;

pub use azure_blob::{AzureBlobStorage, AzureConfig};
pub use s3_bucket::{S3Bucket, S3Config};
pub use ssh::{SshConfig, SshStorage};

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use utils::rate_limit::TokenBucket;

#[derive(Debug, thiserror::Error)]
pub enum RemoteStorageError {
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote checksum mismatch for {path}: local {local}, remote {remote}")]
    ChecksumMismatch {
        path: String,
        local: String,
        remote: String,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Path of an object relative to the storage root, always `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "remote path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_owned()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn join(&self, path: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(path))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which backend to offload to, with its credentials.
#[derive(Debug, Clone)]
pub enum RemoteStorageKind {
    Ssh(SshConfig),
    AwsS3(S3Config),
    AzureBlob(AzureConfig),
}

#[derive(Debug, Clone)]
pub struct RemoteStorageConfig {
    pub storage: RemoteStorageKind,
    /// Prefix all object paths with this, e.g. an operator-chosen base dir.
    pub prefix_in_storage: Option<RemotePath>,
}

/// One configured driver behind a uniform interface.
pub enum GenericRemoteStorage {
    Ssh(SshStorage),
    AwsS3(S3Bucket),
    AzureBlob(AzureBlobStorage),
}

impl GenericRemoteStorage {
    pub fn from_config(config: &RemoteStorageConfig) -> anyhow::Result<Self> {
        Ok(match &config.storage {
            RemoteStorageKind::Ssh(ssh_config) => {
                info!("using SSH remote storage at {}", ssh_config.host);
                GenericRemoteStorage::Ssh(SshStorage::new(ssh_config.clone())?)
            }
            RemoteStorageKind::AwsS3(s3_config) => {
                info!(
                    "using S3 remote storage, bucket {}, region {}",
                    s3_config.bucket_name, s3_config.region
                );
                GenericRemoteStorage::AwsS3(S3Bucket::new(s3_config.clone())?)
            }
            RemoteStorageKind::AzureBlob(azure_config) => {
                info!(
                    "using Azure remote storage, account {}, container {}",
                    azure_config.account, azure_config.container
                );
                GenericRemoteStorage::AzureBlob(AzureBlobStorage::new(azure_config.clone())?)
            }
        })
    }

    /// Open the connection and verify the credentials work.
    pub async fn setup(&self) -> Result<(), RemoteStorageError> {
        match self {
            GenericRemoteStorage::Ssh(s) => s.setup().await,
            GenericRemoteStorage::AwsS3(s) => s.setup().await,
            GenericRemoteStorage::AzureBlob(s) => s.setup().await,
        }
    }

    /// Upload the content of one local file to `remote_path`.
    pub async fn upload_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), RemoteStorageError> {
        if cancel.is_cancelled() {
            return Err(RemoteStorageError::Cancelled);
        }
        match self {
            GenericRemoteStorage::Ssh(s) => s.upload_file(local_path, remote_path).await,
            GenericRemoteStorage::AwsS3(s) => s.upload_file(local_path, remote_path).await,
            GenericRemoteStorage::AzureBlob(s) => s.upload_file(local_path, remote_path).await,
        }
    }

    pub async fn teardown(&self) {
        if let GenericRemoteStorage::Ssh(s) = self {
            s.teardown().await;
        }
        // HTTP drivers hold no per-operation state.
    }
}

/// Upload a whole backup directory: every regular file under `local_dir`
/// lands at `<prefix>/<server>/backup/<label>/<relative path>`. Traversal
/// is deterministic so retries re-upload in the same order.
pub async fn upload_backup_dir(
    storage: &GenericRemoteStorage,
    config: &RemoteStorageConfig,
    local_dir: &Utf8Path,
    server_name: &str,
    label: &str,
    network_bucket: Option<&Arc<TokenBucket>>,
    cancel: &CancellationToken,
) -> Result<u64, RemoteStorageError> {
    let mut uploaded = 0u64;
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(local_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| RemoteStorageError::Io(e.into()))?;
        if entry.file_type().is_file() {
            let path = Utf8PathBuf::from_path_buf(entry.path().to_owned())
                .map_err(|p| RemoteStorageError::Rejected(format!("non-utf8 path {p:?}")))?;
            files.push(path);
        }
    }

    let base = match &config.prefix_in_storage {
        Some(prefix) => prefix.join(server_name).join("backup").join(label),
        None => RemotePath::from_string(server_name)
            .expect("server name is relative")
            .join("backup")
            .join(label),
    };

    for local_path in files {
        if cancel.is_cancelled() {
            return Err(RemoteStorageError::Cancelled);
        }
        let relative = local_path
            .strip_prefix(local_dir)
            .expect("walkdir yields paths under the root");
        let remote_path = base.join(relative);
        if let Some(bucket) = network_bucket {
            let size = tokio::fs::metadata(&local_path).await?.len();
            bucket.acquire(size).await;
        }
        storage.upload_file(&local_path, &remote_path, cancel).await?;
        uploaded += 1;
    }
    info!("uploaded {uploaded} files for {server_name}/{label}");
    Ok(uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_must_be_relative() {
        assert!(RemotePath::from_string("a/b").is_ok());
        assert!(RemotePath::from_string("/absolute").is_err());
    }

    #[test]
    fn remote_path_join() {
        let p = RemotePath::from_string("base").unwrap();
        assert_eq!(p.join("srv").join("backup").to_string(), "base/srv/backup");
    }
}
