//! SSH driver: SFTP upload of backup files, followed by a remote SHA-256
//! of each uploaded file which must match the local digest.
//!
//! libssh2 sessions are blocking, so the session lives behind a mutex and
//! every operation runs on the blocking pool.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{RemotePath, RemoteStorageError};

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Password auth when set; key auth otherwise.
    pub password: Option<String>,
    pub private_key_path: Option<camino::Utf8PathBuf>,
    /// Directory on the remote host under which backups land.
    pub base_path: String,
}

pub struct SshStorage {
    config: SshConfig,
    session: Arc<Mutex<Option<ssh2::Session>>>,
}

impl SshStorage {
    pub fn new(config: SshConfig) -> anyhow::Result<SshStorage> {
        anyhow::ensure!(!config.host.is_empty(), "ssh host must be set");
        anyhow::ensure!(!config.user.is_empty(), "ssh user must be set");
        Ok(SshStorage {
            config,
            session: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn setup(&self) -> Result<(), RemoteStorageError> {
        let config = self.config.clone();
        let session_slot = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let tcp = TcpStream::connect((config.host.as_str(), config.port))
                .map_err(|e| RemoteStorageError::Network(e.to_string()))?;
            let mut session =
                ssh2::Session::new().map_err(|e| RemoteStorageError::Network(e.to_string()))?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| RemoteStorageError::Network(e.to_string()))?;
            match (&config.password, &config.private_key_path) {
                (Some(password), _) => session
                    .userauth_password(&config.user, password)
                    .map_err(|e| RemoteStorageError::Rejected(format!("ssh auth failed: {e}")))?,
                (None, Some(key_path)) => session
                    .userauth_pubkey_file(&config.user, None, key_path.as_std_path(), None)
                    .map_err(|e| RemoteStorageError::Rejected(format!("ssh auth failed: {e}")))?,
                (None, None) => {
                    return Err(RemoteStorageError::Rejected(
                        "ssh needs a password or a private key".to_string(),
                    ))
                }
            }
            info!("ssh session established with {}", config.host);
            *session_slot.lock().unwrap() = Some(session);
            Ok(())
        })
        .await
        .map_err(|e| RemoteStorageError::Network(e.to_string()))?
    }

    pub async fn upload_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &RemotePath,
    ) -> Result<(), RemoteStorageError> {
        let local_path = local_path.to_owned();
        let remote_file = format!("{}/{}", self.config.base_path.trim_end_matches('/'), remote_path);
        let session_slot = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let guard = session_slot.lock().unwrap();
            let session = guard
                .as_ref()
                .ok_or_else(|| RemoteStorageError::Network("ssh session not set up".to_string()))?;

            let contents = std::fs::read(&local_path)?;
            let local_digest = hex::encode(Sha256::digest(&contents));

            let sftp = session
                .sftp()
                .map_err(|e| RemoteStorageError::Network(e.to_string()))?;
            create_remote_dirs(&sftp, &remote_file)?;
            let mut remote = sftp
                .create(std::path::Path::new(&remote_file))
                .map_err(|e| RemoteStorageError::Network(format!("sftp create {remote_file}: {e}")))?;
            remote.write_all(&contents)?;
            drop(remote);
            debug!("uploaded {local_path} to {remote_file}");

            // Integrity check: hash on the remote side and compare.
            let mut channel = session
                .channel_session()
                .map_err(|e| RemoteStorageError::Network(e.to_string()))?;
            channel
                .exec(&format!("sha256sum '{remote_file}'"))
                .map_err(|e| RemoteStorageError::Network(e.to_string()))?;
            let mut output = String::new();
            channel.read_to_string(&mut output)?;
            channel.wait_close().ok();
            let remote_digest = output.split_whitespace().next().unwrap_or("").to_string();
            if remote_digest != local_digest {
                return Err(RemoteStorageError::ChecksumMismatch {
                    path: remote_file,
                    local: local_digest,
                    remote: remote_digest,
                });
            }
            Ok(())
        })
        .await
        .map_err(|e| RemoteStorageError::Network(e.to_string()))?
    }

    pub async fn teardown(&self) {
        let session_slot = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Some(session) = session_slot.lock().unwrap().take() {
                let _ = session.disconnect(None, "done", None);
            }
        })
        .await;
    }
}

fn create_remote_dirs(sftp: &ssh2::Sftp, remote_file: &str) -> Result<(), RemoteStorageError> {
    let path = PathBuf::from(remote_file);
    let mut current = PathBuf::new();
    for component in path.parent().map(|p| p.components()).into_iter().flatten() {
        current.push(component);
        if current.as_os_str().is_empty() || current == PathBuf::from("/") {
            continue;
        }
        // mkdir fails when the directory exists; that is fine.
        let _ = sftp.mkdir(&current, 0o700);
    }
    Ok(())
}
