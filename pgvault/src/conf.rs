//! Resolved engine configuration. Loading and validation of the operator's
//! config file happen in the front-end; the engine receives these structs
//! fully populated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use postgres_wal::PgMajorVersion;
use utils::rate_limit::TokenBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    None,
    Gzip,
    Zstd,
    Lz4,
    Bzip2,
}

impl CompressionMethod {
    pub fn suffix(self) -> &'static str {
        match self {
            CompressionMethod::None => "",
            CompressionMethod::Gzip => ".gz",
            CompressionMethod::Zstd => ".zstd",
            CompressionMethod::Lz4 => ".lz4",
            CompressionMethod::Bzip2 => ".bz2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMethod {
    None,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

impl EncryptionMethod {
    pub fn is_none(self) -> bool {
        self == EncryptionMethod::None
    }

    pub fn suffix(self) -> &'static str {
        if self.is_none() {
            ""
        } else {
            ".aes"
        }
    }
}

/// Retention policy; a `None` slot disables that rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionPolicy {
    pub days: Option<u32>,
    pub weeks: Option<u32>,
    pub months: Option<u32>,
    pub years: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConf {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Replication slot used for WAL streaming.
    pub wal_slot: String,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub workers: Option<usize>,
    /// Maintain a materialized replica directory under `hot_standby/`.
    #[serde(default)]
    pub hot_standby: bool,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConf {
    /// Root of the on-disk repository; servers live in subdirectories.
    pub base_dir: Utf8PathBuf,
    pub servers: Vec<ServerConf>,
    pub compression: CompressionMethod,
    pub compression_level: i32,
    pub encryption: EncryptionMethod,
    /// Master secret the per-file encryption keys derive from.
    #[serde(skip_serializing)]
    pub master_key: Option<String>,
    pub workers: usize,
    pub retention: RetentionPolicy,
    /// Bytes per second; `None` disables the bucket.
    pub network_rate_limit: Option<u64>,
    pub disk_rate_limit: Option<u64>,
    pub compression_rate_limit: Option<u64>,
    #[serde(with = "humantime_serde")]
    pub authentication_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub blocking_timeout: Duration,
    pub remote: Option<RemoteConf>,
}

/// Remote offload selection; mirrors `remote_storage`'s config but stays
/// serde-friendly for the front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum RemoteConf {
    Ssh {
        host: String,
        port: u16,
        user: String,
        #[serde(skip_serializing)]
        password: Option<String>,
        private_key_path: Option<Utf8PathBuf>,
        base_path: String,
    },
    S3 {
        bucket: String,
        region: String,
        access_key_id: String,
        #[serde(skip_serializing)]
        secret_access_key: String,
        endpoint: Option<String>,
        storage_class: Option<String>,
    },
    Azure {
        account: String,
        container: String,
        #[serde(skip_serializing)]
        shared_key: String,
        endpoint: Option<String>,
    },
}

impl EngineConf {
    pub fn server(&self, name: &str) -> Option<&ServerConf> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_dir(&self, server: &str) -> Utf8PathBuf {
        self.base_dir.join(server)
    }

    pub fn backup_dir(&self, server: &str) -> Utf8PathBuf {
        self.server_dir(server).join("backup")
    }

    pub fn wal_dir(&self, server: &str) -> Utf8PathBuf {
        self.server_dir(server).join("wal")
    }

    pub fn summary_dir(&self, server: &str) -> Utf8PathBuf {
        self.server_dir(server).join("summary")
    }

    pub fn hot_standby_dir(&self, server: &str) -> Utf8PathBuf {
        self.server_dir(server).join("hot_standby")
    }

    pub fn workers_for(&self, server: &ServerConf) -> usize {
        server.workers.unwrap_or(self.workers).max(1)
    }

    pub fn retention_for(&self, server: &ServerConf) -> RetentionPolicy {
        RetentionPolicy {
            days: server.retention.days.or(self.retention.days),
            weeks: server.retention.weeks.or(self.retention.weeks),
            months: server.retention.months.or(self.retention.months),
            years: server.retention.years.or(self.retention.years),
        }
    }
}

/// Per-server mutable flags, the engine's replacement for the C original's
/// shared memory block. One instance per configured server, shared by the
/// supervisor, the streaming task and in-flight operations.
#[derive(Debug, Default)]
pub struct ServerFlags {
    /// Catalog mutation lock; compare-and-swap false→true to enter.
    pub repository: AtomicBool,
    pub wal_streaming: AtomicBool,
    pub active_backup: AtomicBool,
    /// Guards uncompressed rotated segments until their transform is done.
    pub wal_compression_lock: AtomicBool,
}

impl ServerFlags {
    /// Bounded CAS acquire of the repository flag. Returns false if the
    /// flag stayed contended for all `retries`.
    pub async fn lock_repository(&self, retries: u32) -> bool {
        for _ in 0..retries {
            if self
                .repository
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    pub fn unlock_repository(&self) {
        self.repository.store(false, Ordering::Release);
    }
}

/// Shared engine state threaded through every component.
pub struct EngineState {
    pub conf: EngineConf,
    pub flags: Vec<Arc<ServerFlags>>,
    pub network_bucket: Option<Arc<TokenBucket>>,
    pub disk_bucket: Option<Arc<TokenBucket>>,
    pub compression_bucket: Option<Arc<TokenBucket>>,
}

impl EngineState {
    pub fn new(conf: EngineConf) -> Arc<EngineState> {
        let flags = conf
            .servers
            .iter()
            .map(|_| Arc::new(ServerFlags::default()))
            .collect();
        Arc::new(EngineState {
            network_bucket: conf.network_rate_limit.map(|r| Arc::new(TokenBucket::new(r))),
            disk_bucket: conf.disk_rate_limit.map(|r| Arc::new(TokenBucket::new(r))),
            compression_bucket: conf
                .compression_rate_limit
                .map(|r| Arc::new(TokenBucket::new(r))),
            flags,
            conf,
        })
    }

    pub fn flags_for(&self, server_name: &str) -> Option<Arc<ServerFlags>> {
        let idx = self.conf.servers.iter().position(|s| s.name == server_name)?;
        Some(self.flags[idx].clone())
    }
}

/// Probed properties of a connected server, fixed per backup.
#[derive(Debug, Clone, Copy)]
pub struct ServerVersionInfo {
    pub major: PgMajorVersion,
    pub minor: u32,
    pub wal_segment_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_conf() -> EngineConf {
        EngineConf {
            base_dir: Utf8PathBuf::from("/srv/pgvault"),
            servers: vec![ServerConf {
                name: "primary".to_string(),
                host: "localhost".to_string(),
                port: 5432,
                user: "repl".to_string(),
                password: None,
                wal_slot: "pgvault".to_string(),
                retention: RetentionPolicy::default(),
                workers: Some(2),
                hot_standby: false,
                tls: false,
            }],
            compression: CompressionMethod::Zstd,
            compression_level: 3,
            encryption: EncryptionMethod::None,
            master_key: None,
            workers: 4,
            retention: RetentionPolicy {
                days: Some(7),
                weeks: None,
                months: None,
                years: None,
            },
            network_rate_limit: None,
            disk_rate_limit: None,
            compression_rate_limit: None,
            authentication_timeout: Duration::from_secs(10),
            blocking_timeout: Duration::from_secs(30),
            remote: None,
        }
    }

    #[test]
    fn per_server_overrides_win() {
        let conf = minimal_conf();
        let server = &conf.servers[0];
        assert_eq!(conf.workers_for(server), 2);
        assert_eq!(conf.retention_for(server).days, Some(7));
    }

    #[test]
    fn directory_layout() {
        let conf = minimal_conf();
        assert_eq!(conf.backup_dir("primary"), "/srv/pgvault/primary/backup");
        assert_eq!(conf.wal_dir("primary"), "/srv/pgvault/primary/wal");
        assert_eq!(conf.summary_dir("primary"), "/srv/pgvault/primary/summary");
    }

    #[tokio::test]
    async fn repository_flag_is_exclusive() {
        let flags = ServerFlags::default();
        assert!(flags.lock_repository(3).await);
        assert!(!flags.lock_repository(2).await);
        flags.unlock_repository();
        assert!(flags.lock_repository(1).await);
    }
}
