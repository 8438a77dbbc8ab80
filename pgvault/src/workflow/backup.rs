//! Stages of the backup and incremental-backup chains.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Instant;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use postgres_wal::XLogFileName;

use crate::catalog::{Backup, BackupType, Tablespace, Validity, BACKUP_MANIFEST_FILE};
use crate::client::basebackup::{run_base_backup, BaseBackupOptions};
use crate::client::{PgClient, ReplicationMode};
use crate::error::{Error, ErrorKind, Result};
use crate::link;
use crate::manifest::{sha256_of_file, write_sha512_file, Manifest};
use crate::pipeline::{self, compression, encryption, run_jobs};
use crate::restore::copy_tree;
use crate::workflow::{Stage, WorkflowContext};

/// Sum of file sizes under a directory tree.
pub(crate) fn dir_size(dir: &Utf8Path) -> Result<(u64, u64)> {
    let mut total = 0u64;
    let mut biggest = 0u64;
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            Error::with_source(ErrorKind::DiskIo, "sizing directory", std::io::Error::from(e))
        })?;
        if entry.file_type().is_file() {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            total += len;
            biggest = biggest.max(len);
        }
    }
    Ok((total, biggest))
}

/// Transform roots of a backup entry: `data/` plus any `tblspc_*`.
fn transform_roots(entry_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut roots = vec![entry_dir.join(crate::catalog::DATA_DIR)];
    for entry in entry_dir.read_dir_utf8().map_err(Error::from)? {
        let entry = entry.map_err(Error::from)?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
            && entry.file_name().starts_with("tblspc_")
        {
            roots.push(entry.path().to_owned());
        }
    }
    Ok(roots)
}

fn collect_files(entry_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    for root in transform_roots(entry_dir)? {
        files.extend(pipeline::collect_transform_files(&root)?);
    }
    Ok(files)
}

/// Parse `CHECKPOINT LOCATION` out of the received `backup_label`.
fn checkpoint_from_backup_label(data_dir: &Utf8Path) -> Option<postgres_wal::Lsn> {
    let content = std::fs::read_to_string(data_dir.join("backup_label")).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("CHECKPOINT LOCATION: "))
        .and_then(|lsn| lsn.trim().parse().ok())
}

async fn save_with_repository_lock(ctx: &WorkflowContext, backup: &Backup) -> Result<()> {
    if !ctx.flags.lock_repository(50).await {
        return Err(Error::new(
            ErrorKind::ActiveConflict,
            "backup catalog is locked by another operation",
        ));
    }
    let result = ctx.catalog().save(backup);
    ctx.flags.unlock_repository();
    result
}

/// Stream the base backup from the server into the new catalog entry.
pub struct BasebackupStage {
    pub incremental: bool,
}

#[async_trait]
impl Stage for BasebackupStage {
    fn name(&self) -> &'static str {
        "basebackup"
    }

    async fn setup(&self, ctx: &mut WorkflowContext) -> Result<()> {
        if ctx
            .flags
            .active_backup
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(
                ErrorKind::ActiveConflict,
                format!("a backup of {} is already running", ctx.server.name),
            ));
        }
        ctx.label = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();

        // Probe the server before opening the replication session.
        let mut probe = PgClient::connect(
            &ctx.server,
            ReplicationMode::None,
            ctx.state.conf.authentication_timeout,
            ctx.state.conf.blocking_timeout,
        )
        .await?;
        ctx.version = Some(probe.probe_version().await?);
        probe.terminate().await;

        if self.incremental {
            let version = ctx.version.expect("probed above");
            if version.major < postgres_wal::PgMajorVersion::V17 {
                return Err(Error::new(
                    ErrorKind::IncompatibleVersion,
                    format!(
                        "incremental backups need server 17+, {} runs {}",
                        ctx.server.name, version.major
                    ),
                ));
            }
            let base = match ctx.identifier.as_str() {
                "" | "latest" | "newest" => ctx.catalog().latest_valid(version.major)?,
                label => Some(ctx.catalog().load(label)?),
            };
            let base = base.ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("no valid parent backup for incremental of {}", ctx.server.name),
                )
            })?;
            if !base.is_valid() {
                return Err(Error::new(
                    ErrorKind::ChainBroken,
                    format!("parent backup {} is not valid", base.label),
                ));
            }
            ctx.incremental_base = Some(base);
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let version = ctx.version.expect("set in setup");
        let started = Instant::now();
        let entry_dir = ctx.entry_dir();
        tokio::fs::create_dir_all(&entry_dir).await?;

        let mut client = PgClient::connect(
            &ctx.server,
            ReplicationMode::Physical,
            ctx.state.conf.authentication_timeout,
            ctx.state.conf.blocking_timeout,
        )
        .await?;

        if let Some(base) = &ctx.incremental_base {
            let manifest_path = ctx
                .catalog()
                .entry_dir(&base.label)
                .join(BACKUP_MANIFEST_FILE);
            let manifest = tokio::fs::read(&manifest_path).await?;
            client.upload_manifest(&manifest).await?;
        }

        let options = BaseBackupOptions {
            label: ctx.label.clone(),
            incremental: self.incremental,
            compression: None,
        };
        let result = run_base_backup(&mut client, version.major, &options, &entry_dir).await?;
        client.terminate().await;

        let data_dir = ctx.data_dir();
        let checkpoint_lsn =
            checkpoint_from_backup_label(&data_dir).unwrap_or(result.start_lsn);

        let backup = Backup {
            label: ctx.label.clone(),
            parent_label: ctx
                .incremental_base
                .as_ref()
                .map(|b| b.label.clone())
                .unwrap_or_default(),
            backup_type: if self.incremental {
                BackupType::Incremental
            } else {
                BackupType::Full
            },
            valid: Validity::Unknown,
            keep: false,
            compression: compression_name(ctx),
            encryption: encryption_name(ctx),
            major_version: version.major.major(),
            minor_version: version.minor,
            wal: XLogFileName(
                result.start_timeline,
                result.start_lsn.segment_number(version.wal_segment_size),
                version.wal_segment_size,
            ),
            start_lsn: result.start_lsn,
            end_lsn: result.end_lsn,
            checkpoint_lsn,
            start_timeline: result.start_timeline,
            end_timeline: result.end_timeline,
            backup_size: 0,
            restore_size: 0,
            biggest_file_size: 0,
            basebackup_elapsed: started.elapsed().as_secs_f64(),
            link_elapsed: 0.0,
            hash_elapsed: 0.0,
            remote_elapsed: 0.0,
            tablespaces: result
                .tablespaces
                .iter()
                .map(|ts| Tablespace {
                    name: ts.oid.to_string(),
                    oid: ts.oid,
                    external_path: ts.location.clone(),
                })
                .collect(),
            comments: BTreeMap::new(),
        };
        save_with_repository_lock(ctx, &backup).await?;
        ctx.basebackup = Some(result);
        ctx.backup = Some(backup);
        Ok(())
    }

    async fn teardown(&self, ctx: &mut WorkflowContext) -> Result<()> {
        ctx.flags.active_backup.store(false, Ordering::Release);
        Ok(())
    }
}

fn compression_name(ctx: &WorkflowContext) -> String {
    match ctx.state.conf.compression {
        crate::conf::CompressionMethod::None => "none",
        crate::conf::CompressionMethod::Gzip => "gzip",
        crate::conf::CompressionMethod::Zstd => "zstd",
        crate::conf::CompressionMethod::Lz4 => "lz4",
        crate::conf::CompressionMethod::Bzip2 => "bzip2",
    }
    .to_string()
}

fn encryption_name(ctx: &WorkflowContext) -> String {
    use crate::conf::EncryptionMethod::*;
    match ctx.state.conf.encryption {
        None => "none",
        Aes128Cbc => "aes-128-cbc",
        Aes192Cbc => "aes-192-cbc",
        Aes256Cbc => "aes-256-cbc",
        Aes128Ctr => "aes-128-ctr",
        Aes192Ctr => "aes-192-ctr",
        Aes256Ctr => "aes-256-ctr",
    }
    .to_string()
}

/// Validate the received manifest and fold pre-transform sizes into the
/// catalog entry.
pub struct ManifestStage;

#[async_trait]
impl Stage for ManifestStage {
    fn name(&self) -> &'static str {
        "manifest"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let entry_dir = ctx.entry_dir();
        let manifest = Manifest::load(&entry_dir.join(BACKUP_MANIFEST_FILE))?;
        debug!("manifest lists {} files", manifest.files.len());

        let (restore_size, biggest) = dir_size(&ctx.data_dir())?;
        let backup = ctx.backup.as_mut().expect("basebackup ran");
        backup.restore_size = restore_size;
        backup.biggest_file_size = biggest;
        ctx.output
            .insert("files".to_string(), manifest.files.len().into());
        Ok(())
    }
}

/// Make sure the per-server auxiliary directories exist alongside the
/// new entry (wal archive, summaries, tablespace mounts).
pub struct ExtraStage;

#[async_trait]
impl Stage for ExtraStage {
    fn name(&self) -> &'static str {
        "extra"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        tokio::fs::create_dir_all(ctx.state.conf.wal_dir(&ctx.server.name)).await?;
        tokio::fs::create_dir_all(ctx.state.conf.summary_dir(&ctx.server.name)).await?;
        for ts in &ctx.backup.as_ref().expect("basebackup ran").tablespaces {
            let dir = ctx.entry_dir().join(format!("tblspc_{}", ts.name));
            if !dir.exists() {
                tokio::fs::create_dir_all(&dir).await?;
            }
        }
        Ok(())
    }
}

/// Persist the catalog entry with the sizes collected so far.
pub struct LocalStoreStage;

#[async_trait]
impl Stage for LocalStoreStage {
    fn name(&self) -> &'static str {
        "local_store"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let backup = ctx.backup.clone().expect("basebackup ran");
        save_with_repository_lock(ctx, &backup).await
    }
}

/// Refresh the materialized replica directory from the fresh backup.
pub struct HotStandbyStage;

#[async_trait]
impl Stage for HotStandbyStage {
    fn name(&self) -> &'static str {
        "hot_standby"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        if !ctx.server.hot_standby {
            return Ok(());
        }
        let target = ctx.state.conf.hot_standby_dir(&ctx.server.name);
        info!("refreshing hot standby at {target}");
        let fresh = Utf8PathBuf::from(format!("{target}.new"));
        if fresh.exists() {
            tokio::fs::remove_dir_all(&fresh).await?;
        }
        copy_tree(&ctx.data_dir(), &fresh).await?;
        if target.exists() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(&fresh, &target).await?;
        Ok(())
    }
}

pub struct CompressStage;

#[async_trait]
impl Stage for CompressStage {
    fn name(&self) -> &'static str {
        "compress"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let method = ctx.state.conf.compression;
        if method == crate::conf::CompressionMethod::None {
            return Ok(());
        }
        let level = ctx.state.conf.compression_level;
        let bucket = ctx.state.compression_bucket.clone();
        let files = collect_files(&ctx.entry_dir())?;
        info!("compressing {} file(s)", files.len());
        run_jobs(ctx.workers(), files, move |path| {
            let bucket = bucket.clone();
            async move {
                compression::compress_file(&path, method, level, bucket.as_ref()).await?;
                Ok(())
            }
        })
        .await
    }
}

pub struct EncryptStage;

#[async_trait]
impl Stage for EncryptStage {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let method = ctx.state.conf.encryption;
        if method.is_none() {
            return Ok(());
        }
        let secret = ctx.state.conf.master_key.clone().ok_or_else(|| {
            Error::new(ErrorKind::ConfigInvalid, "encryption enabled without master key")
        })?;
        let files = collect_files(&ctx.entry_dir())?;
        info!("encrypting {} file(s)", files.len());
        run_jobs(ctx.workers(), files, move |path| {
            let secret = secret.clone();
            async move {
                encryption::encrypt_file(&path, method, &secret).await?;
                Ok(())
            }
        })
        .await
    }
}

/// Enrich the manifest with post-transform sizes and hashes, then write
/// `backup.sha512`.
pub struct Sha512Stage;

#[async_trait]
impl Stage for Sha512Stage {
    fn name(&self) -> &'static str {
        "sha512"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let started = Instant::now();
        let entry_dir = ctx.entry_dir();
        let backup = ctx.backup.clone().expect("basebackup ran");

        let mut manifest = Manifest::load(&entry_dir.join(BACKUP_MANIFEST_FILE))?;
        for file in &mut manifest.files {
            let physical = link::physical_path(&entry_dir, &file.path, &backup);
            match std::fs::metadata(&physical) {
                Ok(meta) => {
                    file.transform_size = Some(meta.len());
                    file.transform_checksum = Some(sha256_of_file(&physical)?);
                }
                Err(_) => {
                    // e.g. excluded from transform; record the plain file
                    let plain = entry_dir.join(crate::catalog::DATA_DIR).join(&file.path);
                    if let Ok(meta) = std::fs::metadata(&plain) {
                        file.transform_size = Some(meta.len());
                        file.transform_checksum = Some(sha256_of_file(&plain)?);
                    }
                }
            }
        }
        manifest.seal();
        manifest.save(&entry_dir.join(BACKUP_MANIFEST_FILE))?;

        let hashed = write_sha512_file(&entry_dir, &ctx.data_dir())?;
        debug!("hashed {hashed} file(s)");

        let (backup_size, _) = dir_size(&entry_dir)?;
        let backup = ctx.backup.as_mut().expect("basebackup ran");
        backup.backup_size = backup_size;
        backup.hash_elapsed = started.elapsed().as_secs_f64();
        Ok(())
    }
}

/// Summarize the WAL between the parent backup and this one into a block
/// reference table, so the next incremental can be planned from the
/// archive instead of re-reading raw segments.
pub struct SummaryStage;

#[async_trait]
impl Stage for SummaryStage {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let Some(base) = &ctx.incremental_base else {
            return Ok(());
        };
        let backup = ctx.backup.as_ref().expect("basebackup ran");
        let version = ctx.version.expect("probed in setup");
        let wal_dir = ctx.state.conf.wal_dir(&ctx.server.name);
        let summary_dir = ctx.state.conf.summary_dir(&ctx.server.name);
        let (start, end) = (base.end_lsn, backup.end_lsn);

        let wal_dir = wal_dir.clone();
        let summarized = tokio::task::spawn_blocking(move || {
            postgres_wal::summary::summarize_range(
                &wal_dir,
                start,
                end,
                version.major,
                version.wal_segment_size,
            )
        })
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, format!("summarizer panicked: {e}")))?;

        match summarized {
            Ok(table) => {
                postgres_wal::summary::save_summary(&summary_dir, start, end, &table)
                    .map_err(|e| Error::with_source(ErrorKind::DiskIo, "writing WAL summary", e))?;
                ctx.output.insert("summarized_forks".to_string(), table.len().into());
            }
            // The archive may trail the server; the summary is advisory
            // and the next run covers the range again.
            Err(e) => warn!("WAL summary for {start}..{end} skipped: {e}"),
        }
        Ok(())
    }
}

/// Hard-link identical files into the previous backup.
pub struct LinkStage;

#[async_trait]
impl Stage for LinkStage {
    fn name(&self) -> &'static str {
        "link"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let outcome = link::link_backup(&ctx.catalog(), &ctx.label, ctx.workers()).await?;
        let backup = ctx.backup.as_mut().expect("basebackup ran");
        backup.link_elapsed = outcome.elapsed;
        ctx.output
            .insert("linked_files".to_string(), outcome.linked_files.into());
        Ok(())
    }
}

/// Lock down the entry and finalize the catalog record.
pub struct PermissionsStage;

#[async_trait]
impl Stage for PermissionsStage {
    fn name(&self) -> &'static str {
        "permissions"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let entry_dir = ctx.entry_dir();
        for entry in walkdir::WalkDir::new(&entry_dir) {
            let entry = entry.map_err(|e| {
                Error::with_source(ErrorKind::DiskIo, "permissions walk", std::io::Error::from(e))
            })?;
            if entry.path_is_symlink() {
                continue;
            }
            let mode = if entry.file_type().is_dir() { 0o700 } else { 0o600 };
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
        }

        let mut backup = ctx.backup.clone().expect("basebackup ran");
        backup.valid = Validity::Valid;
        save_with_repository_lock(ctx, &backup).await?;
        ctx.backup = Some(backup);
        info!("backup {} is complete and valid", ctx.label);
        Ok(())
    }
}

/// Offload the finished entry to the configured remote.
pub struct RemoteStage;

#[async_trait]
impl Stage for RemoteStage {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let Some(remote_conf) = &ctx.state.conf.remote else {
            return Ok(());
        };
        let started = Instant::now();
        let config = remote_config(remote_conf);
        let storage = remote_storage::GenericRemoteStorage::from_config(&config)
            .map_err(|e| Error::with_source(ErrorKind::ConfigInvalid, "remote storage config", e))?;
        storage.setup().await.map_err(Error::from)?;

        let cancel = CancellationToken::new();
        let upload = remote_storage::upload_backup_dir(
            &storage,
            &config,
            &ctx.entry_dir(),
            &ctx.server.name,
            &ctx.label,
            ctx.state.network_bucket.as_ref(),
            &cancel,
        )
        .await;
        storage.teardown().await;
        let uploaded = upload.map_err(Error::from)?;

        let backup = ctx.backup.as_mut().expect("basebackup ran");
        backup.remote_elapsed = started.elapsed().as_secs_f64();
        let finished = backup.clone();
        save_with_repository_lock(ctx, &finished).await?;
        ctx.output.insert("uploaded_files".to_string(), uploaded.into());
        Ok(())
    }
}

pub(crate) fn remote_config(remote: &crate::conf::RemoteConf) -> remote_storage::RemoteStorageConfig {
    use crate::conf::RemoteConf;
    let storage = match remote {
        RemoteConf::Ssh {
            host,
            port,
            user,
            password,
            private_key_path,
            base_path,
        } => remote_storage::RemoteStorageKind::Ssh(remote_storage::SshConfig {
            host: host.clone(),
            port: *port,
            user: user.clone(),
            password: password.clone(),
            private_key_path: private_key_path.clone(),
            base_path: base_path.clone(),
        }),
        RemoteConf::S3 {
            bucket,
            region,
            access_key_id,
            secret_access_key,
            endpoint,
            storage_class,
        } => remote_storage::RemoteStorageKind::AwsS3(remote_storage::S3Config {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: access_key_id.clone(),
            secret_access_key: secret_access_key.clone(),
            endpoint: endpoint.clone(),
            storage_class: storage_class.clone(),
        }),
        RemoteConf::Azure {
            account,
            container,
            shared_key,
            endpoint,
        } => remote_storage::RemoteStorageKind::AzureBlob(remote_storage::AzureConfig {
            account: account.clone(),
            container: container.clone(),
            shared_key: shared_key.clone(),
            endpoint: endpoint.clone(),
        }),
    };
    remote_storage::RemoteStorageConfig {
        storage,
        prefix_in_storage: None,
    }
}

/// Mark a failed backup invalid instead of deleting it; operators may
/// want the partial tree for inspection.
pub async fn mark_backup_failed(ctx: &mut WorkflowContext) {
    if let Some(backup) = &mut ctx.backup {
        backup.valid = Validity::Invalid;
        let failed = backup.clone();
        if let Err(e) = ctx.catalog().save(&failed) {
            warn!("could not mark backup {} invalid: {e}", failed.label);
        }
    }
}
