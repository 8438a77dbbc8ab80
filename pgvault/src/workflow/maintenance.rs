//! Stages of the maintenance chains: archive, delete, retention, verify,
//! annotate and list.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tracing::{info, warn};

use postgres_wal::Lsn;

use crate::catalog::BACKUP_SHA512_FILE;
use crate::error::{Error, ErrorKind, Result};
use crate::manifest::verify_sha512_file;
use crate::pipeline::{compression, encryption};
use crate::retention::apply_retention;
use crate::wal_archive::release_wal_before;
use crate::workflow::{Stage, WorkflowContext};

/// Produce a single archive file `<destination>/<server>-<label>.tar`
/// from a backup entry, then run it through the configured transforms.
/// A failed archive cleans up its partial output.
pub struct ArchiveStage;

#[async_trait]
impl Stage for ArchiveStage {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let destination = ctx
            .destination
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::ConfigInvalid, "archive needs a destination"))?;
        tokio::fs::create_dir_all(&destination).await?;
        let tar_path = destination.join(format!("{}-{}.tar", ctx.server.name, ctx.label));

        let result = build_tar(ctx, &tar_path).await;
        if result.is_err() {
            tokio::fs::remove_file(&tar_path).await.ok();
            return result;
        }

        let mut out_path = tar_path.clone();
        let method = ctx.state.conf.compression;
        if method != crate::conf::CompressionMethod::None {
            out_path = compression::compress_file(
                &out_path,
                method,
                ctx.state.conf.compression_level,
                ctx.state.compression_bucket.as_ref(),
            )
            .await?;
        }
        if !ctx.state.conf.encryption.is_none() {
            let secret = ctx.state.conf.master_key.clone().ok_or_else(|| {
                Error::new(ErrorKind::ConfigInvalid, "encryption enabled without master key")
            })?;
            out_path = encryption::encrypt_file(&out_path, ctx.state.conf.encryption, &secret).await?;
        }
        info!("archived {} to {out_path}", ctx.label);
        ctx.output
            .insert("archive".to_string(), out_path.to_string().into());
        Ok(())
    }
}

async fn build_tar(ctx: &WorkflowContext, tar_path: &Utf8PathBuf) -> Result<()> {
    let entry_dir = ctx.entry_dir();
    let file = tokio::fs::File::create(tar_path).await?;
    let mut builder = tokio_tar::Builder::new(file);
    builder
        .append_dir_all(ctx.label.clone(), entry_dir.as_std_path())
        .await?;
    let mut file = builder.into_inner().await?;
    use tokio::io::AsyncWriteExt;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Delete one backup. Children block the delete unless forced, in which
/// case every descendant is first marked invalid.
pub struct DeleteStage;

#[async_trait]
impl Stage for DeleteStage {
    fn name(&self) -> &'static str {
        "delete"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        if !ctx.flags.lock_repository(50).await {
            return Err(Error::new(
                ErrorKind::ActiveConflict,
                "backup catalog is locked by another operation",
            ));
        }
        let result = delete_locked(ctx).await;
        ctx.flags.unlock_repository();
        result
    }
}

async fn delete_locked(ctx: &mut WorkflowContext) -> Result<()> {
    let catalog = ctx.catalog();
    let backup = catalog.load(&ctx.identifier)?;
    catalog.delete(&backup.label, ctx.force)?;
    info!("deleted backup {}", backup.label);

    release_unreferenced_wal(ctx)?;
    Ok(())
}

/// Drop archived WAL below the minimum surviving `start_lsn`.
fn release_unreferenced_wal(ctx: &WorkflowContext) -> Result<()> {
    let survivors = ctx.catalog().list()?;
    if survivors.is_empty() {
        // no backups left: keep the archive for the streamer
        return Ok(());
    }
    let min_start = survivors
        .iter()
        .map(|b| b.start_lsn)
        .min()
        .unwrap_or(Lsn::INVALID);
    if !min_start.is_valid() {
        return Ok(());
    }
    let wal_dir = ctx.state.conf.wal_dir(&ctx.server.name);
    let removed = release_wal_before(&wal_dir, min_start, postgres_wal::WAL_SEGMENT_SIZE)?;
    if removed > 0 {
        info!("released {removed} WAL segment(s) below {min_start}");
    }
    Ok(())
}

/// Apply the retention policy for the context's server.
pub struct RetentionStage;

#[async_trait]
impl Stage for RetentionStage {
    fn name(&self) -> &'static str {
        "retention"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        if !ctx.flags.lock_repository(50).await {
            return Err(Error::new(
                ErrorKind::ActiveConflict,
                "backup catalog is locked by another operation",
            ));
        }
        let policy = ctx.state.conf.retention_for(&ctx.server);
        let result = apply_retention(&ctx.catalog(), &policy, chrono::Local::now().naive_local());
        ctx.flags.unlock_repository();
        let deleted = result?;

        if !deleted.is_empty() {
            release_unreferenced_wal(ctx)?;
        }
        ctx.output
            .insert("deleted".to_string(), deleted.len().into());
        for backup in deleted {
            info!("retention removed {}", backup.label);
        }
        Ok(())
    }
}

/// Re-verify a backup's `backup.sha512` against the files on disk.
pub struct VerifyStage;

#[async_trait]
impl Stage for VerifyStage {
    fn name(&self) -> &'static str {
        "verify"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let entry_dir = ctx.entry_dir();
        if !entry_dir.join(BACKUP_SHA512_FILE).exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("backup {} has no {BACKUP_SHA512_FILE}", ctx.label),
            ));
        }
        match verify_sha512_file(&entry_dir) {
            Ok(()) => {
                info!("backup {} verified", ctx.label);
                ctx.output.insert("verified".to_string(), true.into());
                Ok(())
            }
            Err(e) => {
                warn!("backup {} failed verification: {e}", ctx.label);
                let mut backup = ctx.backup.clone().expect("resolve ran");
                backup.valid = crate::catalog::Validity::Invalid;
                ctx.catalog().save(&backup)?;
                Err(e)
            }
        }
    }
}

/// Attach or remove a comment on a backup record.
pub struct AnnotateStage;

#[async_trait]
impl Stage for AnnotateStage {
    fn name(&self) -> &'static str {
        "annotate"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        if !ctx.flags.lock_repository(50).await {
            return Err(Error::new(
                ErrorKind::ActiveConflict,
                "backup catalog is locked by another operation",
            ));
        }
        let result = annotate_locked(ctx);
        ctx.flags.unlock_repository();
        result
    }
}

fn annotate_locked(ctx: &mut WorkflowContext) -> Result<()> {
    let catalog = ctx.catalog();
    let mut backup = catalog.load(&ctx.identifier)?;
    let (key, value) = ctx
        .annotation
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::ConfigInvalid, "missing annotation"))?;
    match key.as_str() {
        // the retention override is a first-class field, not a comment
        "keep" => backup.keep = value == "true",
        _ if value.is_empty() => {
            backup.comments.remove(&key);
        }
        _ => {
            backup.comments.insert(key, value);
        }
    }
    catalog.save(&backup)?;
    Ok(())
}

/// Enumerate the catalog into the reply.
pub struct ListStage;

#[async_trait]
impl Stage for ListStage {
    fn name(&self) -> &'static str {
        "list"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let backups = ctx.catalog().list()?;
        let listing: Vec<serde_json::Value> = backups
            .iter()
            .map(|b| {
                serde_json::json!({
                    "label": b.label,
                    "type": b.backup_type.to_string(),
                    "parent": b.parent_label,
                    "valid": b.is_valid(),
                    "keep": b.keep,
                    "start_lsn": b.start_lsn.to_string(),
                    "end_lsn": b.end_lsn.to_string(),
                    "backup_size": b.backup_size,
                    "restore_size": b.restore_size,
                })
            })
            .collect();
        ctx.output.insert("backups".to_string(), listing.into());
        Ok(())
    }
}

