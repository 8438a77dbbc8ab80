//! Stages of the restore chain. Incremental targets run the core stage
//! once per chain member, full backup first, relayed through the same
//! workspace; the combine happens as each incremental is overlaid.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind, Result};
use crate::restore::{
    copy_tree, fix_permissions, overlay_incremental, resolve_identifier, reverse_transforms,
    write_backup_label, write_recovery_info, RestoreOptions, RestorePosition,
};
use crate::workflow::{Stage, WorkflowContext};

fn restore_options(ctx: &WorkflowContext, destination: Utf8PathBuf) -> RestoreOptions {
    RestoreOptions {
        destination,
        position: ctx.position.clone(),
        encryption: ctx.state.conf.encryption,
        master_key: ctx.state.conf.master_key.clone(),
        workers: ctx.workers(),
    }
}

/// Resolve the request's identifier/alias to a concrete backup.
pub struct ResolveStage;

#[async_trait]
impl Stage for ResolveStage {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let backup = resolve_identifier(&ctx.catalog(), &ctx.identifier)?;
        info!("resolved {:?} to backup {}", ctx.identifier, backup.label);
        ctx.label = backup.label.clone();
        ctx.backup = Some(backup);
        Ok(())
    }
}

/// Materialize the chain into the destination: copy the full backup,
/// reverse the pipeline, then overlay each incremental in order.
pub struct RestoreCoreStage;

#[async_trait]
impl Stage for RestoreCoreStage {
    fn name(&self) -> &'static str {
        "restore"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let destination = ctx
            .destination
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::ConfigInvalid, "restore needs a destination"))?;
        let backup = ctx.backup.clone().expect("resolve ran");
        let catalog = ctx.catalog();
        let chain = catalog.chain_of(&backup)?;
        let options = restore_options(ctx, destination.clone());

        let full = &chain[0];
        info!("restoring chain of {} from full backup {}", chain.len(), full.label);
        copy_tree(&catalog.data_dir(&full.label), &destination).await?;
        reverse_transforms(&destination, &options).await?;

        for incremental in &chain[1..] {
            ctx.check_cancelled()?;
            debug!("overlaying incremental {}", incremental.label);
            let staging = destination
                .parent()
                .map(|p| p.join(format!(".pgvault-incr-{}", incremental.label)))
                .unwrap_or_else(|| {
                    Utf8PathBuf::from(format!("/tmp/pgvault-incr-{}", incremental.label))
                });
            copy_tree(&catalog.data_dir(&incremental.label), &staging).await?;
            reverse_transforms(&staging, &options).await?;
            overlay_incremental(&staging, &destination).await?;
            tokio::fs::remove_dir_all(&staging).await.ok();
        }
        Ok(())
    }
}

/// Emit `backup_label` plus recovery target settings when the request
/// names a point in time.
pub struct RecoveryInfoStage;

#[async_trait]
impl Stage for RecoveryInfoStage {
    fn name(&self) -> &'static str {
        "recovery_info"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let destination = ctx.destination.clone().expect("checked by restore stage");
        let backup = ctx.backup.as_ref().expect("resolve ran");
        write_recovery_info(&destination, &ctx.position).await?;
        write_backup_label(&destination, backup).await?;
        if ctx.position != RestorePosition::Current {
            debug!("wrote recovery.signal for {:?}", ctx.position);
        }
        Ok(())
    }
}

pub struct RestorePermissionsStage;

#[async_trait]
impl Stage for RestorePermissionsStage {
    fn name(&self) -> &'static str {
        "permissions"
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let destination = ctx.destination.clone().expect("checked by restore stage");
        fix_permissions(&destination)
    }
}

/// Remove restore leftovers: stray incremental staging directories.
pub struct CleanupStage;

#[async_trait]
impl Stage for CleanupStage {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn execute(&self, _ctx: &mut WorkflowContext) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self, ctx: &mut WorkflowContext) -> Result<()> {
        let Some(destination) = ctx.destination.clone() else {
            return Ok(());
        };
        let Some(parent) = destination.parent() else {
            return Ok(());
        };
        let Ok(entries) = parent.read_dir_utf8() else {
            return Ok(());
        };
        for entry in entries.flatten() {
            if entry.file_name().starts_with(".pgvault-incr-") {
                tokio::fs::remove_dir_all(entry.path()).await.ok();
            }
        }
        Ok(())
    }
}
