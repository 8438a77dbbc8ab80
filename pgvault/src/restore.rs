//! Restore: materialize a full data directory from a backup chain.
//!
//! The pipeline runs in reverse (decrypt, then decompress), the chain is
//! walked full-to-target overlaying incrementals, and `INCREMENTAL.*`
//! files are combined with the parent's copy by 8 KiB block replacement.

use bytes::Buf;
use camino::{Utf8Path, Utf8PathBuf};
use std::os::unix::fs::PermissionsExt;
use tracing::{debug, info};

use postgres_wal::Lsn;

use crate::catalog::{Backup, Catalog, DATA_DIR};
use crate::conf::EncryptionMethod;
use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::{compression, encryption, run_jobs};
use crate::retention::parse_label;

/// Header magic of an incremental relation file.
pub const INCREMENTAL_MAGIC: u32 = 0xD3AE_1F0D;
pub const INCREMENTAL_PREFIX: &str = "INCREMENTAL.";
const BLOCK_SIZE: usize = 8192;

/// Point-in-time target of a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestorePosition {
    /// Recover to the end of the archived WAL.
    Current,
    Time(String),
    Lsn(String),
    Name(String),
}

impl RestorePosition {
    pub fn parse(position: &str) -> RestorePosition {
        match position.split_once('=') {
            None if position == "current" || position.is_empty() => RestorePosition::Current,
            Some(("time", v)) => RestorePosition::Time(v.to_string()),
            Some(("lsn", v)) => RestorePosition::Lsn(v.to_string()),
            Some(("name", v)) => RestorePosition::Name(v.to_string()),
            _ => RestorePosition::Current,
        }
    }
}

/// Resolve `oldest | newest | latest | <label> | <target-time> |
/// <target-lsn>` to a concrete catalog entry.
pub fn resolve_identifier(catalog: &Catalog, identifier: &str) -> Result<Backup> {
    let backups: Vec<Backup> = catalog
        .list()?
        .into_iter()
        .filter(|b| b.is_valid())
        .collect();
    let not_found =
        || Error::new(ErrorKind::NotFound, format!("no backup matches {identifier:?}"));

    match identifier {
        "oldest" => backups.first().cloned().ok_or_else(not_found),
        "newest" | "latest" => backups.last().cloned().ok_or_else(not_found),
        _ => {
            // Exact label first.
            if let Some(backup) = backups.iter().find(|b| b.label == identifier) {
                return Ok(backup.clone());
            }
            // A target LSN: newest backup finished at or before it.
            if let Ok(target) = identifier.parse::<Lsn>() {
                return backups
                    .iter()
                    .rev()
                    .find(|b| b.end_lsn <= target)
                    .cloned()
                    .ok_or_else(not_found);
            }
            // A target time: newest backup taken at or before it.
            if let Some(target) = parse_target_time(identifier) {
                return backups
                    .iter()
                    .rev()
                    .filter_map(|b| parse_label(&b.label).map(|t| (b, t)))
                    .find(|(_, t)| *t <= target)
                    .map(|(b, _)| b.clone())
                    .ok_or_else(not_found);
            }
            Err(not_found())
        }
    }
}

fn parse_target_time(text: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| parse_label(text))
}

pub struct RestoreOptions {
    pub destination: Utf8PathBuf,
    pub position: RestorePosition,
    pub encryption: EncryptionMethod,
    pub master_key: Option<String>,
    pub workers: usize,
}

/// Restore `target` (and its parents, for an incremental) into
/// `options.destination`. On failure the destination is left as-is for
/// inspection; re-run into an empty directory.
pub async fn restore_chain(
    catalog: &Catalog,
    target: &Backup,
    options: &RestoreOptions,
) -> Result<()> {
    let chain = catalog.chain_of(target)?;
    info!(
        "restoring {} (chain of {}) into {}",
        target.label,
        chain.len(),
        options.destination
    );

    let full = &chain[0];
    copy_tree(&catalog.data_dir(&full.label), &options.destination).await?;
    reverse_transforms(&options.destination, options).await?;

    for incremental in &chain[1..] {
        debug!("overlaying incremental {}", incremental.label);
        let staging = options
            .destination
            .parent()
            .map(|p| p.join(format!(".pgvault-incr-{}", incremental.label)))
            .unwrap_or_else(|| Utf8PathBuf::from(format!("/tmp/pgvault-incr-{}", incremental.label)));
        copy_tree(&catalog.data_dir(&incremental.label), &staging).await?;
        reverse_transforms(&staging, options).await?;
        overlay_incremental(&staging, &options.destination).await?;
        tokio::fs::remove_dir_all(&staging).await.ok();
    }

    write_recovery_info(&options.destination, &options.position).await?;
    write_backup_label(&options.destination, target).await?;
    fix_permissions(&options.destination)?;
    info!("restore of {} complete", target.label);
    Ok(())
}

/// Recursive copy preserving symlinks.
pub async fn copy_tree(source: &Utf8Path, destination: &Utf8Path) -> Result<()> {
    tokio::fs::create_dir_all(destination).await?;
    let mut stack = vec![(source.to_owned(), destination.to_owned())];
    while let Some((from, to)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                Error::new(ErrorKind::Internal, format!("non-utf8 name {name:?}"))
            })?;
            let src = from.join(name);
            let dst = to.join(name);
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                tokio::fs::create_dir_all(&dst).await?;
                stack.push((src, dst));
            } else if file_type.is_symlink() {
                let link = tokio::fs::read_link(&src).await?;
                tokio::fs::symlink(link, &dst).await?;
            } else {
                tokio::fs::copy(&src, &dst).await?;
            }
        }
    }
    Ok(())
}

/// Undo the storage pipeline for every file under `dir`: decrypt first,
/// then decompress, on the worker pool.
pub async fn reverse_transforms(dir: &Utf8Path, options: &RestoreOptions) -> Result<()> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            Error::with_source(ErrorKind::DiskIo, "walking restore tree", std::io::Error::from(e))
        })?;
        if entry.file_type().is_file() {
            let path = Utf8PathBuf::from_path_buf(entry.path().to_owned())
                .map_err(|p| Error::new(ErrorKind::Internal, format!("non-utf8 path {p:?}")))?;
            files.push(path);
        }
    }

    let method = options.encryption;
    let secret = options.master_key.clone();
    run_jobs(options.workers, files, move |path| {
        let secret = secret.clone();
        async move {
            let path = if path.as_str().ends_with(encryption::ENCRYPTED_SUFFIX) {
                let secret = secret.as_deref().ok_or_else(|| {
                    Error::new(ErrorKind::ConfigInvalid, "encrypted backup but no master key")
                })?;
                encryption::decrypt_file(&path, method, secret).await?
            } else {
                path
            };
            compression::decompress_file(&path).await?;
            Ok(())
        }
    })
    .await
}

/// Merge an untransformed incremental tree into the workspace: plain
/// files replace or add; `INCREMENTAL.<name>` files combine with the
/// workspace's `<name>` by block replacement.
pub async fn overlay_incremental(incremental_root: &Utf8Path, workspace: &Utf8Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(incremental_root) {
        let entry = entry.map_err(|e| {
            Error::with_source(ErrorKind::DiskIo, "walking incremental", std::io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.path().to_owned())
            .map_err(|p| Error::new(ErrorKind::Internal, format!("non-utf8 path {p:?}")))?;
        let relative = path
            .strip_prefix(incremental_root)
            .expect("walkdir stays under the root");
        let file_name = relative.file_name().unwrap_or_default();

        if let Some(base_name) = file_name.strip_prefix(INCREMENTAL_PREFIX) {
            let target = workspace
                .join(relative.parent().unwrap_or(Utf8Path::new("")))
                .join(base_name);
            combine_incremental_file(&target, &path).await?;
        } else {
            let target = workspace.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&path, &target).await?;
        }
    }
    Ok(())
}

/// Apply one incremental relation file onto `target` in place. Format:
/// `{magic, block_count, truncation_block_length, block_numbers[],
/// blocks[] (8 KiB each)}`, all little-endian.
pub async fn combine_incremental_file(target: &Utf8Path, incremental: &Utf8Path) -> Result<()> {
    let raw = tokio::fs::read(incremental).await?;
    let mut buf = bytes::Bytes::from(raw);
    if buf.remaining() < 12 {
        return Err(Error::new(
            ErrorKind::ChecksumMismatch,
            format!("incremental file {incremental} is truncated"),
        ));
    }
    let magic = buf.get_u32_le();
    if magic != INCREMENTAL_MAGIC {
        return Err(Error::new(
            ErrorKind::ChecksumMismatch,
            format!("incremental file {incremental} has bad magic {magic:#010x}"),
        ));
    }
    let block_count = buf.get_u32_le() as usize;
    let truncation_block_length = buf.get_u32_le() as usize;
    if buf.remaining() < block_count * 4 {
        return Err(Error::new(
            ErrorKind::ChecksumMismatch,
            format!("incremental file {incremental} is truncated"),
        ));
    }
    let mut block_numbers = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        block_numbers.push(buf.get_u32_le() as usize);
    }
    if buf.remaining() < block_count * BLOCK_SIZE {
        return Err(Error::new(
            ErrorKind::ChecksumMismatch,
            format!("incremental file {incremental} is missing block payload"),
        ));
    }

    let mut contents = match tokio::fs::read(target).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    // The relation shrank to this many blocks since the parent backup.
    contents.resize(truncation_block_length * BLOCK_SIZE, 0);
    for blkno in &block_numbers {
        let needed = (blkno + 1) * BLOCK_SIZE;
        if contents.len() < needed {
            contents.resize(needed, 0);
        }
    }
    for (i, blkno) in block_numbers.iter().enumerate() {
        let src = &buf[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
        contents[blkno * BLOCK_SIZE..(blkno + 1) * BLOCK_SIZE].copy_from_slice(src);
    }
    tokio::fs::write(target, contents).await?;
    Ok(())
}

/// Recovery settings for a point-in-time target: `recovery.signal` plus
/// a `postgresql.auto.conf` carrying the target.
pub async fn write_recovery_info(destination: &Utf8Path, position: &RestorePosition) -> Result<()> {
    if *position == RestorePosition::Current {
        return Ok(());
    }
    let target_line = match position {
        RestorePosition::Current => unreachable!(),
        RestorePosition::Time(time) => format!("recovery_target_time = '{time}'"),
        RestorePosition::Lsn(lsn) => format!("recovery_target_lsn = '{lsn}'"),
        RestorePosition::Name(name) => format!("recovery_target_name = '{name}'"),
    };
    let conf = format!(
        "# recovery settings generated by pgvault\n{target_line}\nrecovery_target_action = 'promote'\n"
    );
    let auto_conf = destination.join("postgresql.auto.conf");
    let existing = tokio::fs::read_to_string(&auto_conf).await.unwrap_or_default();
    tokio::fs::write(&auto_conf, format!("{existing}{conf}")).await?;
    tokio::fs::write(destination.join("recovery.signal"), b"").await?;
    Ok(())
}

pub async fn write_backup_label(destination: &Utf8Path, backup: &Backup) -> Result<()> {
    let start_time = parse_label(&backup.label)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| backup.label.clone());
    let content = format!(
        "START WAL LOCATION: {} (file {})\n\
         CHECKPOINT LOCATION: {}\n\
         BACKUP METHOD: streamed\n\
         BACKUP FROM: primary\n\
         START TIME: {}\n\
         LABEL: {}\n",
        backup.start_lsn, backup.wal, backup.checkpoint_lsn, start_time, backup.label
    );
    tokio::fs::write(destination.join("backup_label"), content).await?;
    Ok(())
}

/// Data dir 0700, files 0600, symlinks untouched.
pub fn fix_permissions(destination: &Utf8Path) -> Result<()> {
    std::fs::set_permissions(destination, std::fs::Permissions::from_mode(0o700))?;
    for entry in walkdir::WalkDir::new(destination) {
        let entry = entry.map_err(|e| {
            Error::with_source(ErrorKind::DiskIo, "fixing permissions", std::io::Error::from(e))
        })?;
        if entry.path_is_symlink() {
            continue;
        }
        let mode = if entry.file_type().is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::make_backup;
    use camino_tempfile::tempdir;

    fn incremental_bytes(truncation_blocks: u32, blocks: &[(u32, u8)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&INCREMENTAL_MAGIC.to_le_bytes());
        out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        out.extend_from_slice(&truncation_blocks.to_le_bytes());
        for (blkno, _) in blocks {
            out.extend_from_slice(&blkno.to_le_bytes());
        }
        for (_, fill) in blocks {
            out.extend_from_slice(&vec![*fill; BLOCK_SIZE]);
        }
        out
    }

    #[tokio::test]
    async fn combine_overwrites_matching_blocks() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("16384");
        // Parent file: 4 blocks of 0xAA.
        tokio::fs::write(&target, vec![0xAA; 4 * BLOCK_SIZE]).await.unwrap();
        // Incremental replaces blocks 1 and 3.
        let inc = dir.path().join("INCREMENTAL.16384");
        tokio::fs::write(&inc, incremental_bytes(4, &[(1, 0xBB), (3, 0xCC)]))
            .await
            .unwrap();

        combine_incremental_file(&target, &inc).await.unwrap();
        let result = tokio::fs::read(&target).await.unwrap();
        assert_eq!(result.len(), 4 * BLOCK_SIZE);
        assert!(result[..BLOCK_SIZE].iter().all(|&b| b == 0xAA));
        assert!(result[BLOCK_SIZE..2 * BLOCK_SIZE].iter().all(|&b| b == 0xBB));
        assert!(result[2 * BLOCK_SIZE..3 * BLOCK_SIZE].iter().all(|&b| b == 0xAA));
        assert!(result[3 * BLOCK_SIZE..].iter().all(|&b| b == 0xCC));
    }

    #[tokio::test]
    async fn combine_honors_truncation() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rel");
        tokio::fs::write(&target, vec![0xAA; 10 * BLOCK_SIZE]).await.unwrap();
        let inc = dir.path().join("INCREMENTAL.rel");
        tokio::fs::write(&inc, incremental_bytes(2, &[(0, 0xBB)])).await.unwrap();

        combine_incremental_file(&target, &inc).await.unwrap();
        let result = tokio::fs::read(&target).await.unwrap();
        assert_eq!(result.len(), 2 * BLOCK_SIZE);
        assert!(result[..BLOCK_SIZE].iter().all(|&b| b == 0xBB));
    }

    #[tokio::test]
    async fn combine_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("rel");
        let inc = dir.path().join("INCREMENTAL.rel");
        tokio::fs::write(&inc, vec![0u8; 64]).await.unwrap();
        let err = combine_incremental_file(&target, &inc).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChecksumMismatch);
    }

    #[test]
    fn identifier_aliases() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        catalog.save(&make_backup("20240101000000", "")).unwrap();
        catalog.save(&make_backup("20240201000000", "")).unwrap();
        let mut invalid = make_backup("20240301000000", "");
        invalid.valid = crate::catalog::Validity::Invalid;
        catalog.save(&invalid).unwrap();

        assert_eq!(resolve_identifier(&catalog, "oldest").unwrap().label, "20240101000000");
        // invalid entries never resolve
        assert_eq!(resolve_identifier(&catalog, "newest").unwrap().label, "20240201000000");
        assert_eq!(resolve_identifier(&catalog, "latest").unwrap().label, "20240201000000");
        assert_eq!(
            resolve_identifier(&catalog, "20240101000000").unwrap().label,
            "20240101000000"
        );
        // target time between the two backups resolves to the older one
        assert_eq!(
            resolve_identifier(&catalog, "2024-01-15 00:00:00").unwrap().label,
            "20240101000000"
        );
        assert!(resolve_identifier(&catalog, "nonexistent").is_err());
    }

    #[test]
    fn position_parsing() {
        assert_eq!(RestorePosition::parse("current"), RestorePosition::Current);
        assert_eq!(
            RestorePosition::parse("time=2024-01-01 00:00:00"),
            RestorePosition::Time("2024-01-01 00:00:00".to_string())
        );
        assert_eq!(
            RestorePosition::parse("lsn=0/2000000"),
            RestorePosition::Lsn("0/2000000".to_string())
        );
        assert_eq!(
            RestorePosition::parse("name=before-upgrade"),
            RestorePosition::Name("before-upgrade".to_string())
        );
    }

    #[tokio::test]
    async fn restore_full_backup_writes_labels_and_permissions() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("backup"));
        let mut backup = make_backup("20240101000000", "");
        backup.compression = "none".to_string();
        catalog.save(&backup).unwrap();
        let data = catalog.data_dir(&backup.label);
        std::fs::create_dir_all(data.join("base/1")).unwrap();
        std::fs::write(data.join("base/1/1259"), b"relation").unwrap();
        std::fs::write(data.join("PG_VERSION"), b"16\n").unwrap();

        let destination = dir.path().join("restore");
        let options = RestoreOptions {
            destination: destination.clone(),
            position: RestorePosition::Lsn("0/2000000".to_string()),
            encryption: EncryptionMethod::None,
            master_key: None,
            workers: 2,
        };
        restore_chain(&catalog, &backup, &options).await.unwrap();

        assert_eq!(std::fs::read(destination.join("base/1/1259")).unwrap(), b"relation");
        let label = std::fs::read_to_string(destination.join("backup_label")).unwrap();
        assert!(label.contains("START WAL LOCATION: 0/1000028"));
        assert!(label.contains("CHECKPOINT LOCATION: 0/1000060"));
        assert!(label.contains("LABEL: 20240101000000"));
        assert!(destination.join("recovery.signal").exists());
        let auto = std::fs::read_to_string(destination.join("postgresql.auto.conf")).unwrap();
        assert!(auto.contains("recovery_target_lsn = '0/2000000'"));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&destination).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(destination.join("base/1/1259"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn restore_chain_applies_incrementals_in_order() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("backup"));

        let mut full = make_backup("A", "");
        full.compression = "none".to_string();
        catalog.save(&full).unwrap();
        let data = catalog.data_dir("A");
        std::fs::create_dir_all(data.join("base/1")).unwrap();
        std::fs::write(data.join("base/1/16384"), vec![0xAA; 2 * BLOCK_SIZE]).unwrap();

        let mut incr = make_backup("B", "A");
        incr.compression = "none".to_string();
        catalog.save(&incr).unwrap();
        let incr_data = catalog.data_dir("B");
        std::fs::create_dir_all(incr_data.join("base/1")).unwrap();
        std::fs::write(
            incr_data.join("base/1/INCREMENTAL.16384"),
            incremental_bytes(2, &[(1, 0xBB)]),
        )
        .unwrap();
        std::fs::write(incr_data.join("base/1/16999"), b"fresh file").unwrap();

        let destination = dir.path().join("restore");
        let options = RestoreOptions {
            destination: destination.clone(),
            position: RestorePosition::Current,
            encryption: EncryptionMethod::None,
            master_key: None,
            workers: 1,
        };
        let target = catalog.load("B").unwrap();
        restore_chain(&catalog, &target, &options).await.unwrap();

        let combined = std::fs::read(destination.join("base/1/16384")).unwrap();
        assert!(combined[..BLOCK_SIZE].iter().all(|&b| b == 0xAA));
        assert!(combined[BLOCK_SIZE..].iter().all(|&b| b == 0xBB));
        assert_eq!(std::fs::read(destination.join("base/1/16999")).unwrap(), b"fresh file");
        // position=current writes no recovery.signal
        assert!(!destination.join("recovery.signal").exists());
    }
}
