//! Hard-link deduplication across adjacent backups.
//!
//! After a backup completes, files in the next-newest valid backup of the
//! same major version whose post-transform content is identical are
//! replaced with hard links to the new backup's copies, making the newer
//! backup the physical holder. Backups with differing compression or
//! encryption parameters are left alone.

use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::catalog::{Backup, Catalog, BACKUP_MANIFEST_FILE, DATA_DIR};
use crate::error::{Error, ErrorKind, Result};
use crate::manifest::{compare_manifests, Manifest};
use crate::pipeline::run_jobs;

pub struct LinkOutcome {
    pub linked_files: u64,
    pub elapsed: f64,
}

/// Resolve a manifest path to the post-pipeline file on disk.
pub fn physical_path(entry_dir: &Utf8Path, manifest_path: &str, backup: &Backup) -> Utf8PathBuf {
    let mut name = format!("{}/{}/{}", entry_dir, DATA_DIR, manifest_path);
    match backup.compression.as_str() {
        "gzip" => name.push_str(".gz"),
        "zstd" => name.push_str(".zstd"),
        "lz4" => name.push_str(".lz4"),
        "bzip2" => name.push_str(".bz2"),
        _ => {}
    }
    if backup.encryption != "none" && !backup.encryption.is_empty() {
        name.push_str(".aes");
    }
    Utf8PathBuf::from(name)
}

/// Deduplicate `label` against its next-newest valid predecessor.
pub async fn link_backup(catalog: &Catalog, label: &str, workers: usize) -> Result<LinkOutcome> {
    let started = Instant::now();
    let backup = catalog.load(label)?;
    let backups = catalog.list()?;

    // next-newest valid backup of the same major version, older than ours
    let previous = backups
        .iter()
        .rev()
        .filter(|b| b.label.as_str() < label)
        .find(|b| b.is_valid() && b.major_version == backup.major_version);
    let Some(previous) = previous else {
        debug!("no linkable predecessor for {label}");
        return Ok(LinkOutcome {
            linked_files: 0,
            elapsed: started.elapsed().as_secs_f64(),
        });
    };

    if previous.compression != backup.compression || previous.encryption != backup.encryption {
        info!(
            "skipping link of {label} against {}: transform parameters differ",
            previous.label
        );
        return Ok(LinkOutcome {
            linked_files: 0,
            elapsed: started.elapsed().as_secs_f64(),
        });
    }

    let new_entry = catalog.entry_dir(label);
    let prev_entry = catalog.entry_dir(&previous.label);
    let new_manifest = Manifest::load(&new_entry.join(BACKUP_MANIFEST_FILE))?;
    let prev_manifest = Manifest::load(&prev_entry.join(BACKUP_MANIFEST_FILE))?;

    let diff = compare_manifests(&prev_manifest, &new_manifest);
    let jobs: Vec<(Utf8PathBuf, Utf8PathBuf)> = diff
        .unchanged
        .iter()
        .map(|path| {
            (
                physical_path(&new_entry, path, &backup),
                physical_path(&prev_entry, path, previous),
            )
        })
        .collect();
    let candidates = jobs.len() as u64;

    run_jobs(workers, jobs, move |(new_path, prev_path)| async move {
        link_pair(&new_path, &prev_path).await
    })
    .await?;

    let outcome = LinkOutcome {
        linked_files: candidates,
        elapsed: started.elapsed().as_secs_f64(),
    };
    info!(
        "linked {} file(s) of {} into {label} in {:.3}s",
        outcome.linked_files, previous.label, outcome.elapsed
    );
    Ok(outcome)
}

/// Replace `prev_path` with a hard link to `new_path`.
async fn link_pair(new_path: &Utf8Path, prev_path: &Utf8Path) -> Result<()> {
    let new_meta = match tokio::fs::symlink_metadata(new_path).await {
        Ok(meta) => meta,
        Err(_) => {
            debug!("link candidate missing: {new_path}");
            return Ok(());
        }
    };
    let Ok(prev_meta) = tokio::fs::symlink_metadata(prev_path).await else {
        return Ok(());
    };
    // Only plain files participate; symlinks and directories stay.
    if !new_meta.is_file() || !prev_meta.is_file() {
        return Ok(());
    }
    {
        use std::os::unix::fs::MetadataExt;
        if new_meta.dev() == prev_meta.dev() && new_meta.ino() == prev_meta.ino() {
            return Ok(()); // already linked by an earlier pass
        }
    }

    let tmp = Utf8PathBuf::from(format!("{prev_path}.link"));
    tokio::fs::hard_link(new_path, &tmp).await.map_err(|e| {
        Error::with_source(
            ErrorKind::DiskIo,
            format!("hard link {new_path} -> {prev_path}"),
            e,
        )
    })?;
    tokio::fs::rename(&tmp, prev_path).await.map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::make_backup;
    use crate::manifest::{ManifestFile, WalRange};
    use camino_tempfile::tempdir;
    use std::os::unix::fs::MetadataExt;

    fn manifest_with(files: Vec<(&str, &str)>) -> Manifest {
        let mut m = Manifest {
            version: 1,
            system_identifier: 1,
            files: files
                .into_iter()
                .map(|(path, checksum)| ManifestFile {
                    path: path.to_string(),
                    size: 4,
                    last_modified: "now".to_string(),
                    checksum_algorithm: "SHA256".to_string(),
                    checksum: checksum.to_string(),
                    transform_size: None,
                    transform_checksum: None,
                })
                .collect(),
            wal_ranges: vec![WalRange {
                timeline: 1,
                start_lsn: "0/1".to_string(),
                end_lsn: "0/2".to_string(),
            }],
            manifest_checksum: String::new(),
        };
        m.seal();
        m
    }

    fn write_entry(
        catalog: &Catalog,
        label: &str,
        manifest: &Manifest,
        files: &[(&str, &[u8])],
    ) {
        let mut backup = make_backup(label, "");
        backup.compression = "none".to_string();
        backup.encryption = "none".to_string();
        catalog.save(&backup).unwrap();
        let entry = catalog.entry_dir(label);
        manifest.save(&entry.join(BACKUP_MANIFEST_FILE)).unwrap();
        for (path, content) in files {
            let full = entry.join(DATA_DIR).join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
    }

    #[tokio::test]
    async fn identical_files_share_an_inode_afterwards() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());

        let manifest = manifest_with(vec![("base/1/1259", "same"), ("base/1/2600", "old")]);
        write_entry(
            &catalog,
            "20240101000000",
            &manifest,
            &[("base/1/1259", b"idem"), ("base/1/2600", b"old!")],
        );
        let manifest_new = manifest_with(vec![("base/1/1259", "same"), ("base/1/2600", "new")]);
        write_entry(
            &catalog,
            "20240201000000",
            &manifest_new,
            &[("base/1/1259", b"idem"), ("base/1/2600", b"new!")],
        );

        let outcome = link_backup(&catalog, "20240201000000", 2).await.unwrap();
        assert_eq!(outcome.linked_files, 1);

        let new_meta = std::fs::metadata(
            catalog.entry_dir("20240201000000").join("data/base/1/1259"),
        )
        .unwrap();
        let prev_meta = std::fs::metadata(
            catalog.entry_dir("20240101000000").join("data/base/1/1259"),
        )
        .unwrap();
        assert_eq!(new_meta.ino(), prev_meta.ino());
        assert_eq!(new_meta.dev(), prev_meta.dev());
        assert!(new_meta.nlink() >= 2);

        // The differing file keeps separate storage.
        let changed_new = std::fs::metadata(
            catalog.entry_dir("20240201000000").join("data/base/1/2600"),
        )
        .unwrap();
        let changed_prev = std::fs::metadata(
            catalog.entry_dir("20240101000000").join("data/base/1/2600"),
        )
        .unwrap();
        assert_ne!(changed_new.ino(), changed_prev.ino());
        assert_eq!(
            std::fs::read(catalog.entry_dir("20240101000000").join("data/base/1/2600")).unwrap(),
            b"old!"
        );
    }

    #[tokio::test]
    async fn differing_transform_parameters_skip_linking() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());

        let manifest = manifest_with(vec![("f", "same")]);
        let mut old = make_backup("20240101000000", "");
        old.compression = "gzip".to_string();
        catalog.save(&old).unwrap();
        manifest
            .save(&catalog.entry_dir("20240101000000").join(BACKUP_MANIFEST_FILE))
            .unwrap();

        write_entry(&catalog, "20240201000000", &manifest, &[("f", b"data")]);

        let outcome = link_backup(&catalog, "20240201000000", 1).await.unwrap();
        assert_eq!(outcome.linked_files, 0);
    }

    #[tokio::test]
    async fn first_backup_has_nothing_to_link() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        let manifest = manifest_with(vec![("f", "x")]);
        write_entry(&catalog, "20240101000000", &manifest, &[("f", b"data")]);
        let outcome = link_backup(&catalog, "20240101000000", 1).await.unwrap();
        assert_eq!(outcome.linked_files, 0);
    }

    #[test]
    fn physical_path_applies_suffixes() {
        let mut backup = make_backup("L", "");
        backup.compression = "zstd".to_string();
        backup.encryption = "aes-256-cbc".to_string();
        let path = physical_path(Utf8Path::new("/b/L"), "base/1/1259", &backup);
        assert_eq!(path, "/b/L/data/base/1/1259.zstd.aes");
    }
}
