//! The durable backup catalog: one directory per backup label under
//! `<base>/<server>/backup/`, each holding a `backup.info` key-value file,
//! the manifest, the sha512 listing and the `data/` tree.
//!
//! `backup.info` is the source of truth for navigation. Entries that fail
//! to parse are skipped and logged; they are never deleted by automation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use postgres_wal::{Lsn, PgMajorVersion, TimeLineId};

use crate::error::{Error, ErrorKind, Result};

pub const BACKUP_INFO_FILE: &str = "backup.info";
pub const BACKUP_MANIFEST_FILE: &str = "backup.manifest";
pub const BACKUP_SHA512_FILE: &str = "backup.sha512";
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BackupType {
    fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }
}

impl FromStr for BackupType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(format!("unknown backup type {other:?}")),
        }
    }
}

/// Tri-state validity: a backup in progress is `Unknown` until its chain
/// of stages completes or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
    Unknown,
}

impl Validity {
    fn as_str(self) -> &'static str {
        match self {
            Validity::Valid => "true",
            Validity::Invalid => "false",
            Validity::Unknown => "unknown",
        }
    }
}

impl FromStr for Validity {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "true" => Ok(Validity::Valid),
            "false" => Ok(Validity::Invalid),
            "unknown" => Ok(Validity::Unknown),
            other => Err(format!("unknown validity {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablespace {
    pub name: String,
    pub oid: u32,
    pub external_path: Utf8PathBuf,
}

/// One catalog entry, the in-memory form of `backup.info`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    /// `YYYYMMDDhhmmss`; lexicographic order is chronological order.
    pub label: String,
    /// Empty for a full backup.
    pub parent_label: String,
    pub backup_type: BackupType,
    pub valid: Validity,
    pub keep: bool,
    pub compression: String,
    pub encryption: String,
    pub major_version: u32,
    pub minor_version: u32,
    /// First WAL file needed to recover this backup.
    pub wal: String,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub checkpoint_lsn: Lsn,
    pub start_timeline: TimeLineId,
    pub end_timeline: TimeLineId,
    pub backup_size: u64,
    pub restore_size: u64,
    pub biggest_file_size: u64,
    pub basebackup_elapsed: f64,
    pub link_elapsed: f64,
    pub hash_elapsed: f64,
    pub remote_elapsed: f64,
    pub tablespaces: Vec<Tablespace>,
    pub comments: BTreeMap<String, String>,
}

impl Backup {
    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    pub fn is_valid(&self) -> bool {
        self.valid == Validity::Valid
    }

    /// Serialize to `backup.info` lines. Key order is fixed so diffs of
    /// the catalog stay readable.
    pub fn to_info(&self) -> String {
        let mut out = String::new();
        let mut put = |k: &str, v: String| {
            out.push_str(k);
            out.push('=');
            out.push_str(&v);
            out.push('\n');
        };
        put("label", self.label.clone());
        put("parent_label", self.parent_label.clone());
        put("type", self.backup_type.as_str().to_string());
        put("wal", self.wal.clone());
        put("start_lsn", self.start_lsn.to_string());
        put("end_lsn", self.end_lsn.to_string());
        put("checkpoint_lsn", self.checkpoint_lsn.to_string());
        put("start_timeline", self.start_timeline.to_string());
        put("end_timeline", self.end_timeline.to_string());
        put("major_version", self.major_version.to_string());
        put("minor_version", self.minor_version.to_string());
        put("valid", self.valid.as_str().to_string());
        put("keep", self.keep.to_string());
        put("compression", self.compression.clone());
        put("encryption", self.encryption.clone());
        put("backup_size", self.backup_size.to_string());
        put("restore_size", self.restore_size.to_string());
        put("biggest_file_size", self.biggest_file_size.to_string());
        put("basebackup_elapsed", format!("{:.3}", self.basebackup_elapsed));
        put("link_elapsed", format!("{:.3}", self.link_elapsed));
        put("hash_elapsed", format!("{:.3}", self.hash_elapsed));
        put("remote_elapsed", format!("{:.3}", self.remote_elapsed));
        for (i, ts) in self.tablespaces.iter().enumerate() {
            put(
                &format!("tablespace{i}"),
                format!("{},{},{}", ts.name, ts.oid, ts.external_path),
            );
        }
        for (key, value) in &self.comments {
            put(&format!("comment_{key}"), value.clone());
        }
        out
    }

    pub fn from_info(content: &str) -> std::result::Result<Backup, String> {
        let mut map = BTreeMap::new();
        let mut tablespaces = Vec::new();
        let mut comments = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("malformed line {line:?}"))?;
            if let Some(comment_key) = key.strip_prefix("comment_") {
                comments.insert(comment_key.to_string(), value.to_string());
            } else if key.starts_with("tablespace") {
                let mut parts = value.splitn(3, ',');
                let name = parts.next().unwrap_or_default().to_string();
                let oid = parts
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| format!("bad tablespace oid in {line:?}"))?;
                let external_path =
                    Utf8PathBuf::from(parts.next().unwrap_or_default().to_string());
                tablespaces.push(Tablespace {
                    name,
                    oid,
                    external_path,
                });
            } else {
                map.insert(key.to_string(), value.to_string());
            }
        }

        let get = |k: &str| -> std::result::Result<&String, String> {
            map.get(k).ok_or_else(|| format!("missing key {k}"))
        };
        let parse_lsn = |k: &str| -> std::result::Result<Lsn, String> {
            get(k)?.parse().map_err(|_| format!("bad LSN for {k}"))
        };
        let parse_num = |k: &str| -> std::result::Result<u64, String> {
            get(k)?.parse().map_err(|_| format!("bad number for {k}"))
        };
        let parse_f64 = |k: &str| -> std::result::Result<f64, String> {
            get(k)?.parse().map_err(|_| format!("bad number for {k}"))
        };

        let backup = Backup {
            label: get("label")?.clone(),
            parent_label: map.get("parent_label").cloned().unwrap_or_default(),
            backup_type: get("type")?.parse()?,
            wal: map.get("wal").cloned().unwrap_or_default(),
            start_lsn: parse_lsn("start_lsn")?,
            end_lsn: parse_lsn("end_lsn")?,
            checkpoint_lsn: parse_lsn("checkpoint_lsn")?,
            start_timeline: parse_num("start_timeline")? as u32,
            end_timeline: parse_num("end_timeline")? as u32,
            major_version: parse_num("major_version")? as u32,
            minor_version: parse_num("minor_version")? as u32,
            valid: get("valid")?.parse()?,
            keep: get("keep")?.parse().map_err(|_| "bad keep flag".to_string())?,
            compression: map.get("compression").cloned().unwrap_or_default(),
            encryption: map.get("encryption").cloned().unwrap_or_default(),
            backup_size: parse_num("backup_size")?,
            restore_size: parse_num("restore_size")?,
            biggest_file_size: parse_num("biggest_file_size")?,
            basebackup_elapsed: parse_f64("basebackup_elapsed").unwrap_or(0.0),
            link_elapsed: parse_f64("link_elapsed").unwrap_or(0.0),
            hash_elapsed: parse_f64("hash_elapsed").unwrap_or(0.0),
            remote_elapsed: parse_f64("remote_elapsed").unwrap_or(0.0),
            tablespaces,
            comments,
        };

        if backup.end_lsn < backup.start_lsn {
            return Err(format!(
                "end_lsn {} before start_lsn {}",
                backup.end_lsn, backup.start_lsn
            ));
        }
        if backup.start_timeline > backup.end_timeline {
            return Err(format!(
                "start_timeline {} after end_timeline {}",
                backup.start_timeline, backup.end_timeline
            ));
        }
        Ok(backup)
    }
}

/// Catalog of one server's backups, rooted at its `backup/` directory.
pub struct Catalog {
    backup_dir: Utf8PathBuf,
}

impl Catalog {
    pub fn new(backup_dir: impl Into<Utf8PathBuf>) -> Catalog {
        Catalog {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Utf8Path {
        &self.backup_dir
    }

    pub fn entry_dir(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir.join(label)
    }

    pub fn data_dir(&self, label: &str) -> Utf8PathBuf {
        self.entry_dir(label).join(DATA_DIR)
    }

    /// All parseable backups, sorted by label ascending (oldest first).
    pub fn list(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        let entries = match self.backup_dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry.map_err(Error::from)?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let info_path = entry.path().join(BACKUP_INFO_FILE);
            let content = match std::fs::read_to_string(&info_path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("skipping {}: cannot read {BACKUP_INFO_FILE}: {e}", entry.path());
                    continue;
                }
            };
            match Backup::from_info(&content) {
                Ok(backup) => backups.push(backup),
                Err(e) => warn!("skipping unparseable backup at {}: {e}", entry.path()),
            }
        }
        backups.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(backups)
    }

    pub fn load(&self, label: &str) -> Result<Backup> {
        let info_path = self.entry_dir(label).join(BACKUP_INFO_FILE);
        let content = std::fs::read_to_string(&info_path).map_err(|e| {
            Error::with_source(ErrorKind::NotFound, format!("backup {label} not found"), e)
        })?;
        Backup::from_info(&content)
            .map_err(|e| Error::new(ErrorKind::Internal, format!("backup {label}: {e}")))
    }

    /// Persist `backup.info` atomically.
    pub fn save(&self, backup: &Backup) -> Result<()> {
        let dir = self.entry_dir(&backup.label);
        std::fs::create_dir_all(&dir).map_err(Error::from)?;
        utils::crashsafe::overwrite(&dir.join(BACKUP_INFO_FILE), backup.to_info().as_bytes())
            .map_err(Error::from)
    }

    pub fn parent_of(&self, backup: &Backup) -> Result<Option<Backup>> {
        if backup.parent_label.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.load(&backup.parent_label)?))
    }

    pub fn children_of(&self, label: &str) -> Result<Vec<Backup>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|b| b.parent_label == label)
            .collect())
    }

    /// Newest valid backup of the given major version, if any.
    pub fn latest_valid(&self, major: PgMajorVersion) -> Result<Option<Backup>> {
        Ok(self
            .list()?
            .into_iter()
            .rev()
            .find(|b| b.is_valid() && b.major_version == major.major()))
    }

    /// Walk `parent_label` links up to the full backup at the root of the
    /// chain. Returns the chain ordered `[full, …, backup]`. Fails with
    /// `chain_broken` on a dangling parent, a version mismatch or a cycle.
    pub fn chain_of(&self, backup: &Backup) -> Result<Vec<Backup>> {
        let mut chain = vec![backup.clone()];
        let mut current = backup.clone();
        let mut hops = 0usize;
        while !current.parent_label.is_empty() {
            hops += 1;
            if hops > 1000 {
                return Err(Error::new(
                    ErrorKind::ChainBroken,
                    format!("parent chain of {} does not terminate", backup.label),
                ));
            }
            let parent = self.load(&current.parent_label).map_err(|e| {
                Error::with_source(
                    ErrorKind::ChainBroken,
                    format!("backup {} references missing parent {}", current.label, current.parent_label),
                    e,
                )
            })?;
            if parent.major_version != backup.major_version {
                return Err(Error::new(
                    ErrorKind::ChainBroken,
                    format!(
                        "backup {} (version {}) chained to parent {} (version {})",
                        backup.label, backup.major_version, parent.label, parent.major_version
                    ),
                ));
            }
            chain.push(parent.clone());
            current = parent;
        }
        if chain.last().map(|b| b.backup_type) != Some(BackupType::Full) {
            return Err(Error::new(
                ErrorKind::ChainBroken,
                format!("chain of {} does not terminate in a full backup", backup.label),
            ));
        }
        chain.reverse();
        Ok(chain)
    }

    /// Remove a backup from the catalog. Without `force`, a backup that
    /// still has children is refused with `active_conflict`; with it, all
    /// descendants are marked invalid before the entry is removed.
    pub fn delete(&self, label: &str, force: bool) -> Result<()> {
        let children = self.children_of(label)?;
        if !children.is_empty() {
            if !force {
                return Err(Error::new(
                    ErrorKind::ActiveConflict,
                    format!(
                        "backup {label} has {} dependent incremental backup(s)",
                        children.len()
                    ),
                ));
            }
            for child in children {
                self.invalidate_descendants(&child.label)?;
            }
        }
        std::fs::remove_dir_all(self.entry_dir(label)).map_err(Error::from)
    }

    fn invalidate_descendants(&self, label: &str) -> Result<()> {
        let mut backup = self.load(label)?;
        backup.valid = Validity::Invalid;
        self.save(&backup)?;
        for child in self.children_of(label)? {
            self.invalidate_descendants(&child.label)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    pub(crate) fn make_backup(label: &str, parent: &str) -> Backup {
        Backup {
            label: label.to_string(),
            parent_label: parent.to_string(),
            backup_type: if parent.is_empty() {
                BackupType::Full
            } else {
                BackupType::Incremental
            },
            valid: Validity::Valid,
            keep: false,
            compression: "zstd".to_string(),
            encryption: "none".to_string(),
            major_version: 16,
            minor_version: 3,
            wal: "000000010000000000000001".to_string(),
            start_lsn: Lsn(0x0100_0028),
            end_lsn: Lsn(0x0200_0000),
            checkpoint_lsn: Lsn(0x0100_0060),
            start_timeline: 1,
            end_timeline: 1,
            backup_size: 1024,
            restore_size: 4096,
            biggest_file_size: 512,
            basebackup_elapsed: 1.5,
            link_elapsed: 0.1,
            hash_elapsed: 0.2,
            remote_elapsed: 0.0,
            tablespaces: vec![],
            comments: BTreeMap::new(),
        }
    }

    #[test]
    fn info_roundtrip() {
        let mut backup = make_backup("20240101000000", "");
        backup.tablespaces.push(Tablespace {
            name: "ts1".to_string(),
            oid: 16500,
            external_path: Utf8PathBuf::from("/mnt/ts1"),
        });
        backup.comments.insert("reason".to_string(), "pre-upgrade".to_string());
        let restored = Backup::from_info(&backup.to_info()).unwrap();
        assert_eq!(restored, backup);
    }

    #[test]
    fn info_rejects_inverted_lsn_range() {
        let mut backup = make_backup("20240101000000", "");
        backup.end_lsn = Lsn(1);
        backup.start_lsn = Lsn(2);
        assert!(Backup::from_info(&backup.to_info()).is_err());
    }

    #[test]
    fn list_is_sorted_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        catalog.save(&make_backup("20240301000000", "")).unwrap();
        catalog.save(&make_backup("20240101000000", "")).unwrap();
        // an unparseable entry
        std::fs::create_dir_all(dir.path().join("junk")).unwrap();
        std::fs::write(dir.path().join("junk").join(BACKUP_INFO_FILE), "not=valid").unwrap();

        let labels: Vec<String> = catalog.list().unwrap().into_iter().map(|b| b.label).collect();
        assert_eq!(labels, vec!["20240101000000", "20240301000000"]);
    }

    #[test]
    fn chain_walks_to_full() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        catalog.save(&make_backup("A", "")).unwrap();
        catalog.save(&make_backup("B", "A")).unwrap();
        catalog.save(&make_backup("C", "B")).unwrap();

        let c = catalog.load("C").unwrap();
        let chain: Vec<String> = catalog.chain_of(&c).unwrap().into_iter().map(|b| b.label).collect();
        assert_eq!(chain, vec!["A", "B", "C"]);
    }

    #[test]
    fn chain_with_version_mismatch_is_broken() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        let mut full = make_backup("A", "");
        full.major_version = 15;
        catalog.save(&full).unwrap();
        catalog.save(&make_backup("B", "A")).unwrap();

        let b = catalog.load("B").unwrap();
        assert_eq!(catalog.chain_of(&b).unwrap_err().kind, ErrorKind::ChainBroken);
    }

    #[test]
    fn delete_with_children_requires_force() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        catalog.save(&make_backup("A", "")).unwrap();
        catalog.save(&make_backup("B", "A")).unwrap();
        catalog.save(&make_backup("C", "B")).unwrap();

        // Deleting B without force fails with active_conflict.
        let err = catalog.delete("B", false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActiveConflict);
        assert!(catalog.load("B").is_ok());

        // With force it succeeds and C becomes invalid.
        catalog.delete("B", true).unwrap();
        assert!(catalog.load("B").is_err());
        assert_eq!(catalog.load("C").unwrap().valid, Validity::Invalid);
    }

    #[test]
    fn latest_valid_respects_version_and_validity() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(dir.path());
        catalog.save(&make_backup("20240101000000", "")).unwrap();
        let mut invalid = make_backup("20240301000000", "");
        invalid.valid = Validity::Invalid;
        catalog.save(&invalid).unwrap();
        let mut old_version = make_backup("20240401000000", "");
        old_version.major_version = 15;
        catalog.save(&old_version).unwrap();

        let latest = catalog.latest_valid(PgMajorVersion::V16).unwrap().unwrap();
        assert_eq!(latest.label, "20240101000000");
    }
}
