//! PostgreSQL-form backup manifest (`backup.manifest`), the per-file
//! digest listing (`backup.sha512`), and manifest comparison used by
//! hard-link deduplication and verification.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// The server emits this as `PostgreSQL-Backup-Manifest-Version`;
    /// the stored form uses the short name.
    #[serde(rename = "Version", alias = "PostgreSQL-Backup-Manifest-Version")]
    pub version: u32,
    /// Absent from manifests of servers older than 17.
    #[serde(rename = "System-Identifier", default)]
    pub system_identifier: u64,
    #[serde(rename = "Files")]
    pub files: Vec<ManifestFile>,
    #[serde(rename = "WAL-Ranges")]
    pub wal_ranges: Vec<WalRange>,
    #[serde(rename = "Manifest-Checksum")]
    pub manifest_checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestFile {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Last-Modified")]
    pub last_modified: String,
    #[serde(rename = "Checksum-Algorithm")]
    pub checksum_algorithm: String,
    #[serde(rename = "Checksum")]
    pub checksum: String,
    /// Size after the storage pipeline ran (compression, encryption).
    #[serde(rename = "Transform-Size", skip_serializing_if = "Option::is_none")]
    pub transform_size: Option<u64>,
    /// SHA-256 of the transformed file as stored on disk.
    #[serde(rename = "Transform-Checksum", skip_serializing_if = "Option::is_none")]
    pub transform_checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalRange {
    #[serde(rename = "Timeline")]
    pub timeline: u32,
    #[serde(rename = "Start-LSN")]
    pub start_lsn: String,
    #[serde(rename = "End-LSN")]
    pub end_lsn: String,
}

impl Manifest {
    pub fn load(path: &Utf8Path) -> Result<Manifest> {
        let raw = std::fs::read(path).map_err(Error::from)?;
        serde_json::from_slice(&raw).map_err(|e| {
            Error::with_source(ErrorKind::Internal, format!("malformed manifest {path}"), e)
        })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self).map_err(|e| {
            Error::with_source(ErrorKind::Internal, "manifest serialization failed", e)
        })?;
        utils::crashsafe::overwrite(path, &raw).map_err(Error::from)
    }

    /// Fill `Manifest-Checksum` from the rest of the document.
    pub fn seal(&mut self) {
        self.manifest_checksum = String::new();
        let raw = serde_json::to_vec(self).expect("manifest serializes");
        self.manifest_checksum = hex::encode(Sha256::digest(&raw));
    }

    pub fn file(&self, path: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut ManifestFile> {
        self.files.iter_mut().find(|f| f.path == path)
    }
}

/// Per-path differences between two manifests, keyed on the stored
/// (post-transform when present) checksums.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub deleted: Vec<String>,
    pub changed: Vec<String>,
    pub added: Vec<String>,
    /// Paths whose content is identical in both manifests.
    pub unchanged: Vec<String>,
}

fn effective_checksum(f: &ManifestFile) -> &str {
    f.transform_checksum.as_deref().unwrap_or(&f.checksum)
}

/// Compare `old` (e.g. the previous backup) against `new`.
pub fn compare_manifests(old: &Manifest, new: &Manifest) -> ManifestDiff {
    let old_files: BTreeMap<&str, &ManifestFile> =
        old.files.iter().map(|f| (f.path.as_str(), f)).collect();
    let new_files: BTreeMap<&str, &ManifestFile> =
        new.files.iter().map(|f| (f.path.as_str(), f)).collect();

    let mut diff = ManifestDiff::default();
    for (path, old_file) in &old_files {
        match new_files.get(path) {
            None => diff.deleted.push(path.to_string()),
            Some(new_file) => {
                if effective_checksum(old_file) == effective_checksum(new_file) {
                    diff.unchanged.push(path.to_string());
                } else {
                    diff.changed.push(path.to_string());
                }
            }
        }
    }
    for path in new_files.keys() {
        if !old_files.contains_key(path) {
            diff.added.push(path.to_string());
        }
    }
    diff
}

/// SHA-512 of one file, streamed.
pub fn sha512_of_file(path: &Utf8Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(Error::from)?;
    let mut hasher = Sha512::new();
    std::io::copy(&mut file, &mut hasher).map_err(Error::from)?;
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of one file, streamed.
pub fn sha256_of_file(path: &Utf8Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(Error::from)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(Error::from)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Write `backup.sha512` in `sha512sum` format: one `<digest>  <path>`
/// line per file under `data_dir`, paths relative to the backup entry.
pub fn write_sha512_file(entry_dir: &Utf8Path, data_dir: &Utf8Path) -> Result<u64> {
    let mut lines = Vec::new();
    for entry in walkdir::WalkDir::new(data_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::with_source(ErrorKind::DiskIo, "walking backup data", std::io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.path().to_owned())
            .map_err(|p| Error::new(ErrorKind::Internal, format!("non-utf8 path {p:?}")))?;
        let digest = sha512_of_file(&path)?;
        let relative = path.strip_prefix(entry_dir).unwrap_or(&path);
        lines.push(format!("{digest}  {relative}"));
    }
    let count = lines.len() as u64;
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    utils::crashsafe::overwrite(
        &entry_dir.join(crate::catalog::BACKUP_SHA512_FILE),
        content.as_bytes(),
    )
    .map_err(Error::from)?;
    Ok(count)
}

/// Check every line of `backup.sha512` against the files on disk.
pub fn verify_sha512_file(entry_dir: &Utf8Path) -> Result<()> {
    let listing = std::fs::read_to_string(entry_dir.join(crate::catalog::BACKUP_SHA512_FILE))
        .map_err(Error::from)?;
    for line in listing.lines() {
        let Some((digest, path)) = line.split_once("  ") else {
            return Err(Error::new(
                ErrorKind::ChecksumMismatch,
                format!("malformed sha512 line {line:?}"),
            ));
        };
        let actual = sha512_of_file(&entry_dir.join(path))?;
        if actual != digest {
            return Err(Error::new(
                ErrorKind::ChecksumMismatch,
                format!("checksum mismatch for {path}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn manifest_file(path: &str, checksum: &str) -> ManifestFile {
        ManifestFile {
            path: path.to_string(),
            size: 100,
            last_modified: "2024-01-01 00:00:00 GMT".to_string(),
            checksum_algorithm: "SHA256".to_string(),
            checksum: checksum.to_string(),
            transform_size: None,
            transform_checksum: None,
        }
    }

    fn manifest(files: Vec<ManifestFile>) -> Manifest {
        let mut m = Manifest {
            version: 1,
            system_identifier: 7_000_000_000_000_000_001,
            files,
            wal_ranges: vec![WalRange {
                timeline: 1,
                start_lsn: "0/1000028".to_string(),
                end_lsn: "0/2000000".to_string(),
            }],
            manifest_checksum: String::new(),
        };
        m.seal();
        m
    }

    #[test]
    fn manifest_roundtrip() {
        let dir = tempdir().unwrap();
        let m = manifest(vec![manifest_file("base/1/1259", "aa")]);
        let path = dir.path().join("backup.manifest");
        m.save(&path).unwrap();
        let restored = Manifest::load(&path).unwrap();
        assert_eq!(restored, m);
    }

    #[test]
    fn seal_is_deterministic_and_content_sensitive() {
        let a = manifest(vec![manifest_file("f", "aa")]);
        let b = manifest(vec![manifest_file("f", "aa")]);
        assert_eq!(a.manifest_checksum, b.manifest_checksum);
        let c = manifest(vec![manifest_file("f", "bb")]);
        assert_ne!(a.manifest_checksum, c.manifest_checksum);
    }

    #[test]
    fn compare_reports_all_categories() {
        let old = manifest(vec![
            manifest_file("same", "11"),
            manifest_file("modified", "22"),
            manifest_file("removed", "33"),
        ]);
        let new = manifest(vec![
            manifest_file("same", "11"),
            manifest_file("modified", "99"),
            manifest_file("fresh", "44"),
        ]);
        let diff = compare_manifests(&old, &new);
        assert_eq!(diff.unchanged, vec!["same"]);
        assert_eq!(diff.changed, vec!["modified"]);
        assert_eq!(diff.deleted, vec!["removed"]);
        assert_eq!(diff.added, vec!["fresh"]);
    }

    #[test]
    fn transform_checksum_shadows_original() {
        let mut old_file = manifest_file("f", "same-original");
        old_file.transform_checksum = Some("t1".to_string());
        let mut new_file = manifest_file("f", "same-original");
        new_file.transform_checksum = Some("t2".to_string());
        let diff = compare_manifests(&manifest(vec![old_file]), &manifest(vec![new_file]));
        assert_eq!(diff.changed, vec!["f"]);
    }

    #[test]
    fn sha512_file_covers_zero_byte_files() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("base")).unwrap();
        std::fs::write(data.join("base/full"), b"content").unwrap();
        std::fs::write(data.join("base/empty"), b"").unwrap();

        let count = write_sha512_file(dir.path(), &data).unwrap();
        assert_eq!(count, 2);
        let listing =
            std::fs::read_to_string(dir.path().join(crate::catalog::BACKUP_SHA512_FILE)).unwrap();
        // Known SHA-512 of the empty input.
        assert!(listing.contains("cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"));
        verify_sha512_file(dir.path()).unwrap();
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("file"), b"original").unwrap();
        write_sha512_file(dir.path(), &data).unwrap();
        std::fs::write(data.join("file"), b"tampered").unwrap();
        let err = verify_sha512_file(dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChecksumMismatch);
    }
}
