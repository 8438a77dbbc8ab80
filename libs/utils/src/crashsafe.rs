//! Crash-safe file updates: write to a `.partial` sibling, fsync, rename
//! into place, fsync the parent directory.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs::{self, File};
use std::io::{self, Write};

pub const PARTIAL_SUFFIX: &str = ".partial";

/// Path of the `.partial` sibling for `path`.
pub fn partial_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut s = path.to_string();
    s.push_str(PARTIAL_SUFFIX);
    Utf8PathBuf::from(s)
}

/// Write `content` to `final_path` atomically. The data is first written to
/// `<final_path>.partial`, fsynced, renamed over the final name, and the
/// parent directory is fsynced so the rename itself survives a crash.
pub fn overwrite(final_path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = partial_path(final_path);
    let mut file = File::create(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, final_path)?;
    fsync_parent(final_path)?;
    Ok(())
}

/// Rename `from` to `to` and fsync the destination directory.
pub fn durable_rename(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    fs::rename(from, to)?;
    fsync_parent(to)?;
    Ok(())
}

fn fsync_parent(path: &Utf8Path) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {path:?} has no parent"),
        )
    })?;
    File::open(parent)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn overwrite_leaves_no_partial() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("summary");
        overwrite(&target, b"payload").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        assert!(!partial_path(&target).exists());
    }

    #[test]
    fn overwrite_replaces_existing() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("summary");
        overwrite(&target, b"one").unwrap();
        overwrite(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
    }
}
