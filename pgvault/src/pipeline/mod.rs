//! Per-file transform pipeline: a bounded worker pool draining a shared
//! job queue. Workers publish the first failure into an error slot; the
//! coordinator reads it after the barrier, so one bad file stops the
//! operation without racing the others.

pub mod compression;
pub mod encryption;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

/// Files the transforms must never touch.
pub const TRANSFORM_EXCLUDED: &[&str] = &["backup_label", "backup_manifest"];

pub fn is_transform_excluded(path: &Utf8Path) -> bool {
    let Some(name) = path.file_name() else {
        return true;
    };
    TRANSFORM_EXCLUDED.contains(&name)
        || name.ends_with(".history")
        || name.ends_with(".partial")
}

/// First error published by any worker.
#[derive(Default)]
pub struct ErrorSlot(Mutex<Option<Error>>);

impl ErrorSlot {
    pub fn publish(&self, error: Error) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    pub fn take(&self) -> Option<Error> {
        self.0.lock().unwrap().take()
    }
}

/// Run `op` over `jobs` on `n_workers` concurrent workers. Completion
/// order is irrelevant; the first failure is reported after all workers
/// have stopped. Remaining queued jobs are abandoned once a failure is
/// published.
pub async fn run_jobs<T, F, Fut>(n_workers: usize, jobs: Vec<T>, op: F) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
    let error_slot = Arc::new(ErrorSlot::default());

    let mut handles = Vec::new();
    for _ in 0..n_workers.max(1) {
        let queue = Arc::clone(&queue);
        let error_slot = Arc::clone(&error_slot);
        let op = op.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if error_slot.is_set() {
                    return;
                }
                let job = queue.lock().unwrap().pop_front();
                match job {
                    Some(job) => {
                        if let Err(e) = op(job).await {
                            error_slot.publish(e);
                            return;
                        }
                    }
                    None => return,
                }
            }
        }));
    }

    // Barrier: all workers stop before the outcome is read.
    for handle in handles {
        handle
            .await
            .map_err(|e| Error::new(ErrorKind::Internal, format!("worker panicked: {e}")))?;
    }
    match error_slot.take() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Every transformable regular file under `dir`, deterministic order.
pub fn collect_transform_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::with_source(ErrorKind::DiskIo, "walking backup files", std::io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8PathBuf::from_path_buf(entry.path().to_owned())
            .map_err(|p| Error::new(ErrorKind::Internal, format!("non-utf8 path {p:?}")))?;
        if is_transform_excluded(&path) {
            debug!("excluded from transform: {path}");
            continue;
        }
        files.push(path);
    }
    Ok(files)
}

/// Owner-only permissions for transformed output.
pub fn restrict_permissions(path: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn all_jobs_run_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<u32> = (0..100).collect();
        let c = counter.clone();
        run_jobs(4, jobs, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn first_failure_is_reported_after_barrier() {
        let jobs: Vec<u32> = (0..50).collect();
        let err = run_jobs(4, jobs, |job| async move {
            if job == 13 {
                Err(Error::new(ErrorKind::DiskIo, "boom"))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DiskIo);
    }

    #[tokio::test]
    async fn failure_stops_remaining_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<u32> = (0..10_000).collect();
        let r = ran.clone();
        let _ = run_jobs(1, jobs, move |job| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::Relaxed);
                if job == 3 {
                    Err(Error::new(ErrorKind::DiskIo, "stop"))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        // Single worker: job 3 fails, nothing past it runs.
        assert_eq!(ran.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn exclusion_list() {
        assert!(is_transform_excluded(Utf8Path::new("x/backup_label")));
        assert!(is_transform_excluded(Utf8Path::new("x/backup_manifest")));
        assert!(is_transform_excluded(Utf8Path::new("wal/00000002.history")));
        assert!(is_transform_excluded(Utf8Path::new("wal/0001.partial")));
        assert!(!is_transform_excluded(Utf8Path::new("data/base/1/1259")));
    }
}
