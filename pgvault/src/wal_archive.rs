//! Continuous WAL capture into the per-server `wal/` archive.
//!
//! One long-lived streaming task per server: segments are written as
//! `<name>.partial` and renamed durably at rotation; rotated segments are
//! handed to the transform pool (compression, encryption) while the
//! stream moves on. The archive also answers "release everything below
//! this LSN" for the retention sweep.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use postgres_wal::{
    is_history_file_name, is_xlog_file_name, seg_no_to_lsn, Lsn, TimeLineId, XLogFileName,
    XLogFromFileName, XLogSegNo,
};

use crate::client::{PgClient, ReplicationMode, WalStream, WalStreamEvent};
use crate::conf::{EngineState, ServerConf, ServerFlags, ServerVersionInfo};
use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::{compression, encryption};

const STATUS_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_MIN_DELAY_MS: u64 = 500;
const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Stream WAL for one server until cancelled, reconnecting with backoff.
pub async fn wal_streaming_task(
    state: Arc<EngineState>,
    server: ServerConf,
    version: ServerVersionInfo,
    cancel: CancellationToken,
) {
    let flags = state
        .flags_for(&server.name)
        .expect("server is configured");
    flags.wal_streaming.store(true, Ordering::Release);
    let mut retry = 0u32;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match stream_once(&state, &server, version, &flags, &cancel)
            .instrument(info_span!("wal_stream", server = %server.name))
            .await
        {
            Ok(()) => break, // cancelled cleanly
            Err(e) => {
                retry = retry.saturating_add(1);
                let delay = (RECONNECT_MIN_DELAY_MS << retry.min(8)).min(RECONNECT_MAX_DELAY_MS);
                warn!(
                    "WAL streaming for {} failed ({e}), reconnecting in {delay}ms",
                    server.name
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
    flags.wal_streaming.store(false, Ordering::Release);
    info!("WAL streaming for {} stopped", server.name);
}

async fn stream_once(
    state: &Arc<EngineState>,
    server: &ServerConf,
    version: ServerVersionInfo,
    flags: &Arc<ServerFlags>,
    cancel: &CancellationToken,
) -> Result<()> {
    let wal_dir = state.conf.wal_dir(&server.name);
    tokio::fs::create_dir_all(&wal_dir).await?;

    let mut client = PgClient::connect(
        server,
        ReplicationMode::Physical,
        state.conf.authentication_timeout,
        state.conf.blocking_timeout,
    )
    .await?;
    let identity = client.identify_system().await?;

    if client.read_replication_slot(&server.wal_slot).await?.is_none() {
        client.create_replication_slot(&server.wal_slot).await?;
    }

    // Recovered servers sit on a later timeline; archive its lineage so
    // restores can follow the switch.
    if identity.timeline > 1 {
        let (filename, content) = client.timeline_history(identity.timeline).await?;
        let history_path = wal_dir.join(&filename);
        if !history_path.exists() {
            utils::crashsafe::overwrite(&history_path, content.as_bytes())?;
            info!("archived timeline history {filename}");
        }
    }

    let start_lsn = resume_position(&wal_dir, version.wal_segment_size)?
        .unwrap_or_else(|| identity.xlogpos.segment_lsn(version.wal_segment_size));
    info!(
        "starting WAL streaming at {start_lsn} on timeline {}",
        identity.timeline
    );

    let stream = client
        .start_replication(
            &server.wal_slot,
            start_lsn,
            identity.timeline,
            state.network_bucket.clone(),
        )
        .await?;

    pump_stream(
        stream,
        state,
        flags,
        &wal_dir,
        start_lsn,
        identity.timeline,
        version,
        cancel,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn pump_stream(
    mut stream: WalStream,
    state: &Arc<EngineState>,
    flags: &Arc<ServerFlags>,
    wal_dir: &Utf8Path,
    start_lsn: Lsn,
    tli: TimeLineId,
    version: ServerVersionInfo,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut writer = SegmentWriter::new(wal_dir.to_owned(), tli, version.wal_segment_size);
    writer.disk_bucket = state.disk_bucket.clone();
    let mut flushed = start_lsn;
    let mut transforms: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    enum Tick {
        Cancelled,
        StatusDue,
        Event(Result<WalStreamEvent>),
    }

    loop {
        // select resolves to a value first so the stream borrow is
        // released before any of it is handled
        let tick = tokio::select! {
            _ = cancel.cancelled() => Tick::Cancelled,
            event = tokio::time::timeout(STATUS_UPDATE_INTERVAL, stream.next_event()) => {
                match event {
                    Ok(event) => Tick::Event(event),
                    Err(_elapsed) => Tick::StatusDue,
                }
            }
        };
        match tick {
            Tick::Cancelled => {
                writer.flush().await?;
                stream.finish().await;
                for handle in transforms {
                    handle.await.ok();
                }
                return Ok(());
            }
            Tick::StatusDue => {
                stream.send_status_update(flushed, flushed, flushed).await?;
            }
            Tick::Event(event) => match event? {
                WalStreamEvent::XLogData { wal_start, data } => {
                    let rotated = writer.write(wal_start, &data).await?;
                    flushed = wal_start + data.len() as u64;
                    for segno in rotated {
                        transforms.push(spawn_segment_transform(
                            state.clone(),
                            flags.clone(),
                            wal_dir.join(XLogFileName(tli, segno, version.wal_segment_size)),
                        ));
                    }
                }
                WalStreamEvent::KeepAlive { reply_requested, .. } => {
                    if reply_requested {
                        stream.send_status_update(flushed, flushed, flushed).await?;
                    }
                }
                WalStreamEvent::EndOfStream => {
                    writer.flush().await?;
                    return Err(Error::new(
                        ErrorKind::NetworkIo,
                        "server ended the replication stream",
                    ));
                }
            },
        }
    }
}

/// Compress and encrypt one rotated segment on the pool, guarded by the
/// per-server compression lock so the summarizer never sees a segment
/// mid-transform.
fn spawn_segment_transform(
    state: Arc<EngineState>,
    flags: Arc<ServerFlags>,
    path: Utf8PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while flags
            .wal_compression_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let result = async {
            let path = compression::compress_file(
                &path,
                state.conf.compression,
                state.conf.compression_level,
                state.compression_bucket.as_ref(),
            )
            .await?;
            if !state.conf.encryption.is_none() {
                let secret = state.conf.master_key.as_deref().ok_or_else(|| {
                    Error::new(ErrorKind::ConfigInvalid, "encryption enabled without master key")
                })?;
                encryption::encrypt_file(&path, state.conf.encryption, secret).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        flags.wal_compression_lock.store(false, Ordering::Release);
        if let Err(e) = result {
            warn!("WAL segment transform failed: {e}");
        }
    })
}

/// Writes stream data into `.partial` segment files, rotating at
/// boundaries. Returns the segments completed by each write.
struct SegmentWriter {
    wal_dir: Utf8PathBuf,
    tli: TimeLineId,
    seg_size: usize,
    current: Option<(XLogSegNo, tokio::fs::File)>,
    /// Throttles archive writes when a disk rate limit is configured.
    disk_bucket: Option<Arc<utils::rate_limit::TokenBucket>>,
}

impl SegmentWriter {
    fn new(wal_dir: Utf8PathBuf, tli: TimeLineId, seg_size: usize) -> SegmentWriter {
        SegmentWriter {
            wal_dir,
            tli,
            seg_size,
            current: None,
            disk_bucket: None,
        }
    }

    fn partial_path(&self, segno: XLogSegNo) -> Utf8PathBuf {
        self.wal_dir
            .join(format!("{}.partial", XLogFileName(self.tli, segno, self.seg_size)))
    }

    fn final_path(&self, segno: XLogSegNo) -> Utf8PathBuf {
        self.wal_dir.join(XLogFileName(self.tli, segno, self.seg_size))
    }

    /// Write one XLogData chunk at `lsn`, splitting across segment
    /// boundaries. Returns the numbers of segments that became complete.
    async fn write(&mut self, lsn: Lsn, data: &[u8]) -> Result<Vec<XLogSegNo>> {
        if let Some(bucket) = &self.disk_bucket {
            bucket.acquire(data.len() as u64).await;
        }
        let mut completed = Vec::new();
        let mut offset = 0usize;
        let mut position = lsn;
        while offset < data.len() {
            let segno = position.segment_number(self.seg_size);
            let seg_offset = position.segment_offset(self.seg_size);
            let seg_size = self.seg_size;
            let file = self.open_segment(segno, seg_offset).await?;
            let until_boundary = seg_size - seg_offset;
            let n = std::cmp::min(until_boundary, data.len() - offset);
            file.write_all(&data[offset..offset + n]).await?;
            offset += n;
            position = position + n as u64;
            if position.segment_offset(self.seg_size) == 0 {
                self.rotate(segno).await?;
                completed.push(segno);
            }
        }
        Ok(completed)
    }

    async fn open_segment(
        &mut self,
        segno: XLogSegNo,
        seg_offset: usize,
    ) -> Result<&mut tokio::fs::File> {
        let reopen = match &self.current {
            Some((current, _)) => *current != segno,
            None => true,
        };
        if reopen {
            self.flush().await?;
            let path = self.partial_path(segno);
            debug!("opening {path} at offset {seg_offset}");
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .await?;
            file.set_len(seg_offset as u64).await?;
            use tokio::io::AsyncSeekExt;
            file.seek(std::io::SeekFrom::Start(seg_offset as u64)).await?;
            self.current = Some((segno, file));
        }
        Ok(&mut self.current.as_mut().unwrap().1)
    }

    async fn rotate(&mut self, segno: XLogSegNo) -> Result<()> {
        if let Some((current, file)) = self.current.take() {
            debug_assert_eq!(current, segno);
            file.sync_all().await?;
            drop(file);
            utils::crashsafe::durable_rename(&self.partial_path(segno), &self.final_path(segno))?;
            info!("archived WAL segment {}", self.final_path(segno));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some((_, file)) = &mut self.current {
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// Where to resume streaming: the boundary after the last complete
/// segment in the archive, or the start of an existing partial.
fn resume_position(wal_dir: &Utf8Path, seg_size: usize) -> Result<Option<Lsn>> {
    let mut best: Option<XLogSegNo> = None;
    let mut best_partial: Option<XLogSegNo> = None;
    for entry in wal_dir.read_dir_utf8().map_err(Error::from)? {
        let entry = entry.map_err(Error::from)?;
        let name = entry.file_name();
        let stem = name
            .trim_end_matches(".partial")
            .trim_end_matches(".gz")
            .trim_end_matches(".zstd")
            .trim_end_matches(".lz4")
            .trim_end_matches(".bz2")
            .trim_end_matches(".aes");
        if let Some((segno, _)) = XLogFromFileName(stem, seg_size) {
            if name.contains(".partial") {
                best_partial = Some(best_partial.map_or(segno, |b| b.max(segno)));
            } else {
                best = Some(best.map_or(segno, |b| b.max(segno)));
            }
        }
    }
    Ok(match (best, best_partial) {
        // resume inside the partial: rewrite it from its start
        (_, Some(partial)) => Some(seg_no_to_lsn(partial, seg_size)),
        (Some(complete), None) => Some(seg_no_to_lsn(complete + 1, seg_size)),
        (None, None) => None,
    })
}

/// Delete archived segments whose whole range lies below `min_lsn`.
/// History files and the current partial always survive.
pub fn release_wal_before(wal_dir: &Utf8Path, min_lsn: Lsn, seg_size: usize) -> Result<u64> {
    let min_segno = min_lsn.segment_number(seg_size);
    let mut removed = 0u64;
    let entries = match wal_dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        let name = entry.file_name();
        if is_history_file_name(name) || name.ends_with(".partial") {
            continue;
        }
        let stem = name
            .trim_end_matches(".gz")
            .trim_end_matches(".zstd")
            .trim_end_matches(".lz4")
            .trim_end_matches(".bz2")
            .trim_end_matches(".aes");
        if !is_xlog_file_name(stem) {
            continue;
        }
        if let Some((segno, _)) = XLogFromFileName(stem, seg_size) {
            if segno + 1 <= min_segno {
                debug!("releasing WAL segment {name}");
                std::fs::remove_file(entry.path()).map_err(Error::from)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use postgres_wal::WAL_SEGMENT_SIZE;

    const SEG: usize = WAL_SEGMENT_SIZE;

    #[tokio::test]
    async fn writer_rotates_at_segment_boundary() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path().to_owned(), 1, SEG);

        // Fill most of segment 1, then cross into segment 2.
        let start = seg_no_to_lsn(1, SEG);
        let completed = writer.write(start, &vec![1u8; SEG - 100]).await.unwrap();
        assert!(completed.is_empty());
        assert!(dir.path().join("000000010000000000000001.partial").exists());

        let completed = writer
            .write(start + (SEG - 100) as u64, &vec![2u8; 200])
            .await
            .unwrap();
        assert_eq!(completed, vec![1]);
        assert!(dir.path().join("000000010000000000000001").exists());
        assert!(!dir.path().join("000000010000000000000001.partial").exists());
        assert!(dir.path().join("000000010000000000000002.partial").exists());

        let archived = std::fs::read(dir.path().join("000000010000000000000001")).unwrap();
        assert_eq!(archived.len(), SEG);
        assert_eq!(archived[0], 1);
        // the second write's first 100 bytes completed the segment
        assert_eq!(archived[SEG - 1], 2);
    }

    #[tokio::test]
    async fn resume_position_prefers_partial() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("000000010000000000000001"), b"x").unwrap();
        std::fs::write(dir.path().join("000000010000000000000002.partial"), b"y").unwrap();
        let resume = resume_position(dir.path(), SEG).unwrap();
        assert_eq!(resume, Some(seg_no_to_lsn(2, SEG)));
    }

    #[tokio::test]
    async fn resume_position_after_complete_segment() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("000000010000000000000003.zstd"), b"x").unwrap();
        let resume = resume_position(dir.path(), SEG).unwrap();
        assert_eq!(resume, Some(seg_no_to_lsn(4, SEG)));
    }

    #[test]
    fn release_keeps_history_and_partial() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("000000010000000000000001"), b"old").unwrap();
        std::fs::write(dir.path().join("000000010000000000000002.zstd"), b"old").unwrap();
        std::fs::write(dir.path().join("000000010000000000000005"), b"new").unwrap();
        std::fs::write(dir.path().join("00000002.history"), b"history").unwrap();
        std::fs::write(dir.path().join("000000010000000000000006.partial"), b"cur").unwrap();

        let removed = release_wal_before(dir.path(), seg_no_to_lsn(4, SEG), SEG).unwrap();
        assert_eq!(removed, 2);
        assert!(!dir.path().join("000000010000000000000001").exists());
        assert!(!dir.path().join("000000010000000000000002.zstd").exists());
        assert!(dir.path().join("000000010000000000000005").exists());
        assert!(dir.path().join("00000002.history").exists());
        assert!(dir.path().join("000000010000000000000006.partial").exists());
    }
}
