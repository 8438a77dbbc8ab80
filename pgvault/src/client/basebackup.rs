//! Base backup streaming: drive `BASE_BACKUP` and materialize the result
//! as an untarred directory tree in the staging area.
//!
//! Servers older than 15 send one CopyOut stream per tablespace (plus one
//! for the manifest); 15 and newer multiplex everything over a single
//! stream with typed sub-messages naming the current destination archive.

use bytes::{Buf, Bytes};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use postgres_wal::{Lsn, PgMajorVersion, TimeLineId};
use pq_proto::BeMessage;

use crate::catalog::BACKUP_MANIFEST_FILE;
use crate::conf::CompressionMethod;
use crate::error::{Error, ErrorKind, Result};

use super::PgClient;

#[derive(Debug, Clone)]
pub struct BaseBackupOptions {
    pub label: String,
    /// v17+: request an incremental backup against the uploaded manifest.
    pub incremental: bool,
    /// Server-side compression of the transferred archives.
    pub compression: Option<(CompressionMethod, i32)>,
}

#[derive(Debug, Clone)]
pub struct TablespaceMeta {
    pub oid: u32,
    pub location: Utf8PathBuf,
    pub approx_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BaseBackupResult {
    pub start_lsn: Lsn,
    pub start_timeline: TimeLineId,
    pub end_lsn: Lsn,
    pub end_timeline: TimeLineId,
    pub tablespaces: Vec<TablespaceMeta>,
}

/// Compose the `BASE_BACKUP` command for the server's major version.
pub fn base_backup_command(version: PgMajorVersion, options: &BaseBackupOptions) -> String {
    if version >= PgMajorVersion::V15 {
        let mut opts = vec![
            format!("LABEL '{}'", options.label),
            "PROGRESS".to_string(),
            "CHECKPOINT 'fast'".to_string(),
            "MANIFEST 'yes'".to_string(),
            "MANIFEST_CHECKSUMS 'SHA256'".to_string(),
            "WAIT false".to_string(),
        ];
        if options.incremental && version >= PgMajorVersion::V17 {
            opts.push("INCREMENTAL".to_string());
        }
        if let Some((method, level)) = &options.compression {
            let name = match method {
                CompressionMethod::Gzip => "gzip",
                CompressionMethod::Zstd => "zstd",
                CompressionMethod::Lz4 => "lz4",
                _ => "none",
            };
            opts.push(format!("COMPRESSION '{name}'"));
            opts.push(format!("COMPRESSION_DETAIL 'level={level}'"));
        }
        format!("BASE_BACKUP ({})", opts.join(", "))
    } else {
        let mut cmd = format!(
            "BASE_BACKUP LABEL '{}' PROGRESS FAST MANIFEST 'yes' MANIFEST_CHECKSUMS 'SHA256' NOWAIT",
            options.label
        );
        if let Some((CompressionMethod::Gzip, level)) = &options.compression {
            cmd.push_str(&format!(" COMPRESSION 'gzip' COMPRESSION_LEVEL {level}"));
        }
        cmd
    }
}

/// Run a base backup, unpacking the stream under `staging`: the main data
/// directory into `staging/data`, each external tablespace into
/// `staging/tblspc_<oid>`, the manifest to `staging/backup.manifest`.
pub async fn run_base_backup(
    client: &mut PgClient,
    version: PgMajorVersion,
    options: &BaseBackupOptions,
    staging: &Utf8Path,
) -> Result<BaseBackupResult> {
    tokio::fs::create_dir_all(staging.join("data")).await?;
    client
        .send_base_backup_command(&base_backup_command(version, options))
        .await?;

    let (start_lsn, start_timeline) = read_position_row(client).await?;
    let tablespaces = read_tablespace_list(client).await?;
    info!(
        "base backup started at {start_lsn} on timeline {start_timeline}, {} tablespace(s)",
        tablespaces.len()
    );

    if version >= PgMajorVersion::V15 {
        receive_multiplexed(client, staging).await?;
    } else {
        receive_stream_per_tablespace(client, &tablespaces, staging).await?;
    }

    let (end_lsn, end_timeline) = read_position_row(client).await?;
    drain_to_ready(client).await?;
    info!("base backup finished at {end_lsn} on timeline {end_timeline}");

    Ok(BaseBackupResult {
        start_lsn,
        start_timeline,
        end_lsn,
        end_timeline,
        tablespaces,
    })
}

/// Read one single-row result set of `(lsn, timeline)`.
async fn read_position_row(client: &mut PgClient) -> Result<(Lsn, TimeLineId)> {
    let mut position = None;
    loop {
        match client.next_message().await? {
            BeMessage::RowDescription(_) => {}
            BeMessage::DataRow(cols) => {
                let lsn_text = column_text(&cols, 0)?;
                let tli_text = column_text(&cols, 1)?;
                position = Some((
                    lsn_text.parse().map_err(|_| {
                        Error::new(ErrorKind::ProtocolViolation, format!("bad LSN {lsn_text:?}"))
                    })?,
                    tli_text.parse().map_err(|_| {
                        Error::new(ErrorKind::ProtocolViolation, format!("bad timeline {tli_text:?}"))
                    })?,
                ));
            }
            BeMessage::CommandComplete(_) => {
                return position.ok_or_else(|| {
                    Error::new(ErrorKind::ProtocolViolation, "missing position row")
                });
            }
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
            }
            BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
            other => {
                return Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    format!("unexpected message in position result: {other:?}"),
                ))
            }
        }
    }
}

async fn read_tablespace_list(client: &mut PgClient) -> Result<Vec<TablespaceMeta>> {
    let mut tablespaces = Vec::new();
    loop {
        match client.next_message().await? {
            BeMessage::RowDescription(_) => {}
            BeMessage::DataRow(cols) => {
                let oid = column_text(&cols, 0).ok();
                let location = column_text(&cols, 1).ok();
                match (oid, location) {
                    (Some(oid), Some(location)) => tablespaces.push(TablespaceMeta {
                        oid: oid.parse().map_err(|_| {
                            Error::new(ErrorKind::ProtocolViolation, "bad tablespace oid")
                        })?,
                        location: Utf8PathBuf::from(location),
                        approx_size: column_text(&cols, 2).ok().and_then(|v| v.parse().ok()),
                    }),
                    // The base data directory row carries NULL oid/location.
                    _ => {}
                }
            }
            BeMessage::CommandComplete(_) => return Ok(tablespaces),
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
            }
            other => {
                return Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    format!("unexpected message in tablespace list: {other:?}"),
                ))
            }
        }
    }
}

fn column_text(cols: &[Option<Bytes>], idx: usize) -> Result<String> {
    cols.get(idx)
        .and_then(|c| c.as_ref())
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .ok_or_else(|| Error::new(ErrorKind::ProtocolViolation, format!("null column {idx}")))
}

/// A tar stream being unpacked as it arrives.
struct TarSink {
    tx: Option<mpsc::Sender<std::io::Result<Bytes>>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl TarSink {
    fn start(dest: Utf8PathBuf) -> TarSink {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
        let task = tokio::spawn(async move {
            tokio::fs::create_dir_all(&dest).await?;
            let reader = tokio_util::io::StreamReader::new(ReceiverStream::new(rx));
            let mut archive = tokio_tar::Archive::new(reader);
            archive.unpack(dest.as_std_path()).await
        });
        TarSink { tx: Some(tx), task }
    }

    async fn feed(&mut self, data: Bytes) -> Result<()> {
        if let Some(tx) = &self.tx {
            tx.send(Ok(data)).await.map_err(|_| {
                Error::new(ErrorKind::DiskIo, "tar unpack task terminated early")
            })?;
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        self.tx.take();
        self.task
            .await
            .map_err(|e| Error::new(ErrorKind::Internal, format!("tar task panicked: {e}")))?
            .map_err(|e| Error::with_source(ErrorKind::DiskIo, "tar unpack failed", e))
    }
}

/// A destination for archive bytes: a tar being unpacked, or the raw
/// manifest file.
enum Sink {
    Tar(TarSink),
    Manifest(tokio::fs::File),
}

impl Sink {
    async fn feed(&mut self, data: Bytes) -> Result<()> {
        match self {
            Sink::Tar(tar) => tar.feed(data).await,
            Sink::Manifest(file) => {
                file.write_all(&data).await?;
                Ok(())
            }
        }
    }

    async fn finish(self) -> Result<()> {
        match self {
            Sink::Tar(tar) => tar.finish().await,
            Sink::Manifest(mut file) => {
                file.flush().await?;
                file.sync_all().await?;
                Ok(())
            }
        }
    }
}

fn archive_destination(staging: &Utf8Path, archive_name: &str) -> Utf8PathBuf {
    // `base.tar[.gz]` is the main data directory; `<oid>.tar` one
    // tablespace each.
    let stem = archive_name.split('.').next().unwrap_or(archive_name);
    if stem == "base" {
        staging.join("data")
    } else {
        staging.join(format!("tblspc_{stem}"))
    }
}

/// 15+: one CopyOut stream, sub-messages route data to named archives.
async fn receive_multiplexed(client: &mut PgClient, staging: &Utf8Path) -> Result<()> {
    expect_copy_out(client).await?;
    let mut sink: Option<Sink> = None;
    loop {
        match client.next_message().await? {
            BeMessage::CopyData(mut payload) => {
                if payload.is_empty() {
                    continue;
                }
                match payload.get_u8() {
                    b'n' => {
                        if let Some(prev) = sink.take() {
                            prev.finish().await?;
                        }
                        let name = read_cstr(&mut payload)?;
                        let _location = read_cstr(&mut payload)?;
                        debug!("new archive {name}");
                        sink = Some(Sink::Tar(TarSink::start(archive_destination(staging, &name))));
                    }
                    b'm' => {
                        if let Some(prev) = sink.take() {
                            prev.finish().await?;
                        }
                        debug!("receiving backup manifest");
                        let file =
                            tokio::fs::File::create(staging.join(BACKUP_MANIFEST_FILE)).await?;
                        sink = Some(Sink::Manifest(file));
                    }
                    b'd' => {
                        match &mut sink {
                            Some(sink) => sink.feed(payload).await?,
                            None => {
                                return Err(Error::new(
                                    ErrorKind::ProtocolViolation,
                                    "archive data before any archive header",
                                ))
                            }
                        }
                    }
                    b'p' => {
                        // progress report; payload is bytes-done
                    }
                    other => {
                        warn!("skipping unknown base backup sub-message '{}'", other as char);
                    }
                }
            }
            BeMessage::CopyDone => {
                if let Some(prev) = sink.take() {
                    prev.finish().await?;
                }
                return Ok(());
            }
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
            }
            BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
            other => {
                return Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    format!("unexpected message in backup stream: {other:?}"),
                ))
            }
        }
    }
}

/// Pre-15: one CopyOut stream per tablespace in listing order, base data
/// last, then one more stream carrying the manifest.
async fn receive_stream_per_tablespace(
    client: &mut PgClient,
    tablespaces: &[TablespaceMeta],
    staging: &Utf8Path,
) -> Result<()> {
    let mut destinations: Vec<Utf8PathBuf> = tablespaces
        .iter()
        .map(|ts| staging.join(format!("tblspc_{}", ts.oid)))
        .collect();
    destinations.push(staging.join("data"));

    for dest in destinations {
        expect_copy_out(client).await?;
        let mut sink = TarSink::start(dest);
        loop {
            match client.next_message().await? {
                BeMessage::CopyData(payload) => sink.feed(payload).await?,
                BeMessage::CopyDone => break,
                BeMessage::ErrorResponse(fields) => {
                    return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
                }
                BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
                other => {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        format!("unexpected message in tar stream: {other:?}"),
                    ))
                }
            }
        }
        sink.finish().await?;
    }

    // Manifest stream.
    expect_copy_out(client).await?;
    let mut file = tokio::fs::File::create(staging.join(BACKUP_MANIFEST_FILE)).await?;
    loop {
        match client.next_message().await? {
            BeMessage::CopyData(payload) => file.write_all(&payload).await?,
            BeMessage::CopyDone => break,
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
            }
            other => {
                return Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    format!("unexpected message in manifest stream: {other:?}"),
                ))
            }
        }
    }
    file.sync_all().await?;
    Ok(())
}

async fn expect_copy_out(client: &mut PgClient) -> Result<()> {
    loop {
        match client.next_message().await? {
            BeMessage::CopyOutResponse { .. } => return Ok(()),
            BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
            }
            other => {
                return Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    format!("expected CopyOutResponse, got {other:?}"),
                ))
            }
        }
    }
}

async fn drain_to_ready(client: &mut PgClient) -> Result<()> {
    loop {
        match client.next_message().await? {
            BeMessage::ReadyForQuery(_) => return Ok(()),
            BeMessage::CommandComplete(_) | BeMessage::NoticeResponse(_) => {}
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
            }
            other => debug!("draining {other:?}"),
        }
    }
}

fn read_cstr(buf: &mut Bytes) -> Result<String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::new(ErrorKind::ProtocolViolation, "unterminated string"))?;
    let raw = buf.split_to(pos);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
