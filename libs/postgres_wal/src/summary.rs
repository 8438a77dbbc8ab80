//! WAL summarization: scan a contiguous LSN range of archived segments and
//! produce a block reference table (BRT) of modified blocks per relation
//! fork. Incremental backup planning reads the BRT to decide which blocks
//! must be fetched rather than copied from the parent backup.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::decode::WalStreamDecoder;
use crate::record::DecodedXLogRecord;
use crate::rmgr::RmgrId;
use crate::rmgr_desc::storage::{
    XlSmgrTruncate, SMGR_TRUNCATE_FSM, SMGR_TRUNCATE_HEAP, SMGR_TRUNCATE_VM, XLOG_SMGR_TRUNCATE,
};
use crate::pg_constants::{FSM_FORKNUM, MAIN_FORKNUM, VISIBILITYMAP_FORKNUM};
use crate::{
    is_partial_xlog_file_name, is_xlog_file_name, seg_no_to_lsn, BlockNumber, Lsn, Oid,
    PgMajorVersion, WalDecodeError, XLogFromFileName, XLogSegNo,
};
use camino::Utf8Path;

const BRT_MAGIC: u32 = 0x4252_5431;
const BRT_FORMAT_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum SummaryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] WalDecodeError),
    #[error("WAL segment {0} missing from archive")]
    MissingSegment(XLogSegNo),
    #[error("partial segment {segno} contains records past {end_lsn}")]
    PartialBeyondRange { segno: XLogSegNo, end_lsn: Lsn },
    #[error("WAL ends at {reached} before requested {end_lsn}")]
    IncompleteRange { reached: Lsn, end_lsn: Lsn },
    #[error("bad summary file: {0}")]
    BadFormat(String),
}

/// Identifies one relation fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelFork {
    pub spc_oid: Oid,
    pub db_oid: Oid,
    pub rel_number: Oid,
    pub forknum: u8,
}

/// Modified blocks of one fork plus the high-water mark: one past the
/// highest block known to exist. Truncations lower the mark and drop the
/// blocks beyond it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkSummary {
    pub blocks: BTreeSet<BlockNumber>,
    pub high_water_mark: BlockNumber,
}

/// Block reference table over an LSN interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRefTable {
    entries: BTreeMap<RelFork, ForkSummary>,
}

impl BlockRefTable {
    pub fn new() -> BlockRefTable {
        BlockRefTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &RelFork) -> Option<&ForkSummary> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RelFork, &ForkSummary)> {
        self.entries.iter()
    }

    pub fn mark_block_modified(&mut self, key: RelFork, blkno: BlockNumber) {
        let entry = self.entries.entry(key).or_default();
        entry.blocks.insert(blkno);
        entry.high_water_mark = entry.high_water_mark.max(blkno + 1);
    }

    /// Apply a relation truncation to `nblocks` blocks: the mark drops and
    /// all references at or past it are forgotten.
    pub fn truncate(&mut self, key: RelFork, nblocks: BlockNumber) {
        let entry = self.entries.entry(key).or_default();
        entry.high_water_mark = entry.high_water_mark.min(nblocks);
        entry.blocks = entry.blocks.iter().copied().filter(|&b| b < nblocks).collect();
    }

    /// Serialize to the on-disk summary format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(BRT_MAGIC);
        buf.put_u32_le(BRT_FORMAT_VERSION);
        buf.put_u32_le(self.entries.len() as u32);
        for (key, summary) in &self.entries {
            buf.put_u32_le(key.spc_oid);
            buf.put_u32_le(key.db_oid);
            buf.put_u32_le(key.rel_number);
            buf.put_u32_le(key.forknum as u32);
            buf.put_u32_le(summary.high_water_mark);
            buf.put_u32_le(summary.blocks.len() as u32);
            for blkno in &summary.blocks {
                buf.put_u32_le(*blkno);
            }
        }
        buf.to_vec()
    }

    pub fn from_bytes(raw: &[u8]) -> Result<BlockRefTable, SummaryError> {
        let mut buf = Bytes::copy_from_slice(raw);
        if buf.remaining() < 12 {
            return Err(SummaryError::BadFormat("truncated header".to_string()));
        }
        if buf.get_u32_le() != BRT_MAGIC {
            return Err(SummaryError::BadFormat("bad magic".to_string()));
        }
        let version = buf.get_u32_le();
        if version != BRT_FORMAT_VERSION {
            return Err(SummaryError::BadFormat(format!("unsupported version {version}")));
        }
        let nentries = buf.get_u32_le();
        let mut table = BlockRefTable::new();
        for _ in 0..nentries {
            if buf.remaining() < 24 {
                return Err(SummaryError::BadFormat("truncated entry".to_string()));
            }
            let key = RelFork {
                spc_oid: buf.get_u32_le(),
                db_oid: buf.get_u32_le(),
                rel_number: buf.get_u32_le(),
                forknum: buf.get_u32_le() as u8,
            };
            let high_water_mark = buf.get_u32_le();
            let nblocks = buf.get_u32_le();
            if buf.remaining() < nblocks as usize * 4 {
                return Err(SummaryError::BadFormat("truncated block list".to_string()));
            }
            let mut blocks = BTreeSet::new();
            for _ in 0..nblocks {
                blocks.insert(buf.get_u32_le());
            }
            table.entries.insert(
                key,
                ForkSummary {
                    blocks,
                    high_water_mark,
                },
            );
        }
        Ok(table)
    }
}

/// `<start>-<end>` in zero-padded hex, the summary file name for a range.
pub fn summary_file_name(start_lsn: Lsn, end_lsn: Lsn) -> String {
    format!("{:016X}-{:016X}", start_lsn.0, end_lsn.0)
}

/// Write a summary atomically: the bytes land in a `.partial` sibling that
/// is renamed over the final name.
pub fn save_summary(
    summary_dir: &Utf8Path,
    start_lsn: Lsn,
    end_lsn: Lsn,
    table: &BlockRefTable,
) -> Result<(), SummaryError> {
    let path = summary_dir.join(summary_file_name(start_lsn, end_lsn));
    utils::crashsafe::overwrite(&path, &table.to_bytes())?;
    Ok(())
}

pub fn load_summary(path: &Utf8Path) -> Result<BlockRefTable, SummaryError> {
    let raw = fs::read(path)?;
    BlockRefTable::from_bytes(&raw)
}

/// Summarize `[start_lsn, end_lsn)` from the archived segments in
/// `wal_dir`. A `.partial` segment is consumed only after verifying it
/// carries no record at or past `end_lsn`.
pub fn summarize_range(
    wal_dir: &Utf8Path,
    start_lsn: Lsn,
    end_lsn: Lsn,
    version: PgMajorVersion,
    seg_size: usize,
) -> Result<BlockRefTable, SummaryError> {
    let segments = list_segments(wal_dir, seg_size)?;
    let first_seg = start_lsn.segment_number(seg_size);
    let last_seg = end_lsn.saturating_sub(1u64).segment_number(seg_size);

    let mut table = BlockRefTable::new();
    let mut decoder = WalStreamDecoder::new(seg_no_to_lsn(first_seg, seg_size), version, seg_size);
    let mut reached = Lsn::INVALID;

    for segno in first_seg..=last_seg {
        let (path, is_partial) = segments
            .get(&segno)
            .ok_or(SummaryError::MissingSegment(segno))?;
        debug!("summarizing {path}");
        let bytes = fs::read(path)?;
        decoder.feed_bytes(&bytes);
        loop {
            match decoder.poll_decode() {
                Ok(Some(rec)) => {
                    reached = rec.next_lsn;
                    if *is_partial && rec.lsn >= end_lsn {
                        return Err(SummaryError::PartialBeyondRange { segno, end_lsn });
                    }
                    if rec.lsn >= start_lsn && rec.lsn < end_lsn {
                        absorb_record(&mut table, &rec);
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if decoder.is_end_of_wal() {
            break;
        }
    }

    if reached < end_lsn {
        return Err(SummaryError::IncompleteRange {
            reached,
            end_lsn,
        });
    }
    Ok(table)
}

fn absorb_record(table: &mut BlockRefTable, rec: &DecodedXLogRecord) {
    for blk in &rec.blocks {
        table.mark_block_modified(
            RelFork {
                spc_oid: blk.rlocator.spc_oid,
                db_oid: blk.rlocator.db_oid,
                rel_number: blk.rlocator.rel_number,
                forknum: blk.forknum(),
            },
            blk.blkno,
        );
    }
    if rec.header.xl_rmid == RmgrId::Storage as u8
        && rec.header.rmgr_info() == XLOG_SMGR_TRUNCATE
    {
        let mut buf = rec.main_data.clone();
        if buf.remaining() < 20 {
            warn!("undersized smgr truncate record at {}", rec.lsn);
            return;
        }
        let trunc = XlSmgrTruncate::decode(&mut buf);
        let forks: &[(u32, u8)] = &[
            (SMGR_TRUNCATE_HEAP, MAIN_FORKNUM),
            (SMGR_TRUNCATE_VM, VISIBILITYMAP_FORKNUM),
            (SMGR_TRUNCATE_FSM, FSM_FORKNUM),
        ];
        for (flag, forknum) in forks {
            if trunc.flags & flag != 0 {
                table.truncate(
                    RelFork {
                        spc_oid: trunc.rlocator.spc_oid,
                        db_oid: trunc.rlocator.db_oid,
                        rel_number: trunc.rlocator.rel_number,
                        forknum: *forknum,
                    },
                    trunc.blkno,
                );
            }
        }
    }
}

type SegmentMap = BTreeMap<XLogSegNo, (camino::Utf8PathBuf, bool)>;

/// Map of segment number to file path; a complete segment shadows its
/// `.partial` sibling.
fn list_segments(wal_dir: &Utf8Path, seg_size: usize) -> Result<SegmentMap, SummaryError> {
    let mut segments: SegmentMap = BTreeMap::new();
    for entry in wal_dir.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name();
        if is_xlog_file_name(name) {
            if let Some((segno, _tli)) = XLogFromFileName(name, seg_size) {
                segments.insert(segno, (entry.path().to_owned(), false));
            }
        } else if is_partial_xlog_file_name(name) {
            let stem = name.strip_suffix(".partial").unwrap();
            if let Some((segno, _tli)) = XLogFromFileName(stem, seg_size) {
                segments
                    .entry(segno)
                    .or_insert((entry.path().to_owned(), true));
            }
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::WalWriter;
    use crate::pg_constants::{BKPBLOCK_HAS_DATA, MAIN_FORKNUM};
    use crate::record::{DecodedBkpBlock, RelFileLocator, XLogRecordHeader};
    use crate::XLogFileName;
    use camino_tempfile::tempdir;

    const SEG_SIZE: usize = 64 * 1024;
    const VERSION: PgMajorVersion = PgMajorVersion::V16;

    fn rel(rel_number: Oid) -> RelFileLocator {
        RelFileLocator {
            spc_oid: 1663,
            db_oid: 5,
            rel_number,
        }
    }

    fn fork(rel_number: Oid, forknum: u8) -> RelFork {
        RelFork {
            spc_oid: 1663,
            db_oid: 5,
            rel_number,
            forknum,
        }
    }

    fn heap_touch(rel_number: Oid, blkno: BlockNumber) -> DecodedXLogRecord {
        DecodedXLogRecord {
            lsn: Lsn::INVALID,
            next_lsn: Lsn::INVALID,
            header: XLogRecordHeader {
                xl_tot_len: 0,
                xl_xid: 9,
                xl_prev: Lsn::INVALID,
                xl_info: 0,
                xl_rmid: RmgrId::Heap as u8,
                xl_crc: 0,
            },
            record_origin: None,
            toplevel_xid: None,
            main_data: Bytes::from_static(&[0; 3]),
            blocks: vec![DecodedBkpBlock {
                id: 0,
                fork_flags: MAIN_FORKNUM | BKPBLOCK_HAS_DATA,
                rlocator: rel(rel_number),
                blkno,
                image: None,
                data: Some(Bytes::from_static(b"x")),
            }],
        }
    }

    fn smgr_truncate(rel_number: Oid, nblocks: BlockNumber) -> DecodedXLogRecord {
        let mut main_data = BytesMut::new();
        main_data.put_u32_le(nblocks);
        main_data.put_u32_le(1663);
        main_data.put_u32_le(5);
        main_data.put_u32_le(rel_number);
        main_data.put_u32_le(SMGR_TRUNCATE_HEAP);
        DecodedXLogRecord {
            lsn: Lsn::INVALID,
            next_lsn: Lsn::INVALID,
            header: XLogRecordHeader {
                xl_tot_len: 0,
                xl_xid: 0,
                xl_prev: Lsn::INVALID,
                xl_info: XLOG_SMGR_TRUNCATE,
                xl_rmid: RmgrId::Storage as u8,
                xl_crc: 0,
            },
            record_origin: None,
            toplevel_xid: None,
            main_data: main_data.freeze(),
            blocks: Vec::new(),
        }
    }

    fn write_segments(dir: &Utf8Path, writer: WalWriter, partial_last: bool) {
        let segments = writer.into_segments();
        let count = segments.len();
        for (i, (segno, bytes)) in segments.into_iter().enumerate() {
            let mut name = XLogFileName(1, segno, SEG_SIZE);
            if partial_last && i == count - 1 {
                name.push_str(".partial");
            }
            fs::write(dir.join(name), bytes).unwrap();
        }
    }

    #[test]
    fn brt_tracks_blocks_and_high_water_mark() {
        let mut table = BlockRefTable::new();
        table.mark_block_modified(fork(16384, MAIN_FORKNUM), 5);
        table.mark_block_modified(fork(16384, MAIN_FORKNUM), 2);
        table.mark_block_modified(fork(16384, MAIN_FORKNUM), 9);
        let entry = table.get(&fork(16384, MAIN_FORKNUM)).unwrap();
        assert_eq!(entry.high_water_mark, 10);
        assert_eq!(entry.blocks.iter().copied().collect::<Vec<_>>(), vec![2, 5, 9]);

        table.truncate(fork(16384, MAIN_FORKNUM), 6);
        let entry = table.get(&fork(16384, MAIN_FORKNUM)).unwrap();
        assert_eq!(entry.high_water_mark, 6);
        assert_eq!(entry.blocks.iter().copied().collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn brt_file_roundtrip() {
        let mut table = BlockRefTable::new();
        table.mark_block_modified(fork(16384, MAIN_FORKNUM), 1);
        table.mark_block_modified(fork(16385, VISIBILITYMAP_FORKNUM), 0);
        let restored = BlockRefTable::from_bytes(&table.to_bytes()).unwrap();
        assert_eq!(table, restored);
    }

    #[test]
    fn summary_is_written_atomically() {
        let dir = tempdir().unwrap();
        let mut table = BlockRefTable::new();
        table.mark_block_modified(fork(16384, MAIN_FORKNUM), 3);
        save_summary(dir.path(), Lsn(0x1000), Lsn(0x2000), &table).unwrap();
        let name = summary_file_name(Lsn(0x1000), Lsn(0x2000));
        assert!(dir.path().join(&name).exists());
        assert!(!dir.path().join(format!("{name}.partial")).exists());
        let restored = load_summary(&dir.path().join(&name)).unwrap();
        assert_eq!(restored, table);
    }

    #[test]
    fn summarize_collects_block_references() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::new(Lsn(0), 1, 7, VERSION, SEG_SIZE);
        let mut touches = vec![
            heap_touch(16384, 0),
            heap_touch(16384, 7),
            heap_touch(16385, 3),
        ];
        for rec in &mut touches {
            writer.append_record(rec);
        }
        let end = writer.position();
        write_segments(dir.path(), writer, false);

        let table = summarize_range(dir.path(), Lsn(0), end, VERSION, SEG_SIZE).unwrap();
        let main = table.get(&fork(16384, MAIN_FORKNUM)).unwrap();
        assert_eq!(main.blocks.iter().copied().collect::<Vec<_>>(), vec![0, 7]);
        assert_eq!(main.high_water_mark, 8);
        assert!(table.get(&fork(16385, MAIN_FORKNUM)).is_some());
    }

    #[test]
    fn truncate_lowers_high_water_mark() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::new(Lsn(0), 1, 7, VERSION, SEG_SIZE);
        let mut records = vec![
            heap_touch(16384, 2),
            heap_touch(16384, 30),
            smgr_truncate(16384, 10),
        ];
        for rec in &mut records {
            writer.append_record(rec);
        }
        let end = writer.position();
        write_segments(dir.path(), writer, false);

        let table = summarize_range(dir.path(), Lsn(0), end, VERSION, SEG_SIZE).unwrap();
        let main = table.get(&fork(16384, MAIN_FORKNUM)).unwrap();
        assert_eq!(main.high_water_mark, 10);
        assert_eq!(main.blocks.iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn records_outside_range_are_ignored() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::new(Lsn(0), 1, 7, VERSION, SEG_SIZE);
        let mut before = heap_touch(16384, 1);
        writer.append_record(&mut before);
        let range_start = writer.position();
        let mut inside = heap_touch(16385, 2);
        writer.append_record(&mut inside);
        let end = writer.position();
        write_segments(dir.path(), writer, false);

        let table = summarize_range(dir.path(), range_start, end, VERSION, SEG_SIZE).unwrap();
        assert!(table.get(&fork(16384, MAIN_FORKNUM)).is_none());
        assert!(table.get(&fork(16385, MAIN_FORKNUM)).is_some());
    }

    #[test]
    fn partial_segment_with_records_past_range_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::new(Lsn(0), 1, 7, VERSION, SEG_SIZE);
        let mut first = heap_touch(16384, 1);
        writer.append_record(&mut first);
        let end = writer.position();
        let mut beyond = heap_touch(16384, 2);
        writer.append_record(&mut beyond);
        write_segments(dir.path(), writer, true);

        let err = summarize_range(dir.path(), Lsn(0), end, VERSION, SEG_SIZE).unwrap_err();
        assert!(matches!(err, SummaryError::PartialBeyondRange { .. }));
    }

    #[test]
    fn missing_segment_is_an_error() {
        let dir = tempdir().unwrap();
        let err = summarize_range(dir.path(), Lsn(0), Lsn(0x100), VERSION, SEG_SIZE).unwrap_err();
        assert!(matches!(err, SummaryError::MissingSegment(0)));
    }
}
