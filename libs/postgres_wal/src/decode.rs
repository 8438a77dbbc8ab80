//! Streaming WAL decoder.
//!
//! [`WalStreamDecoder`] consumes a contiguous byte stream of WAL (across
//! page and segment boundaries) and yields decoded records in LSN order.
//! Page headers are validated as they are crossed; a record interrupted at
//! a page or segment boundary is buffered and resumed when more bytes are
//! fed, which makes the same decoder usable for both live streaming and
//! file-at-a-time scans.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::page::{XLogLongPageHeader, XLogPageHeader, SIZE_OF_XLOG_LONG_PHD, SIZE_OF_XLOG_SHORT_PHD};
use crate::record::{DecodedXLogRecord, SIZE_OF_XLOG_RECORD};
use crate::{Lsn, PgMajorVersion, WalDecodeError};

pub struct WalStreamDecoder {
    version: PgMajorVersion,
    seg_size: usize,

    /// Position in the WAL stream the next input byte corresponds to.
    lsn: Lsn,

    /// LSN at which the record currently being assembled started.
    startlsn: Lsn,
    /// Bytes of the current record still to be collected; 0 between records.
    contlen: u32,
    /// Alignment padding to skip before the next record.
    padlen: u32,

    inputbuf: BytesMut,
    recordbuf: BytesMut,

    /// A zero `xl_tot_len` was seen: the rest of the stream is zero fill.
    end_of_wal: bool,
}

impl WalStreamDecoder {
    /// `lsn` is the position in the WAL stream of the first byte that will
    /// be fed. It must sit on a record or page boundary, which is always
    /// the case when starting at a segment boundary.
    pub fn new(lsn: Lsn, version: PgMajorVersion, seg_size: usize) -> WalStreamDecoder {
        WalStreamDecoder {
            version,
            seg_size,
            lsn,
            startlsn: Lsn::INVALID,
            contlen: 0,
            padlen: 0,
            inputbuf: BytesMut::new(),
            recordbuf: BytesMut::new(),
            end_of_wal: false,
        }
    }

    /// The LSN the next fed byte will be interpreted at.
    pub fn available(&self) -> Lsn {
        self.lsn + self.inputbuf.len() as u64
    }

    /// True once zero fill was reached; only meaningful in file mode.
    pub fn is_end_of_wal(&self) -> bool {
        self.end_of_wal
    }

    pub fn feed_bytes(&mut self, buf: &[u8]) {
        self.inputbuf.extend_from_slice(buf);
    }

    /// Try to produce the next record. `Ok(None)` means more input is
    /// needed (or zero fill was reached, see [`Self::is_end_of_wal`]).
    pub fn poll_decode(&mut self) -> Result<Option<DecodedXLogRecord>, WalDecodeError> {
        if self.end_of_wal {
            return Ok(None);
        }
        loop {
            // Page or segment boundary: consume and validate the header.
            if self.lsn.segment_offset(self.seg_size) == 0 {
                if self.inputbuf.remaining() < SIZE_OF_XLOG_LONG_PHD {
                    return Ok(None);
                }
                let mut hdr_bytes = self.inputbuf.split_to(SIZE_OF_XLOG_LONG_PHD).freeze();
                let hdr =
                    XLogLongPageHeader::decode(&mut hdr_bytes, self.version.xlog_page_magic())?;
                self.validate_page_header(&hdr.std)?;
                if hdr.seg_size as usize != self.seg_size {
                    return Err(WalDecodeError::Corrupt {
                        lsn: self.lsn,
                        msg: format!(
                            "segment size {} in long header, expected {}",
                            hdr.seg_size, self.seg_size
                        ),
                    });
                }
                self.lsn += SIZE_OF_XLOG_LONG_PHD as u64;
                continue;
            }
            if self.lsn.block_offset() == 0 {
                if self.inputbuf.remaining() < SIZE_OF_XLOG_SHORT_PHD {
                    return Ok(None);
                }
                let mut hdr_bytes = self.inputbuf.split_to(SIZE_OF_XLOG_SHORT_PHD).freeze();
                let hdr = XLogPageHeader::decode(&mut hdr_bytes, self.version.xlog_page_magic())?;
                self.validate_page_header(&hdr)?;
                self.lsn += SIZE_OF_XLOG_SHORT_PHD as u64;
                continue;
            }

            // Alignment padding between records.
            if self.padlen > 0 {
                if self.inputbuf.remaining() < self.padlen as usize {
                    return Ok(None);
                }
                self.inputbuf.advance(self.padlen as usize);
                self.lsn += self.padlen as u64;
                self.padlen = 0;
                continue;
            }

            if self.contlen == 0 {
                // Between records. A record header is never split across
                // pages; if the remainder of this page cannot hold one, it
                // is zero fill to skip.
                let page_left = self.lsn.remaining_in_block() as usize;
                if page_left < SIZE_OF_XLOG_RECORD {
                    if self.inputbuf.remaining() < page_left {
                        return Ok(None);
                    }
                    self.inputbuf.advance(page_left);
                    self.lsn += page_left as u64;
                    continue;
                }
                if self.inputbuf.remaining() < 4 {
                    return Ok(None);
                }
                let xl_tot_len = u32::from_le_bytes(self.inputbuf[0..4].try_into().unwrap());
                if xl_tot_len == 0 {
                    self.end_of_wal = true;
                    return Ok(None);
                }
                if (xl_tot_len as usize) < SIZE_OF_XLOG_RECORD {
                    return Err(WalDecodeError::Corrupt {
                        lsn: self.lsn,
                        msg: format!("invalid record length {xl_tot_len}"),
                    });
                }
                self.startlsn = self.lsn;
                self.contlen = xl_tot_len;
                self.recordbuf.clear();
                self.recordbuf.reserve(xl_tot_len as usize);
                continue;
            }

            // Collect record bytes up to the page boundary.
            let page_left = self.lsn.remaining_in_block() as usize;
            let take = std::cmp::min(self.contlen as usize, page_left);
            let take = std::cmp::min(take, self.inputbuf.remaining());
            if take == 0 {
                return Ok(None);
            }
            self.recordbuf.put(self.inputbuf.split_to(take));
            self.lsn += take as u64;
            self.contlen -= take as u32;

            if self.contlen == 0 {
                let next_lsn = self.lsn.align();
                self.padlen = (next_lsn.0 - self.lsn.0) as u32;
                let recordbuf = std::mem::take(&mut self.recordbuf).freeze();
                let record = DecodedXLogRecord::decode(
                    self.startlsn,
                    next_lsn,
                    recordbuf,
                    self.version,
                )?;
                return Ok(Some(record));
            }
        }
    }

    fn validate_page_header(&self, hdr: &XLogPageHeader) -> Result<(), WalDecodeError> {
        if hdr.pageaddr != self.lsn {
            return Err(WalDecodeError::Corrupt {
                lsn: self.lsn,
                msg: format!("unexpected page address {}, expected {}", hdr.pageaddr, self.lsn),
            });
        }
        if self.contlen == 0 {
            if hdr.first_is_contrecord() {
                return Err(WalDecodeError::Corrupt {
                    lsn: self.lsn,
                    msg: "page unexpectedly claims a continuation record".to_string(),
                });
            }
        } else {
            if !hdr.first_is_contrecord() {
                return Err(WalDecodeError::Corrupt {
                    lsn: self.lsn,
                    msg: "record continues onto page not flagged as continuation".to_string(),
                });
            }
            if hdr.rem_len != self.contlen {
                return Err(WalDecodeError::Corrupt {
                    lsn: self.lsn,
                    msg: format!(
                        "continuation length {} does not match remaining {}",
                        hdr.rem_len, self.contlen
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Decode every record of one or more contiguous in-memory segments,
/// failing if the stream ends inside a record. Used by file-mode callers;
/// streaming callers drive [`WalStreamDecoder`] directly.
pub fn decode_all(
    start_lsn: Lsn,
    wal: &[u8],
    version: PgMajorVersion,
    seg_size: usize,
) -> Result<Vec<DecodedXLogRecord>, WalDecodeError> {
    let mut decoder = WalStreamDecoder::new(start_lsn, version, seg_size);
    decoder.feed_bytes(wal);
    let mut records = Vec::new();
    while let Some(rec) = decoder.poll_decode()? {
        records.push(rec);
    }
    if !decoder.is_end_of_wal() && decoder.contlen != 0 {
        return Err(WalDecodeError::ShortRead {
            lsn: decoder.startlsn,
            needed: decoder.contlen as usize,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::WalWriter;
    use crate::rmgr::RmgrId;
    use crate::{WAL_SEGMENT_SIZE, XLOG_BLCKSZ};

    fn make_record(xid: u32, main_data: Vec<u8>) -> DecodedXLogRecord {
        DecodedXLogRecord {
            lsn: Lsn::INVALID,
            next_lsn: Lsn::INVALID,
            header: crate::record::XLogRecordHeader {
                xl_tot_len: 0,
                xl_xid: xid,
                xl_prev: Lsn::INVALID,
                xl_info: 0,
                xl_rmid: RmgrId::Xlog as u8,
                xl_crc: 0,
            },
            record_origin: None,
            toplevel_xid: None,
            main_data: main_data.into(),
            blocks: Vec::new(),
        }
    }

    #[test]
    fn decode_stream_of_small_records() {
        let version = PgMajorVersion::V16;
        let mut writer = WalWriter::new(Lsn(0x0100_0000), 1, 42, version, WAL_SEGMENT_SIZE);
        let mut lsns = Vec::new();
        for i in 0..10u32 {
            lsns.push(writer.append_record(&mut make_record(i, vec![i as u8; 16])));
        }
        let wal = writer.into_bytes();

        let records = decode_all(Lsn(0x0100_0000), &wal, version, WAL_SEGMENT_SIZE).unwrap();
        assert_eq!(records.len(), 10);
        for (rec, lsn) in records.iter().zip(&lsns) {
            assert_eq!(rec.lsn, *lsn);
        }
        // Output invariants: records ordered, next_lsn chains.
        for pair in records.windows(2) {
            assert!(pair[0].lsn < pair[1].lsn);
            assert_eq!(pair[0].next_lsn, pair[1].lsn);
            assert!(pair[0].next_lsn.0 - pair[0].lsn.0 >= pair[0].total_length() as u64);
        }
    }

    #[test]
    fn record_spanning_pages_is_reassembled() {
        let version = PgMajorVersion::V15;
        let mut writer = WalWriter::new(Lsn(0x0100_0000), 1, 42, version, WAL_SEGMENT_SIZE);
        // Larger than one 8KiB page, forcing a continuation.
        let mut big = make_record(7, vec![0xAB; XLOG_BLCKSZ + 100]);
        let lsn = writer.append_record(&mut big);
        let wal = writer.into_bytes();

        let records = decode_all(Lsn(0x0100_0000), &wal, version, WAL_SEGMENT_SIZE).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lsn, lsn);
        assert_eq!(records[0].main_data.len(), XLOG_BLCKSZ + 100);
        assert!(records[0].main_data.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn record_spanning_segments_is_reassembled() {
        let version = PgMajorVersion::V16;
        // Tiny segment size so the test stays cheap: 64 KiB.
        let seg_size = 64 * 1024;
        let mut writer = WalWriter::new(Lsn(0), 1, 42, version, seg_size);
        // Fill most of the first segment, then write a record that has to
        // continue into the second one.
        let mut filler = make_record(1, vec![1; seg_size - 4096]);
        writer.append_record(&mut filler);
        let mut spanning = make_record(2, vec![2; 8192]);
        let lsn = writer.append_record(&mut spanning);
        let wal = writer.into_bytes();
        assert!(wal.len() > seg_size, "record must cross the segment boundary");

        // Feed in arbitrary small chunks to exercise buffering.
        let mut decoder = WalStreamDecoder::new(Lsn(0), version, seg_size);
        let mut records = Vec::new();
        for chunk in wal.chunks(1000) {
            decoder.feed_bytes(chunk);
            while let Some(rec) = decoder.poll_decode().unwrap() {
                records.push(rec);
            }
        }
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].lsn, lsn);
        assert_eq!(records[1].main_data.len(), 8192);
    }

    #[test]
    fn short_read_is_reported_in_file_mode() {
        let version = PgMajorVersion::V16;
        let mut writer = WalWriter::new(Lsn(0x0100_0000), 1, 42, version, WAL_SEGMENT_SIZE);
        let mut rec = make_record(1, vec![9; 4000]);
        writer.append_record(&mut rec);
        let wal = writer.into_bytes();

        // Truncate inside the record.
        let err = decode_all(
            Lsn(0x0100_0000),
            &wal[..wal.len() - 1000],
            version,
            WAL_SEGMENT_SIZE,
        )
        .unwrap_err();
        assert!(matches!(err, WalDecodeError::ShortRead { .. }));
    }

    #[test]
    fn zero_fill_marks_end_of_wal() {
        let version = PgMajorVersion::V16;
        let mut writer = WalWriter::new(Lsn(0x0100_0000), 1, 42, version, WAL_SEGMENT_SIZE);
        let mut rec = make_record(1, vec![4; 100]);
        writer.append_record(&mut rec);
        let mut wal = writer.into_bytes();
        // Simulate an archived segment: zero fill after the last record.
        wal.resize(WAL_SEGMENT_SIZE, 0);

        let mut decoder = WalStreamDecoder::new(Lsn(0x0100_0000), version, WAL_SEGMENT_SIZE);
        decoder.feed_bytes(&wal);
        assert!(decoder.poll_decode().unwrap().is_some());
        assert!(decoder.poll_decode().unwrap().is_none());
        assert!(decoder.is_end_of_wal());
    }

    #[test]
    fn corrupted_page_magic_is_fatal() {
        let version = PgMajorVersion::V16;
        let mut writer = WalWriter::new(Lsn(0x0100_0000), 1, 42, version, WAL_SEGMENT_SIZE);
        let mut rec = make_record(1, vec![4; 100]);
        writer.append_record(&mut rec);
        let mut wal = writer.into_bytes();
        wal[0] ^= 0xFF;

        let err = decode_all(Lsn(0x0100_0000), &wal, version, WAL_SEGMENT_SIZE).unwrap_err();
        assert!(matches!(err, WalDecodeError::BadMagic { .. }));
    }
}
