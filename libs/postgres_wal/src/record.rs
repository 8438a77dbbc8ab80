//! XLOG record decoding and re-encoding.
//!
//! A record on disk is a fixed 24-byte header, a chain of tagged
//! sub-headers (block references, replication origin, top-level xid, main
//! data length), the registered block images and block data in block-id
//! order, and finally the main data. The CRC32C in the header covers
//! everything after the header first, then the header itself up to the CRC
//! field.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::pg_constants::*;
use crate::{maxalign, BlockNumber, Lsn, Oid, PgMajorVersion, TransactionId, WalDecodeError, BLCKSZ};

/// On-disk size of the record header, alignment padding included.
pub const SIZE_OF_XLOG_RECORD: usize = 24;
/// Offset of `xl_crc` within the header; the CRC covers bytes before it.
pub const XLOG_RECORD_CRC_OFFS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RelFileLocator {
    pub spc_oid: Oid,
    pub db_oid: Oid,
    pub rel_number: Oid,
}

impl std::fmt::Display for RelFileLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.spc_oid, self.db_oid, self.rel_number)
    }
}

/// Fixed-size record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogRecordHeader {
    pub xl_tot_len: u32,
    pub xl_xid: TransactionId,
    pub xl_prev: Lsn,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub xl_crc: u32,
}

impl XLogRecordHeader {
    pub fn decode(buf: &mut Bytes) -> Result<XLogRecordHeader, WalDecodeError> {
        if buf.remaining() < SIZE_OF_XLOG_RECORD {
            return Err(WalDecodeError::ShortRead {
                lsn: Lsn::INVALID,
                needed: SIZE_OF_XLOG_RECORD - buf.remaining(),
            });
        }
        let xl_tot_len = buf.get_u32_le();
        let xl_xid = buf.get_u32_le();
        let xl_prev = Lsn(buf.get_u64_le());
        let xl_info = buf.get_u8();
        let xl_rmid = buf.get_u8();
        buf.advance(2); // struct padding
        let xl_crc = buf.get_u32_le();
        Ok(XLogRecordHeader {
            xl_tot_len,
            xl_xid,
            xl_prev,
            xl_info,
            xl_rmid,
            xl_crc,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.xl_tot_len);
        buf.put_u32_le(self.xl_xid);
        buf.put_u64_le(self.xl_prev.0);
        buf.put_u8(self.xl_info);
        buf.put_u8(self.xl_rmid);
        buf.put_bytes(0, 2);
        buf.put_u32_le(self.xl_crc);
    }

    /// rmgr-specific bits of `xl_info`.
    pub fn rmgr_info(&self) -> u8 {
        self.xl_info & XLR_RMGR_INFO_MASK
    }
}

/// Full-page image carried by a block reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockImage {
    pub data: Bytes,
    pub hole_offset: u16,
    pub hole_length: u16,
    pub bimg_info: u8,
}

impl BlockImage {
    pub fn is_compressed(&self, version: PgMajorVersion) -> bool {
        bkpimage_is_compressed(self.bimg_info, version)
    }

    pub fn compression(&self, version: PgMajorVersion) -> FpiCompression {
        bkpimage_compression(self.bimg_info, version)
    }

    pub fn apply(&self, version: PgMajorVersion) -> bool {
        bkpimage_apply(self.bimg_info, version)
    }
}

/// One decoded block reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBkpBlock {
    pub id: u8,
    /// Raw fork_flags byte: fork number plus HAS_IMAGE/HAS_DATA/WILL_INIT/
    /// SAME_REL bits. Kept verbatim so re-encoding is byte-exact.
    pub fork_flags: u8,
    pub rlocator: RelFileLocator,
    pub blkno: BlockNumber,
    pub image: Option<BlockImage>,
    pub data: Option<Bytes>,
}

impl DecodedBkpBlock {
    pub fn forknum(&self) -> u8 {
        self.fork_flags & BKPBLOCK_FORK_MASK
    }

    pub fn has_image(&self) -> bool {
        self.fork_flags & BKPBLOCK_HAS_IMAGE != 0
    }

    pub fn has_data(&self) -> bool {
        self.fork_flags & BKPBLOCK_HAS_DATA != 0
    }

    pub fn will_init(&self) -> bool {
        self.fork_flags & BKPBLOCK_WILL_INIT != 0
    }

    pub fn same_rel(&self) -> bool {
        self.fork_flags & BKPBLOCK_SAME_REL != 0
    }
}

/// A fully reassembled, decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedXLogRecord {
    pub lsn: Lsn,
    pub next_lsn: Lsn,
    pub header: XLogRecordHeader,
    pub record_origin: Option<u16>,
    pub toplevel_xid: Option<TransactionId>,
    pub main_data: Bytes,
    pub blocks: Vec<DecodedBkpBlock>,
}

impl DecodedXLogRecord {
    pub fn total_length(&self) -> u32 {
        self.header.xl_tot_len
    }

    pub fn xid(&self) -> TransactionId {
        self.header.xl_xid
    }

    /// Decode a record from its reassembled on-disk bytes, verifying the CRC.
    pub fn decode(
        lsn: Lsn,
        next_lsn: Lsn,
        record: Bytes,
        version: PgMajorVersion,
    ) -> Result<DecodedXLogRecord, WalDecodeError> {
        let mut buf = record.clone();
        let header = XLogRecordHeader::decode(&mut buf).map_err(|e| at_lsn(e, lsn))?;

        if (header.xl_tot_len as usize) != record.len() {
            return Err(WalDecodeError::Corrupt {
                lsn,
                msg: format!(
                    "stated length {} does not match reassembled length {}",
                    header.xl_tot_len,
                    record.len()
                ),
            });
        }

        let computed = compute_crc(&record);
        if computed != header.xl_crc {
            return Err(WalDecodeError::CrcMismatch {
                lsn,
                expected: header.xl_crc,
                computed,
            });
        }

        let mut decoded = DecodedXLogRecord {
            lsn,
            next_lsn,
            header,
            record_origin: None,
            toplevel_xid: None,
            main_data: Bytes::new(),
            blocks: Vec::new(),
        };

        // Walk the sub-header chain. `datatotal` accumulates the combined
        // length of block images, block data and main data that trail the
        // chain; the chain ends when only that payload remains.
        let mut main_data_len: u32 = 0;
        let mut datatotal: u32 = 0;
        let mut max_block_id: i32 = -1;
        let mut prev_rlocator = RelFileLocator::default();
        let mut image_lens: Vec<(usize, u16)> = Vec::new(); // (block index, bimg_len)
        let mut data_lens: Vec<(usize, u16)> = Vec::new();

        while buf.remaining() > datatotal as usize {
            let block_id = buf.get_u8();
            match block_id {
                XLR_BLOCK_ID_DATA_SHORT => {
                    main_data_len = buf.get_u8() as u32;
                    datatotal += main_data_len;
                }
                XLR_BLOCK_ID_DATA_LONG => {
                    main_data_len = buf.get_u32_le();
                    datatotal += main_data_len;
                }
                XLR_BLOCK_ID_ORIGIN => {
                    decoded.record_origin = Some(buf.get_u16_le());
                }
                XLR_BLOCK_ID_TOPLEVEL_XID => {
                    decoded.toplevel_xid = Some(buf.get_u32_le());
                }
                id if id < XLR_MAX_BLOCK_ID => {
                    if (id as i32) <= max_block_id {
                        return Err(WalDecodeError::Corrupt {
                            lsn,
                            msg: format!("out-of-order block_id {id}"),
                        });
                    }
                    max_block_id = id as i32;

                    let fork_flags = buf.get_u8();
                    let data_len = buf.get_u16_le();
                    if (fork_flags & BKPBLOCK_HAS_DATA != 0) != (data_len > 0) {
                        return Err(WalDecodeError::Corrupt {
                            lsn,
                            msg: format!(
                                "BKPBLOCK_HAS_DATA set incoherently with data length {data_len}"
                            ),
                        });
                    }
                    datatotal += data_len as u32;

                    let mut image = None;
                    if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                        let bimg_len = buf.get_u16_le();
                        let hole_offset = buf.get_u16_le();
                        let bimg_info = buf.get_u8();
                        let compressed = bkpimage_is_compressed(bimg_info, version);
                        let hole_length = if compressed {
                            if bimg_info & BKPIMAGE_HAS_HOLE != 0 {
                                buf.get_u16_le()
                            } else {
                                0
                            }
                        } else {
                            BLCKSZ - bimg_len
                        };
                        validate_image(lsn, bimg_info, bimg_len, hole_offset, hole_length, compressed)?;
                        datatotal += bimg_len as u32;
                        image_lens.push((decoded.blocks.len(), bimg_len));
                        image = Some(BlockImage {
                            data: Bytes::new(),
                            hole_offset,
                            hole_length,
                            bimg_info,
                        });
                    }

                    let rlocator = if fork_flags & BKPBLOCK_SAME_REL == 0 {
                        let loc = RelFileLocator {
                            spc_oid: buf.get_u32_le(),
                            db_oid: buf.get_u32_le(),
                            rel_number: buf.get_u32_le(),
                        };
                        prev_rlocator = loc;
                        loc
                    } else {
                        if decoded.blocks.is_empty() {
                            return Err(WalDecodeError::Corrupt {
                                lsn,
                                msg: "BKPBLOCK_SAME_REL set but no previous rel".to_string(),
                            });
                        }
                        prev_rlocator
                    };

                    let blkno = buf.get_u32_le();
                    if data_len > 0 {
                        data_lens.push((decoded.blocks.len(), data_len));
                    }
                    decoded.blocks.push(DecodedBkpBlock {
                        id,
                        fork_flags,
                        rlocator,
                        blkno,
                        image,
                        data: None,
                    });
                }
                other => {
                    return Err(WalDecodeError::Corrupt {
                        lsn,
                        msg: format!("invalid block_id {other}"),
                    });
                }
            }
        }

        if buf.remaining() != datatotal as usize {
            return Err(WalDecodeError::Corrupt {
                lsn,
                msg: format!(
                    "payload length {} does not match headers ({datatotal})",
                    buf.remaining()
                ),
            });
        }

        // Payload section: images and data in block order, then main data.
        for (idx, bimg_len) in image_lens {
            let img = buf.split_to(bimg_len as usize);
            decoded.blocks[idx].image.as_mut().unwrap().data = img;
        }
        for (idx, data_len) in data_lens {
            decoded.blocks[idx].data = Some(buf.split_to(data_len as usize));
        }
        decoded.main_data = buf.split_to(main_data_len as usize);

        Ok(decoded)
    }

    /// Re-encode into on-disk record bytes. The CRC is recomputed, every
    /// other byte reproduces the original encoding.
    pub fn encode(&self, version: PgMajorVersion) -> Bytes {
        let mut body = BytesMut::new();

        // Sub-header chain: blocks in id order, then origin, toplevel xid,
        // and the main data header, matching the server's assembly order.
        for blk in &self.blocks {
            body.put_u8(blk.id);
            body.put_u8(blk.fork_flags);
            body.put_u16_le(blk.data.as_ref().map(|d| d.len() as u16).unwrap_or(0));
            if let Some(image) = &blk.image {
                body.put_u16_le(image.data.len() as u16);
                body.put_u16_le(image.hole_offset);
                body.put_u8(image.bimg_info);
                // hole_length is implicit unless the image is compressed
                // and actually has a hole; see decode.
                let has_hole = image.bimg_info & BKPIMAGE_HAS_HOLE != 0;
                if has_hole && bkpimage_is_compressed(image.bimg_info, version) {
                    body.put_u16_le(image.hole_length);
                }
            }
            if !blk.same_rel() {
                body.put_u32_le(blk.rlocator.spc_oid);
                body.put_u32_le(blk.rlocator.db_oid);
                body.put_u32_le(blk.rlocator.rel_number);
            }
            body.put_u32_le(blk.blkno);
        }
        if let Some(origin) = self.record_origin {
            body.put_u8(XLR_BLOCK_ID_ORIGIN);
            body.put_u16_le(origin);
        }
        if let Some(xid) = self.toplevel_xid {
            body.put_u8(XLR_BLOCK_ID_TOPLEVEL_XID);
            body.put_u32_le(xid);
        }
        if !self.main_data.is_empty() || self.blocks.is_empty() {
            if self.main_data.len() <= 255 {
                body.put_u8(XLR_BLOCK_ID_DATA_SHORT);
                body.put_u8(self.main_data.len() as u8);
            } else {
                body.put_u8(XLR_BLOCK_ID_DATA_LONG);
                body.put_u32_le(self.main_data.len() as u32);
            }
        }

        for blk in &self.blocks {
            if let Some(image) = &blk.image {
                body.put_slice(&image.data);
            }
        }
        for blk in &self.blocks {
            if let Some(data) = &blk.data {
                body.put_slice(data);
            }
        }
        body.put_slice(&self.main_data);

        let tot_len = SIZE_OF_XLOG_RECORD + body.len();
        let mut out = BytesMut::with_capacity(tot_len);
        let mut header = self.header;
        header.xl_tot_len = tot_len as u32;
        header.xl_crc = 0;
        header.encode(&mut out);
        out.put_slice(&body);

        // CRC: payload first, then the header bytes before the CRC field.
        let mut crc = crc32c::crc32c(&out[SIZE_OF_XLOG_RECORD..]);
        crc = crc32c::crc32c_append(crc, &out[..XLOG_RECORD_CRC_OFFS]);
        out[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4].copy_from_slice(&crc.to_le_bytes());

        out.freeze()
    }

    /// Record length on disk including trailing alignment padding.
    pub fn aligned_len(&self) -> u32 {
        maxalign(self.header.xl_tot_len)
    }
}

fn at_lsn(e: WalDecodeError, lsn: Lsn) -> WalDecodeError {
    match e {
        WalDecodeError::ShortRead { needed, .. } => WalDecodeError::ShortRead { lsn, needed },
        other => other,
    }
}

/// CRC32C over the record body then the header prefix, as the server
/// computes it.
pub fn compute_crc(record: &[u8]) -> u32 {
    let mut crc = crc32c::crc32c(&record[SIZE_OF_XLOG_RECORD..]);
    crc = crc32c::crc32c_append(crc, &record[..XLOG_RECORD_CRC_OFFS]);
    crc
}

fn validate_image(
    lsn: Lsn,
    bimg_info: u8,
    bimg_len: u16,
    hole_offset: u16,
    hole_length: u16,
    compressed: bool,
) -> Result<(), WalDecodeError> {
    let has_hole = bimg_info & BKPIMAGE_HAS_HOLE != 0;
    if has_hole && (hole_offset == 0 || hole_length == 0 || bimg_len == BLCKSZ) {
        return Err(WalDecodeError::Corrupt {
            lsn,
            msg: format!(
                "BKPIMAGE_HAS_HOLE set but hole offset {hole_offset} length {hole_length} image length {bimg_len}"
            ),
        });
    }
    if !has_hole && !compressed && bimg_len != BLCKSZ {
        return Err(WalDecodeError::Corrupt {
            lsn,
            msg: format!("neither a hole nor compressed, but image length is {bimg_len}"),
        });
    }
    if compressed && bimg_len == BLCKSZ {
        return Err(WalDecodeError::Corrupt {
            lsn,
            msg: "compressed image may not be a full block".to_string(),
        });
    }
    Ok(())
}
