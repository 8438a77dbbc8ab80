//! BRIN resource manager.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{BlockNumber, PgMajorVersion, WalDecodeError};

pub const XLOG_BRIN_CREATE_INDEX: u8 = 0x00;
pub const XLOG_BRIN_INSERT: u8 = 0x10;
pub const XLOG_BRIN_UPDATE: u8 = 0x20;
pub const XLOG_BRIN_SAMEPAGE_UPDATE: u8 = 0x30;
pub const XLOG_BRIN_REVMAP_EXTEND: u8 = 0x40;
pub const XLOG_BRIN_DESUMMARIZE: u8 = 0x50;
pub const XLOG_BRIN_INIT_PAGE: u8 = 0x80;
pub const XLOG_BRIN_OPMASK: u8 = 0x70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlBrinInsert {
    pub heap_blk: BlockNumber,
    pub pages_per_range: u32,
    pub offnum: u16,
}

impl XlBrinInsert {
    pub fn decode(buf: &mut Bytes) -> XlBrinInsert {
        XlBrinInsert {
            heap_blk: buf.get_u32_le(),
            pages_per_range: buf.get_u32_le(),
            offnum: buf.get_u16_le(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlBrinDesummarize {
    pub pages_per_range: u32,
    pub heap_blk: BlockNumber,
    pub regoffset: u16,
}

impl XlBrinDesummarize {
    pub fn decode(buf: &mut Bytes) -> XlBrinDesummarize {
        XlBrinDesummarize {
            pages_per_range: buf.get_u32_le(),
            heap_blk: buf.get_u32_le(),
            regoffset: buf.get_u16_le(),
        }
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    _version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    let info = rec.header.rmgr_info() & XLOG_BRIN_OPMASK;
    let init = if rec.header.rmgr_info() & XLOG_BRIN_INIT_PAGE != 0 {
        "+INIT"
    } else {
        ""
    };
    Ok(match info {
        XLOG_BRIN_CREATE_INDEX => {
            let version = buf.get_u32_le();
            let pages_per_range = buf.get_u32_le();
            format!("CREATE_INDEX version {version} pagesPerRange {pages_per_range}")
        }
        XLOG_BRIN_INSERT | XLOG_BRIN_UPDATE => {
            let ins = XlBrinInsert::decode(&mut buf);
            format!(
                "{}{init} heapBlk {} pagesPerRange {} offnum {}",
                if info == XLOG_BRIN_INSERT { "INSERT" } else { "UPDATE" },
                ins.heap_blk,
                ins.pages_per_range,
                ins.offnum
            )
        }
        XLOG_BRIN_SAMEPAGE_UPDATE => format!("SAMEPAGE_UPDATE offnum {}", buf.get_u16_le()),
        XLOG_BRIN_REVMAP_EXTEND => format!("REVMAP_EXTEND targetBlk {}", buf.get_u32_le()),
        XLOG_BRIN_DESUMMARIZE => {
            let de = XlBrinDesummarize::decode(&mut buf);
            format!("DESUMMARIZE heapBlk {} regoffset {}", de.heap_blk, de.regoffset)
        }
        _ => return Err(unknown("BRIN", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn insert_layout() {
        let mut b = BytesMut::new();
        b.put_u32_le(1024);
        b.put_u32_le(128);
        b.put_u16_le(6);
        let ins = XlBrinInsert::decode(&mut b.freeze());
        assert_eq!(ins.heap_blk, 1024);
        assert_eq!(ins.pages_per_range, 128);
        assert_eq!(ins.offnum, 6);
    }
}
