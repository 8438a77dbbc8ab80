//! Storage (smgr) resource manager: relation file creation and truncation.
//! Truncations also feed the WAL summarizer, which lowers the high-water
//! mark of the truncated fork.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::{DecodedXLogRecord, RelFileLocator};
use crate::{BlockNumber, PgMajorVersion, WalDecodeError};

pub const XLOG_SMGR_CREATE: u8 = 0x10;
pub const XLOG_SMGR_TRUNCATE: u8 = 0x20;

pub const SMGR_TRUNCATE_HEAP: u32 = 0x0001;
pub const SMGR_TRUNCATE_VM: u32 = 0x0002;
pub const SMGR_TRUNCATE_FSM: u32 = 0x0004;
pub const SMGR_TRUNCATE_ALL: u32 = SMGR_TRUNCATE_HEAP | SMGR_TRUNCATE_VM | SMGR_TRUNCATE_FSM;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlSmgrCreate {
    pub rlocator: RelFileLocator,
    pub forknum: u8,
}

impl XlSmgrCreate {
    pub fn decode(buf: &mut Bytes) -> XlSmgrCreate {
        XlSmgrCreate {
            rlocator: RelFileLocator {
                spc_oid: buf.get_u32_le(),
                db_oid: buf.get_u32_le(),
                rel_number: buf.get_u32_le(),
            },
            forknum: buf.get_u32_le() as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlSmgrTruncate {
    pub blkno: BlockNumber,
    pub rlocator: RelFileLocator,
    pub flags: u32,
}

impl XlSmgrTruncate {
    pub fn decode(buf: &mut Bytes) -> XlSmgrTruncate {
        XlSmgrTruncate {
            blkno: buf.get_u32_le(),
            rlocator: RelFileLocator {
                spc_oid: buf.get_u32_le(),
                db_oid: buf.get_u32_le(),
                rel_number: buf.get_u32_le(),
            },
            flags: buf.get_u32_le(),
        }
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    _version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    Ok(match rec.header.rmgr_info() {
        XLOG_SMGR_CREATE => {
            let create = XlSmgrCreate::decode(&mut buf);
            format!("CREATE {} fork {}", create.rlocator, create.forknum)
        }
        XLOG_SMGR_TRUNCATE => {
            let trunc = XlSmgrTruncate::decode(&mut buf);
            format!(
                "TRUNCATE {} to {} blocks flags {:#x}",
                trunc.rlocator, trunc.blkno, trunc.flags
            )
        }
        _ => return Err(unknown("Storage", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn truncate_layout() {
        let mut b = BytesMut::new();
        b.put_u32_le(128); // new length in blocks
        b.put_u32_le(1663);
        b.put_u32_le(5);
        b.put_u32_le(16400);
        b.put_u32_le(SMGR_TRUNCATE_ALL);
        let trunc = XlSmgrTruncate::decode(&mut b.freeze());
        assert_eq!(trunc.blkno, 128);
        assert_eq!(trunc.rlocator.rel_number, 16400);
        assert_eq!(trunc.flags, SMGR_TRUNCATE_ALL);
    }
}
