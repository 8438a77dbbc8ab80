//! Transaction resource manager: commit/abort records with their optional
//! payload sections, prepared-transaction bookkeeping and subtransaction
//! assignment.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::{DecodedXLogRecord, RelFileLocator};
use crate::{Oid, PgMajorVersion, TimestampTz, TransactionId, WalDecodeError};

pub const XLOG_XACT_COMMIT: u8 = 0x00;
pub const XLOG_XACT_PREPARE: u8 = 0x10;
pub const XLOG_XACT_ABORT: u8 = 0x20;
pub const XLOG_XACT_COMMIT_PREPARED: u8 = 0x30;
pub const XLOG_XACT_ABORT_PREPARED: u8 = 0x40;
pub const XLOG_XACT_ASSIGNMENT: u8 = 0x50;
pub const XLOG_XACT_INVALIDATIONS: u8 = 0x60;
pub const XLOG_XACT_OPMASK: u8 = 0x70;
/// Set when an xl_xact_xinfo word follows the timestamp.
pub const XLOG_XACT_HAS_INFO: u8 = 0x80;

pub const XACT_XINFO_HAS_DBINFO: u32 = 1 << 0;
pub const XACT_XINFO_HAS_SUBXACTS: u32 = 1 << 1;
pub const XACT_XINFO_HAS_RELFILELOCATORS: u32 = 1 << 2;
pub const XACT_XINFO_HAS_INVALS: u32 = 1 << 3;
pub const XACT_XINFO_HAS_TWOPHASE: u32 = 1 << 4;
pub const XACT_XINFO_HAS_ORIGIN: u32 = 1 << 5;
pub const XACT_XINFO_HAS_AE_LOCKS: u32 = 1 << 6;
pub const XACT_XINFO_HAS_GID: u32 = 1 << 7;
/// New in 15.
pub const XACT_XINFO_HAS_DROPPED_STATS: u32 = 1 << 8;

/// A commit or abort record, parsed from the optional sections the xinfo
/// word announces. Commits and aborts share this shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XactParsedRecord {
    pub xid: TransactionId,
    pub info: u8,
    pub xact_time: TimestampTz,
    pub xinfo: u32,
    pub db_id: Oid,
    pub ts_id: Oid,
    pub subxacts: Vec<TransactionId>,
    pub xlocators: Vec<RelFileLocator>,
    pub twophase_xid: Option<TransactionId>,
    pub gid: Option<String>,
}

impl XactParsedRecord {
    pub fn decode(
        buf: &mut Bytes,
        xid: TransactionId,
        xl_info: u8,
        version: PgMajorVersion,
    ) -> Result<XactParsedRecord, WalDecodeError> {
        let info = xl_info & XLOG_XACT_OPMASK;
        let xact_time = buf.get_i64_le();
        let xinfo = if xl_info & XLOG_XACT_HAS_INFO != 0 {
            buf.get_u32_le()
        } else {
            0
        };
        let (db_id, ts_id) = if xinfo & XACT_XINFO_HAS_DBINFO != 0 {
            (buf.get_u32_le(), buf.get_u32_le())
        } else {
            (0, 0)
        };
        let mut subxacts = Vec::new();
        if xinfo & XACT_XINFO_HAS_SUBXACTS != 0 {
            let nsubxacts = buf.get_i32_le();
            for _ in 0..nsubxacts {
                subxacts.push(buf.get_u32_le());
            }
        }
        let mut xlocators = Vec::new();
        if xinfo & XACT_XINFO_HAS_RELFILELOCATORS != 0 {
            let nrels = buf.get_i32_le();
            for _ in 0..nrels {
                xlocators.push(RelFileLocator {
                    spc_oid: buf.get_u32_le(),
                    db_oid: buf.get_u32_le(),
                    rel_number: buf.get_u32_le(),
                });
            }
        }
        if version >= PgMajorVersion::V15 && xinfo & XACT_XINFO_HAS_DROPPED_STATS != 0 {
            // xl_xact_stats_item: (kind i32, dboid u32, objoid u32/u64)
            let nitems = buf.get_i32_le();
            let item_len = if version >= PgMajorVersion::V17 { 16 } else { 12 };
            buf.advance(nitems as usize * item_len);
        }
        if xinfo & XACT_XINFO_HAS_INVALS != 0 {
            let nmsgs = buf.get_i32_le();
            // SharedInvalidationMessage is a 16-byte union.
            buf.advance(nmsgs as usize * 16);
        }
        let twophase_xid = if xinfo & XACT_XINFO_HAS_TWOPHASE != 0 {
            Some(buf.get_u32_le())
        } else {
            None
        };
        let gid = if xinfo & XACT_XINFO_HAS_GID != 0 {
            let raw: Vec<u8> = buf.iter().take_while(|&&b| b != 0).copied().collect();
            buf.advance(raw.len().min(buf.remaining()));
            Some(String::from_utf8_lossy(&raw).into_owned())
        } else {
            None
        };
        Ok(XactParsedRecord {
            xid,
            info,
            xact_time,
            xinfo,
            db_id,
            ts_id,
            subxacts,
            xlocators,
            twophase_xid,
            gid,
        })
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    let info = rec.header.xl_info & XLOG_XACT_OPMASK;
    Ok(match info {
        XLOG_XACT_COMMIT | XLOG_XACT_COMMIT_PREPARED => {
            let parsed =
                XactParsedRecord::decode(&mut buf, rec.header.xl_xid, rec.header.xl_info, version)?;
            format!(
                "COMMIT{} xid {} subxacts {} rels {}",
                if info == XLOG_XACT_COMMIT_PREPARED { "_PREPARED" } else { "" },
                parsed.twophase_xid.unwrap_or(parsed.xid),
                parsed.subxacts.len(),
                parsed.xlocators.len()
            )
        }
        XLOG_XACT_ABORT | XLOG_XACT_ABORT_PREPARED => {
            let parsed =
                XactParsedRecord::decode(&mut buf, rec.header.xl_xid, rec.header.xl_info, version)?;
            format!(
                "ABORT{} xid {} subxacts {}",
                if info == XLOG_XACT_ABORT_PREPARED { "_PREPARED" } else { "" },
                parsed.twophase_xid.unwrap_or(parsed.xid),
                parsed.subxacts.len()
            )
        }
        XLOG_XACT_PREPARE => format!("PREPARE xid {}", rec.header.xl_xid),
        XLOG_XACT_ASSIGNMENT => {
            let xtop = buf.get_u32_le();
            let nsubxacts = buf.get_i32_le();
            format!("ASSIGNMENT xtop {xtop} nsubxacts {nsubxacts}")
        }
        XLOG_XACT_INVALIDATIONS => "INVALIDATIONS".to_string(),
        _ => return Err(unknown("Transaction", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn commit_with_subxacts_and_rels() {
        let mut b = BytesMut::new();
        b.put_i64_le(770_000_000); // xact_time
        b.put_u32_le(XACT_XINFO_HAS_SUBXACTS | XACT_XINFO_HAS_RELFILELOCATORS);
        b.put_i32_le(2); // nsubxacts
        b.put_u32_le(101);
        b.put_u32_le(102);
        b.put_i32_le(1); // nrels
        b.put_u32_le(1663);
        b.put_u32_le(5);
        b.put_u32_le(16384);

        let mut buf = b.freeze();
        let parsed = XactParsedRecord::decode(
            &mut buf,
            100,
            XLOG_XACT_COMMIT | XLOG_XACT_HAS_INFO,
            PgMajorVersion::V16,
        )
        .unwrap();
        assert_eq!(parsed.subxacts, vec![101, 102]);
        assert_eq!(parsed.xlocators.len(), 1);
        assert_eq!(parsed.xlocators[0].rel_number, 16384);
        assert_eq!(parsed.twophase_xid, None);
    }

    #[test]
    fn minimal_commit_has_no_optional_sections() {
        let mut b = BytesMut::new();
        b.put_i64_le(1);
        let mut buf = b.freeze();
        let parsed =
            XactParsedRecord::decode(&mut buf, 7, XLOG_XACT_COMMIT, PgMajorVersion::V13).unwrap();
        assert_eq!(parsed.xinfo, 0);
        assert!(parsed.subxacts.is_empty());
    }
}
