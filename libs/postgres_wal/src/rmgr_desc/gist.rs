//! GiST resource manager. Delete and page-reuse gained the
//! catalog-relation flag in 16, mirroring the b-tree changes.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::{DecodedXLogRecord, RelFileLocator};
use crate::{BlockNumber, PgMajorVersion, TransactionId, WalDecodeError};

pub const XLOG_GIST_PAGE_UPDATE: u8 = 0x00;
pub const XLOG_GIST_DELETE: u8 = 0x10;
pub const XLOG_GIST_PAGE_REUSE: u8 = 0x20;
pub const XLOG_GIST_PAGE_SPLIT: u8 = 0x30;
pub const XLOG_GIST_PAGE_DELETE: u8 = 0x60;
pub const XLOG_GIST_ASSIGN_LSN: u8 = 0x70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GistDelete {
    V13_15 {
        latest_removed_xid: TransactionId,
        ntodelete: u16,
    },
    V16_17 {
        snapshot_conflict_horizon: TransactionId,
        ntodelete: u16,
        is_catalog_rel: bool,
    },
}

impl GistDelete {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> GistDelete {
        if version >= PgMajorVersion::V16 {
            GistDelete::V16_17 {
                snapshot_conflict_horizon: buf.get_u32_le(),
                ntodelete: buf.get_u16_le(),
                is_catalog_rel: buf.get_u8() != 0,
            }
        } else {
            GistDelete::V13_15 {
                latest_removed_xid: buf.get_u32_le(),
                ntodelete: buf.get_u16_le(),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GistPageReuse {
    V13_15 {
        locator: RelFileLocator,
        block: BlockNumber,
        latest_removed_full_xid: u64,
    },
    V16_17 {
        locator: RelFileLocator,
        block: BlockNumber,
        snapshot_conflict_horizon: u64,
        is_catalog_rel: bool,
    },
}

impl GistPageReuse {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> GistPageReuse {
        let locator = RelFileLocator {
            spc_oid: buf.get_u32_le(),
            db_oid: buf.get_u32_le(),
            rel_number: buf.get_u32_le(),
        };
        let block = buf.get_u32_le();
        if version >= PgMajorVersion::V16 {
            GistPageReuse::V16_17 {
                locator,
                block,
                snapshot_conflict_horizon: buf.get_u64_le(),
                is_catalog_rel: buf.get_u8() != 0,
            }
        } else {
            GistPageReuse::V13_15 {
                locator,
                block,
                latest_removed_full_xid: buf.get_u64_le(),
            }
        }
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    Ok(match rec.header.rmgr_info() {
        XLOG_GIST_PAGE_UPDATE => {
            let ntodelete = buf.get_u16_le();
            let ntoinsert = buf.get_u16_le();
            format!("PAGE_UPDATE ntodelete {ntodelete} ntoinsert {ntoinsert}")
        }
        XLOG_GIST_DELETE => match GistDelete::decode(&mut buf, version) {
            GistDelete::V13_15 {
                latest_removed_xid,
                ntodelete,
            } => format!("DELETE latestRemovedXid {latest_removed_xid} ntodelete {ntodelete}"),
            GistDelete::V16_17 {
                snapshot_conflict_horizon,
                ntodelete,
                is_catalog_rel,
            } => format!(
                "DELETE snapshotConflictHorizon {snapshot_conflict_horizon} ntodelete {ntodelete} isCatalogRel {is_catalog_rel}"
            ),
        },
        XLOG_GIST_PAGE_REUSE => match GistPageReuse::decode(&mut buf, version) {
            GistPageReuse::V13_15 {
                locator,
                block,
                latest_removed_full_xid,
            } => format!(
                "PAGE_REUSE {locator} block {block} latestRemovedFullXid {latest_removed_full_xid}"
            ),
            GistPageReuse::V16_17 {
                locator,
                block,
                snapshot_conflict_horizon,
                is_catalog_rel,
            } => format!(
                "PAGE_REUSE {locator} block {block} snapshotConflictHorizon {snapshot_conflict_horizon} isCatalogRel {is_catalog_rel}"
            ),
        },
        XLOG_GIST_PAGE_SPLIT => {
            buf.advance(2); // origrlink
            let npage = buf.get_u16_le();
            format!("PAGE_SPLIT npage {npage}")
        }
        XLOG_GIST_PAGE_DELETE => "PAGE_DELETE".to_string(),
        XLOG_GIST_ASSIGN_LSN => "ASSIGN_LSN".to_string(),
        _ => return Err(unknown("Gist", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn delete_gains_catalog_flag_at_v16() {
        let mut b = BytesMut::new();
        b.put_u32_le(321);
        b.put_u16_le(8);
        match GistDelete::decode(&mut b.freeze(), PgMajorVersion::V15) {
            GistDelete::V13_15 { latest_removed_xid, ntodelete } => {
                assert_eq!(latest_removed_xid, 321);
                assert_eq!(ntodelete, 8);
            }
            other => panic!("wrong variant {other:?}"),
        }

        let mut b = BytesMut::new();
        b.put_u32_le(321);
        b.put_u16_le(8);
        b.put_u8(1);
        match GistDelete::decode(&mut b.freeze(), PgMajorVersion::V17) {
            GistDelete::V16_17 { is_catalog_rel, .. } => assert!(is_catalog_rel),
            other => panic!("wrong variant {other:?}"),
        }
    }
}
