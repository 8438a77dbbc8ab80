//! B-tree resource manager. Three structs forked across the supported
//! majors: delete (16 added the catalog flag), page reuse (15 widened the
//! xid, 16 renamed it), and metadata (14 replaced the cleanup heuristics).

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::{DecodedXLogRecord, RelFileLocator};
use crate::{BlockNumber, PgMajorVersion, TransactionId, WalDecodeError};

pub const XLOG_BTREE_INSERT_LEAF: u8 = 0x00;
pub const XLOG_BTREE_INSERT_UPPER: u8 = 0x10;
pub const XLOG_BTREE_INSERT_META: u8 = 0x20;
pub const XLOG_BTREE_SPLIT_L: u8 = 0x30;
pub const XLOG_BTREE_SPLIT_R: u8 = 0x40;
pub const XLOG_BTREE_INSERT_POST: u8 = 0x50;
pub const XLOG_BTREE_DEDUP: u8 = 0x60;
pub const XLOG_BTREE_DELETE: u8 = 0x70;
pub const XLOG_BTREE_UNLINK_PAGE: u8 = 0x80;
pub const XLOG_BTREE_UNLINK_PAGE_META: u8 = 0x90;
pub const XLOG_BTREE_NEWROOT: u8 = 0xA0;
pub const XLOG_BTREE_MARK_PAGE_HALFDEAD: u8 = 0xB0;
pub const XLOG_BTREE_VACUUM: u8 = 0xC0;
pub const XLOG_BTREE_REUSE_PAGE: u8 = 0xD0;
pub const XLOG_BTREE_META_CLEANUP: u8 = 0xE0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlBtreeInsert {
    pub offnum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlBtreeSplit {
    pub level: u32,
    pub firstrightoff: u16,
    pub newitemoff: u16,
    pub postingoff: u16,
}

impl XlBtreeSplit {
    pub fn decode(buf: &mut Bytes) -> XlBtreeSplit {
        XlBtreeSplit {
            level: buf.get_u32_le(),
            firstrightoff: buf.get_u16_le(),
            newitemoff: buf.get_u16_le(),
            postingoff: buf.get_u16_le(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlBtreeVacuum {
    pub ndeleted: u16,
    pub nupdated: u16,
}

/// Leaf-page delete main data across its three layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtreeDelete {
    V13 {
        latest_removed_xid: TransactionId,
        ndeleted: u32,
    },
    V14_15 {
        latest_removed_xid: TransactionId,
        ndeleted: u16,
        nupdated: u16,
    },
    V16_17 {
        snapshot_conflict_horizon: TransactionId,
        ndeleted: u16,
        nupdated: u16,
        is_catalog_rel: bool,
    },
}

impl BtreeDelete {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> BtreeDelete {
        match version {
            PgMajorVersion::V13 => BtreeDelete::V13 {
                latest_removed_xid: buf.get_u32_le(),
                ndeleted: buf.get_u32_le(),
            },
            PgMajorVersion::V14 | PgMajorVersion::V15 => BtreeDelete::V14_15 {
                latest_removed_xid: buf.get_u32_le(),
                ndeleted: buf.get_u16_le(),
                nupdated: buf.get_u16_le(),
            },
            _ => BtreeDelete::V16_17 {
                snapshot_conflict_horizon: buf.get_u32_le(),
                ndeleted: buf.get_u16_le(),
                nupdated: buf.get_u16_le(),
                is_catalog_rel: buf.get_u8() != 0,
            },
        }
    }
}

/// Page-reuse main data: 15 widened the conflict xid to 64 bits, 16
/// renamed it and added the catalog flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtreeReusePage {
    V13_14 {
        locator: RelFileLocator,
        block: BlockNumber,
        latest_removed_xid: TransactionId,
    },
    V15 {
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

impl BtreeReusePage {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> BtreeReusePage {
        let locator = RelFileLocator {
            spc_oid: buf.get_u32_le(),
            db_oid: buf.get_u32_le(),
            rel_number: buf.get_u32_le(),
        };
        let block = buf.get_u32_le();
        match version {
            PgMajorVersion::V13 | PgMajorVersion::V14 => BtreeReusePage::V13_14 {
                locator,
                block,
                latest_removed_xid: buf.get_u32_le(),
            },
            PgMajorVersion::V15 => BtreeReusePage::V15 {
                locator,
                block,
                latest_removed_full_xid: buf.get_u64_le(),
            },
            _ => BtreeReusePage::V16_17 {
                locator,
                block,
                snapshot_conflict_horizon: buf.get_u64_le(),
                is_catalog_rel: buf.get_u8() != 0,
            },
        }
    }
}

/// Metapage contents; 14 dropped the xid/heap-tuples cleanup heuristics
/// for a deleted-pages counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BtreeMetadata {
    V13 {
        version: u32,
        root: BlockNumber,
        level: u32,
        fastroot: BlockNumber,
        fastlevel: u32,
        oldest_btpo_xact: TransactionId,
        last_cleanup_num_heap_tuples: f64,
        allequalimage: bool,
    },
    V14_17 {
        version: u32,
        root: BlockNumber,
        level: u32,
        fastroot: BlockNumber,
        fastlevel: u32,
        last_cleanup_num_delpages: u32,
        allequalimage: bool,
    },
}

impl BtreeMetadata {
    pub fn decode(buf: &mut Bytes, pg: PgMajorVersion) -> BtreeMetadata {
        let version = buf.get_u32_le();
        let root = buf.get_u32_le();
        let level = buf.get_u32_le();
        let fastroot = buf.get_u32_le();
        let fastlevel = buf.get_u32_le();
        if pg == PgMajorVersion::V13 {
            BtreeMetadata::V13 {
                version,
                root,
                level,
                fastroot,
                fastlevel,
                oldest_btpo_xact: buf.get_u32_le(),
                last_cleanup_num_heap_tuples: buf.get_f64_le(),
                allequalimage: buf.get_u8() != 0,
            }
        } else {
            BtreeMetadata::V14_17 {
                version,
                root,
                level,
                fastroot,
                fastlevel,
                last_cleanup_num_delpages: buf.get_u32_le(),
                allequalimage: buf.get_u8() != 0,
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
        XLOG_BTREE_INSERT_LEAF => format!("INSERT_LEAF off {}", buf.get_u16_le()),
        XLOG_BTREE_INSERT_UPPER => format!("INSERT_UPPER off {}", buf.get_u16_le()),
        XLOG_BTREE_INSERT_META => format!("INSERT_META off {}", buf.get_u16_le()),
        XLOG_BTREE_INSERT_POST => format!("INSERT_POST off {}", buf.get_u16_le()),
        XLOG_BTREE_SPLIT_L | XLOG_BTREE_SPLIT_R => {
            let split = XlBtreeSplit::decode(&mut buf);
            format!(
                "SPLIT_{} level {} firstrightoff {} newitemoff {}",
                if rec.header.rmgr_info() == XLOG_BTREE_SPLIT_L { "L" } else { "R" },
                split.level,
                split.firstrightoff,
                split.newitemoff
            )
        }
        XLOG_BTREE_DEDUP => format!("DEDUP nintervals {}", buf.get_u16_le()),
        XLOG_BTREE_DELETE => match BtreeDelete::decode(&mut buf, version) {
            BtreeDelete::V13 {
                latest_removed_xid,
                ndeleted,
            } => format!("DELETE latestRemovedXid {latest_removed_xid} ndeleted {ndeleted}"),
            BtreeDelete::V14_15 {
                latest_removed_xid,
                ndeleted,
                nupdated,
            } => format!(
                "DELETE latestRemovedXid {latest_removed_xid} ndeleted {ndeleted} nupdated {nupdated}"
            ),
            BtreeDelete::V16_17 {
                snapshot_conflict_horizon,
                ndeleted,
                nupdated,
                is_catalog_rel,
            } => format!(
                "DELETE snapshotConflictHorizon {snapshot_conflict_horizon} ndeleted {ndeleted} nupdated {nupdated} isCatalogRel {is_catalog_rel}"
            ),
        },
        XLOG_BTREE_VACUUM => {
            let ndeleted = buf.get_u16_le();
            let nupdated = buf.get_u16_le();
            format!("VACUUM ndeleted {ndeleted} nupdated {nupdated}")
        }
        XLOG_BTREE_MARK_PAGE_HALFDEAD => {
            let poffset = buf.get_u16_le();
            format!("MARK_PAGE_HALFDEAD poffset {poffset}")
        }
        XLOG_BTREE_UNLINK_PAGE | XLOG_BTREE_UNLINK_PAGE_META => {
            format!(
                "UNLINK_PAGE{} leftsib {} rightsib {}",
                if rec.header.rmgr_info() == XLOG_BTREE_UNLINK_PAGE_META { "_META" } else { "" },
                buf.get_u32_le(),
                buf.get_u32_le()
            )
        }
        XLOG_BTREE_NEWROOT => {
            let rootblk = buf.get_u32_le();
            let level = buf.get_u32_le();
            format!("NEWROOT block {rootblk} level {level}")
        }
        XLOG_BTREE_REUSE_PAGE => match BtreeReusePage::decode(&mut buf, version) {
            BtreeReusePage::V13_14 {
                locator,
                block,
                latest_removed_xid,
            } => format!("REUSE_PAGE {locator} block {block} latestRemovedXid {latest_removed_xid}"),
            BtreeReusePage::V15 {
                locator,
                block,
                latest_removed_full_xid,
            } => format!(
                "REUSE_PAGE {locator} block {block} latestRemovedFullXid {latest_removed_full_xid}"
            ),
            BtreeReusePage::V16_17 {
                locator,
                block,
                snapshot_conflict_horizon,
                is_catalog_rel,
            } => format!(
                "REUSE_PAGE {locator} block {block} snapshotConflictHorizon {snapshot_conflict_horizon} isCatalogRel {is_catalog_rel}"
            ),
        },
        XLOG_BTREE_META_CLEANUP => {
            let meta = BtreeMetadata::decode(&mut buf, version);
            format!("META_CLEANUP {meta:?}")
        }
        _ => return Err(unknown("Btree", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn delete_bytes(with_catalog_flag: bool) -> Bytes {
        let mut b = BytesMut::new();
        b.put_u32_le(555);
        b.put_u16_le(10);
        b.put_u16_le(3);
        if with_catalog_flag {
            b.put_u8(1);
        }
        b.freeze()
    }

    #[test]
    fn delete_variant_per_version() {
        match BtreeDelete::decode(&mut delete_bytes(false), PgMajorVersion::V15) {
            BtreeDelete::V14_15 {
                latest_removed_xid,
                ndeleted,
                nupdated,
            } => {
                assert_eq!(latest_removed_xid, 555);
                assert_eq!((ndeleted, nupdated), (10, 3));
            }
            other => panic!("wrong variant {other:?}"),
        }
        match BtreeDelete::decode(&mut delete_bytes(true), PgMajorVersion::V16) {
            BtreeDelete::V16_17 {
                snapshot_conflict_horizon,
                is_catalog_rel,
                ..
            } => {
                assert_eq!(snapshot_conflict_horizon, 555);
                assert!(is_catalog_rel);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn reuse_page_widens_at_v15() {
        let mut b = BytesMut::new();
        b.put_u32_le(1663);
        b.put_u32_le(5);
        b.put_u32_le(16384);
        b.put_u32_le(99); // block
        b.put_u64_le(0x0000_0001_0000_0002); // full xid
        match BtreeReusePage::decode(&mut b.freeze(), PgMajorVersion::V15) {
            BtreeReusePage::V15 {
                latest_removed_full_xid,
                block,
                ..
            } => {
                assert_eq!(latest_removed_full_xid, 0x0000_0001_0000_0002);
                assert_eq!(block, 99);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn metadata_variant_per_version() {
        let mut b = BytesMut::new();
        b.put_u32_le(4); // btree version
        b.put_u32_le(3); // root
        b.put_u32_le(1);
        b.put_u32_le(3);
        b.put_u32_le(1);
        b.put_u32_le(17); // last_cleanup_num_delpages
        b.put_u8(1);
        match BtreeMetadata::decode(&mut b.freeze(), PgMajorVersion::V16) {
            BtreeMetadata::V14_17 {
                last_cleanup_num_delpages,
                allequalimage,
                ..
            } => {
                assert_eq!(last_cleanup_num_delpages, 17);
                assert!(allequalimage);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }
}
