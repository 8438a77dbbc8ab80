//! Heap and Heap2 resource managers.
//!
//! Heap2 is where the layouts moved the most between majors: 14 renamed
//! CLEAN to PRUNE and split out VACUUM, 16 added the catalog-relation flag
//! to prune and freeze, and 17 folded prune/vacuum/freeze into three
//! prune variants with a reason byte.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{Oid, PgMajorVersion, TransactionId, WalDecodeError};

pub const XLOG_HEAP_INSERT: u8 = 0x00;
pub const XLOG_HEAP_DELETE: u8 = 0x10;
pub const XLOG_HEAP_UPDATE: u8 = 0x20;
pub const XLOG_HEAP_TRUNCATE: u8 = 0x30;
pub const XLOG_HEAP_HOT_UPDATE: u8 = 0x40;
pub const XLOG_HEAP_CONFIRM: u8 = 0x50;
pub const XLOG_HEAP_LOCK: u8 = 0x60;
pub const XLOG_HEAP_INPLACE: u8 = 0x70;
pub const XLOG_HEAP_OPMASK: u8 = 0x70;
pub const XLOG_HEAP_INIT_PAGE: u8 = 0x80;

pub const XLOG_HEAP2_REWRITE: u8 = 0x00;
/// CLEAN before 14, PRUNE in 14–16, PRUNE_ON_ACCESS in 17.
pub const XLOG_HEAP2_PRUNE: u8 = 0x10;
/// FREEZE_PAGE before 14, VACUUM in 14–16, PRUNE_VACUUM_SCAN in 17.
pub const XLOG_HEAP2_VACUUM: u8 = 0x20;
/// CLEANUP_INFO before 14, FREEZE_PAGE in 14–16, PRUNE_VACUUM_CLEANUP in 17.
pub const XLOG_HEAP2_FREEZE_PAGE: u8 = 0x30;
pub const XLOG_HEAP2_VISIBLE: u8 = 0x40;
pub const XLOG_HEAP2_MULTI_INSERT: u8 = 0x50;
pub const XLOG_HEAP2_LOCK_UPDATED: u8 = 0x60;
pub const XLOG_HEAP2_NEW_CID: u8 = 0x70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlHeapInsert {
    pub offnum: u16,
    pub flags: u8,
}

impl XlHeapInsert {
    pub fn decode(buf: &mut Bytes) -> XlHeapInsert {
        XlHeapInsert {
            offnum: buf.get_u16_le(),
            flags: buf.get_u8(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlHeapDelete {
    pub xmax: TransactionId,
    pub offnum: u16,
    pub infobits_set: u8,
    pub flags: u8,
}

impl XlHeapDelete {
    pub fn decode(buf: &mut Bytes) -> XlHeapDelete {
        XlHeapDelete {
            xmax: buf.get_u32_le(),
            offnum: buf.get_u16_le(),
            infobits_set: buf.get_u8(),
            flags: buf.get_u8(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlHeapUpdate {
    pub old_xmax: TransactionId,
    pub old_offnum: u16,
    pub old_infobits_set: u8,
    pub flags: u8,
    pub new_xmax: TransactionId,
    pub new_offnum: u16,
}

impl XlHeapUpdate {
    pub fn decode(buf: &mut Bytes) -> XlHeapUpdate {
        XlHeapUpdate {
            old_xmax: buf.get_u32_le(),
            old_offnum: buf.get_u16_le(),
            old_infobits_set: buf.get_u8(),
            flags: buf.get_u8(),
            new_xmax: buf.get_u32_le(),
            new_offnum: buf.get_u16_le(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlHeapTruncate {
    pub db_id: Oid,
    pub flags: u8,
    pub relids: Vec<Oid>,
}

impl XlHeapTruncate {
    pub fn decode(buf: &mut Bytes) -> XlHeapTruncate {
        let db_id = buf.get_u32_le();
        let nrelids = buf.get_u32_le();
        let flags = buf.get_u8();
        buf.advance(3); // alignment before the relid array
        let mut relids = Vec::with_capacity(nrelids as usize);
        for _ in 0..nrelids {
            relids.push(buf.get_u32_le());
        }
        XlHeapTruncate { db_id, flags, relids }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlHeapLock {
    pub locking_xid: TransactionId,
    pub offnum: u16,
    pub infobits_set: u8,
    pub flags: u8,
}

impl XlHeapLock {
    pub fn decode(buf: &mut Bytes) -> XlHeapLock {
        XlHeapLock {
            locking_xid: buf.get_u32_le(),
            offnum: buf.get_u16_le(),
            infobits_set: buf.get_u8(),
            flags: buf.get_u8(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlHeapMultiInsert {
    pub flags: u8,
    pub ntuples: u16,
}

impl XlHeapMultiInsert {
    pub fn decode(buf: &mut Bytes) -> XlHeapMultiInsert {
        let flags = buf.get_u8();
        buf.advance(1);
        XlHeapMultiInsert {
            flags,
            ntuples: buf.get_u16_le(),
        }
    }
}

/// Prune main data across the three layout generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapPrune {
    /// 13 (named CLEAN there), 14 and 15.
    V13_15 {
        latest_removed_xid: TransactionId,
        nredirected: u16,
        ndead: u16,
    },
    /// 16 renamed the xid and added the catalog-relation flag.
    V16 {
        snapshot_conflict_horizon: TransactionId,
        nredirected: u16,
        ndead: u16,
        is_catalog_rel: bool,
    },
    /// 17 restructured to a reason byte plus flag-dependent payload.
    V17 { reason: u8, flags: u8 },
}

impl HeapPrune {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> HeapPrune {
        match version {
            PgMajorVersion::V13 | PgMajorVersion::V14 | PgMajorVersion::V15 => HeapPrune::V13_15 {
                latest_removed_xid: buf.get_u32_le(),
                nredirected: buf.get_u16_le(),
                ndead: buf.get_u16_le(),
            },
            PgMajorVersion::V16 => HeapPrune::V16 {
                snapshot_conflict_horizon: buf.get_u32_le(),
                nredirected: buf.get_u16_le(),
                ndead: buf.get_u16_le(),
                is_catalog_rel: buf.get_u8() != 0,
            },
            PgMajorVersion::V17 => HeapPrune::V17 {
                reason: buf.get_u8(),
                flags: buf.get_u8(),
            },
        }
    }
}

/// Freeze-page main data; 16 replaced per-tuple entries with freeze plans
/// and added the catalog-relation flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapFreezePage {
    V13_15 {
        cutoff_xid: TransactionId,
        ntuples: u16,
    },
    V16_17 {
        snapshot_conflict_horizon: TransactionId,
        nplans: u16,
        is_catalog_rel: bool,
    },
}

impl HeapFreezePage {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> HeapFreezePage {
        if version >= PgMajorVersion::V16 {
            HeapFreezePage::V16_17 {
                snapshot_conflict_horizon: buf.get_u32_le(),
                nplans: buf.get_u16_le(),
                is_catalog_rel: buf.get_u8() != 0,
            }
        } else {
            HeapFreezePage::V13_15 {
                cutoff_xid: buf.get_u32_le(),
                ntuples: buf.get_u16_le(),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlHeapVisible {
    pub snapshot_conflict_horizon: TransactionId,
    pub flags: u8,
}

impl XlHeapVisible {
    pub fn decode(buf: &mut Bytes) -> XlHeapVisible {
        XlHeapVisible {
            snapshot_conflict_horizon: buf.get_u32_le(),
            flags: buf.get_u8(),
        }
    }
}

pub fn describe_heap(
    rec: &DecodedXLogRecord,
    _version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    let info = rec.header.xl_info & XLOG_HEAP_OPMASK;
    let init = if rec.header.xl_info & XLOG_HEAP_INIT_PAGE != 0 {
        "+INIT"
    } else {
        ""
    };
    Ok(match info {
        XLOG_HEAP_INSERT => {
            let ins = XlHeapInsert::decode(&mut buf);
            format!("INSERT{init} off {} flags {:#04x}", ins.offnum, ins.flags)
        }
        XLOG_HEAP_DELETE => {
            let del = XlHeapDelete::decode(&mut buf);
            format!("DELETE off {} xmax {}", del.offnum, del.xmax)
        }
        XLOG_HEAP_UPDATE | XLOG_HEAP_HOT_UPDATE => {
            let upd = XlHeapUpdate::decode(&mut buf);
            format!(
                "{}{init} old off {} xmax {} new off {} xmax {}",
                if info == XLOG_HEAP_UPDATE { "UPDATE" } else { "HOT_UPDATE" },
                upd.old_offnum,
                upd.old_xmax,
                upd.new_offnum,
                upd.new_xmax
            )
        }
        XLOG_HEAP_TRUNCATE => {
            let trunc = XlHeapTruncate::decode(&mut buf);
            format!("TRUNCATE db {} nrelids {}", trunc.db_id, trunc.relids.len())
        }
        XLOG_HEAP_CONFIRM => format!("CONFIRM off {}", buf.get_u16_le()),
        XLOG_HEAP_LOCK => {
            let lock = XlHeapLock::decode(&mut buf);
            format!("LOCK off {} xid {}", lock.offnum, lock.locking_xid)
        }
        XLOG_HEAP_INPLACE => format!("INPLACE off {}", buf.get_u16_le()),
        _ => return Err(unknown("Heap", rec)),
    })
}

pub fn describe_heap2(
    rec: &DecodedXLogRecord,
    version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    let info = rec.header.xl_info & XLOG_HEAP_OPMASK;
    Ok(match info {
        XLOG_HEAP2_REWRITE => "REWRITE".to_string(),
        XLOG_HEAP2_PRUNE => match HeapPrune::decode(&mut buf, version) {
            HeapPrune::V13_15 {
                latest_removed_xid,
                nredirected,
                ndead,
            } => format!(
                "{} latestRemovedXid {latest_removed_xid} nredirected {nredirected} ndead {ndead}",
                if version == PgMajorVersion::V13 { "CLEAN" } else { "PRUNE" }
            ),
            HeapPrune::V16 {
                snapshot_conflict_horizon,
                nredirected,
                ndead,
                is_catalog_rel,
            } => format!(
                "PRUNE snapshotConflictHorizon {snapshot_conflict_horizon} nredirected {nredirected} ndead {ndead} isCatalogRel {is_catalog_rel}"
            ),
            HeapPrune::V17 { reason, flags } => {
                format!("PRUNE_ON_ACCESS reason {reason} flags {flags:#04x}")
            }
        },
        XLOG_HEAP2_VACUUM => match version {
            PgMajorVersion::V13 => {
                // FREEZE_PAGE occupied this slot in 13.
                let freeze = HeapFreezePage::decode(&mut buf, version);
                format!("FREEZE_PAGE {freeze:?}")
            }
            PgMajorVersion::V17 => "PRUNE_VACUUM_SCAN".to_string(),
            _ => format!("VACUUM nunused {}", buf.get_u16_le()),
        },
        XLOG_HEAP2_FREEZE_PAGE => match version {
            PgMajorVersion::V13 => format!("CLEANUP_INFO latestRemovedXid {}", buf.get_u32_le()),
            PgMajorVersion::V17 => "PRUNE_VACUUM_CLEANUP".to_string(),
            _ => match HeapFreezePage::decode(&mut buf, version) {
                HeapFreezePage::V13_15 { cutoff_xid, ntuples } => {
                    format!("FREEZE_PAGE cutoff_xid {cutoff_xid} ntuples {ntuples}")
                }
                HeapFreezePage::V16_17 {
                    snapshot_conflict_horizon,
                    nplans,
                    is_catalog_rel,
                } => format!(
                    "FREEZE_PAGE snapshotConflictHorizon {snapshot_conflict_horizon} nplans {nplans} isCatalogRel {is_catalog_rel}"
                ),
            },
        },
        XLOG_HEAP2_VISIBLE => {
            let vis = XlHeapVisible::decode(&mut buf);
            format!(
                "VISIBLE snapshotConflictHorizon {} flags {:#04x}",
                vis.snapshot_conflict_horizon, vis.flags
            )
        }
        XLOG_HEAP2_MULTI_INSERT => {
            let multi = XlHeapMultiInsert::decode(&mut buf);
            format!("MULTI_INSERT ntuples {} flags {:#04x}", multi.ntuples, multi.flags)
        }
        XLOG_HEAP2_LOCK_UPDATED => {
            let lock = XlHeapLock::decode(&mut buf);
            format!("LOCK_UPDATED off {} xid {}", lock.offnum, lock.locking_xid)
        }
        XLOG_HEAP2_NEW_CID => "NEW_CID".to_string(),
        _ => return Err(unknown("Heap2", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn prune_variant_per_version() {
        // v15: xid + counts
        let mut b = BytesMut::new();
        b.put_u32_le(600);
        b.put_u16_le(4);
        b.put_u16_le(2);
        match HeapPrune::decode(&mut b.freeze(), PgMajorVersion::V15) {
            HeapPrune::V13_15 {
                latest_removed_xid,
                nredirected,
                ndead,
            } => {
                assert_eq!(latest_removed_xid, 600);
                assert_eq!(nredirected, 4);
                assert_eq!(ndead, 2);
            }
            other => panic!("wrong variant {other:?}"),
        }

        // v16: same prefix plus the catalog flag
        let mut b = BytesMut::new();
        b.put_u32_le(600);
        b.put_u16_le(4);
        b.put_u16_le(2);
        b.put_u8(1);
        match HeapPrune::decode(&mut b.freeze(), PgMajorVersion::V16) {
            HeapPrune::V16 { is_catalog_rel, .. } => assert!(is_catalog_rel),
            other => panic!("wrong variant {other:?}"),
        }

        // v17: reason + flags
        let mut b = BytesMut::new();
        b.put_u8(1);
        b.put_u8(0x03);
        match HeapPrune::decode(&mut b.freeze(), PgMajorVersion::V17) {
            HeapPrune::V17 { reason, flags } => {
                assert_eq!(reason, 1);
                assert_eq!(flags, 0x03);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn freeze_page_gains_catalog_flag_at_v16() {
        let mut b = BytesMut::new();
        b.put_u32_le(77);
        b.put_u16_le(5);
        match HeapFreezePage::decode(&mut b.freeze(), PgMajorVersion::V14) {
            HeapFreezePage::V13_15 { cutoff_xid, ntuples } => {
                assert_eq!(cutoff_xid, 77);
                assert_eq!(ntuples, 5);
            }
            other => panic!("wrong variant {other:?}"),
        }

        let mut b = BytesMut::new();
        b.put_u32_le(77);
        b.put_u16_le(5);
        b.put_u8(0);
        match HeapFreezePage::decode(&mut b.freeze(), PgMajorVersion::V16) {
            HeapFreezePage::V16_17 {
                nplans,
                is_catalog_rel,
                ..
            } => {
                assert_eq!(nplans, 5);
                assert!(!is_catalog_rel);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn heap_update_layout() {
        let mut b = BytesMut::new();
        b.put_u32_le(901); // old_xmax
        b.put_u16_le(7);
        b.put_u8(0);
        b.put_u8(0);
        b.put_u32_le(902); // new_xmax
        b.put_u16_le(1);
        let upd = XlHeapUpdate::decode(&mut b.freeze());
        assert_eq!(upd.old_offnum, 7);
        assert_eq!(upd.new_offnum, 1);
        assert_eq!(upd.new_xmax, 902);
    }
}
