//! Hash index resource manager.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{PgMajorVersion, TransactionId, WalDecodeError};

pub const XLOG_HASH_INIT_META_PAGE: u8 = 0x00;
pub const XLOG_HASH_INIT_BITMAP_PAGE: u8 = 0x10;
pub const XLOG_HASH_INSERT: u8 = 0x20;
pub const XLOG_HASH_ADD_OVFL_PAGE: u8 = 0x30;
pub const XLOG_HASH_SPLIT_ALLOCATE_PAGE: u8 = 0x40;
pub const XLOG_HASH_SPLIT_PAGE: u8 = 0x50;
pub const XLOG_HASH_SPLIT_COMPLETE: u8 = 0x60;
pub const XLOG_HASH_MOVE_PAGE_CONTENTS: u8 = 0x70;
pub const XLOG_HASH_SQUEEZE_PAGE: u8 = 0x80;
pub const XLOG_HASH_DELETE: u8 = 0x90;
pub const XLOG_HASH_SPLIT_CLEANUP: u8 = 0xA0;
pub const XLOG_HASH_UPDATE_META_PAGE: u8 = 0xB0;
pub const XLOG_HASH_VACUUM_ONE_PAGE: u8 = 0xC0;

/// Single-page vacuum; 16 widened and reordered it around the catalog flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVacuumOnePage {
    V13_15 {
        latest_removed_xid: TransactionId,
        ntuples: i32,
    },
    V16_17 {
        snapshot_conflict_horizon: TransactionId,
        ntuples: u16,
        is_catalog_rel: bool,
    },
}

impl HashVacuumOnePage {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> HashVacuumOnePage {
        if version >= PgMajorVersion::V16 {
            HashVacuumOnePage::V16_17 {
                snapshot_conflict_horizon: buf.get_u32_le(),
                ntuples: buf.get_u16_le(),
                is_catalog_rel: buf.get_u8() != 0,
            }
        } else {
            HashVacuumOnePage::V13_15 {
                latest_removed_xid: buf.get_u32_le(),
                ntuples: buf.get_i32_le(),
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
        XLOG_HASH_INIT_META_PAGE => {
            let num_tuples = buf.get_f64_le();
            format!("INIT_META_PAGE num_tuples {num_tuples}")
        }
        XLOG_HASH_INIT_BITMAP_PAGE => format!("INIT_BITMAP_PAGE bmsize {}", buf.get_u16_le()),
        XLOG_HASH_INSERT => format!("INSERT off {}", buf.get_u16_le()),
        XLOG_HASH_ADD_OVFL_PAGE => "ADD_OVFL_PAGE".to_string(),
        XLOG_HASH_SPLIT_ALLOCATE_PAGE => {
            let new_bucket = buf.get_u32_le();
            format!("SPLIT_ALLOCATE_PAGE new_bucket {new_bucket}")
        }
        XLOG_HASH_SPLIT_PAGE => "SPLIT_PAGE".to_string(),
        XLOG_HASH_SPLIT_COMPLETE => "SPLIT_COMPLETE".to_string(),
        XLOG_HASH_MOVE_PAGE_CONTENTS => format!("MOVE_PAGE_CONTENTS ntups {}", buf.get_u16_le()),
        XLOG_HASH_SQUEEZE_PAGE => {
            let prevblkno = buf.get_u32_le();
            let nextblkno = buf.get_u32_le();
            let ntups = buf.get_u16_le();
            format!("SQUEEZE_PAGE prevblkno {prevblkno} nextblkno {nextblkno} ntups {ntups}")
        }
        XLOG_HASH_DELETE => {
            let clear_dead_marking = buf.get_u8() != 0;
            let is_primary_bucket_page = buf.get_u8() != 0;
            format!(
                "DELETE clear_dead_marking {clear_dead_marking} is_primary {is_primary_bucket_page}"
            )
        }
        XLOG_HASH_SPLIT_CLEANUP => "SPLIT_CLEANUP".to_string(),
        XLOG_HASH_UPDATE_META_PAGE => format!("UPDATE_META_PAGE ntuples {}", buf.get_f64_le()),
        XLOG_HASH_VACUUM_ONE_PAGE => match HashVacuumOnePage::decode(&mut buf, version) {
            HashVacuumOnePage::V13_15 {
                latest_removed_xid,
                ntuples,
            } => format!("VACUUM_ONE_PAGE latestRemovedXid {latest_removed_xid} ntuples {ntuples}"),
            HashVacuumOnePage::V16_17 {
                snapshot_conflict_horizon,
                ntuples,
                is_catalog_rel,
            } => format!(
                "VACUUM_ONE_PAGE snapshotConflictHorizon {snapshot_conflict_horizon} ntuples {ntuples} isCatalogRel {is_catalog_rel}"
            ),
        },
        _ => return Err(unknown("Hash", rec)),
    })
}
