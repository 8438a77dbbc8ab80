//! XLOG resource manager: checkpoints, segment switches, full-page images
//! and recovery bookkeeping.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{Lsn, Oid, PgMajorVersion, TimeLineId, TransactionId, WalDecodeError};

pub const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;
pub const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
pub const XLOG_NOOP: u8 = 0x20;
pub const XLOG_NEXTOID: u8 = 0x30;
pub const XLOG_SWITCH: u8 = 0x40;
pub const XLOG_BACKUP_END: u8 = 0x50;
pub const XLOG_PARAMETER_CHANGE: u8 = 0x60;
pub const XLOG_RESTORE_POINT: u8 = 0x70;
pub const XLOG_FPW_CHANGE: u8 = 0x80;
pub const XLOG_END_OF_RECOVERY: u8 = 0x90;
pub const XLOG_FPI_FOR_HINT: u8 = 0xA0;
pub const XLOG_FPI: u8 = 0xB0;
pub const XLOG_OVERWRITE_CONTRECORD: u8 = 0xC0;
/// New in 17.
pub const XLOG_CHECKPOINT_REDO: u8 = 0xD0;

/// Checkpoint payload. Version 17 added `wal_level` in what used to be
/// struct padding; every other field kept its offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckPoint {
    V13_16(CheckPointV13),
    V17(CheckPointV17),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPointV13 {
    pub redo: Lsn,
    pub this_timeline: TimeLineId,
    pub prev_timeline: TimeLineId,
    pub full_page_writes: bool,
    pub next_xid: u64,
    pub next_oid: Oid,
    pub next_multi: u32,
    pub next_multi_offset: u32,
    pub oldest_xid: TransactionId,
    pub oldest_xid_db: Oid,
    pub oldest_multi: u32,
    pub oldest_multi_db: Oid,
    pub time: i64,
    pub oldest_commit_ts_xid: TransactionId,
    pub newest_commit_ts_xid: TransactionId,
    pub oldest_active_xid: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPointV17 {
    pub wal_level: i32,
    pub rest: CheckPointV13,
}

impl CheckPoint {
    pub fn decode(buf: &mut Bytes, version: PgMajorVersion) -> Result<CheckPoint, WalDecodeError> {
        let redo = Lsn(buf.get_u64_le());
        let this_timeline = buf.get_u32_le();
        let prev_timeline = buf.get_u32_le();
        let full_page_writes = buf.get_u8() != 0;
        let wal_level = if version >= PgMajorVersion::V17 {
            buf.advance(3);
            Some(buf.get_i32_le())
        } else {
            buf.advance(7);
            None
        };
        let rest = CheckPointV13 {
            redo,
            this_timeline,
            prev_timeline,
            full_page_writes,
            next_xid: buf.get_u64_le(),
            next_oid: buf.get_u32_le(),
            next_multi: buf.get_u32_le(),
            next_multi_offset: buf.get_u32_le(),
            oldest_xid: buf.get_u32_le(),
            oldest_xid_db: buf.get_u32_le(),
            oldest_multi: buf.get_u32_le(),
            oldest_multi_db: buf.get_u32_le(),
            time: {
                buf.advance(4); // alignment before the 8-byte timestamp
                buf.get_i64_le()
            },
            oldest_commit_ts_xid: buf.get_u32_le(),
            newest_commit_ts_xid: buf.get_u32_le(),
            oldest_active_xid: buf.get_u32_le(),
        };
        Ok(match wal_level {
            Some(wal_level) => CheckPoint::V17(CheckPointV17 { wal_level, rest }),
            None => CheckPoint::V13_16(rest),
        })
    }

    pub fn common(&self) -> &CheckPointV13 {
        match self {
            CheckPoint::V13_16(c) => c,
            CheckPoint::V17(c) => &c.rest,
        }
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    let info = rec.header.rmgr_info();
    Ok(match info {
        XLOG_CHECKPOINT_SHUTDOWN | XLOG_CHECKPOINT_ONLINE => {
            let cp = CheckPoint::decode(&mut buf, version)?;
            let c = cp.common();
            format!(
                "CHECKPOINT_{} redo {} tli {} prev_tli {} nextXid {} oldestXid {} oldestActiveXid {}",
                if info == XLOG_CHECKPOINT_SHUTDOWN { "SHUTDOWN" } else { "ONLINE" },
                c.redo,
                c.this_timeline,
                c.prev_timeline,
                c.next_xid,
                c.oldest_xid,
                c.oldest_active_xid,
            )
        }
        XLOG_NOOP => "NOOP".to_string(),
        XLOG_NEXTOID => format!("NEXTOID {}", buf.get_u32_le()),
        XLOG_SWITCH => "SWITCH".to_string(),
        XLOG_BACKUP_END => format!("BACKUP_END {}", Lsn(buf.get_u64_le())),
        XLOG_PARAMETER_CHANGE => "PARAMETER_CHANGE".to_string(),
        XLOG_RESTORE_POINT => {
            buf.advance(8); // timestamp
            let name: Vec<u8> = buf.iter().take_while(|&&b| b != 0).copied().collect();
            format!("RESTORE_POINT {}", String::from_utf8_lossy(&name))
        }
        XLOG_FPW_CHANGE => format!("FPW_CHANGE {}", buf.get_u8() != 0),
        XLOG_END_OF_RECOVERY => "END_OF_RECOVERY".to_string(),
        XLOG_FPI_FOR_HINT => format!("FPI_FOR_HINT blocks {}", rec.blocks.len()),
        XLOG_FPI => format!("FPI blocks {}", rec.blocks.len()),
        XLOG_OVERWRITE_CONTRECORD => "OVERWRITE_CONTRECORD".to_string(),
        XLOG_CHECKPOINT_REDO if version >= PgMajorVersion::V17 => "CHECKPOINT_REDO".to_string(),
        _ => return Err(unknown("XLOG", rec)),
    })
}
