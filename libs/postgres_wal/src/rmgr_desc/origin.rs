//! Replication origin resource manager.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{Lsn, PgMajorVersion, WalDecodeError};

pub const XLOG_REPLORIGIN_SET: u8 = 0x00;
pub const XLOG_REPLORIGIN_DROP: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlReploriginSet {
    pub remote_lsn: Lsn,
    pub node_id: u16,
    pub force: bool,
}

impl XlReploriginSet {
    pub fn decode(buf: &mut Bytes) -> XlReploriginSet {
        XlReploriginSet {
            remote_lsn: Lsn(buf.get_u64_le()),
            node_id: buf.get_u16_le(),
            force: buf.get_u8() != 0,
        }
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    _version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    Ok(match rec.header.rmgr_info() {
        XLOG_REPLORIGIN_SET => {
            let set = XlReploriginSet::decode(&mut buf);
            format!(
                "SET node {} remote_lsn {}{}",
                set.node_id,
                set.remote_lsn,
                if set.force { " force" } else { "" }
            )
        }
        XLOG_REPLORIGIN_DROP => format!("DROP node {}", buf.get_u16_le()),
        _ => return Err(unknown("ReplicationOrigin", rec)),
    })
}
