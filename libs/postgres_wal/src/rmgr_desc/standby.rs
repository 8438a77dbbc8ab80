//! Standby resource manager: running-xacts snapshots and AccessExclusive
//! lock tracking emitted for hot standby.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{PgMajorVersion, TransactionId, WalDecodeError};

pub const XLOG_STANDBY_LOCK: u8 = 0x00;
pub const XLOG_RUNNING_XACTS: u8 = 0x10;
pub const XLOG_INVALIDATIONS: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlRunningXacts {
    pub xcnt: u32,
    pub subxcnt: u32,
    pub subxid_overflow: bool,
    pub next_xid: TransactionId,
    pub oldest_running_xid: TransactionId,
    pub latest_completed_xid: TransactionId,
    pub xids: Vec<TransactionId>,
}

impl XlRunningXacts {
    pub fn decode(buf: &mut Bytes) -> XlRunningXacts {
        let xcnt = buf.get_u32_le();
        let subxcnt = buf.get_u32_le();
        let subxid_overflow = buf.get_u32_le() != 0;
        let next_xid = buf.get_u32_le();
        let oldest_running_xid = buf.get_u32_le();
        let latest_completed_xid = buf.get_u32_le();
        let mut xids = Vec::with_capacity((xcnt + subxcnt) as usize);
        for _ in 0..(xcnt + subxcnt) {
            xids.push(buf.get_u32_le());
        }
        XlRunningXacts {
            xcnt,
            subxcnt,
            subxid_overflow,
            next_xid,
            oldest_running_xid,
            latest_completed_xid,
            xids,
        }
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    _version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    Ok(match rec.header.rmgr_info() {
        XLOG_STANDBY_LOCK => {
            let nlocks = buf.get_i32_le();
            format!("LOCK nlocks {nlocks}")
        }
        XLOG_RUNNING_XACTS => {
            let xacts = XlRunningXacts::decode(&mut buf);
            format!(
                "RUNNING_XACTS nextXid {} oldestRunningXid {} latestCompletedXid {} xcnt {}{}",
                xacts.next_xid,
                xacts.oldest_running_xid,
                xacts.latest_completed_xid,
                xacts.xcnt,
                if xacts.subxid_overflow { " (subxids overflowed)" } else { "" }
            )
        }
        XLOG_INVALIDATIONS => "INVALIDATIONS".to_string(),
        _ => return Err(unknown("Standby", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn running_xacts_layout() {
        let mut b = BytesMut::new();
        b.put_u32_le(2); // xcnt
        b.put_u32_le(0); // subxcnt
        b.put_u32_le(0); // overflow
        b.put_u32_le(1000);
        b.put_u32_le(990);
        b.put_u32_le(999);
        b.put_u32_le(991);
        b.put_u32_le(995);
        let xacts = XlRunningXacts::decode(&mut b.freeze());
        assert_eq!(xacts.xcnt, 2);
        assert_eq!(xacts.xids, vec![991, 995]);
        assert!(!xacts.subxid_overflow);
    }
}
