//! Sequence resource manager.

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{PgMajorVersion, WalDecodeError};

pub const XLOG_SEQ_LOG: u8 = 0x00;

pub fn describe(
    rec: &DecodedXLogRecord,
    _version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    Ok(match rec.header.rmgr_info() {
        XLOG_SEQ_LOG => {
            // xl_seq_rec is the rel file locator; the tuple follows.
            let spc = buf.get_u32_le();
            let db = buf.get_u32_le();
            let rel = buf.get_u32_le();
            format!("LOG rel {spc}/{db}/{rel}")
        }
        _ => return Err(unknown("Sequence", rec)),
    })
}
