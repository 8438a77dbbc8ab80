//! Logical message resource manager (`pg_logical_emit_message`).

use bytes::{Buf, Bytes};

use super::unknown;
use crate::record::DecodedXLogRecord;
use crate::{PgMajorVersion, WalDecodeError};

pub const XLOG_LOGICAL_MESSAGE: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlLogicalMessage {
    pub transactional: bool,
    pub prefix: String,
    pub message: Bytes,
}

impl XlLogicalMessage {
    pub fn decode(buf: &mut Bytes) -> XlLogicalMessage {
        let transactional = buf.get_u8() != 0;
        buf.advance(7); // alignment before the two size_t fields
        let prefix_size = buf.get_u64_le() as usize;
        let message_size = buf.get_u64_le() as usize;
        let prefix_raw = buf.split_to(prefix_size);
        // prefix is NUL-terminated
        let prefix = String::from_utf8_lossy(&prefix_raw[..prefix_size.saturating_sub(1)]).into_owned();
        let message = buf.split_to(message_size);
        XlLogicalMessage {
            transactional,
            prefix,
            message,
        }
    }
}

pub fn describe(
    rec: &DecodedXLogRecord,
    _version: PgMajorVersion,
) -> Result<String, WalDecodeError> {
    let mut buf = rec.main_data.clone();
    Ok(match rec.header.rmgr_info() {
        XLOG_LOGICAL_MESSAGE => {
            let msg = XlLogicalMessage::decode(&mut buf);
            format!(
                "MESSAGE{} prefix \"{}\" ({} bytes)",
                if msg.transactional { " transactional" } else { "" },
                msg.prefix,
                msg.message.len()
            )
        }
        _ => return Err(unknown("LogicalMessage", rec)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn message_layout() {
        let mut b = BytesMut::new();
        b.put_u8(1);
        b.put_bytes(0, 7);
        b.put_u64_le(5); // "test" + NUL
        b.put_u64_le(3);
        b.put_slice(b"test\0");
        b.put_slice(b"abc");
        let msg = XlLogicalMessage::decode(&mut b.freeze());
        assert!(msg.transactional);
        assert_eq!(msg.prefix, "test");
        assert_eq!(&msg.message[..], b"abc");
    }
}
