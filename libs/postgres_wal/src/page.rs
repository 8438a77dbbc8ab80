//! WAL page headers. The first page of each segment carries the long form
//! with system id, segment size and block size; every other page carries the
//! short form. Both are padded to 8-byte alignment on disk.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Lsn, TimeLineId, WalDecodeError};

/// On-disk size of the short page header, padding included.
pub const SIZE_OF_XLOG_SHORT_PHD: usize = 24;
/// On-disk size of the long page header, padding included.
pub const SIZE_OF_XLOG_LONG_PHD: usize = 40;

/* xlp_info flag bits */
/// The first record on this page is a continuation of one begun on the
/// previous page.
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
/// This is the long header.
pub const XLP_LONG_HEADER: u16 = 0x0002;
pub const XLP_BKP_REMOVABLE: u16 = 0x0004;
pub const XLP_FIRST_IS_OVERWRITE_CONTRECORD: u16 = 0x0008;
pub const XLP_ALL_FLAGS: u16 = 0x000F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogPageHeader {
    pub magic: u16,
    pub info: u16,
    pub tli: TimeLineId,
    pub pageaddr: Lsn,
    /// Bytes of the continued record remaining at the start of this page.
    pub rem_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogLongPageHeader {
    pub std: XLogPageHeader,
    pub sysid: u64,
    pub seg_size: u32,
    pub xlog_blcksz: u32,
}

impl XLogPageHeader {
    pub fn is_long(&self) -> bool {
        self.info & XLP_LONG_HEADER != 0
    }

    pub fn first_is_contrecord(&self) -> bool {
        self.info & XLP_FIRST_IS_CONTRECORD != 0
    }

    /// Parse a short header. Fails with `bad_magic` if the stated magic is
    /// not the expected one.
    pub fn decode(buf: &mut Bytes, expect_magic: u16) -> Result<XLogPageHeader, WalDecodeError> {
        if buf.remaining() < SIZE_OF_XLOG_SHORT_PHD {
            return Err(WalDecodeError::ShortRead {
                lsn: Lsn::INVALID,
                needed: SIZE_OF_XLOG_SHORT_PHD - buf.remaining(),
            });
        }
        let magic = buf.get_u16_le();
        let info = buf.get_u16_le();
        let tli = buf.get_u32_le();
        let pageaddr = Lsn(buf.get_u64_le());
        let rem_len = buf.get_u32_le();
        buf.advance(4); // struct padding
        if magic != expect_magic {
            return Err(WalDecodeError::BadMagic {
                found: magic,
                lsn: pageaddr,
            });
        }
        if info & !XLP_ALL_FLAGS != 0 {
            return Err(WalDecodeError::Corrupt {
                lsn: pageaddr,
                msg: format!("invalid page info flags {info:#06x}"),
            });
        }
        Ok(XLogPageHeader {
            magic,
            info,
            tli,
            pageaddr,
            rem_len,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.magic);
        buf.put_u16_le(self.info);
        buf.put_u32_le(self.tli);
        buf.put_u64_le(self.pageaddr.0);
        buf.put_u32_le(self.rem_len);
        buf.put_bytes(0, 4);
    }
}

impl XLogLongPageHeader {
    pub fn decode(buf: &mut Bytes, expect_magic: u16) -> Result<XLogLongPageHeader, WalDecodeError> {
        let std = XLogPageHeader::decode(buf, expect_magic)?;
        if !std.is_long() {
            return Err(WalDecodeError::Corrupt {
                lsn: std.pageaddr,
                msg: "expected long page header at segment start".to_string(),
            });
        }
        if buf.remaining() < SIZE_OF_XLOG_LONG_PHD - SIZE_OF_XLOG_SHORT_PHD {
            return Err(WalDecodeError::ShortRead {
                lsn: std.pageaddr,
                needed: SIZE_OF_XLOG_LONG_PHD - SIZE_OF_XLOG_SHORT_PHD - buf.remaining(),
            });
        }
        let sysid = buf.get_u64_le();
        let seg_size = buf.get_u32_le();
        let xlog_blcksz = buf.get_u32_le();
        if !seg_size.is_power_of_two() {
            return Err(WalDecodeError::Corrupt {
                lsn: std.pageaddr,
                msg: format!("segment size {seg_size} is not a power of two"),
            });
        }
        Ok(XLogLongPageHeader {
            std,
            sysid,
            seg_size,
            xlog_blcksz,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.std.encode(buf);
        buf.put_u64_le(self.sysid);
        buf.put_u32_le(self.seg_size);
        buf.put_u32_le(self.xlog_blcksz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PgMajorVersion;

    #[test]
    fn short_header_roundtrip() {
        let magic = PgMajorVersion::V16.xlog_page_magic();
        let hdr = XLogPageHeader {
            magic,
            info: XLP_FIRST_IS_CONTRECORD,
            tli: 3,
            pageaddr: Lsn(0x2000),
            rem_len: 123,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), SIZE_OF_XLOG_SHORT_PHD);
        let decoded = XLogPageHeader::decode(&mut buf.freeze(), magic).unwrap();
        assert_eq!(decoded, hdr);
        assert!(decoded.first_is_contrecord());
        assert!(!decoded.is_long());
    }

    #[test]
    fn long_header_roundtrip() {
        let magic = PgMajorVersion::V15.xlog_page_magic();
        let hdr = XLogLongPageHeader {
            std: XLogPageHeader {
                magic,
                info: XLP_LONG_HEADER,
                tli: 1,
                pageaddr: Lsn(0x0100_0000),
                rem_len: 0,
            },
            sysid: 0xDEAD_BEEF_0000_0001,
            seg_size: crate::WAL_SEGMENT_SIZE as u32,
            xlog_blcksz: crate::XLOG_BLCKSZ as u32,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), SIZE_OF_XLOG_LONG_PHD);
        let decoded = XLogLongPageHeader::decode(&mut buf.freeze(), magic).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let hdr = XLogPageHeader {
            magic: PgMajorVersion::V13.xlog_page_magic(),
            info: 0,
            tli: 1,
            pageaddr: Lsn(0x4000),
            rem_len: 0,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        let err = XLogPageHeader::decode(&mut buf.freeze(), PgMajorVersion::V16.xlog_page_magic())
            .unwrap_err();
        assert!(matches!(err, WalDecodeError::BadMagic { .. }));
    }
}
