//! On-disk WAL format: segment naming, page framing, record decoding and
//! re-encoding, resource-manager descriptors, and block-reference
//! summarization.
//!
//! The format is reproduced for server versions 13 through 17. Layouts that
//! drifted between majors (page magic, full-page-image flags, several rmgr
//! main-data structs) are modeled as explicit per-version variants selected
//! by [`PgMajorVersion`] at decode time.

pub mod decode;
pub mod encode;
pub mod page;
pub mod pg_constants;
pub mod record;
pub mod rmgr;
pub mod rmgr_desc;
pub mod summary;

use std::fmt;
use std::str::FromStr;

pub use utils::lsn::Lsn;

/// Default WAL segment size, 16 MiB. The actual size is carried by the long
/// page header of every segment and may be any power of two the server was
/// initialized with.
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// WAL page size. Fixed at compile time on the server side.
pub const XLOG_BLCKSZ: usize = 8192;

/// Relation block size; full-page images are this large.
pub const BLCKSZ: u16 = 8192;

/// `MAXALIGN` of the server: records are aligned to this many bytes.
pub const MAXALIGN: u32 = 8;

pub type TimeLineId = u32;
pub type XLogSegNo = u64;
pub type TransactionId = u32;
pub type Oid = u32;
pub type BlockNumber = u32;
pub type RepOriginId = u16;
pub type TimestampTz = i64;

/// Round `n` up to the next multiple of [`MAXALIGN`].
#[inline]
pub const fn maxalign(n: u32) -> u32 {
    (n + MAXALIGN - 1) & !(MAXALIGN - 1)
}

/// Supported server major versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PgMajorVersion {
    V13,
    V14,
    V15,
    V16,
    V17,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported PostgreSQL major version {0}")]
pub struct UnsupportedVersion(pub u32);

impl PgMajorVersion {
    pub fn from_major(major: u32) -> Result<Self, UnsupportedVersion> {
        match major {
            13 => Ok(PgMajorVersion::V13),
            14 => Ok(PgMajorVersion::V14),
            15 => Ok(PgMajorVersion::V15),
            16 => Ok(PgMajorVersion::V16),
            17 => Ok(PgMajorVersion::V17),
            other => Err(UnsupportedVersion(other)),
        }
    }

    pub fn major(self) -> u32 {
        match self {
            PgMajorVersion::V13 => 13,
            PgMajorVersion::V14 => 14,
            PgMajorVersion::V15 => 15,
            PgMajorVersion::V16 => 16,
            PgMajorVersion::V17 => 17,
        }
    }

    /// WAL page magic for this major.
    pub fn xlog_page_magic(self) -> u16 {
        match self {
            PgMajorVersion::V13 => 0xD106,
            PgMajorVersion::V14 => 0xD10D,
            PgMajorVersion::V15 => 0xD110,
            PgMajorVersion::V16 => 0xD113,
            PgMajorVersion::V17 => 0xD116,
        }
    }

    /// Reverse lookup from the magic found in a page header.
    pub fn from_xlog_page_magic(magic: u16) -> Option<Self> {
        match magic {
            0xD106 => Some(PgMajorVersion::V13),
            0xD10D => Some(PgMajorVersion::V14),
            0xD110 => Some(PgMajorVersion::V15),
            0xD113 => Some(PgMajorVersion::V16),
            0xD116 => Some(PgMajorVersion::V17),
            _ => None,
        }
    }
}

impl fmt::Display for PgMajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major())
    }
}

impl FromStr for PgMajorVersion {
    type Err = UnsupportedVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let major: u32 = s.parse().map_err(|_| UnsupportedVersion(0))?;
        PgMajorVersion::from_major(major)
    }
}

/// Errors produced while decoding WAL.
#[derive(thiserror::Error, Debug)]
pub enum WalDecodeError {
    #[error("invalid page magic {found:#06x} at {lsn}")]
    BadMagic { found: u16, lsn: Lsn },
    #[error("CRC mismatch for record at {lsn}: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        lsn: Lsn,
        expected: u32,
        computed: u32,
    },
    #[error("unknown resource manager id {rmid} at {lsn}")]
    UnknownRmgr { rmid: u8, lsn: Lsn },
    #[error("unknown record type {info:#04x} for {rmgr} at {lsn}")]
    UnknownRecordType { rmgr: &'static str, info: u8, lsn: Lsn },
    #[error("corrupt WAL at {lsn}: {msg}")]
    Corrupt { lsn: Lsn, msg: String },
    #[error("short read: need {needed} more bytes at {lsn}")]
    ShortRead { lsn: Lsn, needed: usize },
}

/// Number of segments per logical xlog file (the middle component of a
/// segment file name).
#[inline]
pub fn segments_per_xlog_id(seg_size: usize) -> u64 {
    0x1_0000_0000 / seg_size as u64
}

/// Build a WAL segment file name: `<tli:8X><hi:8X><lo:8X>`.
#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineId, seg_no: XLogSegNo, seg_size: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        seg_no / segments_per_xlog_id(seg_size),
        seg_no % segments_per_xlog_id(seg_size)
    )
}

/// Parse a WAL segment file name back into `(segno, timeline)`.
#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, seg_size: usize) -> Option<(XLogSegNo, TimeLineId)> {
    if fname.len() != 24 || !fname.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u64::from_str_radix(&fname[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&fname[16..24], 16).ok()?;
    Some((log * segments_per_xlog_id(seg_size) + seg, tli))
}

/// True for a plain (complete) WAL segment file name.
pub fn is_xlog_file_name(fname: &str) -> bool {
    fname.len() == 24 && fname.bytes().all(|b| b.is_ascii_hexdigit())
}

/// True for a `.partial` WAL segment file name.
pub fn is_partial_xlog_file_name(fname: &str) -> bool {
    fname
        .strip_suffix(".partial")
        .map(is_xlog_file_name)
        .unwrap_or(false)
}

/// True for a timeline history file name.
pub fn is_history_file_name(fname: &str) -> bool {
    fname
        .strip_suffix(".history")
        .map(|stem| stem.len() == 8 && stem.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// First LSN of the given segment.
pub fn seg_no_to_lsn(seg_no: XLogSegNo, seg_size: usize) -> Lsn {
    Lsn(seg_no * seg_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names() {
        let seg_size = WAL_SEGMENT_SIZE;
        assert_eq!(XLogFileName(1, 1, seg_size), "000000010000000000000001");
        // segno 256 crosses into the next logical xlog file at 16MiB segments
        assert_eq!(XLogFileName(1, 256, seg_size), "000000010000000100000000");
        assert_eq!(
            XLogFromFileName("000000010000000100000000", seg_size),
            Some((256, 1))
        );
        assert_eq!(XLogFromFileName("garbage", seg_size), None);
    }

    #[test]
    fn file_name_classification() {
        assert!(is_xlog_file_name("000000010000000000000001"));
        assert!(!is_xlog_file_name("00000001000000000000000G"));
        assert!(is_partial_xlog_file_name("000000010000000000000001.partial"));
        assert!(!is_partial_xlog_file_name("000000010000000000000001"));
        assert!(is_history_file_name("00000002.history"));
        assert!(!is_history_file_name("0000000G.history"));
        assert!(!is_history_file_name("00000002.partial"));
    }

    #[test]
    fn version_magic_roundtrip() {
        for v in [
            PgMajorVersion::V13,
            PgMajorVersion::V14,
            PgMajorVersion::V15,
            PgMajorVersion::V16,
            PgMajorVersion::V17,
        ] {
            assert_eq!(PgMajorVersion::from_xlog_page_magic(v.xlog_page_magic()), Some(v));
        }
        assert_eq!(PgMajorVersion::from_xlog_page_magic(0xBEEF), None);
    }

    #[test]
    fn alignment() {
        assert_eq!(maxalign(0), 0);
        assert_eq!(maxalign(1), 8);
        assert_eq!(maxalign(8), 8);
        assert_eq!(maxalign(25), 32);
    }
}
