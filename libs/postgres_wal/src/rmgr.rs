//! Resource manager ids. Each rmgr namespaces its own record subtypes in
//! the high bits of `xl_info`; the per-rmgr layouts live in
//! [`crate::rmgr_desc`].

use crate::{Lsn, WalDecodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RmgrId {
    Xlog = 0,
    Transaction = 1,
    Storage = 2,
    Clog = 3,
    Database = 4,
    Tablespace = 5,
    MultiXact = 6,
    RelMap = 7,
    Standby = 8,
    Heap2 = 9,
    Heap = 10,
    Btree = 11,
    Hash = 12,
    Gin = 13,
    Gist = 14,
    Sequence = 15,
    SpGist = 16,
    Brin = 17,
    CommitTs = 18,
    ReplicationOrigin = 19,
    Generic = 20,
    LogicalMessage = 21,
}

pub const RM_MAX_ID: u8 = RmgrId::LogicalMessage as u8;

impl RmgrId {
    pub fn from_u8(rmid: u8, lsn: Lsn) -> Result<RmgrId, WalDecodeError> {
        use RmgrId::*;
        Ok(match rmid {
            0 => Xlog,
            1 => Transaction,
            2 => Storage,
            3 => Clog,
            4 => Database,
            5 => Tablespace,
            6 => MultiXact,
            7 => RelMap,
            8 => Standby,
            9 => Heap2,
            10 => Heap,
            11 => Btree,
            12 => Hash,
            13 => Gin,
            14 => Gist,
            15 => Sequence,
            16 => SpGist,
            17 => Brin,
            18 => CommitTs,
            19 => ReplicationOrigin,
            20 => Generic,
            21 => LogicalMessage,
            other => return Err(WalDecodeError::UnknownRmgr { rmid: other, lsn }),
        })
    }

    pub fn name(self) -> &'static str {
        use RmgrId::*;
        match self {
            Xlog => "XLOG",
            Transaction => "Transaction",
            Storage => "Storage",
            Clog => "CLOG",
            Database => "Database",
            Tablespace => "Tablespace",
            MultiXact => "MultiXact",
            RelMap => "RelMap",
            Standby => "Standby",
            Heap2 => "Heap2",
            Heap => "Heap",
            Btree => "Btree",
            Hash => "Hash",
            Gin => "Gin",
            Gist => "Gist",
            Sequence => "Sequence",
            SpGist => "SPGist",
            Brin => "BRIN",
            CommitTs => "CommitTs",
            ReplicationOrigin => "ReplicationOrigin",
            Generic => "Generic",
            LogicalMessage => "LogicalMessage",
        }
    }
}

impl std::fmt::Display for RmgrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rmgr_is_an_error() {
        assert!(RmgrId::from_u8(10, Lsn(0)).is_ok());
        let err = RmgrId::from_u8(99, Lsn(0x10)).unwrap_err();
        assert!(matches!(err, WalDecodeError::UnknownRmgr { rmid: 99, .. }));
    }
}
