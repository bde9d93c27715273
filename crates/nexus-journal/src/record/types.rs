//! Record type identifiers and decoded record information.

use bytes::Bytes;

use crate::format::{
    self, ADD_RECORD, ADD_RECORD_TX, COMMIT_RECORD, COMPACT_COUNT_VERSION, DELETE_RECORD,
    DELETE_RECORD_TX, PREPARE_RECORD, ROLLBACK_RECORD, UPDATE_RECORD, UPDATE_RECORD_TX,
};

/// Record type identifier, the first byte of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Add a new record.
    Add = ADD_RECORD,
    /// Update an existing record.
    Update = UPDATE_RECORD,
    /// Add a record inside a transaction.
    AddTx = ADD_RECORD_TX,
    /// Update a record inside a transaction.
    UpdateTx = UPDATE_RECORD_TX,
    /// Delete a record inside a transaction.
    DeleteTx = DELETE_RECORD_TX,
    /// Delete a record.
    Delete = DELETE_RECORD,
    /// Transaction prepare (for 2PC).
    Prepare = PREPARE_RECORD,
    /// Transaction commit.
    Commit = COMMIT_RECORD,
    /// Transaction rollback.
    Rollback = ROLLBACK_RECORD,
}

impl RecordType {
    /// Converts the record type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a record type from a u8, or `None` outside the valid range.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            ADD_RECORD => Some(Self::Add),
            UPDATE_RECORD => Some(Self::Update),
            ADD_RECORD_TX => Some(Self::AddTx),
            UPDATE_RECORD_TX => Some(Self::UpdateTx),
            DELETE_RECORD_TX => Some(Self::DeleteTx),
            DELETE_RECORD => Some(Self::Delete),
            PREPARE_RECORD => Some(Self::Prepare),
            COMMIT_RECORD => Some(Self::Commit),
            ROLLBACK_RECORD => Some(Self::Rollback),
            _ => None,
        }
    }

    /// Returns true if the record carries a transaction id.
    pub const fn is_transaction(self) -> bool {
        matches!(
            self,
            Self::AddTx
                | Self::UpdateTx
                | Self::DeleteTx
                | Self::Prepare
                | Self::Commit
                | Self::Rollback
        )
    }

    /// Returns true for prepare, commit and rollback, which carry no record id.
    pub const fn is_complete_transaction(self) -> bool {
        matches!(self, Self::Prepare | Self::Commit | Self::Rollback)
    }

    /// Returns true if the record carries a sized body.
    pub const fn contains_body(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Update | Self::AddTx | Self::UpdateTx | Self::DeleteTx
        )
    }

    /// Returns true if the body is preceded by a user record type byte.
    pub const fn has_user_type(self) -> bool {
        matches!(self, Self::Add | Self::Update | Self::AddTx | Self::UpdateTx)
    }

    /// Returns the fixed (body-less) size of this record for a format version.
    pub const fn fixed_size(self, version: u32) -> usize {
        let size = match self {
            Self::Add | Self::Update => format::SIZE_ADD_RECORD,
            Self::AddTx | Self::UpdateTx => format::SIZE_ADD_RECORD_TX,
            Self::DeleteTx => format::SIZE_DELETE_RECORD_TX,
            Self::Delete => format::SIZE_DELETE_RECORD,
            Self::Prepare => format::SIZE_PREPARE_RECORD,
            Self::Commit => format::SIZE_COMMIT_RECORD,
            Self::Rollback => format::SIZE_ROLLBACK_RECORD,
        };
        if version >= COMPACT_COUNT_VERSION {
            size + format::SIZE_BYTE
        } else {
            size
        }
    }
}

/// A record decoded by the recovery scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// Caller-chosen record id.
    pub id: u64,
    /// Caller-defined record type byte.
    pub user_record_type: u8,
    /// Record body.
    pub data: Bytes,
    /// True when decoded from an update record.
    pub is_update: bool,
    /// Number of compactions this copy has survived.
    pub compact_count: u8,
}

impl RecordInfo {
    /// Creates a new record info.
    pub fn new(
        id: u64,
        user_record_type: u8,
        data: Bytes,
        is_update: bool,
        compact_count: u8,
    ) -> Self {
        Self {
            id,
            user_record_type,
            data,
            is_update,
            compact_count,
        }
    }
}
