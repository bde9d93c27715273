//! Record encoding.
//!
//! Every record is self-describing and ends with a check size equal to its
//! total encoded length:
//!
//! ```text
//! +------+-------------+---------+---------+---------+----------------------+-------+
//! | Type | FileRecId(4)| Compact | TxId(8) | RecId(8)| Body / Summary (var) | Check |
//! +------+-------------+---------+---------+---------+----------------------+-------+
//! ```
//!
//! Decoding happens in the recovery scanner, which needs the owning file's id
//! and format version.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::RecordType;
use crate::format::FORMAT_VERSION;

/// A payload that knows its encoded size and can write itself into a buffer.
pub trait EncodingSupport {
    /// Number of bytes `encode` writes.
    fn encode_size(&self) -> usize;

    /// Writes the payload.
    fn encode(&self, buf: &mut BytesMut);

    /// Encodes the payload into an owned buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encode_size());
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl EncodingSupport for [u8] {
    fn encode_size(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl<const N: usize> EncodingSupport for [u8; N] {
    fn encode_size(&self) -> usize {
        N
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl EncodingSupport for Vec<u8> {
    fn encode_size(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl EncodingSupport for Bytes {
    fn encode_size(&self) -> usize {
        self.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn to_bytes(&self) -> Bytes {
        self.clone()
    }
}

/// A record to be written, one variant per on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// Non-transactional add.
    Add {
        /// Record id.
        id: u64,
        /// Caller-defined type.
        user_type: u8,
        /// Record body.
        body: Bytes,
    },
    /// Non-transactional update.
    Update {
        /// Record id.
        id: u64,
        /// Caller-defined type.
        user_type: u8,
        /// Record body.
        body: Bytes,
    },
    /// Non-transactional delete.
    Delete {
        /// Record id.
        id: u64,
    },
    /// Transactional add.
    AddTx {
        /// Transaction id.
        tx_id: u64,
        /// Record id.
        id: u64,
        /// Caller-defined type.
        user_type: u8,
        /// Record body.
        body: Bytes,
    },
    /// Transactional update.
    UpdateTx {
        /// Transaction id.
        tx_id: u64,
        /// Record id.
        id: u64,
        /// Caller-defined type.
        user_type: u8,
        /// Record body.
        body: Bytes,
    },
    /// Transactional delete, optionally carrying caller data.
    DeleteTx {
        /// Transaction id.
        tx_id: u64,
        /// Record id.
        id: u64,
        /// Caller data.
        body: Bytes,
    },
    /// Transaction prepare with caller metadata.
    Prepare {
        /// Transaction id.
        tx_id: u64,
        /// Opaque transaction data.
        extra: Bytes,
    },
    /// Transaction commit.
    Commit {
        /// Transaction id.
        tx_id: u64,
    },
    /// Transaction rollback.
    Rollback {
        /// Transaction id.
        tx_id: u64,
    },
}

impl JournalEntry {
    /// Returns the on-disk record type.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Add { .. } => RecordType::Add,
            Self::Update { .. } => RecordType::Update,
            Self::Delete { .. } => RecordType::Delete,
            Self::AddTx { .. } => RecordType::AddTx,
            Self::UpdateTx { .. } => RecordType::UpdateTx,
            Self::DeleteTx { .. } => RecordType::DeleteTx,
            Self::Prepare { .. } => RecordType::Prepare,
            Self::Commit { .. } => RecordType::Commit,
            Self::Rollback { .. } => RecordType::Rollback,
        }
    }

    /// Returns the record id, if the layout carries one.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Add { id, .. }
            | Self::Update { id, .. }
            | Self::Delete { id }
            | Self::AddTx { id, .. }
            | Self::UpdateTx { id, .. }
            | Self::DeleteTx { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Returns the transaction id, if the layout carries one.
    pub fn tx_id(&self) -> Option<u64> {
        match self {
            Self::AddTx { tx_id, .. }
            | Self::UpdateTx { tx_id, .. }
            | Self::DeleteTx { tx_id, .. }
            | Self::Prepare { tx_id, .. }
            | Self::Commit { tx_id }
            | Self::Rollback { tx_id } => Some(*tx_id),
            _ => None,
        }
    }

    fn variable_size(&self) -> usize {
        match self {
            Self::Add { body, .. }
            | Self::Update { body, .. }
            | Self::AddTx { body, .. }
            | Self::UpdateTx { body, .. }
            | Self::DeleteTx { body, .. } => body.len(),
            Self::Prepare { extra, .. } => extra.len(),
            Self::Delete { .. } | Self::Commit { .. } | Self::Rollback { .. } => 0,
        }
    }

    /// Total encoded size in the current format version.
    pub fn encoded_size(&self) -> usize {
        self.record_type().fixed_size(FORMAT_VERSION) + self.variable_size()
    }

    /// Encodes the record into a new buffer.
    ///
    /// `number_of_records` is only written for prepare and commit.
    pub fn encode(&self, file_record_id: u32, compact_count: u8, number_of_records: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf, file_record_id, compact_count, number_of_records);
        buf.freeze()
    }

    /// Encodes the record at the end of `buf`.
    pub fn encode_into(
        &self,
        buf: &mut impl BufMut,
        file_record_id: u32,
        compact_count: u8,
        number_of_records: u32,
    ) {
        buf.put_u8(self.record_type().as_u8());
        buf.put_u32(file_record_id);
        buf.put_u8(compact_count);

        if let Some(tx_id) = self.tx_id() {
            buf.put_u64(tx_id);
        }
        if let Some(id) = self.id() {
            buf.put_u64(id);
        }

        match self {
            Self::Add {
                user_type, body, ..
            }
            | Self::Update {
                user_type, body, ..
            }
            | Self::AddTx {
                user_type, body, ..
            }
            | Self::UpdateTx {
                user_type, body, ..
            } => {
                buf.put_u32(body.len() as u32);
                buf.put_u8(*user_type);
                buf.put_slice(body);
            }
            Self::DeleteTx { body, .. } => {
                buf.put_u32(body.len() as u32);
                buf.put_slice(body);
            }
            Self::Prepare { extra, .. } => {
                buf.put_u32(number_of_records);
                buf.put_u32(extra.len() as u32);
                buf.put_slice(extra);
            }
            Self::Commit { .. } => {
                buf.put_u32(number_of_records);
            }
            Self::Delete { .. } | Self::Rollback { .. } => {}
        }

        buf.put_u32(self.encoded_size() as u32);
    }
}
