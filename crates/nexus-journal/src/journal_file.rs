//! Journal file bookkeeping and file headers.
//!
//! A [`JournalFile`] wraps a physical sequential file with the identity and
//! counters the reclaimer needs. The physical name of a file is reused across
//! its lifetime, the file id is not: every recycle assigns a fresh, larger id
//! which is also stamped into the header.
//!
//! # File Header
//!
//! ```text
//! +----------------+----------------+----------------+
//! | Version (4)    | UserVersion (4)| File ID (8)    |
//! +----------------+----------------+----------------+
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{JournalError, JournalResult};
use crate::file::SequentialFile;
use crate::format::{FORMAT_VERSION, SIZE_HEADER};

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version the file was written with.
    pub version: u32,
    /// Caller-defined version.
    pub user_version: u32,
    /// File id.
    pub file_id: u64,
}

impl FileHeader {
    /// Creates a header in the current format version.
    pub fn new(user_version: u32, file_id: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            user_version,
            file_id,
        }
    }

    /// Encodes the header.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.version);
        buf.put_u32(self.user_version);
        buf.put_u64(self.file_id);
    }

    /// Decodes a header from at least `SIZE_HEADER` bytes.
    pub fn decode(mut buf: impl Buf) -> Option<Self> {
        if buf.remaining() < SIZE_HEADER {
            return None;
        }
        Some(Self {
            version: buf.get_u32(),
            user_version: buf.get_u32(),
            file_id: buf.get_u64(),
        })
    }

    /// Encodes the header into an owned buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SIZE_HEADER);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Reads the header of an open file. Leaves the cursor after the header.
pub fn read_file_header(file: &dyn SequentialFile) -> JournalResult<FileHeader> {
    let mut buf = [0u8; SIZE_HEADER];
    file.position(0)?;
    let read = file.read(&mut buf)?;
    FileHeader::decode(&buf[..read]).ok_or_else(|| JournalError::ShortRead {
        file: file.file_name(),
        expected: SIZE_HEADER,
        read,
    })
}

/// Writes a fresh header at the start of an open file and syncs it.
pub fn init_file_header(
    file: &dyn SequentialFile,
    user_version: u32,
    file_id: u64,
) -> JournalResult<()> {
    file.position(0)?;
    file.write_direct(FileHeader::new(user_version, file_id).to_bytes(), true)
}

/// A physical journal file plus its reclamation counters.
pub struct JournalFile {
    file: Arc<dyn SequentialFile>,
    file_id: u64,
    version: u32,
    pos_count: AtomicU32,
    live_size: AtomicI64,
    total_negative_to_others: AtomicU32,
    neg_counts: Mutex<HashMap<u64, u32>>,
    can_reclaim: AtomicBool,
}

impl JournalFile {
    /// Creates bookkeeping for a file with the given id and format version.
    pub fn new(file: Arc<dyn SequentialFile>, file_id: u64, version: u32) -> Self {
        Self {
            file,
            file_id,
            version,
            pos_count: AtomicU32::new(0),
            live_size: AtomicI64::new(0),
            total_negative_to_others: AtomicU32::new(0),
            neg_counts: Mutex::new(HashMap::new()),
            can_reclaim: AtomicBool::new(false),
        }
    }

    /// Returns the physical file.
    pub fn file(&self) -> &Arc<dyn SequentialFile> {
        &self.file
    }

    /// Returns the file id.
    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    /// Id stamped into every record of this file (low 32 bits of the file id).
    pub fn record_id(&self) -> u32 {
        (self.file_id & 0xFFFF_FFFF) as u32
    }

    /// Format version of the file.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the current file name.
    pub fn file_name(&self) -> String {
        self.file.file_name()
    }

    /// Number of positive references (adds, updates, transaction touches).
    pub fn pos_count(&self) -> u32 {
        self.pos_count.load(Ordering::Acquire)
    }

    /// Adds a positive reference.
    pub fn inc_pos_count(&self) {
        self.pos_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Removes a positive reference.
    pub fn dec_pos_count(&self) {
        let _ = self
            .pos_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            });
    }

    /// Bytes of live record data held in this file.
    pub fn live_size(&self) -> i64 {
        self.live_size.load(Ordering::Acquire)
    }

    /// Adds live bytes.
    pub fn add_size(&self, bytes: usize) {
        self.live_size.fetch_add(bytes as i64, Ordering::AcqRel);
    }

    /// Removes live bytes.
    pub fn dec_size(&self, bytes: usize) {
        self.live_size.fetch_sub(bytes as i64, Ordering::AcqRel);
    }

    /// Records one negative in this file against `target`.
    pub fn inc_neg_count(&self, target: &JournalFile) {
        *self.neg_counts.lock().entry(target.file_id).or_insert(0) += 1;
        if target.file_id != self.file_id {
            self.total_negative_to_others.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Negatives in this file against `target`.
    pub fn neg_count(&self, target: &JournalFile) -> u32 {
        self.neg_count_for(target.file_id)
    }

    /// Negatives in this file against the file with `file_id`.
    pub fn neg_count_for(&self, file_id: u64) -> u32 {
        self.neg_counts.lock().get(&file_id).copied().unwrap_or(0)
    }

    /// Negatives in this file against other files.
    pub fn total_negative_to_others(&self) -> u32 {
        self.total_negative_to_others.load(Ordering::Acquire)
    }

    /// Ids of the files this file holds negatives against.
    pub fn neg_targets(&self) -> Vec<u64> {
        self.neg_counts.lock().keys().copied().collect()
    }

    /// Set by the reclaimer.
    pub fn set_can_reclaim(&self, can_reclaim: bool) {
        self.can_reclaim.store(can_reclaim, Ordering::Release);
    }

    /// Result of the last reclaimer pass.
    pub fn is_can_reclaim(&self) -> bool {
        self.can_reclaim.load(Ordering::Acquire)
    }
}

impl PartialEq for JournalFile {
    fn eq(&self, other: &Self) -> bool {
        self.file_id == other.file_id
    }
}

impl Eq for JournalFile {}

impl std::fmt::Debug for JournalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalFile")
            .field("name", &self.file.file_name())
            .field("file_id", &self.file_id)
            .field("version", &self.version)
            .field("pos_count", &self.pos_count())
            .field("live_size", &self.live_size())
            .field("total_negative_to_others", &self.total_negative_to_others())
            .field("can_reclaim", &self.is_can_reclaim())
            .finish()
    }
}

impl std::fmt::Display for JournalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JournalFile[{}, id={}]", self.file.file_name(), self.file_id)
    }
}
