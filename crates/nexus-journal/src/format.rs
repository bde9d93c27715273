//! On-disk format constants for the journal.
//!
//! Shared by the record codec, the recovery scanner, file headers and the
//! compaction control file. Every multi-byte field is big-endian.

// =============================================================================
// Format Versions
// =============================================================================

/// Format version written into every new file header.
///
/// Version 2 added the one-byte compaction counter to every record.
pub const FORMAT_VERSION: u32 = 2;

/// Older format versions that can still be read (but are never written).
pub const COMPATIBLE_VERSIONS: &[u32] = &[1];

/// First format version carrying the compaction counter byte.
pub const COMPACT_COUNT_VERSION: u32 = 2;

// =============================================================================
// File Layout
// =============================================================================

/// File header size: format version (4), user version (4), file id (8).
pub const SIZE_HEADER: usize = 4 + 4 + 8;

/// Smallest journal file size accepted by the configuration.
pub const MIN_FILE_SIZE: usize = 1024;

/// Byte used to pre-fill fresh files.
///
/// Must stay outside the record type range so the scanner skips it.
pub const FILL_BYTE: u8 = 0;

/// Extension appended to compacted output until it is published.
pub const COMPACT_EXTENSION: &str = "cmp";

/// Extension appended to files while they are being created.
pub const TMP_EXTENSION: &str = "tmp";

/// Name of the compaction control file.
pub const CONTROL_FILE_NAME: &str = "journal-rst-files.ctr";

/// Records that survived this many compactions are segregated into their own
/// output file during the next compaction.
pub const COMPACT_SPLIT_LINE: u8 = 2;

// =============================================================================
// Primitive Sizes
// =============================================================================

/// Size of a byte field.
pub const SIZE_BYTE: usize = 1;

/// Size of an int field.
pub const SIZE_INT: usize = 4;

/// Size of a long field.
pub const SIZE_LONG: usize = 8;

// =============================================================================
// Record Type Bytes
// =============================================================================

/// Non-transactional add.
pub const ADD_RECORD: u8 = 11;

/// Non-transactional update.
pub const UPDATE_RECORD: u8 = 12;

/// Transactional add.
pub const ADD_RECORD_TX: u8 = 13;

/// Transactional update.
pub const UPDATE_RECORD_TX: u8 = 14;

/// Transactional delete.
pub const DELETE_RECORD_TX: u8 = 15;

/// Non-transactional delete.
pub const DELETE_RECORD: u8 = 16;

/// Transaction prepare.
pub const PREPARE_RECORD: u8 = 17;

/// Transaction commit.
pub const COMMIT_RECORD: u8 = 18;

/// Transaction rollback.
pub const ROLLBACK_RECORD: u8 = 19;

// =============================================================================
// Fixed Record Sizes (format version 1; version 2 adds SIZE_BYTE)
// =============================================================================

/// Record type (1) + file record id (4) + trailing check size (4).
pub const BASIC_SIZE: usize = SIZE_BYTE + SIZE_INT + SIZE_INT;

/// Add/update: record id, user type, body size.
pub const SIZE_ADD_RECORD: usize = BASIC_SIZE + SIZE_LONG + SIZE_BYTE + SIZE_INT;

/// Transactional add/update: tx id, record id, user type, body size.
pub const SIZE_ADD_RECORD_TX: usize = BASIC_SIZE + SIZE_LONG + SIZE_BYTE + SIZE_LONG + SIZE_INT;

/// Transactional delete: tx id, record id, body size.
pub const SIZE_DELETE_RECORD_TX: usize = BASIC_SIZE + SIZE_LONG + SIZE_LONG + SIZE_INT;

/// Delete: record id.
pub const SIZE_DELETE_RECORD: usize = BASIC_SIZE + SIZE_LONG;

/// Commit: tx id, number of records.
pub const SIZE_COMMIT_RECORD: usize = BASIC_SIZE + SIZE_LONG + SIZE_INT;

/// Prepare: tx id, number of records, extra data size.
pub const SIZE_PREPARE_RECORD: usize = SIZE_COMMIT_RECORD + SIZE_INT;

/// Rollback: tx id.
pub const SIZE_ROLLBACK_RECORD: usize = BASIC_SIZE + SIZE_LONG;

/// Returns the name of a journal file for the given id.
pub fn file_name(prefix: &str, file_id: u64, extension: &str) -> String {
    format!("{}-{}.{}", prefix, file_id, extension)
}

/// Appends an extra extension (`cmp`, `tmp`) to a file name.
pub fn with_extension(name: &str, extension: &str) -> String {
    format!("{}.{}", name, extension)
}

/// Strips a trailing extra extension, returning the name unchanged when absent.
pub fn strip_extension<'a>(name: &'a str, extension: &str) -> &'a str {
    name.strip_suffix(extension)
        .and_then(|n| n.strip_suffix('.'))
        .unwrap_or(name)
}

/// Parses the numeric id out of `<prefix>-<id>.<ext>`, returning 0 on mismatch.
pub fn file_name_id(prefix: &str, name: &str) -> u64 {
    name.strip_prefix(prefix)
        .and_then(|n| n.strip_prefix('-'))
        .and_then(|n| n.split('.').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
