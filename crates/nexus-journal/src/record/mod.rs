//! Journal record types and encoding.
//!
//! This module defines the nine record layouts written to journal files.
//! Records are encoded here and decoded by the recovery scanner.

pub mod entry;
pub mod types;

pub use entry::{EncodingSupport, JournalEntry};
pub use types::{RecordInfo, RecordType};
