//! # nexus-journal
//!
//! Transactional record journal for NexusDB.
//!
//! This crate implements an append-only journal over a pool of
//! pre-allocated, fixed-size files with:
//! - Adds, updates and deletes of caller-identified records
//! - Transactions with prepare, commit and rollback
//! - Recovery that tolerates torn writes at any record boundary
//! - Reclaiming of files whose records are all superseded
//! - Online compaction of sparsely used files
//!
//! # Architecture
//!
//! Files are written sequentially and recycled once nothing in them is
//! live. Each file starts with a small header identifying it; every record
//! carries the id of the file use it was written for, so stale records left
//! over from a previous use are skipped on recovery.
//!
//! ## File Format
//!
//! ```text
//! +-------------+------------------+-------------+
//! | Version (4) | User Version (4) | File Id (8) |
//! +-------------+------------------+-------------+
//! | Record | Record | ... | zero fill           |
//! +----------------------------------------------+
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use nexus_journal::{Journal, JournalConfig};
//!
//! # fn main() -> nexus_journal::JournalResult<()> {
//! let journal = Journal::new(JournalConfig::new("/var/lib/nexus/journal"))?;
//! journal.start()?;
//! let loaded = journal.load_records(None)?;
//! println!("recovered {} records", loaded.committed.len());
//!
//! journal.append_add_record(1, 0, &b"hello"[..], true)?;
//! journal.stop()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod compactor;
mod config;
mod error;
mod journal_record;
mod reclaimer;
mod repository;
mod transaction;

/// On-disk format constants and file naming.
pub mod format;

/// Record types and encoding.
pub mod record;

/// Sequential file abstraction.
pub mod file;

/// Single-threaded task executors.
pub mod executor;

/// Journal files and their headers.
pub mod journal_file;

/// Recovery scanner.
pub mod reader;

/// Compaction control file.
pub mod control;

/// Load callbacks and results.
pub mod loader;

/// Main journal engine.
pub mod journal;

// Re-exports for convenience
pub use config::JournalConfig;
pub use error::{JournalError, JournalResult};
pub use file::{IoCompletion, SequentialFile, SequentialFileFactory, StdFileFactory, WaitCompletion};
pub use journal::{Journal, JournalState, SynchronizationGuard};
pub use journal_file::JournalFile;
pub use loader::{
    JournalLoadInformation, LoadedRecords, LoaderCallback, NullLoader, PreparedTransactionInfo,
    TransactionFailureCallback,
};
pub use record::{JournalEntry, RecordInfo, RecordType};
