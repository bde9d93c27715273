//! Sequential file abstraction for the journal.
//!
//! The journal never touches `std::fs` directly. Every file it creates, opens,
//! renames or deletes goes through a [`SequentialFileFactory`], so tests and
//! alternative backends can swap the storage layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        SequentialFileFactory            │
//! │  (create, list, alignment, buffers)     │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │          SequentialFile Trait           │
//! │ (open, fill, position, read, write,     │
//! │  rename, delete)                        │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │     StdSequentialFile (std::fs)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Writes carry an optional [`IoCompletion`] that is signalled once the data
//! is written (and synced, when requested).

mod completion;
mod sequential;
mod std_file;

pub use completion::{IoCompletion, WaitCompletion};
pub use sequential::{SequentialFile, SequentialFileFactory};
pub use std_file::{StdFileFactory, StdSequentialFile};

/// Size of the zero-filled chunks used to pre-allocate files.
pub const FILL_CHUNK_SIZE: usize = 64 * 1024;
