//! Sequential file and factory traits.

use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::IoCompletion;
use crate::error::JournalResult;

/// A fixed-size file written front to back.
///
/// Implementations keep their own cursor; `read` and `write` advance it.
pub trait SequentialFile: Send + Sync + std::fmt::Debug {
    /// Current file name (no directory).
    fn file_name(&self) -> String;

    /// Opens the file, creating it if missing. The cursor starts at 0.
    fn open(&self) -> JournalResult<()>;

    /// Returns true while the file is open.
    fn is_open(&self) -> bool;

    /// Closes the file. Closing a closed file is a no-op.
    fn close(&self) -> JournalResult<()>;

    /// Returns true if the file exists on disk.
    fn exists(&self) -> bool;

    /// File length in bytes.
    fn size(&self) -> JournalResult<usize>;

    /// Overwrites the first `size` bytes with `fill` and rewinds the cursor.
    fn fill(&self, size: usize, fill: u8) -> JournalResult<()>;

    /// Moves the cursor.
    fn position(&self, pos: usize) -> JournalResult<()>;

    /// Cursor position.
    fn current_position(&self) -> usize;

    /// Reads from the cursor into `buf`, returning the bytes read.
    fn read(&self, buf: &mut [u8]) -> JournalResult<usize>;

    /// Writes at the cursor.
    ///
    /// The completion, if any, is signalled with `done` on success or
    /// `on_error` on failure; failures are also returned.
    fn write(
        &self,
        data: Bytes,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<()>;

    /// Writes at the cursor without a completion.
    fn write_direct(&self, data: Bytes, sync: bool) -> JournalResult<()>;

    /// Flushes written data to stable storage.
    fn sync(&self) -> JournalResult<()>;

    /// Returns true if `size` more bytes fit before the end of the file.
    fn fits(&self, size: usize) -> bool {
        match self.size() {
            Ok(len) => self.current_position() + size <= len,
            Err(_) => false,
        }
    }

    /// Closes the file and renames it within its directory.
    fn rename_to(&self, new_name: &str) -> JournalResult<()>;

    /// Closes and removes the file.
    fn delete(&self) -> JournalResult<()>;

    /// Returns a fresh, closed handle to the same file.
    fn clone_file(&self) -> Arc<dyn SequentialFile>;
}

/// Creates and lists sequential files within one directory.
pub trait SequentialFileFactory: Send + Sync + std::fmt::Debug {
    /// Returns a handle for `name`. The file is not created until opened.
    fn create_sequential_file(&self, name: &str) -> Arc<dyn SequentialFile>;

    /// Lists file names ending in `.<extension>`.
    fn list_files(&self, extension: &str) -> JournalResult<Vec<String>>;

    /// Write alignment in bytes.
    fn alignment(&self) -> usize;

    /// Rounds `size` up to the alignment.
    fn calculate_block_size(&self, size: usize) -> usize {
        let alignment = self.alignment().max(1);
        size.div_ceil(alignment) * alignment
    }

    /// Allocates a write buffer able to hold `size` bytes.
    fn new_buffer(&self, size: usize) -> BytesMut {
        BytesMut::with_capacity(self.calculate_block_size(size))
    }

    /// Returns true if writes complete asynchronously through callbacks.
    fn supports_callbacks(&self) -> bool;

    /// Directory holding the files.
    fn directory(&self) -> &Path;

    /// Creates the directory if missing.
    fn create_dirs(&self) -> JournalResult<()>;
}
