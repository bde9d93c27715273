//! In-memory index entry for a live record.

use std::sync::Arc;

use crate::journal_file::JournalFile;

/// Where a live record and its updates are stored.
///
/// Every file holding a copy gets one positive count and the copy's size as
/// live data. Deleting the record writes one negative per copy into the
/// deleting file.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    file: Arc<JournalFile>,
    size: usize,
    update_files: Vec<(Arc<JournalFile>, usize)>,
}

impl JournalRecord {
    /// Creates an entry for a record added to `file`.
    pub fn new(file: Arc<JournalFile>, size: usize) -> Self {
        file.inc_pos_count();
        file.add_size(size);
        Self {
            file,
            size,
            update_files: Vec::new(),
        }
    }

    /// Records an update copy written to `file`.
    pub fn add_update_file(&mut self, file: Arc<JournalFile>, size: usize) {
        file.inc_pos_count();
        file.add_size(size);
        self.update_files.push((file, size));
    }

    /// Accounts for a delete written to `file`.
    pub fn delete(&self, file: &JournalFile) {
        file.inc_neg_count(&self.file);
        self.file.dec_size(self.size);
        for (update_file, size) in &self.update_files {
            file.inc_neg_count(update_file);
            update_file.dec_size(*size);
        }
    }

    /// File holding the original add.
    pub fn file(&self) -> &Arc<JournalFile> {
        &self.file
    }

    /// Encoded size of the original add.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Files holding update copies, in write order.
    pub fn update_files(&self) -> &[(Arc<JournalFile>, usize)] {
        &self.update_files
    }
}
