//! Journal file registry.
//!
//! The repository owns three pools of files:
//! - **Data files**: closed files holding records, oldest first
//! - **Free files**: zero-filled files with a fresh header, ready for reuse
//! - **Opened files**: free files already opened by the files executor so a
//!   rotation never waits on file creation
//!
//! File ids are handed out from one counter that only grows. A recycled file
//! keeps its physical name but receives a new id in its header, so the load
//! order is recovered from headers, never from names.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::executor::SingleWorkerExecutor;
use crate::file::{SequentialFile, SequentialFileFactory};
use crate::format::{
    self, COMPACT_EXTENSION, COMPATIBLE_VERSIONS, FILL_BYTE, FORMAT_VERSION, SIZE_HEADER,
    TMP_EXTENSION,
};
use crate::journal_file::{init_file_header, read_file_header, JournalFile};

/// Pools of journal files plus the file id counter.
pub struct JournalFilesRepository {
    factory: Arc<dyn SequentialFileFactory>,
    config: JournalConfig,
    data_files: Mutex<VecDeque<Arc<JournalFile>>>,
    free_files: Mutex<VecDeque<Arc<JournalFile>>>,
    opened_files: Mutex<VecDeque<Arc<JournalFile>>>,
    opened_available: Condvar,
    next_file_id: AtomicU64,
    executor: RwLock<Option<Arc<SingleWorkerExecutor>>>,
}

impl JournalFilesRepository {
    /// Creates an empty repository over `factory`.
    pub fn new(factory: Arc<dyn SequentialFileFactory>, config: JournalConfig) -> Self {
        Self {
            factory,
            config,
            data_files: Mutex::new(VecDeque::new()),
            free_files: Mutex::new(VecDeque::new()),
            opened_files: Mutex::new(VecDeque::new()),
            opened_available: Condvar::new(),
            next_file_id: AtomicU64::new(0),
            executor: RwLock::new(None),
        }
    }

    /// Sets the executor used for opening and closing files.
    ///
    /// Without an executor every task runs on the calling thread.
    pub fn set_executor(&self, executor: Option<Arc<SingleWorkerExecutor>>) {
        *self.executor.write() = executor;
    }

    /// Runs `task` on the files executor, or inline when none is set.
    pub fn execute<F>(&self, task: F) -> JournalResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = self.executor.read().clone();
        match executor {
            Some(executor) => executor.execute(task),
            None => {
                task();
                Ok(())
            }
        }
    }

    /// Returns the file factory.
    pub fn factory(&self) -> &Arc<dyn SequentialFileFactory> {
        &self.factory
    }

    /// Returns the configured file size.
    pub fn file_size(&self) -> usize {
        self.config.file_size
    }

    /// Returns the configured minimum number of files.
    pub fn min_files(&self) -> usize {
        self.config.min_files
    }

    /// Returns the file name prefix.
    pub fn file_prefix(&self) -> &str {
        &self.config.file_prefix
    }

    /// Returns the file name extension.
    pub fn file_extension(&self) -> &str {
        &self.config.file_extension
    }

    /// Returns the user version stamped into headers.
    pub fn user_version(&self) -> u32 {
        self.config.user_version
    }

    /// Drops every pool, closing pre-opened files.
    pub fn clear(&self) {
        self.data_files.lock().clear();
        self.free_files.lock().clear();
        let opened: Vec<_> = self.opened_files.lock().drain(..).collect();
        for file in opened {
            if let Err(e) = file.file().close() {
                warn!(file = %file, error = %e, "failed to close pre-opened file");
            }
        }
    }

    // =========================================================================
    // Data Files
    // =========================================================================

    /// Snapshot of the data files, oldest first.
    pub fn data_files(&self) -> Vec<Arc<JournalFile>> {
        self.data_files.lock().iter().cloned().collect()
    }

    /// Number of data files.
    pub fn data_files_count(&self) -> usize {
        self.data_files.lock().len()
    }

    /// Removes and returns every data file.
    pub fn take_data_files(&self) -> Vec<Arc<JournalFile>> {
        self.data_files.lock().drain(..).collect()
    }

    /// Adds a data file before all others.
    pub fn add_data_file_on_top(&self, file: Arc<JournalFile>) {
        self.data_files.lock().push_front(file);
    }

    /// Adds a data file after all others.
    pub fn add_data_file_on_bottom(&self, file: Arc<JournalFile>) {
        self.data_files.lock().push_back(file);
    }

    /// Removes a data file. Returns false if it was not registered.
    pub fn remove_data_file(&self, file: &JournalFile) -> bool {
        let mut files = self.data_files.lock();
        match files.iter().position(|f| f.file_id() == file.file_id()) {
            Some(index) => {
                files.remove(index);
                true
            }
            None => {
                warn!(file = %file, "could not remove file from data files");
                false
            }
        }
    }

    /// Removes and returns the newest data file.
    pub fn poll_last_data_file(&self) -> Option<Arc<JournalFile>> {
        self.data_files.lock().pop_back()
    }

    // =========================================================================
    // Free And Opened Files
    // =========================================================================

    /// Snapshot of the free files.
    pub fn free_files(&self) -> Vec<Arc<JournalFile>> {
        self.free_files.lock().iter().cloned().collect()
    }

    /// Number of free files.
    pub fn free_files_count(&self) -> usize {
        self.free_files.lock().len()
    }

    /// Number of pre-opened files waiting for a rotation.
    pub fn opened_files_count(&self) -> usize {
        self.opened_files.lock().len()
    }

    /// Creates free files until data plus free files reach `min_files`.
    pub fn ensure_min_files(&self) -> JournalResult<()> {
        let existing = self.data_files_count() + self.free_files_count();
        let to_create = self.config.min_files.saturating_sub(existing);
        for _ in 0..to_create {
            let file = self.create_file(false, true, false, None)?;
            self.free_files.lock().push_back(file);
        }
        if to_create > 0 {
            debug!(created = to_create, "created journal files to reach the minimum");
        }
        Ok(())
    }

    /// Returns a file to the free pool, or deletes it.
    ///
    /// Files of the wrong size are always deleted. With `check_delete` a file
    /// is only kept while the pools are below `min_files`. A kept file gets a
    /// new id and header. With `rename_tmp` a trailing `.tmp` is stripped.
    pub fn add_free_file(
        &self,
        file: &JournalFile,
        rename_tmp: bool,
        check_delete: bool,
    ) -> JournalResult<()> {
        let size = match file.file().size() {
            Ok(size) => size,
            Err(e) => {
                warn!(file = %file, error = %e, "could not read file size");
                0
            }
        };

        if size != self.config.file_size {
            debug!(file = %file, size, "deleting journal file with unexpected size");
            return file.file().delete();
        }

        let pooled = self.free_files_count() + self.data_files_count() + 1 + self.opened_files_count();
        if !check_delete || pooled < self.config.min_files {
            let recycled = self.reinitialize_file(file)?;
            if rename_tmp {
                let sf = recycled.file();
                let name = sf.file_name();
                sf.rename_to(format::strip_extension(&name, TMP_EXTENSION))?;
            }
            trace!(file = %recycled, previous_id = file.file_id(), "recycled journal file");
            self.free_files.lock().push_back(recycled);
            Ok(())
        } else {
            debug!(file = %file, "deleting surplus journal file");
            file.file().delete()
        }
    }

    /// Takes a free file, creating one when the pool is empty.
    pub fn take_file(
        &self,
        keep_open: bool,
        init: bool,
        tmp_compact: bool,
    ) -> JournalResult<Arc<JournalFile>> {
        let pooled = self.free_files.lock().pop_front();
        match pooled {
            Some(file) => {
                if tmp_compact {
                    let sf = file.file();
                    let name = sf.file_name();
                    sf.rename_to(&format::with_extension(&name, COMPACT_EXTENSION))?;
                }
                if keep_open {
                    self.open_journal_file(&file)?;
                }
                Ok(file)
            }
            None => self.create_file(keep_open, init, tmp_compact, None),
        }
    }

    /// Returns a free file without opening it.
    pub fn free_file(&self) -> JournalResult<Arc<JournalFile>> {
        self.take_file(false, true, false)
    }

    /// Opens `file` and positions it after the header.
    pub fn open_journal_file(&self, file: &JournalFile) -> JournalResult<()> {
        let sf = file.file();
        sf.open()?;
        sf.position(self.factory.calculate_block_size(SIZE_HEADER))
    }

    /// Returns the next file to write to.
    ///
    /// Schedules another file to be pre-opened, then waits up to the open
    /// file timeout for a pre-opened one before creating one inline.
    pub fn open_file(self: &Arc<Self>) -> JournalResult<Arc<JournalFile>> {
        self.schedule_push_opened_file()?;

        let deadline = Instant::now() + self.config.open_file_timeout;
        let mut opened = self.opened_files.lock();
        loop {
            if let Some(file) = opened.pop_front() {
                return Ok(file);
            }
            if self
                .opened_available
                .wait_until(&mut opened, deadline)
                .timed_out()
            {
                if let Some(file) = opened.pop_front() {
                    return Ok(file);
                }
                break;
            }
        }
        drop(opened);

        warn!(
            timeout_ms = self.config.open_file_timeout.as_millis() as u64,
            "no pre-opened journal file available, opening one inline"
        );
        self.take_file(true, true, false)
    }

    /// Queues the pre-opening of one file on the files executor.
    pub fn schedule_push_opened_file(self: &Arc<Self>) -> JournalResult<()> {
        let repository = Arc::clone(self);
        self.execute(move || {
            if let Err(e) = repository.push_opened_file() {
                error!(error = %e, "failed to pre-open journal file");
            }
        })
    }

    /// Takes a free file, opens it and adds it to the opened queue.
    pub fn push_opened_file(&self) -> JournalResult<()> {
        let file = self.take_file(true, true, false)?;
        trace!(file = %file, "pre-opened journal file");
        self.opened_files.lock().push_back(file);
        self.opened_available.notify_all();
        Ok(())
    }

    /// Moves a full current file to the data files and closes it.
    pub fn close_file(&self, file: Arc<JournalFile>) -> JournalResult<()> {
        self.data_files.lock().push_back(Arc::clone(&file));
        self.execute(move || {
            if let Err(e) = file.file().close() {
                error!(file = %file, error = %e, "failed to close journal file");
            }
        })
    }

    // =========================================================================
    // File Creation
    // =========================================================================

    /// Creates a new file.
    ///
    /// The file is written under a `.tmp` name, then renamed to its final
    /// name, which ends with `.cmp` when `tmp_compact` is set. With `init`
    /// the file is zero-filled to the file size and gets a header.
    pub fn create_file(
        &self,
        keep_open: bool,
        init: bool,
        tmp_compact: bool,
        preset_id: Option<u64>,
    ) -> JournalResult<Arc<JournalFile>> {
        let file_id = match preset_id {
            Some(id) => id,
            None => self.generate_file_id(),
        };

        let mut file_name = self.config.file_name(file_id);
        if tmp_compact {
            file_name = format::with_extension(&file_name, COMPACT_EXTENSION);
        }
        let tmp_name = format::with_extension(&file_name, TMP_EXTENSION);

        trace!(file = %file_name, file_id, "creating journal file");

        let sf = self.factory.create_sequential_file(&tmp_name);
        sf.open()?;
        if init {
            sf.fill(self.config.file_size, FILL_BYTE)?;
            init_file_header(sf.as_ref(), self.config.user_version, file_id)?;
        }
        let position = sf.current_position();
        sf.close()?;
        sf.rename_to(&file_name)?;

        if keep_open {
            sf.open()?;
            sf.position(position)?;
        }

        Ok(Arc::new(JournalFile::new(sf, file_id, FORMAT_VERSION)))
    }

    /// Creates an empty file with a given id for a backup to receive.
    pub fn create_remote_backup_sync_file(&self, file_id: u64) -> JournalResult<Arc<JournalFile>> {
        self.create_file(false, false, false, Some(file_id))
    }

    /// Gives `file` a new id and header, keeping its physical name.
    ///
    /// The body is not re-zeroed. Records left from the previous use carry
    /// the old file record id, so the scanner skips them.
    fn reinitialize_file(&self, file: &JournalFile) -> JournalResult<Arc<JournalFile>> {
        let file_id = self.generate_file_id();
        let sf = Arc::clone(file.file());
        sf.open()?;
        init_file_header(sf.as_ref(), self.config.user_version, file_id)?;
        sf.close()?;
        Ok(Arc::new(JournalFile::new(sf, file_id, FORMAT_VERSION)))
    }

    // =========================================================================
    // File Ids
    // =========================================================================

    /// Allocates the next file id.
    pub fn generate_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raises the id counter to at least `target`.
    pub fn set_next_file_id(&self, target: u64) {
        self.next_file_id.fetch_max(target, Ordering::SeqCst);
    }

    /// Returns the last allocated file id.
    pub fn last_file_id(&self) -> u64 {
        self.next_file_id.load(Ordering::SeqCst)
    }

    /// Raises the id counter past every id in `files`.
    ///
    /// Both the header id and the id in the name count, since compaction
    /// output can carry a name allocated after its header id.
    pub fn calculate_next_file_id(&self, files: &[Arc<JournalFile>]) {
        for file in files {
            let from_name = format::file_name_id(&self.config.file_prefix, &file.file_name());
            self.set_next_file_id(file.file_id().max(from_name));
        }
    }

    /// Lists the journal files on disk ordered by header id.
    ///
    /// Every header is validated against the format and user versions.
    pub fn order_files(&self) -> JournalResult<Vec<Arc<JournalFile>>> {
        let names = self.factory.list_files(&self.config.file_extension)?;
        let mut files = Vec::with_capacity(names.len());

        for name in names {
            let sf = self.factory.create_sequential_file(&name);
            sf.open()?;
            let header = read_file_header(sf.as_ref());
            sf.close()?;
            let header = header?;

            if header.version != FORMAT_VERSION && !COMPATIBLE_VERSIONS.contains(&header.version) {
                return Err(JournalError::IncompatibleVersion {
                    file: name,
                    found: header.version,
                });
            }
            if header.user_version != self.config.user_version {
                return Err(JournalError::UserVersionMismatch {
                    file: name,
                    expected: self.config.user_version,
                    found: header.user_version,
                });
            }

            files.push(Arc::new(JournalFile::new(sf, header.file_id, header.version)));
        }

        files.sort_by_key(|f| f.file_id());
        Ok(files)
    }
}

impl std::fmt::Debug for JournalFilesRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalFilesRepository")
            .field("dir", &self.factory.directory())
            .field("data_files", &self.data_files_count())
            .field("free_files", &self.free_files_count())
            .field("opened_files", &self.opened_files_count())
            .field("next_file_id", &self.last_file_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::StdFileFactory;
    use crate::reader::{read_journal_file, read_whole_file, JournalReaderCallback};
    use crate::record::{JournalEntry, RecordInfo};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    const FILE_SIZE: usize = 4096;

    fn repository(tmp: &TempDir) -> Arc<JournalFilesRepository> {
        let config = JournalConfig::new(tmp.path())
            .with_file_size(FILE_SIZE)
            .with_min_files(3)
            .with_user_version(5)
            .with_open_file_timeout(Duration::from_millis(200));
        let factory: Arc<dyn SequentialFileFactory> = Arc::new(StdFileFactory::new(tmp.path()));
        Arc::new(JournalFilesRepository::new(factory, config))
    }

    fn names(repo: &JournalFilesRepository) -> Vec<String> {
        let mut names = repo.factory().list_files("njr").unwrap();
        names.sort();
        names
    }

    #[test]
    fn test_create_file_writes_header() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);

        let file = repo.create_file(false, true, false, None).unwrap();
        assert_eq!(file.file_id(), 1);
        assert_eq!(file.file_name(), "nexus-data-1.njr");
        assert!(!file.file().is_open());
        assert_eq!(file.file().size().unwrap(), FILE_SIZE);

        file.file().open().unwrap();
        let header = read_file_header(file.file().as_ref()).unwrap();
        assert_eq!(header.file_id, 1);
        assert_eq!(header.user_version, 5);
        assert_eq!(header.version, FORMAT_VERSION);

        let cmp = repo.create_file(true, true, true, Some(9)).unwrap();
        assert_eq!(cmp.file_name(), "nexus-data-9.njr.cmp");
        assert!(cmp.file().is_open());
        assert_eq!(cmp.file().current_position(), SIZE_HEADER);
        assert_eq!(repo.last_file_id(), 1);
        assert!(repo.factory().list_files("tmp").unwrap().is_empty());
    }

    #[test]
    fn test_ensure_min_files() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);

        repo.ensure_min_files().unwrap();
        assert_eq!(repo.free_files_count(), 3);
        assert_eq!(names(&repo).len(), 3);

        repo.ensure_min_files().unwrap();
        assert_eq!(repo.free_files_count(), 3);

        let taken = repo.take_file(true, true, false).unwrap();
        assert!(taken.file().is_open());
        assert_eq!(taken.file().current_position(), SIZE_HEADER);
        repo.close_file(taken).unwrap();
        assert_eq!(repo.data_files_count(), 1);

        repo.ensure_min_files().unwrap();
        assert_eq!(repo.free_files_count(), 2);
    }

    #[test]
    fn test_add_free_file_recycles_with_new_id() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);

        let file = repo.create_file(false, true, false, None).unwrap();
        repo.add_free_file(&file, false, true).unwrap();

        let free = repo.free_files();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].file_name(), "nexus-data-1.njr");
        assert_eq!(free[0].file_id(), 2);

        free[0].file().open().unwrap();
        assert_eq!(read_file_header(free[0].file().as_ref()).unwrap().file_id, 2);
        free[0].file().close().unwrap();
    }

    #[derive(Default)]
    struct AddCounter(usize);

    impl JournalReaderCallback for AddCounter {
        fn on_read_add_record(&mut self, _: RecordInfo) -> JournalResult<()> {
            self.0 += 1;
            Ok(())
        }
    }

    #[test]
    fn test_recycled_file_keeps_body_but_hides_old_records() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);

        let file = repo.create_file(false, true, false, None).unwrap();
        let old = JournalEntry::Add { id: 9, user_type: 1, body: Bytes::from_static(b"old") };
        let sf = file.file();
        sf.open().unwrap();
        sf.position(SIZE_HEADER).unwrap();
        sf.write_direct(old.encode(file.record_id(), 0, 0), true).unwrap();
        sf.close().unwrap();

        let mut counter = AddCounter::default();
        read_journal_file(&file, &mut counter).unwrap();
        assert_eq!(counter.0, 1);

        repo.add_free_file(&file, false, true).unwrap();
        let recycled = repo.free_files().pop().unwrap();
        assert_ne!(recycled.record_id(), file.record_id());

        let data = read_whole_file(&recycled).unwrap();
        assert!(data[SIZE_HEADER..SIZE_HEADER + old.encoded_size()].iter().any(|b| *b != 0));

        let mut counter = AddCounter::default();
        let last = read_journal_file(&recycled, &mut counter).unwrap();
        assert_eq!(counter.0, 0);
        assert_eq!(last, SIZE_HEADER);
    }

    #[test]
    fn test_add_free_file_deletes_surplus_and_wrong_size() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);
        repo.ensure_min_files().unwrap();

        let extra = repo.create_file(false, true, false, None).unwrap();
        repo.add_free_file(&extra, false, true).unwrap();
        assert!(!extra.file().exists());
        assert_eq!(repo.free_files_count(), 3);

        // Without the delete check the file is always kept.
        let kept = repo.create_file(false, true, false, None).unwrap();
        repo.add_free_file(&kept, false, false).unwrap();
        assert_eq!(repo.free_files_count(), 4);

        let short = repo.create_file(false, false, false, None).unwrap();
        repo.add_free_file(&short, false, false).unwrap();
        assert!(!short.file().exists());
        assert_eq!(repo.free_files_count(), 4);
    }

    #[test]
    fn test_take_file_for_compaction_renames() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);
        repo.ensure_min_files().unwrap();

        let file = repo.take_file(false, true, true).unwrap();
        assert!(file.file_name().ends_with(".njr.cmp"));
        assert_eq!(repo.free_files_count(), 2);
    }

    #[test]
    fn test_open_file_uses_pre_opened_files() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);
        let executor = Arc::new(SingleWorkerExecutor::start("test-files").unwrap());
        repo.set_executor(Some(Arc::clone(&executor)));

        repo.ensure_min_files().unwrap();
        repo.push_opened_file().unwrap();
        assert_eq!(repo.opened_files_count(), 1);

        let first = repo.open_file().unwrap();
        assert!(first.file().is_open());
        executor.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(repo.opened_files_count(), 1);

        let second = repo.open_file().unwrap();
        assert_ne!(first.file_id(), second.file_id());

        repo.close_file(first).unwrap();
        executor.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(repo.data_files_count(), 1);
        assert!(!repo.data_files()[0].file().is_open());

        repo.clear();
        assert_eq!(repo.opened_files_count(), 0);
        assert_eq!(repo.free_files_count(), 0);
        assert!(executor.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn test_open_file_without_executor() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);

        let file = repo.open_file().unwrap();
        assert!(file.file().is_open());
        assert_eq!(repo.opened_files_count(), 0);
    }

    #[test]
    fn test_order_files_by_header_id() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);

        let a = repo.create_file(false, true, false, None).unwrap();
        let b = repo.create_file(false, true, false, None).unwrap();
        // Recycling gives the first file the highest id.
        repo.add_free_file(&a, false, false).unwrap();
        assert_eq!(b.file_id(), 2);

        let ordered = repo.order_files().unwrap();
        let ids: Vec<u64> = ordered.iter().map(|f| f.file_id()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(ordered[1].file_name(), "nexus-data-1.njr");

        let fresh = repository(&tmp);
        fresh.calculate_next_file_id(&ordered);
        assert_eq!(fresh.generate_file_id(), 4);
    }

    #[test]
    fn test_order_files_rejects_user_version() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);
        repo.create_file(false, true, false, None).unwrap();

        let config = JournalConfig::new(tmp.path())
            .with_file_size(FILE_SIZE)
            .with_user_version(6);
        let factory: Arc<dyn SequentialFileFactory> = Arc::new(StdFileFactory::new(tmp.path()));
        let other = JournalFilesRepository::new(factory, config);

        let err = other.order_files().unwrap_err();
        assert!(matches!(
            err,
            JournalError::UserVersionMismatch {
                expected: 6,
                found: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_next_file_id_only_grows() {
        let tmp = TempDir::new().unwrap();
        let repo = repository(&tmp);
        repo.set_next_file_id(10);
        repo.set_next_file_id(4);
        assert_eq!(repo.generate_file_id(), 11);

        let backup = repo.create_remote_backup_sync_file(7).unwrap();
        assert_eq!(backup.file_id(), 7);
        assert_eq!(backup.file().size().unwrap(), 0);
    }
}
