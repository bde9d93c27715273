//! Journal engine.
//!
//! The journal appends records to a rolling set of pre-allocated files and
//! keeps an in-memory index of which file holds the live copy of every
//! record. Files whose contents are fully superseded are recycled by the
//! reclaimer; files that are mostly dead are rewritten by the compactor.
//!
//! # Locking
//!
//! ```text
//! compactor_lock (write: compaction, synchronization)
//!   └── journal_lock (read: appends, reclaim; write: compaction swap, stop)
//!         └── current_file (append lock)
//! ```
//!
//! Locks are always taken in this order.
//!
//! # Lifecycle
//!
//! ```text
//! STOPPED ──start──▶ STARTED ──load──▶ LOADED
//!                       │
//!                       └──load_sync_only──▶ SYNCING / SYNCING_UP_TO_DATE
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, trace, warn};

use crate::compactor::JournalCompactor;
use crate::config::JournalConfig;
use crate::control::{self, ControlFile};
use crate::error::{JournalError, JournalResult};
use crate::executor::{CountDownLatch, SingleWorkerExecutor};
use crate::file::{
    IoCompletion, SequentialFile, SequentialFileFactory, StdFileFactory, WaitCompletion,
};
use crate::format::{
    self, COMPACT_EXTENSION, CONTROL_FILE_NAME, SIZE_ADD_RECORD, SIZE_ADD_RECORD_TX, SIZE_HEADER,
};
use crate::journal_file::JournalFile;
use crate::journal_record::JournalRecord;
use crate::loader::{
    JournalLoadInformation, ListLoader, LoadedRecords, LoaderCallback, NullLoader,
    PreparedTransactionInfo, TransactionFailureCallback,
};
use crate::reader::{read_journal_file, JournalReaderCallback};
use crate::reclaimer;
use crate::record::{JournalEntry, RecordInfo};
use crate::repository::JournalFilesRepository;
use crate::transaction::{JournalTransaction, RecordSink};

const FILES_EXECUTOR: &str = "journal-files";
const COMPACTOR_EXECUTOR: &str = "journal-compactor";

// =============================================================================
// Journal State
// =============================================================================

/// Lifecycle state of a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// Not started, or stopped.
    Stopped,
    /// Executors running, nothing loaded.
    Started,
    /// Loaded and accepting appends.
    Loaded,
    /// Receiving files from a replication source.
    Syncing,
    /// Replication caught up with the source.
    SyncingUpToDate,
}

impl JournalState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalState::Stopped => "STOPPED",
            JournalState::Started => "STARTED",
            JournalState::Loaded => "LOADED",
            JournalState::Syncing => "SYNCING",
            JournalState::SyncingUpToDate => "SYNCING_UP_TO_DATE",
        }
    }
}

impl std::fmt::Display for JournalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Synchronization Guard
// =============================================================================

/// Holds the journal still for replication synchronization.
///
/// Blocks appends and compaction until dropped.
pub struct SynchronizationGuard<'a> {
    _journal: RwLockWriteGuard<'a, ()>,
    _compactor: RwLockWriteGuard<'a, ()>,
}

// =============================================================================
// Journal
// =============================================================================

/// Append-only record journal over a pool of circular files.
pub struct Journal {
    /// Configuration.
    config: JournalConfig,

    /// Creates and lists files.
    factory: Arc<dyn SequentialFileFactory>,

    /// Data, free and pre-opened file pools.
    repository: Arc<JournalFilesRepository>,

    /// Lifecycle state.
    state: RwLock<JournalState>,

    /// Serializes start, stop and load.
    lifecycle: Mutex<()>,

    /// Appends share it; the compaction swap takes it exclusively.
    journal_lock: RwLock<()>,

    /// File receiving appends. The mutex is the append lock.
    current_file: Mutex<Option<Arc<JournalFile>>>,

    /// Held exclusively by compaction and synchronization.
    compactor_lock: RwLock<()>,

    /// Compaction in progress, if any.
    compactor: RwLock<Option<Arc<JournalCompactor>>>,

    /// Set while a compaction is scheduled or running.
    compactor_running: AtomicBool,

    /// Allows automatic compaction.
    compact_enabled: AtomicBool,

    /// Allows automatic reclaiming.
    auto_reclaim: AtomicBool,

    /// Live record index.
    records: DashMap<u64, JournalRecord>,

    /// Open transactions.
    transactions: DashMap<u64, Arc<JournalTransaction>>,

    /// Runs file opens, closes and recycling.
    files_executor: RwLock<Option<Arc<SingleWorkerExecutor>>>,

    /// Runs reclaim and compaction.
    compactor_executor: RwLock<Option<Arc<SingleWorkerExecutor>>>,

    /// Handle passed to background tasks.
    this: Weak<Journal>,
}

impl Journal {
    /// Creates a journal over the local file system at `config.dir`.
    pub fn new(config: JournalConfig) -> JournalResult<Arc<Self>> {
        let factory: Arc<dyn SequentialFileFactory> = Arc::new(StdFileFactory::new(config.dir.clone()));
        Self::with_factory(config, factory)
    }

    /// Creates a journal over a custom file factory.
    pub fn with_factory(
        config: JournalConfig,
        factory: Arc<dyn SequentialFileFactory>,
    ) -> JournalResult<Arc<Self>> {
        config
            .validate(factory.alignment())
            .map_err(JournalError::config_error)?;
        factory.create_dirs()?;

        let repository = Arc::new(JournalFilesRepository::new(
            Arc::clone(&factory),
            config.clone(),
        ));

        Ok(Arc::new_cyclic(|this| Self {
            config,
            factory,
            repository,
            state: RwLock::new(JournalState::Stopped),
            lifecycle: Mutex::new(()),
            journal_lock: RwLock::new(()),
            current_file: Mutex::new(None),
            compactor_lock: RwLock::new(()),
            compactor: RwLock::new(None),
            compactor_running: AtomicBool::new(false),
            compact_enabled: AtomicBool::new(true),
            auto_reclaim: AtomicBool::new(true),
            records: DashMap::new(),
            transactions: DashMap::new(),
            files_executor: RwLock::new(None),
            compactor_executor: RwLock::new(None),
            this: this.clone(),
        }))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the background executors.
    pub fn start(&self) -> JournalResult<()> {
        let _lifecycle = self.lifecycle.lock();
        let state = self.state();
        if state != JournalState::Stopped {
            return Err(JournalError::invalid_state("STOPPED", state));
        }

        let files = Arc::new(SingleWorkerExecutor::start(FILES_EXECUTOR)?);
        let compactor = Arc::new(SingleWorkerExecutor::start(COMPACTOR_EXECUTOR)?);
        self.repository.set_executor(Some(Arc::clone(&files)));
        *self.files_executor.write() = Some(files);
        *self.compactor_executor.write() = Some(compactor);

        self.set_state(JournalState::Started);
        info!(dir = %self.config.dir.display(), "journal started");
        Ok(())
    }

    /// Stops the journal, draining background work and closing files.
    pub fn stop(&self) -> JournalResult<()> {
        let _lifecycle = self.lifecycle.lock();
        let state = self.state();
        if state == JournalState::Stopped {
            return Err(JournalError::invalid_state("STARTED", state));
        }

        // Queued tasks observe STOPPED and return; the executors drain
        // before any journal lock is taken here.
        self.set_state(JournalState::Stopped);

        let timeout = self.config.executor_shutdown_timeout;
        let compactor = self.compactor_executor.write().take();
        if let Some(executor) = compactor {
            if !executor.shutdown(timeout) {
                warn!(executor = COMPACTOR_EXECUTOR, "executor did not terminate in time");
            }
        }
        self.repository.set_executor(None);
        let files = self.files_executor.write().take();
        if let Some(executor) = files {
            if !executor.shutdown(timeout) {
                warn!(executor = FILES_EXECUTOR, "executor did not terminate in time");
            }
        }

        let _journal = self.journal_lock.write();
        let current = self.current_file.lock().take();
        if let Some(file) = current {
            if file.file().is_open() {
                file.file().close()?;
            }
        }
        self.repository.clear();

        info!(dir = %self.config.dir.display(), "journal stopped");
        Ok(())
    }

    /// Returns true unless stopped.
    pub fn is_started(&self) -> bool {
        self.state() != JournalState::Stopped
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> JournalState {
        *self.state.read()
    }

    fn set_state(&self, state: JournalState) {
        *self.state.write() = state;
    }

    fn check_journal_is_loaded(&self) -> JournalResult<()> {
        let state = self.state();
        if state != JournalState::Loaded && state != JournalState::Syncing {
            return Err(JournalError::invalid_state("LOADED", state));
        }
        Ok(())
    }

    // =========================================================================
    // Appends
    // =========================================================================

    /// Appends an add record.
    pub fn append_add_record(
        &self,
        id: u64,
        user_type: u8,
        body: impl Into<Bytes>,
        sync: bool,
    ) -> JournalResult<()> {
        let body = body.into();
        self.sync_wait(sync, |completion| {
            self.append_add_record_with_completion(id, user_type, body, sync, completion)
        })
    }

    /// Appends an add record, signalling `completion` when written.
    pub fn append_add_record_with_completion(
        &self,
        id: u64,
        user_type: u8,
        body: impl Into<Bytes>,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<()> {
        self.check_journal_is_loaded()?;
        let entry = JournalEntry::Add {
            id,
            user_type,
            body: body.into(),
        };

        if let Some(completion) = &completion {
            completion.store_line_up();
        }

        let _journal = self.journal_lock.read();
        let mut current = self.current_file.lock();
        let file = self.append_record(&mut current, &entry, false, sync, None, completion)?;
        trace!(id, file = %file, "appended add record");
        self.records
            .insert(id, JournalRecord::new(file, entry.encoded_size()));
        Ok(())
    }

    /// Appends an update of a live record.
    pub fn append_update_record(
        &self,
        id: u64,
        user_type: u8,
        body: impl Into<Bytes>,
        sync: bool,
    ) -> JournalResult<()> {
        let body = body.into();
        self.sync_wait(sync, |completion| {
            self.append_update_record_with_completion(id, user_type, body, sync, completion)
        })
    }

    /// Appends an update of a live record, signalling `completion` when written.
    pub fn append_update_record_with_completion(
        &self,
        id: u64,
        user_type: u8,
        body: impl Into<Bytes>,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<()> {
        self.check_journal_is_loaded()?;
        let entry = JournalEntry::Update {
            id,
            user_type,
            body: body.into(),
        };

        let _journal = self.journal_lock.read();
        let compactor = self.compactor.read().clone();
        let known = self.records.contains_key(&id)
            || compactor.as_ref().map_or(false, |c| c.lookup_record(id));
        if !known {
            return Err(JournalError::RecordNotFound { id });
        }

        if let Some(completion) = &completion {
            completion.store_line_up();
        }

        let mut current = self.current_file.lock();
        let file = self.append_record(&mut current, &entry, false, sync, None, completion)?;
        trace!(id, file = %file, "appended update record");

        let size = entry.encoded_size();
        match self.records.get_mut(&id) {
            Some(mut record) => record.add_update_file(file, size),
            None => match &compactor {
                Some(compactor) => compactor.add_command_update(id, &file, size),
                None => warn!(id, "record deleted while its update was appended"),
            },
        }
        Ok(())
    }

    /// Appends a delete of a live record.
    pub fn append_delete_record(&self, id: u64, sync: bool) -> JournalResult<()> {
        self.sync_wait(sync, |completion| {
            self.append_delete_record_with_completion(id, sync, completion)
        })
    }

    /// Appends a delete of a live record, signalling `completion` when written.
    pub fn append_delete_record_with_completion(
        &self,
        id: u64,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<()> {
        self.check_journal_is_loaded()?;

        let _journal = self.journal_lock.read();
        let compactor = self.compactor.read().clone();
        let record = match &compactor {
            None => match self.records.remove(&id) {
                Some((_, record)) => Some(record),
                None => return Err(JournalError::RecordNotFound { id }),
            },
            Some(compactor) => {
                if !self.records.contains_key(&id) && !compactor.lookup_record(id) {
                    return Err(JournalError::RecordNotFound { id });
                }
                None
            }
        };

        if let Some(completion) = &completion {
            completion.store_line_up();
        }

        let mut current = self.current_file.lock();
        let file = self.append_record(
            &mut current,
            &JournalEntry::Delete { id },
            false,
            sync,
            None,
            completion,
        )?;
        trace!(id, file = %file, "appended delete record");

        match (record, &compactor) {
            (Some(record), _) => record.delete(&file),
            (None, Some(compactor)) => compactor.add_command_delete(id, &file),
            (None, None) => {}
        }
        Ok(())
    }

    /// Appends an add record to a transaction.
    pub fn append_add_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        body: impl Into<Bytes>,
    ) -> JournalResult<()> {
        self.append_positive_transactional(JournalEntry::AddTx {
            tx_id,
            id,
            user_type,
            body: body.into(),
        })
    }

    /// Appends an update record to a transaction.
    pub fn append_update_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        body: impl Into<Bytes>,
    ) -> JournalResult<()> {
        self.append_positive_transactional(JournalEntry::UpdateTx {
            tx_id,
            id,
            user_type,
            body: body.into(),
        })
    }

    fn append_positive_transactional(&self, entry: JournalEntry) -> JournalResult<()> {
        self.check_journal_is_loaded()?;
        let (tx_id, id) = match (entry.tx_id(), entry.id()) {
            (Some(tx_id), Some(id)) => (tx_id, id),
            _ => return Err(JournalError::inconsistency("not a transactional record")),
        };

        let _journal = self.journal_lock.read();
        let tx = self.get_transaction_info(tx_id);
        let mut current = self.current_file.lock();
        let file = self.append_record(&mut current, &entry, false, false, Some(&tx), None)?;
        trace!(tx_id, id, file = %file, "appended transactional record");
        tx.add_positive(&file, id, entry.encoded_size());
        Ok(())
    }

    /// Appends a delete record to a transaction.
    ///
    /// `body` is opaque to the journal and is handed back on load.
    pub fn append_delete_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        body: impl Into<Bytes>,
    ) -> JournalResult<()> {
        self.check_journal_is_loaded()?;
        let entry = JournalEntry::DeleteTx {
            tx_id,
            id,
            body: body.into(),
        };

        let _journal = self.journal_lock.read();
        let tx = self.get_transaction_info(tx_id);
        let mut current = self.current_file.lock();
        let file = self.append_record(&mut current, &entry, false, false, Some(&tx), None)?;
        trace!(tx_id, id, file = %file, "appended transactional delete");
        tx.add_negative(&file, id);
        Ok(())
    }

    /// Appends a prepare record.
    ///
    /// A prepared transaction survives restarts until it is committed or
    /// rolled back.
    pub fn append_prepare_record(
        &self,
        tx_id: u64,
        extra_data: impl Into<Bytes>,
        sync: bool,
    ) -> JournalResult<()> {
        let extra_data = extra_data.into();
        self.sync_wait(sync, |completion| {
            self.append_prepare_record_with_completion(tx_id, extra_data, sync, completion)
        })
    }

    /// Appends a prepare record, signalling `completion` when written.
    pub fn append_prepare_record_with_completion(
        &self,
        tx_id: u64,
        extra_data: impl Into<Bytes>,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<()> {
        self.check_journal_is_loaded()?;
        let entry = JournalEntry::Prepare {
            tx_id,
            extra: extra_data.into(),
        };

        if let Some(completion) = &completion {
            completion.store_line_up();
        }

        let _journal = self.journal_lock.read();
        let tx = self.get_transaction_info(tx_id);
        let mut current = self.current_file.lock();
        let file = self.append_record(&mut current, &entry, true, sync, Some(&tx), completion)?;
        trace!(tx_id, file = %file, "appended prepare record");
        tx.prepare(&file);
        Ok(())
    }

    /// Appends a commit record and applies the transaction.
    pub fn append_commit_record(&self, tx_id: u64, sync: bool) -> JournalResult<()> {
        self.sync_wait(sync, |completion| {
            self.append_commit_record_with_completion(tx_id, sync, completion, true)
        })
    }

    /// Appends a commit record, signalling `completion` when written.
    ///
    /// With `line_up_context` the completion is lined up before the write.
    pub fn append_commit_record_with_completion(
        &self,
        tx_id: u64,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
        line_up_context: bool,
    ) -> JournalResult<()> {
        self.check_journal_is_loaded()?;

        let _journal = self.journal_lock.read();
        let tx = match self.transactions.remove(&tx_id) {
            Some((_, tx)) => tx,
            None => return Err(JournalError::TransactionNotFound { tx_id }),
        };

        if line_up_context {
            if let Some(completion) = &completion {
                completion.store_line_up();
            }
        }

        let mut current = self.current_file.lock();
        let file = self.append_record(
            &mut current,
            &JournalEntry::Commit { tx_id },
            true,
            sync,
            Some(&tx),
            completion,
        )?;
        debug!(tx_id, file = %file, "committed transaction");
        tx.commit(&file, self);
        Ok(())
    }

    /// Appends a rollback record and discards the transaction.
    pub fn append_rollback_record(&self, tx_id: u64, sync: bool) -> JournalResult<()> {
        self.sync_wait(sync, |completion| {
            self.append_rollback_record_with_completion(tx_id, sync, completion)
        })
    }

    /// Appends a rollback record, signalling `completion` when written.
    pub fn append_rollback_record_with_completion(
        &self,
        tx_id: u64,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<()> {
        self.check_journal_is_loaded()?;

        if let Some(completion) = &completion {
            completion.store_line_up();
        }

        let _journal = self.journal_lock.read();
        let tx = match self.transactions.remove(&tx_id) {
            Some((_, tx)) => tx,
            None => return Err(JournalError::TransactionNotFound { tx_id }),
        };

        let mut current = self.current_file.lock();
        let file = self.append_record(
            &mut current,
            &JournalEntry::Rollback { tx_id },
            false,
            sync,
            Some(&tx),
            completion,
        )?;
        debug!(tx_id, file = %file, "rolled back transaction");
        tx.rollback(&file, self);
        Ok(())
    }

    /// Lines up an operation context before an append that will use it.
    pub fn line_up_context(&self, completion: &dyn IoCompletion) {
        completion.store_line_up();
    }

    /// Runs `append` and, for synced appends, waits for the write to land.
    fn sync_wait<F>(&self, sync: bool, append: F) -> JournalResult<()>
    where
        F: FnOnce(Option<Arc<dyn IoCompletion>>) -> JournalResult<()>,
    {
        if !sync || !self.factory.supports_callbacks() {
            return append(None);
        }

        let waiter = Arc::new(WaitCompletion::new());
        let completion: Arc<dyn IoCompletion> = waiter.clone();
        append(Some(completion))?;
        waiter.wait(self.config.sync_timeout)
    }

    /// Writes one record to the current file, rolling to the next file when
    /// it does not fit. Must be called with the append lock held.
    fn append_record(
        &self,
        current: &mut Option<Arc<JournalFile>>,
        entry: &JournalEntry,
        complete_transaction: bool,
        sync: bool,
        tx: Option<&Arc<JournalTransaction>>,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<Arc<JournalFile>> {
        self.check_journal_is_loaded()?;

        let size = entry.encoded_size();
        let file = self.switch_file_if_necessary(current, size)?;

        let completion = match tx {
            Some(tx) if self.factory.supports_callbacks() => {
                let callback = tx.callback();
                if let Some(completion) = completion {
                    callback.set_delegate_completion(completion);
                }
                let callback: Arc<dyn IoCompletion> = callback;
                Some(callback)
            }
            _ => completion,
        };

        let number_of_records = match tx {
            Some(tx) if complete_transaction => tx.counter(&file),
            _ => 0,
        };

        let data = entry.encode(file.record_id(), 0, number_of_records);
        file.file().write(data, sync, completion)?;
        Ok(file)
    }

    fn switch_file_if_necessary(
        &self,
        current: &mut Option<Arc<JournalFile>>,
        size: usize,
    ) -> JournalResult<Arc<JournalFile>> {
        let max = self.config.file_size - self.factory.calculate_block_size(SIZE_HEADER);
        if size > max {
            return Err(JournalError::record_too_large(size, max));
        }

        let fits = match current.as_ref() {
            Some(file) => file.file().fits(size),
            None => return Err(JournalError::invalid_state("LOADED", self.state())),
        };
        if !fits {
            self.move_next_file(current, true)?;
        }

        match current.as_ref() {
            Some(file) if file.file().fits(size) => Ok(Arc::clone(file)),
            Some(file) => Err(JournalError::inconsistency(format!(
                "record of {} bytes does not fit into fresh file {}",
                size, file
            ))),
            None => Err(JournalError::invalid_state("LOADED", self.state())),
        }
    }

    /// Closes the current file into the data files and opens the next one.
    fn move_next_file(
        &self,
        current: &mut Option<Arc<JournalFile>>,
        schedule_reclaim: bool,
    ) -> JournalResult<()> {
        if let Some(file) = current.take() {
            self.repository.close_file(file)?;
        }

        let next = self.repository.open_file()?;
        debug!(file = %next, "moved to next journal file");
        *current = Some(next);

        if schedule_reclaim {
            self.schedule_reclaim();
        }
        Ok(())
    }

    /// Returns the open transaction `tx_id`, creating it if needed.
    fn get_transaction_info(&self, tx_id: u64) -> Arc<JournalTransaction> {
        let entry = self
            .transactions
            .entry(tx_id)
            .or_insert_with(|| Arc::new(JournalTransaction::new(tx_id)));
        Arc::clone(entry.value())
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Loads the journal, replaying committed records into `loader`.
    pub fn load(&self, loader: &mut dyn LoaderCallback) -> JournalResult<JournalLoadInformation> {
        self.load_with(loader, true, None)
    }

    /// Loads the journal into lists.
    ///
    /// Committed records whose id was deleted at any point of the load are
    /// left out.
    pub fn load_records(
        &self,
        failure_callback: Option<&mut dyn TransactionFailureCallback>,
    ) -> JournalResult<LoadedRecords> {
        let mut loader = ListLoader::new(failure_callback);
        let info = self.load_with(&mut loader, true, None)?;
        Ok(loader.finish(info))
    }

    /// Rebuilds the journal's bookkeeping without handing out records.
    pub fn load_internal_only(&self) -> JournalResult<JournalLoadInformation> {
        self.load_with(&mut NullLoader, true, None)
    }

    /// Loads for replication synchronization.
    ///
    /// With [`JournalState::Syncing`] the journal stops after reading the
    /// files and opens no current file.
    pub fn load_sync_only(&self, sync_state: JournalState) -> JournalResult<JournalLoadInformation> {
        if !matches!(
            sync_state,
            JournalState::Syncing | JournalState::SyncingUpToDate
        ) {
            return Err(JournalError::invalid_state("SYNCING", sync_state));
        }
        self.load_with(&mut NullLoader, true, Some(sync_state))
    }

    fn load_with(
        &self,
        loader: &mut dyn LoaderCallback,
        change_data: bool,
        sync_state: Option<JournalState>,
    ) -> JournalResult<JournalLoadInformation> {
        let _lifecycle = self.lifecycle.lock();
        let state = self.state();
        if state == JournalState::Stopped || state == JournalState::Loaded {
            return Err(JournalError::invalid_state("STARTED", state));
        }
        if Some(state) == sync_state {
            return Err(JournalError::invalid_state("STARTED", state));
        }

        control::check_control_file(self.factory.as_ref(), &self.config.file_extension)?;

        self.records.clear();
        self.transactions.clear();
        self.repository.clear();
        *self.current_file.lock() = None;

        let ordered_files = self.repository.order_files()?;
        self.repository.calculate_next_file_id(&ordered_files);

        let mut context = LoadContext {
            journal: self,
            loader: &mut *loader,
            holders: BTreeMap::new(),
            max_id: None,
        };
        let mut last_data_pos = SIZE_HEADER;

        for file in &ordered_files {
            trace!(file = %file, "loading journal file");
            let mut reader = FileLoader {
                context: &mut context,
                file: Arc::clone(file),
                has_data: false,
            };
            let position = read_journal_file(file, &mut reader)?;

            if reader.has_data {
                last_data_pos = position;
                self.repository.add_data_file_on_bottom(Arc::clone(file));
            } else if change_data {
                self.repository.add_free_file(file, false, false)?;
            }
        }

        let LoadContext {
            holders, mut max_id, ..
        } = context;

        if sync_state == Some(JournalState::Syncing) {
            self.set_state(JournalState::Syncing);
            info!(
                data_files = self.repository.data_files_count(),
                "journal loaded for synchronization"
            );
            return Ok(JournalLoadInformation::new(0, None));
        }

        self.set_up_current_file(last_data_pos)?;
        self.set_state(JournalState::Loaded);

        for holder in holders.into_values() {
            let incomplete = !holder.prepared || holder.invalid;
            if incomplete && sync_state != Some(JournalState::SyncingUpToDate) {
                warn!(
                    tx_id = holder.tx_id,
                    prepared = holder.prepared,
                    "uncommitted transaction found during load"
                );
                if change_data {
                    self.append_rollback_record(holder.tx_id, false)?;
                }
                loader.failed_transaction(holder.tx_id, holder.records, holder.records_to_delete);
            } else {
                for record in &holder.records {
                    max_id = Some(max_id.map_or(record.id, |max| max.max(record.id)));
                }
                let mut info = PreparedTransactionInfo::new(holder.tx_id, holder.extra_data);
                info.records = holder.records;
                info.records_to_delete = holder.records_to_delete;
                loader.add_prepared_transaction(info);
            }
        }

        self.check_reclaim_status()?;

        let info = JournalLoadInformation::new(self.records.len(), max_id);
        info!(
            records = info.number_of_records,
            max_id = ?info.max_id,
            data_files = self.repository.data_files_count(),
            free_files = self.repository.free_files_count(),
            "journal loaded"
        );
        Ok(info)
    }

    /// Picks the file appends continue in after a load.
    fn set_up_current_file(&self, last_data_pos: usize) -> JournalResult<()> {
        self.repository.ensure_min_files()?;

        let file = match self.repository.poll_last_data_file() {
            Some(file) => {
                let sequential = file.file();
                if !sequential.is_open() {
                    sequential.open()?;
                }
                sequential.position(self.factory.calculate_block_size(last_data_pos))?;
                file
            }
            None => {
                let file = self.repository.free_file()?;
                self.repository.open_journal_file(&file)?;
                file
            }
        };

        debug!(file = %file, "current journal file");
        *self.current_file.lock() = Some(file);
        self.repository.push_opened_file()
    }

    // =========================================================================
    // Reclaim
    // =========================================================================

    /// Queues a reclaim pass, followed by a compaction check when nothing
    /// could be reclaimed.
    fn schedule_reclaim(&self) {
        if self.state() != JournalState::Loaded {
            return;
        }
        if !self.is_auto_reclaim() || self.compactor_running.load(Ordering::Acquire) {
            return;
        }
        let Some(journal) = self.this.upgrade() else {
            return;
        };

        self.execute_on_compactor(move || match journal.check_reclaim_status() {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = journal.check_compact() {
                    error!(error = %e, "compaction check failed");
                }
            }
            Err(e) => error!(error = %e, "reclaim failed"),
        });
    }

    /// Moves every reclaimable data file back to the free files.
    ///
    /// Returns true if a file was reclaimed.
    pub fn check_reclaim_status(&self) -> JournalResult<bool> {
        if self.compactor_running.load(Ordering::Acquire) {
            return Ok(false);
        }
        if self.state() != JournalState::Loaded || !self.is_auto_reclaim() {
            return Ok(false);
        }

        let _journal = self.journal_lock.read();
        let data_files = self.repository.data_files();
        reclaimer::scan(&data_files);

        let mut reclaimed = false;
        for file in data_files.iter().filter(|f| f.is_can_reclaim()) {
            if self.repository.remove_data_file(file) {
                debug!(file = %file, "reclaiming journal file");
                self.repository.add_free_file(file, false, true)?;
                reclaimed = true;
            }
        }
        Ok(reclaimed)
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Returns true when the live bytes of the data files fall under the
    /// compaction threshold.
    pub fn needs_compact(&self) -> bool {
        let data_files = self.repository.data_files();
        let total_live: i64 = data_files.iter().map(|f| f.live_size()).sum();
        let total_bytes = data_files.len() as f64 * self.config.file_size as f64;
        let threshold = (total_bytes * self.config.compact_ratio()) as i64;
        total_live < threshold && data_files.len() > self.config.compact_min_files
    }

    fn check_compact(&self) -> JournalResult<()> {
        if self.config.compact_min_files == 0 || self.state() != JournalState::Loaded {
            return Ok(());
        }
        if !self.is_compact_enabled() || self.compactor_running.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.needs_compact() {
            self.schedule_compact();
        }
        Ok(())
    }

    fn schedule_compact(&self) {
        if self
            .compactor_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(journal) = self.this.upgrade() else {
            self.compactor_running.store(false, Ordering::Release);
            return;
        };

        let submitted = self.execute_on_compactor(move || {
            if let Err(e) = journal.compact() {
                error!(error = %e, "compaction failed");
            }
            journal.compactor_running.store(false, Ordering::Release);
        });
        if !submitted {
            self.compactor_running.store(false, Ordering::Release);
        }
    }

    /// Runs a compaction on the compactor executor and waits for it.
    pub fn schedule_compact_and_block(&self, timeout: Duration) -> JournalResult<()> {
        let executor = self
            .compactor_executor
            .read()
            .clone()
            .ok_or_else(|| JournalError::invalid_state("LOADED", self.state()))?;
        let journal = self
            .this
            .upgrade()
            .ok_or_else(|| JournalError::inconsistency("journal is being dropped"))?;

        self.compactor_running.store(true, Ordering::Release);

        let latch = Arc::new(CountDownLatch::new(1));
        let outcome: Arc<Mutex<Option<JournalError>>> = Arc::new(Mutex::new(None));
        let signal = Arc::clone(&latch);
        let task_outcome = Arc::clone(&outcome);

        let result = executor
            .execute(move || {
                *task_outcome.lock() = journal.compact().err();
                signal.count_down();
            })
            .and_then(|()| {
                if !latch.wait_for(timeout) {
                    return Err(JournalError::timeout("compaction", timeout));
                }
                match outcome.lock().take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            });

        self.compactor_running.store(false, Ordering::Release);
        result
    }

    /// Rewrites the data files, keeping only live records.
    ///
    /// Appends continue during the rewrite. On failure the journal keeps its
    /// previous files and index.
    pub fn compact(&self) -> JournalResult<()> {
        if self.compactor.read().is_some() {
            return Err(JournalError::CompactionInProgress);
        }

        let _compactor_lock = self.compactor_lock.write();
        let previous_reclaim = self.is_auto_reclaim();
        let result = self.run_compaction();
        self.set_auto_reclaim(previous_reclaim);
        result
    }

    fn run_compaction(&self) -> JournalResult<()> {
        let Some((compactor, data_files, saved)) = self.begin_compaction()? else {
            return Ok(());
        };

        let control_file = match self.rewrite_files(&compactor, &data_files) {
            Ok(control_file) => control_file,
            Err(e) => {
                self.abort_compaction(&compactor, data_files, saved);
                return Err(e);
            }
        };

        let new_files = self.swap_compacted_files(&compactor, &saved);
        self.rename_files(&data_files, &new_files)?;
        control_file.delete()?;

        info!(
            old_files = data_files.len(),
            new_files = new_files.len(),
            records = self.records.len(),
            "compaction finished"
        );
        Ok(())
    }

    /// Takes the snapshot: rolls to a fresh file, detaches the data files
    /// and routes further appends to the compactor.
    fn begin_compaction(&self) -> JournalResult<Option<CompactionSnapshot>> {
        let _journal = self.journal_lock.write();
        if self.state() != JournalState::Loaded {
            return Ok(None);
        }

        self.set_auto_reclaim(false);
        {
            let mut current = self.current_file.lock();
            self.move_next_file(&mut current, false)?;
        }

        let mut data_files = self.repository.take_data_files();
        if data_files.is_empty() {
            debug!("no data files to compact");
            return Ok(None);
        }
        data_files.sort_by_key(|f| f.file_id());

        info!(files = data_files.len(), "starting compaction");

        let compactor = Arc::new(JournalCompactor::new(
            Arc::clone(&self.repository),
            self.records.iter().map(|entry| *entry.key()),
            data_files[0].file_id(),
        ));

        let mut transactions = Vec::new();
        for entry in self.transactions.iter() {
            let tx = entry.value();
            compactor.add_pending_transaction(tx.id(), tx.positive_ids());
            transactions.push((Arc::clone(tx), tx.snapshot()));
            tx.set_compacting();
        }

        let records: HashMap<u64, JournalRecord> = self
            .records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.records.clear();
        *self.compactor.write() = Some(Arc::clone(&compactor));

        Ok(Some((
            compactor,
            data_files,
            SavedState {
                records,
                transactions,
            },
        )))
    }

    /// Publishes the compacted index and files, then replays what was
    /// appended since the snapshot.
    fn swap_compacted_files(
        &self,
        compactor: &JournalCompactor,
        saved: &SavedState,
    ) -> Vec<Arc<JournalFile>> {
        let _journal = self.journal_lock.write();
        *self.compactor.write() = None;

        for (id, record) in compactor.take_new_records() {
            self.records.entry(id).or_insert(record);
        }

        let new_files = compactor.new_data_files();
        for file in new_files.iter().rev() {
            self.repository.add_data_file_on_top(Arc::clone(file));
        }

        compactor.replay_pending_commands(&self.records, self);

        for compacted in compactor.new_transactions() {
            match self.transactions.get(&compacted.id()) {
                Some(live) => live.merge(&compacted),
                None => warn!(tx_id = compacted.id(), "compacted transaction is no longer open"),
            }
        }
        for (live, _) in &saved.transactions {
            if live.is_compacting() {
                live.clear_compacting();
            }
        }
        new_files
    }

    /// Copies live records into new files and writes the rename plan.
    fn rewrite_files(
        &self,
        compactor: &JournalCompactor,
        data_files: &[Arc<JournalFile>],
    ) -> JournalResult<Arc<dyn SequentialFile>> {
        for file in data_files {
            compactor.compact_file(file).map_err(|e| {
                error!(file = %file, error = %e, "error reading file during compaction");
                JournalError::compaction_failed(format!("error reading {}: {}", file, e))
            })?;
        }
        compactor.flush()?;

        let plan = ControlFile::new(data_files, &compactor.new_data_files(), Vec::new());
        control::write_control_file(self.factory.as_ref(), &plan)
    }

    /// Puts back the pre-compaction files and index.
    fn abort_compaction(
        &self,
        compactor: &JournalCompactor,
        data_files: Vec<Arc<JournalFile>>,
        saved: SavedState,
    ) {
        warn!("compaction aborted, restoring previous files");

        let discarded = {
            let _journal = self.journal_lock.write();
            *self.compactor.write() = None;

            for (id, record) in saved.records {
                self.records.entry(id).or_insert(record);
            }
            for file in data_files.into_iter().rev() {
                self.repository.add_data_file_on_top(file);
            }
            for (live, backup) in &saved.transactions {
                live.merge(backup);
            }

            let discarded = compactor.discard();
            compactor.replay_pending_commands(&self.records, self);
            discarded
        };

        for file in discarded {
            if let Err(e) = file.file().delete() {
                warn!(file = %file, error = %e, "failed to delete compaction output");
            }
        }

        let control_file = self.factory.create_sequential_file(CONTROL_FILE_NAME);
        if control_file.exists() {
            if let Err(e) = control_file.delete() {
                warn!(error = %e, "failed to delete compaction control file");
            }
        }
    }

    /// Recycles the compacted files and gives the new files their final names.
    fn rename_files(
        &self,
        old_files: &[Arc<JournalFile>],
        new_files: &[Arc<JournalFile>],
    ) -> JournalResult<()> {
        let latch = Arc::new(CountDownLatch::new(1));
        let signal = Arc::clone(&latch);
        let repository = Arc::clone(&self.repository);
        let old_files = old_files.to_vec();

        self.repository.execute(move || {
            for file in &old_files {
                if let Err(e) = repository.add_free_file(file, false, true) {
                    error!(file = %file, error = %e, "failed to recycle compacted file");
                }
            }
            signal.count_down();
        })?;

        // The control file stays behind on timeout, so the next load
        // finishes the renames.
        let timeout = self.config.executor_shutdown_timeout;
        if !latch.wait_for(timeout) {
            error!(
                timeout_ms = timeout.as_millis() as u64,
                "files executor did not recycle compacted files in time"
            );
            return Err(JournalError::timeout("recycling compacted files", timeout));
        }

        for file in new_files {
            let name = file.file_name();
            let final_name = format::strip_extension(&name, COMPACT_EXTENSION);
            file.file().rename_to(final_name)?;
        }
        Ok(())
    }

    fn execute_on_compactor<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = self.compactor_executor.read().clone();
        match executor {
            Some(executor) => match executor.execute(task) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "compactor executor rejected task");
                    false
                }
            },
            None => false,
        }
    }

    // =========================================================================
    // Replication Support
    // =========================================================================

    /// Blocks appends and compaction until the guard is dropped.
    pub fn synchronization_lock(&self) -> SynchronizationGuard<'_> {
        let compactor = self.compactor_lock.write();
        let journal = self.journal_lock.write();
        SynchronizationGuard {
            _journal: journal,
            _compactor: compactor,
        }
    }

    /// Creates files to receive a backup's copy of the given file ids.
    pub fn create_files_for_backup_sync(
        &self,
        file_ids: &[u64],
    ) -> JournalResult<HashMap<u64, Arc<JournalFile>>> {
        self.check_journal_is_loaded()?;

        let mut files = HashMap::with_capacity(file_ids.len());
        let mut max_id = 0;
        for &file_id in file_ids {
            max_id = max_id.max(file_id);
            files.insert(
                file_id,
                self.repository.create_remote_backup_sync_file(file_id)?,
            );
        }
        self.repository.set_next_file_id(max_id);
        Ok(files)
    }

    /// Closes the current file and moves on to a new one.
    pub fn force_move_next_file(&self) -> JournalResult<()> {
        self.check_journal_is_loaded()?;
        {
            let _journal = self.journal_lock.read();
            let mut current = self.current_file.lock();
            self.move_next_file(&mut current, false)?;
        }
        self.debug_wait()
    }

    /// Stops reclaim and compaction so a replication source keeps its files.
    pub fn replication_sync_preserve_old_files(&self) {
        self.set_auto_reclaim(false);
        self.disable_compact();
    }

    /// Resumes reclaim and compaction after synchronization.
    pub fn replication_sync_finished(&self) {
        self.set_auto_reclaim(true);
        self.enable_compact();
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Enables or disables automatic reclaiming.
    pub fn set_auto_reclaim(&self, auto_reclaim: bool) {
        self.auto_reclaim.store(auto_reclaim, Ordering::Release);
    }

    /// Returns true if reclaiming runs automatically.
    pub fn is_auto_reclaim(&self) -> bool {
        self.auto_reclaim.load(Ordering::Acquire)
    }

    /// Allows automatic compaction.
    pub fn enable_compact(&self) {
        self.compact_enabled.store(true, Ordering::Release);
    }

    /// Prevents automatic compaction. Explicit calls to [`Journal::compact`]
    /// still run.
    pub fn disable_compact(&self) {
        self.compact_enabled.store(false, Ordering::Release);
    }

    /// Returns true if automatic compaction is allowed.
    pub fn is_compact_enabled(&self) -> bool {
        self.compact_enabled.load(Ordering::Acquire)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Returns the configuration.
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Data files, oldest first.
    pub fn data_files(&self) -> Vec<Arc<JournalFile>> {
        self.repository.data_files()
    }

    /// Number of data files.
    pub fn data_files_count(&self) -> usize {
        self.repository.data_files_count()
    }

    /// Number of free files.
    pub fn free_files_count(&self) -> usize {
        self.repository.free_files_count()
    }

    /// Number of pre-opened files.
    pub fn opened_files_count(&self) -> usize {
        self.repository.opened_files_count()
    }

    /// Number of live records.
    pub fn number_of_records(&self) -> usize {
        self.records.len()
    }

    /// Size of the record index; same as [`Journal::number_of_records`].
    pub fn id_map_size(&self) -> usize {
        self.records.len()
    }

    /// Number of open transactions.
    pub fn number_of_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Returns true if `id` is a live record.
    pub fn contains_record(&self, id: u64) -> bool {
        self.records.contains_key(&id)
    }

    /// Size of each journal file.
    pub fn file_size(&self) -> usize {
        self.config.file_size
    }

    /// Minimum number of files kept.
    pub fn min_files(&self) -> usize {
        self.config.min_files
    }

    /// Version stamped into file headers.
    pub fn user_version(&self) -> u32 {
        self.config.user_version
    }

    /// Write alignment of the file factory.
    pub fn alignment(&self) -> usize {
        self.factory.alignment()
    }

    /// File receiving appends.
    pub fn current_file(&self) -> Option<Arc<JournalFile>> {
        self.current_file.lock().clone()
    }

    /// Describes every file's counters and reclaim status.
    pub fn debug(&self) -> String {
        let data_files = self.repository.data_files();
        reclaimer::scan(&data_files);

        let mut out = String::new();
        for file in &data_files {
            let _ = writeln!(
                out,
                "data file {} pos_count={} can_reclaim={} live_size={}",
                file,
                file.pos_count(),
                file.is_can_reclaim(),
                file.live_size()
            );
            for target in file.neg_targets() {
                let _ = writeln!(
                    out,
                    "    neg_count on file {} = {}",
                    target,
                    file.neg_count_for(target)
                );
            }
        }
        for file in self.repository.free_files() {
            let _ = writeln!(out, "free file {}", file);
        }
        if let Some(file) = self.current_file() {
            let _ = writeln!(
                out,
                "current file {} pos_count={}",
                file,
                file.pos_count()
            );
        }
        let _ = writeln!(out, "records={}", self.records.len());
        out
    }

    /// Waits for outstanding transaction writes and background file work.
    pub fn debug_wait(&self) -> JournalResult<()> {
        let transactions: Vec<_> = self
            .transactions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for tx in transactions {
            tx.wait_callbacks(self.config.sync_timeout)?;
        }

        let executor = self.files_executor.read().clone();
        if let Some(executor) = executor {
            if !executor.is_shutdown() {
                executor.flush(self.config.executor_shutdown_timeout)?;
            }
        }
        Ok(())
    }
}

impl RecordSink for Journal {
    fn add_positive(&self, file: &Arc<JournalFile>, id: u64, size: usize) {
        let compactor = self.compactor.read().clone();
        if let Some(compactor) = compactor {
            if compactor.lookup_record(id) {
                compactor.add_command_update(id, file, size);
                return;
            }
        }

        self.records
            .entry(id)
            .and_modify(|record| record.add_update_file(Arc::clone(file), size))
            .or_insert_with(|| JournalRecord::new(Arc::clone(file), size));
    }

    fn add_negative(&self, file: &Arc<JournalFile>, id: u64) {
        let compactor = self.compactor.read().clone();
        if let Some(compactor) = compactor {
            compactor.add_command_delete(id, file);
            return;
        }

        if let Some((_, record)) = self.records.remove(&id) {
            record.delete(file);
        }
    }

    fn defer_commit(&self, tx: &Arc<JournalTransaction>, file: &Arc<JournalFile>) -> bool {
        let compactor = self.compactor.read().clone();
        match compactor {
            Some(compactor) => {
                compactor.add_command_commit(tx, file);
                true
            }
            None => false,
        }
    }

    fn defer_rollback(&self, tx: &Arc<JournalTransaction>, file: &Arc<JournalFile>) -> bool {
        let compactor = self.compactor.read().clone();
        match compactor {
            Some(compactor) => {
                compactor.add_command_rollback(tx, file);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("dir", &self.config.dir)
            .field("state", &self.state())
            .field("records", &self.records.len())
            .field("transactions", &self.transactions.len())
            .field("data_files", &self.repository.data_files_count())
            .field("free_files", &self.repository.free_files_count())
            .finish()
    }
}

// =============================================================================
// Load Support
// =============================================================================

/// What a failed compaction needs to restore.
struct SavedState {
    records: HashMap<u64, JournalRecord>,
    transactions: Vec<(Arc<JournalTransaction>, JournalTransaction)>,
}

type CompactionSnapshot = (Arc<JournalCompactor>, Vec<Arc<JournalFile>>, SavedState);

/// A transaction as seen while loading.
struct TransactionHolder {
    tx_id: u64,
    records: Vec<RecordInfo>,
    records_to_delete: Vec<RecordInfo>,
    prepared: bool,
    invalid: bool,
    extra_data: Bytes,
}

impl TransactionHolder {
    fn new(tx_id: u64) -> Self {
        Self {
            tx_id,
            records: Vec::new(),
            records_to_delete: Vec::new(),
            prepared: false,
            invalid: false,
            extra_data: Bytes::new(),
        }
    }
}

/// State shared across every file of a load.
struct LoadContext<'a> {
    journal: &'a Journal,
    loader: &'a mut dyn LoaderCallback,
    holders: BTreeMap<u64, TransactionHolder>,
    max_id: Option<u64>,
}

impl LoadContext<'_> {
    fn check_id(&mut self, id: u64) {
        self.max_id = Some(self.max_id.map_or(id, |max| max.max(id)));
    }

    fn holder(&mut self, tx_id: u64) -> &mut TransactionHolder {
        self.holders
            .entry(tx_id)
            .or_insert_with(|| TransactionHolder::new(tx_id))
    }
}

/// Rebuilds the index from one file.
struct FileLoader<'c, 'a> {
    context: &'c mut LoadContext<'a>,
    file: Arc<JournalFile>,
    has_data: bool,
}

impl JournalReaderCallback for FileLoader<'_, '_> {
    fn on_read_add_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        self.context.check_id(info.id);
        self.has_data = true;

        let size = info.data.len() + SIZE_ADD_RECORD + 1;
        let id = info.id;
        self.context.loader.add_record(info);
        self.context
            .journal
            .records
            .insert(id, JournalRecord::new(Arc::clone(&self.file), size));
        Ok(())
    }

    fn on_read_update_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        self.context.check_id(info.id);
        self.has_data = true;

        let size = info.data.len() + SIZE_ADD_RECORD + 1;
        if let Some(mut record) = self.context.journal.records.get_mut(&info.id) {
            record.add_update_file(Arc::clone(&self.file), size);
        }
        self.context.loader.update_record(info);
        Ok(())
    }

    fn on_read_delete_record(&mut self, id: u64) -> JournalResult<()> {
        self.has_data = true;

        self.context.loader.delete_record(id);
        if let Some((_, record)) = self.context.journal.records.remove(&id) {
            record.delete(&self.file);
        }
        Ok(())
    }

    fn on_read_add_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        self.on_read_update_record_tx(tx_id, info)
    }

    fn on_read_update_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        self.context.check_id(info.id);
        self.has_data = true;

        let size = info.data.len() + SIZE_ADD_RECORD_TX + 1;
        let id = info.id;
        self.context.holder(tx_id).records.push(info);
        self.context
            .journal
            .get_transaction_info(tx_id)
            .add_positive(&self.file, id, size);
        Ok(())
    }

    fn on_read_delete_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        self.has_data = true;

        let id = info.id;
        self.context.holder(tx_id).records_to_delete.push(info);
        self.context
            .journal
            .get_transaction_info(tx_id)
            .add_negative(&self.file, id);
        Ok(())
    }

    fn on_read_prepare_record(
        &mut self,
        tx_id: u64,
        extra_data: Bytes,
        number_of_records: u32,
    ) -> JournalResult<()> {
        self.has_data = true;

        let tx = self.context.journal.get_transaction_info(tx_id);
        let healthy = tx.counter(&self.file) == number_of_records;

        let holder = self.context.holder(tx_id);
        holder.prepared = true;
        holder.extra_data = extra_data;

        if healthy {
            tx.prepare(&self.file);
        } else {
            warn!(
                tx_id,
                expected = number_of_records,
                file = %self.file,
                "prepared transaction is missing records"
            );
            holder.invalid = true;
        }
        Ok(())
    }

    fn on_read_commit_record(&mut self, tx_id: u64, number_of_records: u32) -> JournalResult<()> {
        // A commit without records left in earlier files belongs to a
        // transaction that was already applied.
        let Some(holder) = self.context.holders.remove(&tx_id) else {
            return Ok(());
        };
        self.has_data = true;

        let tx = match self.context.journal.transactions.remove(&tx_id) {
            Some((_, tx)) => tx,
            None => {
                return Err(JournalError::inconsistency(format!(
                    "transaction {} has a holder but no bookkeeping",
                    tx_id
                )))
            }
        };

        if tx.counter(&self.file) == number_of_records {
            for record in holder.records {
                if record.is_update {
                    self.context.loader.update_record(record);
                } else {
                    self.context.loader.add_record(record);
                }
            }
            for record in holder.records_to_delete {
                self.context.loader.delete_record(record.id);
            }
            tx.commit(&self.file, self.context.journal);
        } else {
            warn!(
                tx_id,
                expected = number_of_records,
                found = tx.counter(&self.file),
                file = %self.file,
                "committed transaction is missing records, ignoring it"
            );
            tx.forget();
        }
        Ok(())
    }

    fn on_read_rollback_record(&mut self, tx_id: u64) -> JournalResult<()> {
        if self.context.holders.remove(&tx_id).is_none() {
            return Ok(());
        }
        self.has_data = true;

        if let Some((_, tx)) = self.context.journal.transactions.remove(&tx_id) {
            tx.rollback(&self.file, self.context.journal);
        }
        Ok(())
    }

    fn mark_as_data_file(&mut self, _file: &JournalFile) {
        self.has_data = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> JournalConfig {
        JournalConfig::new(dir.path())
            .with_file_size(4096)
            .with_min_files(2)
            .with_compact_min_files(0)
    }

    fn open(config: JournalConfig) -> Arc<Journal> {
        let journal = Journal::new(config).unwrap();
        journal.start().unwrap();
        journal
    }

    fn reopen(journal: Arc<Journal>) -> (Arc<Journal>, LoadedRecords) {
        let config = journal.config().clone();
        journal.stop().unwrap();
        drop(journal);
        let journal = open(config);
        let loaded = journal.load_records(None).unwrap();
        (journal, loaded)
    }

    fn ids(loaded: &LoadedRecords) -> Vec<u64> {
        loaded.committed.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_state_display() {
        assert_eq!(JournalState::SyncingUpToDate.to_string(), "SYNCING_UP_TO_DATE");
        assert_eq!(JournalState::Loaded.to_string(), "LOADED");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let result = Journal::new(JournalConfig::new(dir.path()).with_min_files(1));
        assert!(matches!(result, Err(JournalError::ConfigError { .. })));
    }

    #[test]
    fn test_append_requires_load() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));

        let err = journal.append_add_record(1, 1, &b"x"[..], false).unwrap_err();
        assert!(matches!(err, JournalError::InvalidState { .. }));

        journal.load_internal_only().unwrap();
        assert_eq!(journal.state(), JournalState::Loaded);
        assert!(journal.load_internal_only().is_err());
        journal.stop().unwrap();
        assert!(journal.stop().is_err());
    }

    #[test]
    fn test_add_update_delete_reload() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        journal.append_add_record(1, 7, &b"one"[..], true).unwrap();
        journal.append_add_record(2, 7, &b"two"[..], false).unwrap();
        journal.append_update_record(1, 7, &b"one-b"[..], false).unwrap();
        journal.append_delete_record(2, true).unwrap();
        assert_eq!(journal.number_of_records(), 1);

        let (journal, loaded) = reopen(journal);
        assert_eq!(ids(&loaded), vec![1, 1]);
        assert!(loaded.committed[1].is_update);
        assert_eq!(loaded.committed[1].data, Bytes::from_static(b"one-b"));
        assert_eq!(loaded.info.number_of_records, 1);
        assert_eq!(loaded.info.max_id, Some(2));
        assert!(journal.contains_record(1));
        journal.stop().unwrap();
    }

    #[test]
    fn test_unknown_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        assert!(matches!(
            journal.append_update_record(9, 1, &b"x"[..], false),
            Err(JournalError::RecordNotFound { id: 9 })
        ));
        assert!(matches!(
            journal.append_delete_record(9, false),
            Err(JournalError::RecordNotFound { id: 9 })
        ));
        assert!(matches!(
            journal.append_commit_record(5, false),
            Err(JournalError::TransactionNotFound { tx_id: 5 })
        ));
        journal.stop().unwrap();
    }

    #[test]
    fn test_record_too_large() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        let body = vec![0u8; 4096];
        assert!(matches!(
            journal.append_add_record(1, 1, body, false),
            Err(JournalError::RecordTooLarge { .. })
        ));
        journal.stop().unwrap();
    }

    #[test]
    fn test_rolls_to_next_file() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        let first = journal.current_file().unwrap().file_id();
        for id in 0..100 {
            journal.append_add_record(id, 1, vec![1u8; 200], false).unwrap();
        }
        assert_ne!(journal.current_file().unwrap().file_id(), first);
        assert!(journal.data_files_count() > 0);

        let (journal, loaded) = reopen(journal);
        assert_eq!(loaded.committed.len(), 100);
        assert_eq!(loaded.info.max_id, Some(99));
        journal.stop().unwrap();
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        journal.append_add_record(1, 1, &b"base"[..], false).unwrap();
        journal.append_add_record_transactional(10, 2, 1, &b"a"[..]).unwrap();
        journal.append_update_record_transactional(10, 1, 1, &b"b"[..]).unwrap();
        journal.append_delete_record_transactional(10, 1, Bytes::new()).unwrap();
        assert_eq!(journal.number_of_transactions(), 1);
        journal.append_commit_record(10, true).unwrap();
        assert_eq!(journal.number_of_transactions(), 0);
        assert!(journal.contains_record(2));
        assert!(!journal.contains_record(1));

        journal.append_add_record_transactional(11, 3, 1, &b"c"[..]).unwrap();
        journal.append_rollback_record(11, false).unwrap();
        assert!(!journal.contains_record(3));

        let (journal, loaded) = reopen(journal);
        let committed = ids(&loaded);
        assert!(committed.contains(&2));
        assert!(!committed.contains(&1));
        assert!(!committed.contains(&3));
        journal.stop().unwrap();
    }

    #[test]
    fn test_prepared_transaction_survives_reload() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        journal.append_add_record_transactional(20, 5, 1, &b"p"[..]).unwrap();
        journal.append_prepare_record(20, &b"xid"[..], true).unwrap();

        let (journal, loaded) = reopen(journal);
        assert!(loaded.committed.is_empty());
        assert_eq!(loaded.prepared.len(), 1);
        assert_eq!(loaded.prepared[0].tx_id, 20);
        assert_eq!(loaded.prepared[0].extra_data, Bytes::from_static(b"xid"));
        assert_eq!(loaded.info.max_id, Some(5));

        journal.append_commit_record(20, true).unwrap();
        let (journal, loaded) = reopen(journal);
        assert_eq!(ids(&loaded), vec![5]);
        assert!(loaded.prepared.is_empty());
        journal.stop().unwrap();
    }

    #[test]
    fn test_unprepared_transaction_fails_on_load() {
        #[derive(Default)]
        struct Failures(Vec<u64>);

        impl TransactionFailureCallback for Failures {
            fn failed_transaction(&mut self, tx_id: u64, _: Vec<RecordInfo>, _: Vec<RecordInfo>) {
                self.0.push(tx_id);
            }
        }

        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();
        journal.append_add_record_transactional(30, 1, 1, &b"x"[..]).unwrap();
        journal.debug_wait().unwrap();

        let config = journal.config().clone();
        journal.stop().unwrap();
        drop(journal);

        let journal = open(config.clone());
        let mut failures = Failures::default();
        let loaded = journal.load_records(Some(&mut failures)).unwrap();
        assert_eq!(failures.0, vec![30]);
        assert!(loaded.committed.is_empty());
        journal.stop().unwrap();
        drop(journal);

        // The rollback appended by the first load settles it.
        let journal = open(config);
        let mut failures = Failures::default();
        journal.load_records(Some(&mut failures)).unwrap();
        assert!(failures.0.is_empty());
        journal.stop().unwrap();
    }

    #[test]
    fn test_reclaim_frees_dead_files() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();
        journal.set_auto_reclaim(false);

        for id in 0..60 {
            journal.append_add_record(id, 1, vec![2u8; 200], false).unwrap();
        }
        for id in 0..60 {
            journal.append_delete_record(id, false).unwrap();
        }
        journal.force_move_next_file().unwrap();
        let before = journal.data_files_count();
        assert!(before > 1);

        journal.set_auto_reclaim(true);
        assert!(journal.check_reclaim_status().unwrap());
        assert!(journal.data_files_count() < before);
        journal.stop().unwrap();
    }

    #[test]
    fn test_compact_keeps_live_records() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();
        journal.set_auto_reclaim(false);

        for id in 0..60 {
            journal.append_add_record(id, 1, vec![3u8; 200], false).unwrap();
        }
        for id in (0..60).filter(|id| id % 10 != 0) {
            journal.append_delete_record(id, false).unwrap();
        }
        journal.append_add_record_transactional(40, 100, 1, &b"open"[..]).unwrap();
        let before = journal.data_files_count();

        journal.compact().unwrap();
        journal.debug_wait().unwrap();
        assert!(journal.data_files_count() < before);
        assert_eq!(journal.number_of_records(), 6);

        journal.append_commit_record(40, true).unwrap();
        assert!(journal.contains_record(100));

        let (journal, loaded) = reopen(journal);
        let mut committed = ids(&loaded);
        committed.sort_unstable();
        assert_eq!(committed, vec![0, 10, 20, 30, 40, 50, 100]);
        journal.stop().unwrap();
    }

    #[test]
    fn test_schedule_compact_and_block() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        for id in 0..30 {
            journal.append_add_record(id, 1, vec![4u8; 200], false).unwrap();
            journal.append_update_record(id, 1, vec![5u8; 200], false).unwrap();
        }
        journal.schedule_compact_and_block(Duration::from_secs(30)).unwrap();
        assert_eq!(journal.number_of_records(), 30);

        let (journal, loaded) = reopen(journal);
        assert_eq!(loaded.info.number_of_records, 30);
        journal.stop().unwrap();
    }

    #[test]
    fn test_sync_only_load() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_sync_only(JournalState::Syncing).unwrap();
        assert_eq!(journal.state(), JournalState::Syncing);
        assert!(journal.current_file().is_none());
        assert!(journal.load_sync_only(JournalState::Loaded).is_err());
        journal.stop().unwrap();
    }

    /// Sixty adds over a couple of files, with two out of three deleted.
    fn sparse_journal(dir: &TempDir) -> Arc<Journal> {
        let journal = open(config(dir));
        journal.load_internal_only().unwrap();
        for id in 0..60 {
            journal.append_add_record(id, 1, vec![7u8; 100], false).unwrap();
        }
        for id in (0..60).filter(|id| id % 3 != 0) {
            journal.append_delete_record(id, false).unwrap();
        }
        journal
    }

    /// Appends that land between the compaction snapshot and the swap.
    fn append_during_compaction(journal: &Journal) {
        journal.append_add_record(500, 1, &b"late"[..], false).unwrap();
        journal.append_update_record(3, 1, &b"changed"[..], false).unwrap();
        journal.append_delete_record(6, false).unwrap();
        journal.append_add_record_transactional(7, 600, 1, &b"tx"[..]).unwrap();
        journal.append_commit_record(7, false).unwrap();
    }

    fn expected_after_compaction() -> BTreeSet<u64> {
        let mut expected: BTreeSet<u64> = (0..60).filter(|id| id % 3 == 0).collect();
        expected.remove(&6);
        expected.insert(500);
        expected.insert(600);
        expected
    }

    #[test]
    fn test_appends_between_snapshot_and_swap_are_replayed() {
        let dir = TempDir::new().unwrap();
        let journal = sparse_journal(&dir);

        let (compactor, data_files, saved) = journal.begin_compaction().unwrap().unwrap();
        append_during_compaction(&journal);

        let control_file = journal.rewrite_files(&compactor, &data_files).unwrap();
        let new_files = journal.swap_compacted_files(&compactor, &saved);
        journal.rename_files(&data_files, &new_files).unwrap();
        control_file.delete().unwrap();

        let expected = expected_after_compaction();
        let live: BTreeSet<u64> = journal.records.iter().map(|e| *e.key()).collect();
        assert_eq!(live, expected);
        assert!(!journal.contains_record(6));
        assert!(journal.contains_record(600));

        let (journal, loaded) = reopen(journal);
        let reloaded: BTreeSet<u64> = ids(&loaded).into_iter().collect();
        assert_eq!(reloaded, expected);
        assert_eq!(loaded.info.number_of_records, expected.len());
        journal.stop().unwrap();
    }

    #[test]
    fn test_interrupted_compaction_is_finished_on_load() {
        let dir = TempDir::new().unwrap();
        let journal = sparse_journal(&dir);

        let (compactor, data_files, _saved) = journal.begin_compaction().unwrap().unwrap();
        append_during_compaction(&journal);
        journal.rewrite_files(&compactor, &data_files).unwrap();
        assert!(dir.path().join(CONTROL_FILE_NAME).exists());

        // Crash before the new files are published.
        let config = journal.config().clone();
        journal.stop().unwrap();
        drop(journal);

        let journal = open(config);
        let loaded = journal.load_records(None).unwrap();
        assert!(!dir.path().join(CONTROL_FILE_NAME).exists());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(COMPACT_EXTENSION))
            .count();
        assert_eq!(leftovers, 0);

        let expected = expected_after_compaction();
        let reloaded: BTreeSet<u64> = ids(&loaded).into_iter().collect();
        assert_eq!(reloaded, expected);
        assert_eq!(journal.number_of_records(), expected.len());
        journal.stop().unwrap();
    }

    #[test]
    fn test_rename_files_times_out_on_stuck_executor() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir).with_executor_shutdown_timeout(Duration::from_millis(100)));
        journal.load_internal_only().unwrap();

        let gate = Arc::new(CountDownLatch::new(1));
        let blocker = Arc::clone(&gate);
        journal.repository.execute(move || blocker.wait()).unwrap();

        let err = journal.rename_files(&[], &[]).unwrap_err();
        assert!(err.is_timeout());

        gate.count_down();
        journal.stop().unwrap();
    }

    #[test]
    fn test_syncing_accepts_appends() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_sync_only(JournalState::Syncing).unwrap();
        journal.force_move_next_file().unwrap();
        assert!(journal.current_file().is_some());

        journal.append_add_record(1, 1, &b"synced"[..], true).unwrap();
        journal.append_update_record(1, 1, &b"again"[..], true).unwrap();
        assert_eq!(journal.state(), JournalState::Syncing);

        let (journal, loaded) = reopen(journal);
        assert_eq!(ids(&loaded), vec![1, 1]);
        assert_eq!(loaded.info.number_of_records, 1);
        journal.stop().unwrap();
    }

    #[test]
    fn test_backup_sync_files_advance_ids() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        let files = journal.create_files_for_backup_sync(&[40, 41]).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[&41].file_id(), 41);

        assert!(files[&40].file().exists());
        assert!(journal.repository.generate_file_id() > 41);
        journal.stop().unwrap();
    }

    #[test]
    fn test_synchronization_lock_blocks_compaction() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();

        let guard = journal.synchronization_lock();
        assert!(journal.compactor_lock.try_write().is_none());
        drop(guard);
        assert!(journal.compactor_lock.try_write().is_some());
        journal.stop().unwrap();
    }

    #[test]
    fn test_debug_lists_files() {
        let dir = TempDir::new().unwrap();
        let journal = open(config(&dir));
        journal.load_internal_only().unwrap();
        journal.append_add_record(1, 1, &b"x"[..], false).unwrap();

        let out = journal.debug();
        assert!(out.contains("current file"));
        assert!(out.contains("records=1"));
        journal.stop().unwrap();
    }
}
