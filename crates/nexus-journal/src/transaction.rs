//! Transaction tracking.
//!
//! A [`JournalTransaction`] remembers, for one transaction id, which files
//! hold its adds/updates (positives) and deletes (negatives), and how many of
//! its records each file holds. The per-file count is written into prepare
//! and commit records and re-checked on load to detect transactions whose
//! body was lost.
//!
//! Every file a transaction touches receives one positive for the
//! transaction itself, balanced by a negative from the file holding the
//! commit or rollback. Until then the reclaimer keeps the file.
//!
//! Commit and rollback apply their effects through a [`RecordSink`], which
//! is either the live journal or the compactor's scratch state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{JournalError, JournalResult};
use crate::executor::CountDownLatch;
use crate::file::IoCompletion;
use crate::journal_file::JournalFile;

/// One transactional operation against a file.
#[derive(Debug, Clone)]
pub struct JournalUpdate {
    /// File holding the record.
    pub file: Arc<JournalFile>,
    /// Record id.
    pub id: u64,
    /// Encoded size (zero for negatives).
    pub size: usize,
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Records are being appended.
    Active,
    /// A prepare record was written.
    Prepared,
    /// A commit record was written.
    Committed,
    /// A rollback record was written.
    RolledBack,
}

/// Target for the effects of a completed transaction.
pub trait RecordSink {
    /// A transactional add or update became visible.
    fn add_positive(&self, file: &Arc<JournalFile>, id: u64, size: usize);

    /// A transactional delete became effective; `file` holds the commit.
    fn add_negative(&self, file: &Arc<JournalFile>, id: u64);

    /// Returns true if the commit was queued to run later.
    fn defer_commit(&self, tx: &Arc<JournalTransaction>, file: &Arc<JournalFile>) -> bool;

    /// Returns true if the rollback was queued to run later.
    fn defer_rollback(&self, tx: &Arc<JournalTransaction>, file: &Arc<JournalFile>) -> bool;
}

#[derive(Debug)]
struct TransactionState {
    pos: Vec<JournalUpdate>,
    neg: Vec<JournalUpdate>,
    pending_files: Vec<Arc<JournalFile>>,
    counters: HashMap<u64, u32>,
    compacting: bool,
    status: TransactionStatus,
    callback: Option<Arc<TransactionCallback>>,
}

impl TransactionState {
    fn add_file(&mut self, file: &Arc<JournalFile>) {
        if !self.pending_files.iter().any(|f| f.file_id() == file.file_id()) {
            file.inc_pos_count();
            self.pending_files.push(Arc::clone(file));
        }
    }

    fn inc_counter(&mut self, file: &JournalFile) {
        *self.counters.entry(file.file_id()).or_insert(0) += 1;
    }
}

/// Per-transaction bookkeeping.
pub struct JournalTransaction {
    id: u64,
    state: Mutex<TransactionState>,
}

impl JournalTransaction {
    /// Creates an empty, active transaction.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState {
                pos: Vec::new(),
                neg: Vec::new(),
                pending_files: Vec::new(),
                counters: HashMap::new(),
                compacting: false,
                status: TransactionStatus::Active,
                callback: None,
            }),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current status.
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Records an add or update written to `file`.
    pub fn add_positive(&self, file: &Arc<JournalFile>, id: u64, size: usize) {
        let mut state = self.state.lock();
        state.inc_counter(file);
        state.add_file(file);
        state.pos.push(JournalUpdate {
            file: Arc::clone(file),
            id,
            size,
        });
    }

    /// Records a delete written to `file`.
    pub fn add_negative(&self, file: &Arc<JournalFile>, id: u64) {
        let mut state = self.state.lock();
        state.inc_counter(file);
        state.add_file(file);
        state.neg.push(JournalUpdate {
            file: Arc::clone(file),
            id,
            size: 0,
        });
    }

    /// Number of this transaction's records in `file`.
    pub fn counter(&self, file: &JournalFile) -> u32 {
        self.state
            .lock()
            .counters
            .get(&file.file_id())
            .copied()
            .unwrap_or(0)
    }

    /// Records a prepare written to `file`.
    pub fn prepare(&self, file: &Arc<JournalFile>) {
        let mut state = self.state.lock();
        state.add_file(file);
        state.status = TransactionStatus::Prepared;
    }

    /// Applies the transaction; `file` holds the commit record.
    pub fn commit(self: &Arc<Self>, file: &Arc<JournalFile>, sink: &dyn RecordSink) {
        let compacting = self.state.lock().compacting;
        if compacting && sink.defer_commit(self, file) {
            return;
        }

        let (pos, neg, pending) = {
            let mut state = self.state.lock();
            state.status = TransactionStatus::Committed;
            (
                state.pos.clone(),
                state.neg.clone(),
                state.pending_files.clone(),
            )
        };

        for update in &pos {
            sink.add_positive(&update.file, update.id, update.size);
        }
        for delete in &neg {
            sink.add_negative(file, delete.id);
        }
        for pending_file in &pending {
            file.inc_neg_count(pending_file);
        }
    }

    /// Discards the transaction; `file` holds the rollback record.
    pub fn rollback(self: &Arc<Self>, file: &Arc<JournalFile>, sink: &dyn RecordSink) {
        let compacting = self.state.lock().compacting;
        if compacting && sink.defer_rollback(self, file) {
            return;
        }

        let pending = {
            let mut state = self.state.lock();
            state.status = TransactionStatus::RolledBack;
            state.pending_files.clone()
        };
        for pending_file in &pending {
            file.inc_neg_count(pending_file);
        }
    }

    /// Releases the transaction's hold on its files without completing it.
    ///
    /// Used on load for a commit whose body is incomplete.
    pub fn forget(&self) {
        let state = self.state.lock();
        for file in &state.pending_files {
            file.dec_pos_count();
        }
    }

    /// Clears all file references before a compaction rewrites them.
    pub fn set_compacting(&self) {
        let mut state = self.state.lock();
        state.compacting = true;
        state.pos.clear();
        state.neg.clear();
        state.pending_files.clear();
        state.counters.clear();
        state.callback = None;
    }

    /// Returns true between `set_compacting` and `merge`.
    pub fn is_compacting(&self) -> bool {
        self.state.lock().compacting
    }

    /// Copies the bookkeeping without touching any file counter.
    ///
    /// Lets a failed compaction give back what `set_compacting` cleared.
    pub fn snapshot(&self) -> JournalTransaction {
        let state = self.state.lock();
        JournalTransaction {
            id: self.id,
            state: Mutex::new(TransactionState {
                pos: state.pos.clone(),
                neg: state.neg.clone(),
                pending_files: state.pending_files.clone(),
                counters: state.counters.clone(),
                compacting: false,
                status: state.status,
                callback: None,
            }),
        }
    }

    /// Adopts the compacted copy's file references.
    pub fn merge(&self, other: &JournalTransaction) {
        let (pos, neg, pending, counters) = {
            let other = other.state.lock();
            (
                other.pos.clone(),
                other.neg.clone(),
                other.pending_files.clone(),
                other.counters.clone(),
            )
        };

        let mut state = self.state.lock();
        state.pos.extend(pos);
        state.neg.extend(neg);
        for (file_id, count) in counters {
            *state.counters.entry(file_id).or_insert(0) += count;
        }
        for file in pending {
            if !state.pending_files.iter().any(|f| f.file_id() == file.file_id()) {
                state.pending_files.push(file);
            }
        }
        state.compacting = false;
    }

    /// Ends the compaction hold without a compacted copy.
    pub fn clear_compacting(&self) {
        self.state.lock().compacting = false;
    }

    /// Record ids added or updated by this transaction.
    pub fn positive_ids(&self) -> Vec<u64> {
        self.state.lock().pos.iter().map(|u| u.id).collect()
    }

    /// Files this transaction holds a reference on.
    pub fn pending_files(&self) -> Vec<Arc<JournalFile>> {
        self.state.lock().pending_files.clone()
    }

    /// Returns the completion callback for the next write, counting it up.
    pub fn callback(&self) -> Arc<TransactionCallback> {
        let mut state = self.state.lock();
        let callback = state
            .callback
            .get_or_insert_with(|| Arc::new(TransactionCallback::new()))
            .clone();
        callback.count_up();
        callback
    }

    /// Waits for every write issued through `callback`.
    pub fn wait_callbacks(&self, timeout: Duration) -> JournalResult<()> {
        let callback = self.state.lock().callback.clone();
        match callback {
            Some(callback) => callback.wait_completion(timeout),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for JournalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JournalTransaction")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("positives", &state.pos.len())
            .field("negatives", &state.neg.len())
            .field("pending_files", &state.pending_files.len())
            .field("compacting", &state.compacting)
            .finish()
    }
}

/// Completion shared by every write of one transaction.
///
/// Counts writes as they are issued and forwards `done` to the caller's
/// completion once the last outstanding write finishes.
pub struct TransactionCallback {
    latch: CountDownLatch,
    up: AtomicUsize,
    done: AtomicUsize,
    error: Mutex<Option<(i32, String)>>,
    delegate: Mutex<Option<Arc<dyn IoCompletion>>>,
}

impl TransactionCallback {
    /// Creates a callback with no outstanding writes.
    pub fn new() -> Self {
        Self {
            latch: CountDownLatch::new(0),
            up: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            error: Mutex::new(None),
            delegate: Mutex::new(None),
        }
    }

    /// Counts one more outstanding write.
    pub fn count_up(&self) {
        self.up.fetch_add(1, Ordering::AcqRel);
        self.latch.count_up();
    }

    /// Sets the caller completion to notify when all writes are done.
    pub fn set_delegate_completion(&self, completion: Arc<dyn IoCompletion>) {
        *self.delegate.lock() = Some(completion);
    }

    /// Blocks until every counted write finished, surfacing a reported error.
    pub fn wait_completion(&self, timeout: Duration) -> JournalResult<()> {
        if !self.latch.wait_for(timeout) {
            return Err(JournalError::timeout("transaction completion", timeout));
        }
        match self.error.lock().clone() {
            Some((code, message)) => Err(JournalError::CompletionFailed { code, message }),
            None => Ok(()),
        }
    }
}

impl Default for TransactionCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl IoCompletion for TransactionCallback {
    fn done(&self) {
        self.latch.count_down();
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        if done == self.up.load(Ordering::Acquire) {
            let delegate = self.delegate.lock().take();
            if let Some(delegate) = delegate {
                delegate.done();
            }
        }
    }

    fn on_error(&self, code: i32, message: &str) {
        *self.error.lock() = Some((code, message.to_string()));
        self.latch.count_down();
        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate {
            delegate.on_error(code, message);
        }
    }
}

impl std::fmt::Debug for TransactionCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCallback")
            .field("up", &self.up.load(Ordering::Relaxed))
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}
