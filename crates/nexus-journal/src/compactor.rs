//! Online compaction.
//!
//! A [`JournalCompactor`] is created while the journal is exclusively
//! locked, with a snapshot of the live record ids and of the open
//! transactions. It then replays the old data files through the recovery
//! scanner without any journal lock held and rewrites every still-live
//! record into fresh `.cmp` files, building a replacement record index and
//! replacement transactions against the new files.
//!
//! Appends keep running meanwhile. Updates and deletes of snapshot ids, and
//! completions of snapshot transactions, cannot be applied to the index
//! under construction, so they are queued as commands and replayed when the
//! journal swaps the compacted state in.
//!
//! Output files reuse ordering ids starting at the oldest compacted file's
//! id, so they sort before every file written after the compaction started.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{JournalError, JournalResult};
use crate::format::{COMPACT_SPLIT_LINE, FILL_BYTE, FORMAT_VERSION};
use crate::journal_file::{FileHeader, JournalFile};
use crate::journal_record::JournalRecord;
use crate::reader::{read_journal_file, JournalReaderCallback};
use crate::record::{JournalEntry, RecordInfo};
use crate::repository::JournalFilesRepository;
use crate::transaction::{JournalTransaction, RecordSink};

/// Operation that reached the journal while compaction was running.
enum CompactCommand {
    Update {
        id: u64,
        file: Arc<JournalFile>,
        size: usize,
    },
    Delete {
        id: u64,
        file: Arc<JournalFile>,
    },
    Commit {
        tx: Arc<JournalTransaction>,
        file: Arc<JournalFile>,
    },
    Rollback {
        tx: Arc<JournalTransaction>,
        file: Arc<JournalFile>,
    },
}

/// Output side: the in-memory image of the file being filled.
struct CompactWriter {
    buffer: Option<BytesMut>,
    current_file: Option<Arc<JournalFile>>,
    next_ordering_id: u64,
    new_data_files: Vec<Arc<JournalFile>>,
    will_need_to_split: bool,
    splitted: bool,
}

/// Rewrites live records of old data files into new files.
pub struct JournalCompactor {
    repository: Arc<JournalFilesRepository>,
    records_snapshot: DashSet<u64>,
    pending_transactions: DashMap<u64, Vec<u64>>,
    new_records: Mutex<HashMap<u64, JournalRecord>>,
    new_transactions: Mutex<HashMap<u64, Arc<JournalTransaction>>>,
    pending_commands: Mutex<Vec<CompactCommand>>,
    writer: Mutex<CompactWriter>,
}

impl JournalCompactor {
    /// Creates a compactor over a snapshot of the live record ids.
    pub fn new(
        repository: Arc<JournalFilesRepository>,
        records_snapshot: impl IntoIterator<Item = u64>,
        first_file_id: u64,
    ) -> Self {
        Self {
            repository,
            records_snapshot: records_snapshot.into_iter().collect(),
            pending_transactions: DashMap::new(),
            new_records: Mutex::new(HashMap::new()),
            new_transactions: Mutex::new(HashMap::new()),
            pending_commands: Mutex::new(Vec::new()),
            writer: Mutex::new(CompactWriter {
                buffer: None,
                current_file: None,
                next_ordering_id: first_file_id,
                new_data_files: Vec::new(),
                will_need_to_split: false,
                splitted: false,
            }),
        }
    }

    /// Registers a transaction that was open when compaction started.
    pub fn add_pending_transaction(&self, tx_id: u64, positive_ids: Vec<u64>) {
        self.pending_transactions.insert(tx_id, positive_ids);
    }

    /// Returns true if `id` is part of the compacted state.
    pub fn lookup_record(&self, id: u64) -> bool {
        self.records_snapshot.contains(&id)
    }

    fn add_to_records(&self, id: u64) {
        self.records_snapshot.insert(id);
    }

    fn is_pending(&self, tx_id: u64) -> bool {
        self.pending_transactions.contains_key(&tx_id)
    }

    /// Rewrites the live records of one old data file.
    pub fn compact_file(&self, file: &JournalFile) -> JournalResult<()> {
        debug!(file = %file, "compacting file");
        read_journal_file(file, &mut CompactorReader(self))?;
        Ok(())
    }

    /// Writes the file being filled, padded to the file size.
    pub fn flush(&self) -> JournalResult<()> {
        let mut writer = self.writer.lock();
        Self::flush_writer(&mut writer, self.repository.file_size())
    }

    fn flush_writer(writer: &mut CompactWriter, file_size: usize) -> JournalResult<()> {
        if let (Some(mut buffer), Some(file)) = (writer.buffer.take(), writer.current_file.as_ref()) {
            buffer.resize(file_size, FILL_BYTE);
            let sf = file.file();
            sf.open()?;
            sf.position(0)?;
            let result = sf.write_direct(buffer.freeze(), true);
            sf.close()?;
            result?;
        }
        Ok(())
    }

    /// Starts a new output file.
    fn open_file(&self, writer: &mut CompactWriter) -> JournalResult<()> {
        let file_size = self.repository.file_size();
        Self::flush_writer(writer, file_size)?;

        let taken = self.repository.take_file(false, false, true)?;
        let file_id = writer.next_ordering_id;
        writer.next_ordering_id += 1;
        let file = Arc::new(JournalFile::new(Arc::clone(taken.file()), file_id, FORMAT_VERSION));

        let mut buffer = self.repository.factory().new_buffer(file_size);
        FileHeader::new(self.repository.user_version(), file_id).encode(&mut buffer);

        trace!(file = %file, "compaction output file");
        writer.buffer = Some(buffer);
        writer.current_file = Some(Arc::clone(&file));
        writer.new_data_files.push(file);
        Ok(())
    }

    /// Returns true if a split opened a new file.
    fn check_compact(&self, writer: &mut CompactWriter, compact_count: u8) -> JournalResult<bool> {
        if compact_count >= COMPACT_SPLIT_LINE && !writer.splitted {
            writer.will_need_to_split = true;
        }
        if writer.will_need_to_split && compact_count < COMPACT_SPLIT_LINE {
            writer.will_need_to_split = false;
            writer.splitted = true;
            self.open_file(writer)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Makes room for `size` bytes, splitting on the compaction counter.
    fn check_size(
        &self,
        writer: &mut CompactWriter,
        size: usize,
        compact_count: Option<u8>,
    ) -> JournalResult<()> {
        if writer.buffer.is_none() {
            let split = match compact_count {
                Some(count) => self.check_compact(writer, count)?,
                None => false,
            };
            if !split {
                self.open_file(writer)?;
            }
            return Ok(());
        }

        if let Some(count) = compact_count {
            if self.check_compact(writer, count)? {
                return Ok(());
            }
        }

        let written = writer.buffer.as_ref().map_or(0, |b| b.len());
        if written + size > self.repository.file_size() {
            self.open_file(writer)?;
        }
        Ok(())
    }

    /// Appends `entry` to the output, returning the file that holds it.
    fn write_entry(
        &self,
        entry: &JournalEntry,
        compact_count: u8,
        number_of_records: impl FnOnce(&JournalFile) -> u32,
        split_count: Option<u8>,
    ) -> JournalResult<(Arc<JournalFile>, usize)> {
        let size = entry.encoded_size();
        let mut writer = self.writer.lock();
        self.check_size(&mut writer, size, split_count)?;

        let file = match writer.current_file.as_ref() {
            Some(file) => Arc::clone(file),
            None => return Err(JournalError::compaction_failed("no output file")),
        };
        let n = number_of_records(&file);
        if let Some(buffer) = writer.buffer.as_mut() {
            entry.encode_into(buffer, file.record_id(), compact_count, n);
        }
        Ok((file, size))
    }

    fn new_transaction(&self, tx_id: u64) -> Arc<JournalTransaction> {
        Arc::clone(
            self.new_transactions
                .lock()
                .entry(tx_id)
                .or_insert_with(|| Arc::new(JournalTransaction::new(tx_id))),
        )
    }

    /// Output files written so far.
    pub fn new_data_files(&self) -> Vec<Arc<JournalFile>> {
        self.writer.lock().new_data_files.clone()
    }

    /// Takes the rebuilt record index.
    pub fn take_new_records(&self) -> HashMap<u64, JournalRecord> {
        std::mem::take(&mut *self.new_records.lock())
    }

    /// Rebuilt transactions not completed during compaction.
    pub fn new_transactions(&self) -> Vec<Arc<JournalTransaction>> {
        self.new_transactions.lock().values().cloned().collect()
    }

    /// Drops everything built so far and returns the output files.
    pub fn discard(&self) -> Vec<Arc<JournalFile>> {
        self.new_records.lock().clear();
        self.new_transactions.lock().clear();
        let mut writer = self.writer.lock();
        writer.buffer = None;
        writer.current_file = None;
        std::mem::take(&mut writer.new_data_files)
    }

    /// Number of queued commands.
    pub fn pending_commands(&self) -> usize {
        self.pending_commands.lock().len()
    }

    /// Queues the commit of a transaction that was open at the snapshot.
    pub fn add_command_commit(&self, tx: &Arc<JournalTransaction>, file: &Arc<JournalFile>) {
        self.pending_commands.lock().push(CompactCommand::Commit {
            tx: Arc::clone(tx),
            file: Arc::clone(file),
        });

        // Later deletes of these ids must be accepted before the swap.
        for id in tx.positive_ids() {
            self.add_to_records(id);
        }
        if let Some(ids) = self.pending_transactions.get(&tx.id()) {
            for id in ids.iter() {
                self.add_to_records(*id);
            }
        }
    }

    /// Queues the rollback of a transaction that was open at the snapshot.
    pub fn add_command_rollback(&self, tx: &Arc<JournalTransaction>, file: &Arc<JournalFile>) {
        self.pending_commands.lock().push(CompactCommand::Rollback {
            tx: Arc::clone(tx),
            file: Arc::clone(file),
        });
    }

    /// Queues a delete of a snapshot record.
    pub fn add_command_delete(&self, id: u64, file: &Arc<JournalFile>) {
        self.pending_commands.lock().push(CompactCommand::Delete {
            id,
            file: Arc::clone(file),
        });
    }

    /// Queues an update of a snapshot record.
    pub fn add_command_update(&self, id: u64, file: &Arc<JournalFile>, size: usize) {
        self.pending_commands.lock().push(CompactCommand::Update {
            id,
            file: Arc::clone(file),
            size,
        });
    }

    /// Applies the queued commands to the swapped-in index.
    ///
    /// `sink` must no longer route anything to this compactor.
    pub fn replay_pending_commands(
        &self,
        records: &DashMap<u64, JournalRecord>,
        sink: &dyn RecordSink,
    ) {
        let commands = std::mem::take(&mut *self.pending_commands.lock());
        debug!(commands = commands.len(), "replaying commands queued during compaction");

        for command in commands {
            match command {
                CompactCommand::Update { id, file, size } => match records.get_mut(&id) {
                    Some(mut record) => record.add_update_file(file, size),
                    None => warn!(id, "no record during compact replay"),
                },
                CompactCommand::Delete { id, file } => match records.remove(&id) {
                    Some((_, record)) => record.delete(&file),
                    None => warn!(id, "no record during compact replay"),
                },
                CompactCommand::Commit { tx, file } => {
                    self.adopt_compacted(&tx);
                    tx.commit(&file, sink);
                }
                CompactCommand::Rollback { tx, file } => {
                    self.adopt_compacted(&tx);
                    tx.rollback(&file, sink);
                }
            }
        }
    }

    fn adopt_compacted(&self, live: &JournalTransaction) {
        let compacted = self.new_transactions.lock().remove(&live.id());
        match compacted {
            Some(compacted) => live.merge(&compacted),
            None => live.clear_compacting(),
        }
    }
}

impl RecordSink for JournalCompactor {
    fn add_positive(&self, file: &Arc<JournalFile>, id: u64, size: usize) {
        let mut records = self.new_records.lock();
        match records.get_mut(&id) {
            Some(record) => record.add_update_file(Arc::clone(file), size),
            None => {
                records.insert(id, JournalRecord::new(Arc::clone(file), size));
            }
        }
    }

    fn add_negative(&self, file: &Arc<JournalFile>, id: u64) {
        if let Some(record) = self.new_records.lock().remove(&id) {
            record.delete(file);
        }
    }

    fn defer_commit(&self, _: &Arc<JournalTransaction>, _: &Arc<JournalFile>) -> bool {
        false
    }

    fn defer_rollback(&self, _: &Arc<JournalTransaction>, _: &Arc<JournalFile>) -> bool {
        false
    }
}

impl std::fmt::Debug for JournalCompactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalCompactor")
            .field("snapshot", &self.records_snapshot.len())
            .field("pending_transactions", &self.pending_transactions.len())
            .field("new_records", &self.new_records.lock().len())
            .field("new_files", &self.writer.lock().new_data_files.len())
            .field("pending_commands", &self.pending_commands())
            .finish()
    }
}

/// Scanner callback feeding old records into a compactor.
struct CompactorReader<'a>(&'a JournalCompactor);

fn next_count(info: &RecordInfo) -> u8 {
    info.compact_count.saturating_add(1)
}

impl JournalReaderCallback for CompactorReader<'_> {
    fn on_read_add_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.lookup_record(info.id) {
            let compact_count = next_count(&info);
            let split_count = info.compact_count;
            let id = info.id;
            let entry = JournalEntry::Add {
                id,
                user_type: info.user_record_type,
                body: info.data,
            };
            let (file, size) = compactor.write_entry(&entry, compact_count, |_| 0, Some(split_count))?;
            compactor
                .new_records
                .lock()
                .insert(id, JournalRecord::new(file, size));
        }
        Ok(())
    }

    fn on_read_update_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.lookup_record(info.id) {
            let compact_count = next_count(&info);
            let split_count = info.compact_count;
            let id = info.id;
            let entry = JournalEntry::Update {
                id,
                user_type: info.user_record_type,
                body: info.data,
            };
            let (file, size) = compactor.write_entry(&entry, compact_count, |_| 0, Some(split_count))?;
            match compactor.new_records.lock().get_mut(&id) {
                Some(record) => record.add_update_file(file, size),
                None => warn!(id, "compacting update without an add record"),
            }
        }
        Ok(())
    }

    fn on_read_delete_record(&mut self, id: u64) -> JournalResult<()> {
        if self.0.new_records.lock().contains_key(&id) {
            warn!(id, "inconsistency during compacting: delete of a live record");
        }
        Ok(())
    }

    fn on_read_add_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.is_pending(tx_id) || compactor.lookup_record(info.id) {
            let tx = compactor.new_transaction(tx_id);
            let compact_count = next_count(&info);
            let split_count = info.compact_count;
            let id = info.id;
            let entry = JournalEntry::AddTx {
                tx_id,
                id,
                user_type: info.user_record_type,
                body: info.data,
            };
            let (file, size) = compactor.write_entry(&entry, compact_count, |_| 0, Some(split_count))?;
            tx.add_positive(&file, id, size);
        }
        Ok(())
    }

    fn on_read_update_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.is_pending(tx_id) || compactor.lookup_record(info.id) {
            let tx = compactor.new_transaction(tx_id);
            let compact_count = next_count(&info);
            let split_count = info.compact_count;
            let id = info.id;
            let entry = JournalEntry::UpdateTx {
                tx_id,
                id,
                user_type: info.user_record_type,
                body: info.data,
            };
            let (file, size) = compactor.write_entry(&entry, compact_count, |_| 0, Some(split_count))?;
            tx.add_positive(&file, id, size);
            Ok(())
        } else {
            self.on_read_update_record(info)
        }
    }

    fn on_read_delete_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.is_pending(tx_id) {
            let tx = compactor.new_transaction(tx_id);
            let id = info.id;
            let entry = JournalEntry::DeleteTx {
                tx_id,
                id,
                body: info.data,
            };
            let (file, _) = compactor.write_entry(&entry, 0, |_| 0, None)?;
            tx.add_negative(&file, id);
        }
        Ok(())
    }

    fn on_read_prepare_record(
        &mut self,
        tx_id: u64,
        extra_data: Bytes,
        _number_of_records: u32,
    ) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.is_pending(tx_id) {
            let tx = compactor.new_transaction(tx_id);
            let entry = JournalEntry::Prepare {
                tx_id,
                extra: extra_data,
            };
            let (file, _) = compactor.write_entry(&entry, 0, |file| tx.counter(file), None)?;
            tx.prepare(&file);
        }
        Ok(())
    }

    fn on_read_commit_record(&mut self, tx_id: u64, _number_of_records: u32) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.is_pending(tx_id) {
            warn!(tx_id, "inconsistency during compacting: commit of a pending transaction");
            return Ok(());
        }

        let tx = compactor.new_transactions.lock().remove(&tx_id);
        if let Some(tx) = tx {
            let entry = JournalEntry::Commit { tx_id };
            let (file, _) = compactor.write_entry(&entry, 0, |file| tx.counter(file), None)?;
            tx.commit(&file, compactor);
        }
        Ok(())
    }

    fn on_read_rollback_record(&mut self, tx_id: u64) -> JournalResult<()> {
        let compactor = self.0;
        if compactor.is_pending(tx_id) {
            return Err(JournalError::inconsistency(format!(
                "rollback of transaction {} that was still pending when compaction started",
                tx_id
            )));
        }

        let tx = compactor.new_transactions.lock().remove(&tx_id);
        if let Some(tx) = tx {
            let entry = JournalEntry::Rollback { tx_id };
            let (file, _) = compactor.write_entry(&entry, 0, |_| 0, None)?;
            tx.rollback(&file, compactor);
        }
        Ok(())
    }
}
