//! Loader-facing types.
//!
//! `Journal::load` replays committed state into a [`LoaderCallback`]. Records
//! are delivered in file id order, then physical order, with transactional
//! records delivered when their commit is read.

use std::collections::HashSet;

use bytes::Bytes;

use crate::record::RecordInfo;

/// Receives transactions that could not be completed during a load.
pub trait TransactionFailureCallback {
    /// A transaction without a usable commit or prepare.
    ///
    /// The journal has already discarded it and, when allowed to change
    /// data, appended a rollback record for it.
    fn failed_transaction(
        &mut self,
        tx_id: u64,
        records: Vec<RecordInfo>,
        records_to_delete: Vec<RecordInfo>,
    );
}

/// Receives the committed contents of the journal during a load.
pub trait LoaderCallback: TransactionFailureCallback {
    /// A transaction that was prepared but neither committed nor rolled back.
    fn add_prepared_transaction(&mut self, info: PreparedTransactionInfo);

    /// A committed add.
    fn add_record(&mut self, info: RecordInfo);

    /// A committed delete.
    fn delete_record(&mut self, id: u64);

    /// A committed update.
    fn update_record(&mut self, info: RecordInfo);
}

/// A prepared transaction recovered by a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransactionInfo {
    /// Transaction id.
    pub tx_id: u64,
    /// Opaque data stored with the prepare record.
    pub extra_data: Bytes,
    /// Adds and updates of the transaction, in write order.
    pub records: Vec<RecordInfo>,
    /// Deletes of the transaction, in write order.
    pub records_to_delete: Vec<RecordInfo>,
}

impl PreparedTransactionInfo {
    /// Creates an empty prepared transaction.
    pub fn new(tx_id: u64, extra_data: Bytes) -> Self {
        Self {
            tx_id,
            extra_data,
            records: Vec::new(),
            records_to_delete: Vec::new(),
        }
    }
}

/// Summary returned by a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalLoadInformation {
    /// Live records after the load.
    pub number_of_records: usize,
    /// Highest record id seen in any add or update, if any.
    pub max_id: Option<u64>,
}

impl JournalLoadInformation {
    /// Creates a load summary.
    pub fn new(number_of_records: usize, max_id: Option<u64>) -> Self {
        Self {
            number_of_records,
            max_id,
        }
    }
}

/// Loader that discards everything.
///
/// Used to rebuild the journal's bookkeeping without keeping the records.
#[derive(Debug, Default)]
pub struct NullLoader;

impl TransactionFailureCallback for NullLoader {
    fn failed_transaction(&mut self, _: u64, _: Vec<RecordInfo>, _: Vec<RecordInfo>) {}
}

impl LoaderCallback for NullLoader {
    fn add_prepared_transaction(&mut self, _: PreparedTransactionInfo) {}
    fn add_record(&mut self, _: RecordInfo) {}
    fn delete_record(&mut self, _: u64) {}
    fn update_record(&mut self, _: RecordInfo) {}
}

/// Result of a list-based load.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    /// Committed adds and updates whose id was never deleted during the load.
    pub committed: Vec<RecordInfo>,
    /// Prepared transactions.
    pub prepared: Vec<PreparedTransactionInfo>,
    /// Load summary.
    pub info: JournalLoadInformation,
}

/// Loader collecting records into lists.
pub(crate) struct ListLoader<'a> {
    records: Vec<RecordInfo>,
    deleted: HashSet<u64>,
    prepared: Vec<PreparedTransactionInfo>,
    failure_callback: Option<&'a mut dyn TransactionFailureCallback>,
}

impl<'a> ListLoader<'a> {
    pub(crate) fn new(failure_callback: Option<&'a mut dyn TransactionFailureCallback>) -> Self {
        Self {
            records: Vec::new(),
            deleted: HashSet::new(),
            prepared: Vec::new(),
            failure_callback,
        }
    }

    /// Drops every record whose id was deleted at any point of the load.
    pub(crate) fn finish(self, info: JournalLoadInformation) -> LoadedRecords {
        let deleted = self.deleted;
        LoadedRecords {
            committed: self
                .records
                .into_iter()
                .filter(|r| !deleted.contains(&r.id))
                .collect(),
            prepared: self.prepared,
            info,
        }
    }
}

impl TransactionFailureCallback for ListLoader<'_> {
    fn failed_transaction(
        &mut self,
        tx_id: u64,
        records: Vec<RecordInfo>,
        records_to_delete: Vec<RecordInfo>,
    ) {
        if let Some(callback) = self.failure_callback.as_mut() {
            callback.failed_transaction(tx_id, records, records_to_delete);
        }
    }
}

impl LoaderCallback for ListLoader<'_> {
    fn add_prepared_transaction(&mut self, info: PreparedTransactionInfo) {
        self.prepared.push(info);
    }

    fn add_record(&mut self, info: RecordInfo) {
        self.records.push(info);
    }

    fn delete_record(&mut self, id: u64) {
        self.deleted.insert(id);
    }

    fn update_record(&mut self, info: RecordInfo) {
        self.records.push(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64, body: &'static [u8]) -> RecordInfo {
        RecordInfo::new(id, 1, Bytes::from_static(body), false, 0)
    }

    #[derive(Default)]
    struct Failures(Vec<u64>);

    impl TransactionFailureCallback for Failures {
        fn failed_transaction(&mut self, tx_id: u64, _: Vec<RecordInfo>, _: Vec<RecordInfo>) {
            self.0.push(tx_id);
        }
    }

    #[test]
    fn test_list_loader_filters_deleted_ids() {
        let mut failures = Failures::default();
        let mut loader = ListLoader::new(Some(&mut failures));

        loader.add_record(info(1, b"a"));
        loader.add_record(info(2, b"b"));
        loader.update_record(info(1, b"a2"));
        loader.delete_record(2);
        loader.add_prepared_transaction(PreparedTransactionInfo::new(9, Bytes::new()));
        loader.failed_transaction(7, Vec::new(), Vec::new());

        let loaded = loader.finish(JournalLoadInformation::new(1, Some(2)));
        let ids: Vec<u64> = loaded.committed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 1]);
        assert_eq!(loaded.committed[1].data, Bytes::from_static(b"a2"));
        assert_eq!(loaded.prepared.len(), 1);
        assert_eq!(loaded.info.max_id, Some(2));
        assert_eq!(failures.0, vec![7]);
    }

    #[test]
    fn test_list_loader_without_failure_callback() {
        let mut loader = ListLoader::new(None);
        loader.failed_transaction(3, vec![info(1, b"x")], Vec::new());
        let loaded = loader.finish(JournalLoadInformation::default());
        assert!(loaded.committed.is_empty());
        assert_eq!(loaded.info.max_id, None);
    }
}
