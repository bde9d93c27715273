//! Recovery scanner.
//!
//! This module replays one journal file into a [`JournalReaderCallback`]:
//! - Reads the whole file and skips the header
//! - Scans byte by byte for a valid record type, so a torn record never
//!   desynchronizes the scan
//! - Validates the file record id, every length field and the trailing
//!   check size before dispatching
//!
//! Records left behind by a previous use of a recycled file carry a different
//! file record id and are skipped silently. Anything else that fails
//! validation marks the file as a data file and the scan resumes one byte
//! after the failed record start.

use bytes::{Buf, Bytes};
use tracing::trace;

use crate::error::{JournalError, JournalResult};
use crate::format::{COMPACT_COUNT_VERSION, SIZE_BYTE, SIZE_HEADER, SIZE_INT, SIZE_LONG};
use crate::journal_file::JournalFile;
use crate::record::{RecordInfo, RecordType};

/// Receives the records decoded by [`read_journal_file`].
///
/// Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait JournalReaderCallback {
    /// A non-transactional add.
    fn on_read_add_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        Ok(())
    }

    /// A non-transactional update.
    fn on_read_update_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        Ok(())
    }

    /// A non-transactional delete.
    fn on_read_delete_record(&mut self, id: u64) -> JournalResult<()> {
        Ok(())
    }

    /// A transactional add.
    fn on_read_add_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        Ok(())
    }

    /// A transactional update.
    fn on_read_update_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        Ok(())
    }

    /// A transactional delete. `info.data` holds the caller data, if any.
    fn on_read_delete_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
        Ok(())
    }

    /// A prepare with `number_of_records` transactional records in this file.
    fn on_read_prepare_record(
        &mut self,
        tx_id: u64,
        extra_data: Bytes,
        number_of_records: u32,
    ) -> JournalResult<()> {
        Ok(())
    }

    /// A commit with `number_of_records` transactional records in this file.
    fn on_read_commit_record(&mut self, tx_id: u64, number_of_records: u32) -> JournalResult<()> {
        Ok(())
    }

    /// A rollback.
    fn on_read_rollback_record(&mut self, tx_id: u64) -> JournalResult<()> {
        Ok(())
    }

    /// The file holds bytes that failed validation.
    fn mark_as_data_file(&mut self, file: &JournalFile) {}
}

/// Cursor over a whole-file buffer.
struct Scan<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Scan<'_> {
    /// Returns true if `size` bytes are available at the cursor.
    fn fits(&self, size: usize) -> bool {
        fits_at(self.data.len(), self.pos, size)
    }

    fn get_u8(&mut self) -> u8 {
        let value = self.data[self.pos];
        self.pos += SIZE_BYTE;
        value
    }

    fn get_u32(&mut self) -> u32 {
        let value = (&self.data[self.pos..]).get_u32();
        self.pos += SIZE_INT;
        value
    }

    fn get_i32(&mut self) -> i32 {
        let value = (&self.data[self.pos..]).get_i32();
        self.pos += SIZE_INT;
        value
    }

    fn get_u64(&mut self) -> u64 {
        let value = (&self.data[self.pos..]).get_u64();
        self.pos += SIZE_LONG;
        value
    }
}

fn fits_at(file_size: usize, pos: usize, size: usize) -> bool {
    pos.checked_add(size).map_or(false, |end| end <= file_size)
}

/// Reads the whole content of a journal file through a fresh handle.
pub fn read_whole_file(file: &JournalFile) -> JournalResult<Bytes> {
    let handle = file.file().clone_file();
    handle.open()?;
    let result = (|| -> JournalResult<Bytes> {
        let size = handle.size()?;
        let mut buf = vec![0u8; size];
        handle.position(0)?;
        let read = handle.read(&mut buf)?;
        if read != size {
            return Err(JournalError::ShortRead {
                file: handle.file_name(),
                expected: size,
                read,
            });
        }
        Ok(Bytes::from(buf))
    })();
    handle.close()?;
    result
}

/// Replays every valid record of `file` into `reader`.
///
/// Returns the position right after the last valid record, which is where
/// appends resume if this file becomes the current file again.
pub fn read_journal_file(
    file: &JournalFile,
    reader: &mut dyn JournalReaderCallback,
) -> JournalResult<usize> {
    let data = read_whole_file(file)?;
    scan_buffer(file, &data, reader)
}

/// Replays the records of an in-memory copy of `file`.
pub fn scan_buffer(
    file: &JournalFile,
    data: &Bytes,
    reader: &mut dyn JournalReaderCallback,
) -> JournalResult<usize> {
    let file_size = data.len();
    let version = file.version();
    let mut scan = Scan {
        data: data.as_ref(),
        pos: SIZE_HEADER.min(file_size),
    };
    let mut last_data_pos = SIZE_HEADER;

    while scan.pos < file_size {
        let start = scan.pos;
        let record_type = match RecordType::from_u8(scan.get_u8()) {
            Some(record_type) => record_type,
            None => continue,
        };

        macro_rules! skip {
            (mark) => {{
                reader.mark_as_data_file(file);
                scan.pos = start + 1;
                continue;
            }};
            () => {{
                scan.pos = start + 1;
                continue;
            }};
        }

        if !scan.fits(SIZE_INT) {
            skip!(mark);
        }

        // A different id means the bytes predate the last recycle of this file.
        if scan.get_u32() != file.record_id() {
            skip!();
        }

        let mut compact_count = 0;
        if version >= COMPACT_COUNT_VERSION {
            if !scan.fits(SIZE_BYTE) {
                skip!(mark);
            }
            compact_count = scan.get_u8();
        }

        let mut tx_id = 0;
        if record_type.is_transaction() {
            if !scan.fits(SIZE_LONG) {
                skip!(mark);
            }
            tx_id = scan.get_u64();
        }

        let mut record_id = 0;
        if !record_type.is_complete_transaction() {
            if !scan.fits(SIZE_LONG) {
                skip!(mark);
            }
            record_id = scan.get_u64();
        }

        let mut variable_size = 0usize;
        let mut user_record_type = 0u8;
        let mut body = Bytes::new();

        if record_type.contains_body() {
            if !scan.fits(SIZE_INT) {
                skip!(mark);
            }
            let size = scan.get_i32();

            if record_type.has_user_type() {
                if !scan.fits(SIZE_BYTE) {
                    skip!();
                }
                user_record_type = scan.get_u8();
            }

            if size < 0 || !scan.fits(size as usize) {
                skip!();
            }
            variable_size = size as usize;
            body = data.slice(scan.pos..scan.pos + variable_size);
            scan.pos += variable_size;
        }

        let mut number_of_records = 0;
        let mut extra_size = 0usize;

        if matches!(record_type, RecordType::Prepare | RecordType::Commit) {
            if !scan.fits(SIZE_INT) {
                skip!();
            }
            number_of_records = scan.get_u32();

            if record_type == RecordType::Prepare {
                if !scan.fits(SIZE_INT) {
                    skip!();
                }
                let size = scan.get_i32();
                if size < 0 {
                    skip!(mark);
                }
                extra_size = size as usize;
            }
        }

        let record_size = record_type.fixed_size(version);
        let total_size = record_size + variable_size + extra_size;

        if !fits_at(file_size, start, total_size) {
            trace!(
                file = %file,
                position = start,
                record_type = record_type.as_u8(),
                total_size,
                "record exceeds file bounds, ignoring"
            );
            skip!(mark);
        }

        let check_pos = start + total_size - SIZE_INT;
        let check_size = (&data[check_pos..]).get_u32();
        if check_size as usize != total_size {
            trace!(
                file = %file,
                position = start,
                record_type = record_type.as_u8(),
                tx_id,
                record_id,
                "record check size mismatch, ignoring"
            );
            skip!(mark);
        }

        match record_type {
            RecordType::Add => reader.on_read_add_record(RecordInfo::new(
                record_id,
                user_record_type,
                body,
                false,
                compact_count,
            ))?,
            RecordType::Update => reader.on_read_update_record(RecordInfo::new(
                record_id,
                user_record_type,
                body,
                true,
                compact_count,
            ))?,
            RecordType::Delete => reader.on_read_delete_record(record_id)?,
            RecordType::AddTx => reader.on_read_add_record_tx(
                tx_id,
                RecordInfo::new(record_id, user_record_type, body, false, compact_count),
            )?,
            RecordType::UpdateTx => reader.on_read_update_record_tx(
                tx_id,
                RecordInfo::new(record_id, user_record_type, body, true, compact_count),
            )?,
            RecordType::DeleteTx => reader.on_read_delete_record_tx(
                tx_id,
                RecordInfo::new(record_id, 0, body, true, compact_count),
            )?,
            RecordType::Prepare => {
                let extra = data.slice(scan.pos..scan.pos + extra_size);
                scan.pos += extra_size;
                reader.on_read_prepare_record(tx_id, extra, number_of_records)?
            }
            RecordType::Commit => reader.on_read_commit_record(tx_id, number_of_records)?,
            RecordType::Rollback => reader.on_read_rollback_record(tx_id)?,
        }

        if scan.pos != check_pos {
            return Err(JournalError::internal_corruption(
                file.file_name(),
                start,
                format!(
                    "decoded up to {} but check size sits at {}",
                    scan.pos, check_pos
                ),
            ));
        }
        scan.pos += SIZE_INT;
        last_data_pos = scan.pos;
    }

    Ok(last_data_pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{SequentialFile, SequentialFileFactory, StdFileFactory};
    use crate::format::FORMAT_VERSION;
    use crate::journal_file::init_file_header;
    use crate::record::JournalEntry;
    use bytes::{BufMut, BytesMut};
    use std::sync::Arc;
    use tempfile::TempDir;

    const FILE_SIZE: usize = 4096;

    #[derive(Debug, PartialEq)]
    enum Event {
        Add(u64, u8, Vec<u8>),
        Update(u64, u8, Vec<u8>),
        Delete(u64),
        AddTx(u64, u64, Vec<u8>),
        UpdateTx(u64, u64, Vec<u8>),
        DeleteTx(u64, u64, Vec<u8>),
        Prepare(u64, Vec<u8>, u32),
        Commit(u64, u32),
        Rollback(u64),
        Marked,
    }

    #[derive(Default)]
    struct Collector {
        events: Vec<Event>,
    }

    impl JournalReaderCallback for Collector {
        fn on_read_add_record(&mut self, info: RecordInfo) -> JournalResult<()> {
            self.events
                .push(Event::Add(info.id, info.user_record_type, info.data.to_vec()));
            Ok(())
        }

        fn on_read_update_record(&mut self, info: RecordInfo) -> JournalResult<()> {
            assert!(info.is_update);
            self.events
                .push(Event::Update(info.id, info.user_record_type, info.data.to_vec()));
            Ok(())
        }

        fn on_read_delete_record(&mut self, id: u64) -> JournalResult<()> {
            self.events.push(Event::Delete(id));
            Ok(())
        }

        fn on_read_add_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
            self.events
                .push(Event::AddTx(tx_id, info.id, info.data.to_vec()));
            Ok(())
        }

        fn on_read_update_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
            self.events
                .push(Event::UpdateTx(tx_id, info.id, info.data.to_vec()));
            Ok(())
        }

        fn on_read_delete_record_tx(&mut self, tx_id: u64, info: RecordInfo) -> JournalResult<()> {
            self.events
                .push(Event::DeleteTx(tx_id, info.id, info.data.to_vec()));
            Ok(())
        }

        fn on_read_prepare_record(
            &mut self,
            tx_id: u64,
            extra_data: Bytes,
            number_of_records: u32,
        ) -> JournalResult<()> {
            self.events
                .push(Event::Prepare(tx_id, extra_data.to_vec(), number_of_records));
            Ok(())
        }

        fn on_read_commit_record(&mut self, tx_id: u64, number_of_records: u32) -> JournalResult<()> {
            self.events.push(Event::Commit(tx_id, number_of_records));
            Ok(())
        }

        fn on_read_rollback_record(&mut self, tx_id: u64) -> JournalResult<()> {
            self.events.push(Event::Rollback(tx_id));
            Ok(())
        }

        fn mark_as_data_file(&mut self, _file: &JournalFile) {
            if self.events.last() != Some(&Event::Marked) {
                self.events.push(Event::Marked);
            }
        }
    }

    fn new_file(tmp: &TempDir, file_id: u64) -> (Arc<dyn SequentialFile>, JournalFile) {
        let factory = StdFileFactory::new(tmp.path());
        let seq = factory.create_sequential_file(&format!("scan-{}.njr", file_id));
        seq.open().unwrap();
        seq.fill(FILE_SIZE, 0).unwrap();
        init_file_header(seq.as_ref(), 0, file_id).unwrap();
        let jf = JournalFile::new(seq.clone(), file_id, FORMAT_VERSION);
        (seq, jf)
    }

    fn write(seq: &Arc<dyn SequentialFile>, bytes: Bytes) {
        seq.write_direct(bytes, false).unwrap();
    }

    fn scan_file(jf: &JournalFile) -> (Vec<Event>, usize) {
        let mut collector = Collector::default();
        let last = read_journal_file(jf, &mut collector).unwrap();
        (collector.events, last)
    }

    #[test]
    fn test_all_record_kinds() {
        let tmp = TempDir::new().unwrap();
        let (seq, jf) = new_file(&tmp, 3);
        let rid = jf.record_id();

        let entries = vec![
            (JournalEntry::Add { id: 1, user_type: 7, body: Bytes::from_static(b"one") }, 0),
            (JournalEntry::Update { id: 1, user_type: 8, body: Bytes::from_static(b"uno") }, 0),
            (JournalEntry::Delete { id: 1 }, 0),
            (JournalEntry::AddTx { tx_id: 9, id: 2, user_type: 1, body: Bytes::from_static(b"two") }, 0),
            (JournalEntry::UpdateTx { tx_id: 9, id: 2, user_type: 1, body: Bytes::from_static(b"dos") }, 0),
            (JournalEntry::DeleteTx { tx_id: 9, id: 5, body: Bytes::from_static(b"why") }, 0),
            (JournalEntry::Prepare { tx_id: 9, extra: Bytes::from_static(b"xid-9") }, 3),
            (JournalEntry::Commit { tx_id: 9 }, 3),
            (JournalEntry::Rollback { tx_id: 10 }, 0),
        ];

        let mut expected_end = SIZE_HEADER;
        for (entry, n) in &entries {
            expected_end += entry.encoded_size();
            write(&seq, entry.encode(rid, 0, *n));
        }

        let (events, last) = scan_file(&jf);
        assert_eq!(
            events,
            vec![
                Event::Add(1, 7, b"one".to_vec()),
                Event::Update(1, 8, b"uno".to_vec()),
                Event::Delete(1),
                Event::AddTx(9, 2, b"two".to_vec()),
                Event::UpdateTx(9, 2, b"dos".to_vec()),
                Event::DeleteTx(9, 5, b"why".to_vec()),
                Event::Prepare(9, b"xid-9".to_vec(), 3),
                Event::Commit(9, 3),
                Event::Rollback(10),
            ]
        );
        assert_eq!(last, expected_end);
    }

    #[test]
    fn test_empty_file() {
        let tmp = TempDir::new().unwrap();
        let (_seq, jf) = new_file(&tmp, 1);
        let (events, last) = scan_file(&jf);
        assert!(events.is_empty());
        assert_eq!(last, SIZE_HEADER);
    }

    #[test]
    fn test_stale_records_from_previous_use_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let (seq, jf) = new_file(&tmp, 4);

        let stale = JournalEntry::Add { id: 1, user_type: 0, body: Bytes::from_static(b"old") };
        write(&seq, stale.encode(3, 0, 0));
        let fresh = JournalEntry::Add { id: 2, user_type: 0, body: Bytes::from_static(b"new") };
        write(&seq, fresh.encode(jf.record_id(), 0, 0));

        let (events, last) = scan_file(&jf);
        assert_eq!(events, vec![Event::Add(2, 0, b"new".to_vec())]);
        assert_eq!(last, SIZE_HEADER + stale.encoded_size() + fresh.encoded_size());
    }

    #[test]
    fn test_torn_tail_marks_data_file() {
        let tmp = TempDir::new().unwrap();
        let (seq, jf) = new_file(&tmp, 5);
        let rid = jf.record_id();

        let first = JournalEntry::Add { id: 1, user_type: 0, body: Bytes::from(vec![1u8; 100]) };
        write(&seq, first.encode(rid, 0, 0));

        // Only the first half of the second record reaches the disk.
        let second = JournalEntry::Add { id: 2, user_type: 0, body: Bytes::from(vec![2u8; 100]) };
        let encoded = second.encode(rid, 0, 0);
        write(&seq, encoded.slice(..encoded.len() / 2));

        let (events, last) = scan_file(&jf);
        assert_eq!(events[0], Event::Add(1, 0, vec![1u8; 100]));
        assert!(events.contains(&Event::Marked));
        assert!(!events.iter().any(|e| matches!(e, Event::Add(2, ..))));
        assert_eq!(last, SIZE_HEADER + first.encoded_size());
    }

    #[test]
    fn test_bad_check_size_resumes_scanning() {
        let tmp = TempDir::new().unwrap();
        let (seq, jf) = new_file(&tmp, 6);
        let rid = jf.record_id();

        let broken = JournalEntry::Add { id: 1, user_type: 0, body: Bytes::from_static(b"abc") };
        let mut bytes = BytesMut::from(&broken.encode(rid, 0, 0)[..]);
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        write(&seq, bytes.freeze());

        let good = JournalEntry::Delete { id: 7 };
        write(&seq, good.encode(rid, 0, 0));

        let (events, _) = scan_file(&jf);
        assert_eq!(events.first(), Some(&Event::Marked));
        assert_eq!(events.last(), Some(&Event::Delete(7)));
    }

    #[test]
    fn test_version_one_records() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());
        let seq = factory.create_sequential_file("v1.njr");
        seq.open().unwrap();
        seq.fill(FILE_SIZE, 0).unwrap();
        seq.position(SIZE_HEADER).unwrap();
        let jf = JournalFile::new(seq.clone(), 2, 1);

        // Version 1 layout: no compact count byte.
        let mut buf = BytesMut::new();
        buf.put_u8(RecordType::Delete.as_u8());
        buf.put_u32(2);
        buf.put_u64(44);
        buf.put_u32(RecordType::Delete.fixed_size(1) as u32);
        write(&seq, buf.freeze());

        let (events, last) = scan_file(&jf);
        assert_eq!(events, vec![Event::Delete(44)]);
        assert_eq!(last, SIZE_HEADER + 17);
    }

    #[test]
    fn test_callback_error_aborts_scan() {
        struct Failing;
        impl JournalReaderCallback for Failing {
            fn on_read_delete_record(&mut self, _id: u64) -> JournalResult<()> {
                Err(JournalError::inconsistency("boom"))
            }
        }

        let tmp = TempDir::new().unwrap();
        let (seq, jf) = new_file(&tmp, 8);
        write(&seq, JournalEntry::Delete { id: 1 }.encode(jf.record_id(), 0, 0));

        let err = read_journal_file(&jf, &mut Failing).unwrap_err();
        assert!(matches!(err, JournalError::Inconsistency { .. }));
    }
}
