//! Compaction control file.
//!
//! Before a compaction swaps its output in, it records the file set change
//! in `journal-rst-files.ctr`: the old data files to drop, the new `.cmp`
//! files to publish and any pending renames. The control file is deleted once
//! the swap is physically complete, so finding one on startup means the
//! previous process died in between and the plan must be finished.
//!
//! The control file is a journal file itself (user version 0, file id 0)
//! holding a single add record whose body is the plan:
//!
//! ```text
//! +-----------+-----------------+-----------+-----------------+-----------+-----------------------+
//! | Old (u32) | old names...    | New (u32) | new names...    | Ren (u32) | (from, to) names...   |
//! +-----------+-----------------+-----------+-----------------+-----------+-----------------------+
//! ```
//!
//! Every name is a `u16` length followed by UTF-8 bytes.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::error::{JournalError, JournalResult};
use crate::file::{SequentialFile, SequentialFileFactory};
use crate::format::{self, COMPACT_EXTENSION, CONTROL_FILE_NAME, SIZE_HEADER, TMP_EXTENSION};
use crate::journal_file::{init_file_header, read_file_header, JournalFile};
use crate::reader::{read_journal_file, JournalReaderCallback};
use crate::record::{EncodingSupport, JournalEntry, RecordInfo};

/// File set change recorded by a compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlFile {
    /// Data files replaced by the compaction.
    pub old_files: Vec<String>,
    /// Compacted output files, still carrying the `.cmp` extension.
    pub new_files: Vec<String>,
    /// Pending `(from, to)` renames.
    pub renames: Vec<(String, String)>,
}

fn name_size(name: &str) -> usize {
    2 + name.len()
}

fn put_name(buf: &mut BytesMut, name: &str) {
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
}

fn get_name(buf: &mut Bytes) -> JournalResult<String> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| {
        JournalError::internal_corruption(CONTROL_FILE_NAME, 0, format!("invalid file name: {}", e))
    })
}

fn get_count(buf: &mut Bytes) -> JournalResult<usize> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32() as usize)
}

fn truncated() -> JournalError {
    JournalError::internal_corruption(CONTROL_FILE_NAME, 0, "truncated control record")
}

impl EncodingSupport for ControlFile {
    fn encode_size(&self) -> usize {
        4 + self.old_files.iter().map(|n| name_size(n)).sum::<usize>()
            + 4
            + self.new_files.iter().map(|n| name_size(n)).sum::<usize>()
            + 4
            + self
                .renames
                .iter()
                .map(|(from, to)| name_size(from) + name_size(to))
                .sum::<usize>()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.old_files.len() as u32);
        for name in &self.old_files {
            put_name(buf, name);
        }
        buf.put_u32(self.new_files.len() as u32);
        for name in &self.new_files {
            put_name(buf, name);
        }
        buf.put_u32(self.renames.len() as u32);
        for (from, to) in &self.renames {
            put_name(buf, from);
            put_name(buf, to);
        }
    }
}

impl ControlFile {
    /// Builds a plan from the old and new file sets.
    pub fn new(
        old_files: &[Arc<JournalFile>],
        new_files: &[Arc<JournalFile>],
        renames: Vec<(String, String)>,
    ) -> Self {
        Self {
            old_files: old_files.iter().map(|f| f.file_name()).collect(),
            new_files: new_files.iter().map(|f| f.file_name()).collect(),
            renames,
        }
    }

    /// Decodes a plan from a control record body.
    pub fn decode(mut buf: Bytes) -> JournalResult<Self> {
        let mut control = Self::default();

        for _ in 0..get_count(&mut buf)? {
            control.old_files.push(get_name(&mut buf)?);
        }
        for _ in 0..get_count(&mut buf)? {
            control.new_files.push(get_name(&mut buf)?);
        }
        for _ in 0..get_count(&mut buf)? {
            let from = get_name(&mut buf)?;
            let to = get_name(&mut buf)?;
            control.renames.push((from, to));
        }

        Ok(control)
    }
}

/// Writes the control file and syncs it. Returns the closed file.
pub fn write_control_file(
    factory: &dyn SequentialFileFactory,
    control: &ControlFile,
) -> JournalResult<Arc<dyn SequentialFile>> {
    let sf = factory.create_sequential_file(CONTROL_FILE_NAME);
    sf.open()?;

    let result = (|| -> JournalResult<()> {
        init_file_header(sf.as_ref(), 0, 0)?;
        let entry = JournalEntry::Add {
            id: 0,
            user_type: 0,
            body: control.to_bytes(),
        };
        sf.position(SIZE_HEADER)?;
        sf.write_direct(entry.encode(0, 0, 0), true)
    })();

    sf.close()?;
    result?;

    debug!(
        old_files = control.old_files.len(),
        new_files = control.new_files.len(),
        renames = control.renames.len(),
        "wrote compaction control file"
    );
    Ok(sf)
}

#[derive(Default)]
struct ControlRecordReader {
    body: Option<Bytes>,
}

impl JournalReaderCallback for ControlRecordReader {
    fn on_read_add_record(&mut self, info: RecordInfo) -> JournalResult<()> {
        if self.body.is_none() {
            self.body = Some(info.data);
        }
        Ok(())
    }
}

/// Reads the control file, if one exists.
///
/// A control file without a valid record is deleted and reported as absent.
pub fn read_control_file(
    factory: &dyn SequentialFileFactory,
) -> JournalResult<Option<(ControlFile, Arc<dyn SequentialFile>)>> {
    let sf = factory.create_sequential_file(CONTROL_FILE_NAME);
    if !sf.exists() {
        return Ok(None);
    }

    sf.open()?;
    let header = read_file_header(sf.as_ref());
    sf.close()?;

    let header = match header {
        Ok(header) => header,
        Err(e) => {
            warn!(error = %e, "deleting unreadable compaction control file");
            sf.delete()?;
            return Ok(None);
        }
    };

    let file = JournalFile::new(Arc::clone(&sf), header.file_id, header.version);
    let mut reader = ControlRecordReader::default();
    read_journal_file(&file, &mut reader)?;

    match reader.body {
        Some(body) => Ok(Some((ControlFile::decode(body)?, sf))),
        None => {
            warn!("deleting compaction control file without a record");
            sf.delete()?;
            Ok(None)
        }
    }
}

/// Finishes an interrupted compaction and removes leftover temporary files.
///
/// Runs at the start of every load, before the data files are listed.
pub fn check_control_file(factory: &dyn SequentialFileFactory, extension: &str) -> JournalResult<()> {
    if let Some((control, sf)) = read_control_file(factory)? {
        info!(
            old_files = control.old_files.len(),
            new_files = control.new_files.len(),
            "completing interrupted compaction"
        );

        for name in &control.old_files {
            let file = factory.create_sequential_file(name);
            if file.exists() {
                file.delete()?;
            }
        }

        for name in &control.new_files {
            let file = factory.create_sequential_file(name);
            if file.exists() {
                file.rename_to(format::strip_extension(name, COMPACT_EXTENSION))?;
            }
        }

        for (from, to) in &control.renames {
            let source = factory.create_sequential_file(from);
            // The source is gone when the crash hit after the rename itself.
            if source.exists() {
                factory.create_sequential_file(to).delete()?;
                source.rename_to(to)?;
            }
        }

        sf.delete()?;
    }

    cleanup_tmp_files(factory, &format::with_extension(extension, COMPACT_EXTENSION))?;
    cleanup_tmp_files(factory, &format::with_extension(extension, TMP_EXTENSION))?;
    Ok(())
}

fn cleanup_tmp_files(factory: &dyn SequentialFileFactory, extension: &str) -> JournalResult<()> {
    let leftovers = factory.list_files(extension)?;
    if !leftovers.is_empty() {
        warn!(count = leftovers.len(), extension, "temporary journal files left behind");
    }
    for name in leftovers {
        warn!(file = %name, "deleting orphaned file");
        factory.create_sequential_file(&name).delete()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::StdFileFactory;
    use tempfile::TempDir;

    fn touch(factory: &StdFileFactory, name: &str, content: &'static [u8]) {
        let file = factory.create_sequential_file(name);
        file.open().unwrap();
        file.write_direct(Bytes::from_static(content), false).unwrap();
        file.close().unwrap();
    }

    fn sorted(factory: &StdFileFactory, extension: &str) -> Vec<String> {
        let mut names = factory.list_files(extension).unwrap();
        names.sort();
        names
    }

    #[test]
    fn test_control_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());

        let control = ControlFile {
            old_files: vec!["j-1.njr".into(), "j-2.njr".into()],
            new_files: vec!["j-7.njr.cmp".into()],
            renames: vec![("a.tmp".into(), "a".into())],
        };
        assert_eq!(control.encode_size(), control.to_bytes().len());

        write_control_file(&factory, &control).unwrap();
        let (read, sf) = read_control_file(&factory).unwrap().unwrap();
        assert_eq!(read, control);
        assert_eq!(sf.file_name(), CONTROL_FILE_NAME);
    }

    #[test]
    fn test_missing_control_file() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());
        assert!(read_control_file(&factory).unwrap().is_none());
        check_control_file(&factory, "njr").unwrap();
    }

    #[test]
    fn test_empty_control_file_is_deleted() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());
        touch(&factory, CONTROL_FILE_NAME, &[0u8; 40]);

        assert!(read_control_file(&factory).unwrap().is_none());
        assert!(!factory.create_sequential_file(CONTROL_FILE_NAME).exists());
    }

    #[test]
    fn test_check_control_file_completes_plan() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());

        touch(&factory, "j-1.njr", b"old");
        touch(&factory, "j-2.njr", b"old");
        touch(&factory, "j-3.njr.cmp", b"new");
        touch(&factory, "j-4.njr.tmp", b"orphan");
        touch(&factory, "j-5.njr.cmp", b"orphan");
        touch(&factory, "x.from", b"from");
        touch(&factory, "x.to", b"to");

        let control = ControlFile {
            old_files: vec!["j-1.njr".into(), "j-2.njr".into(), "j-9.njr".into()],
            new_files: vec!["j-3.njr.cmp".into()],
            renames: vec![
                ("x.from".into(), "x.to".into()),
                ("gone.from".into(), "x.keep".into()),
            ],
        };
        write_control_file(&factory, &control).unwrap();
        touch(&factory, "x.keep", b"keep");

        check_control_file(&factory, "njr").unwrap();

        assert_eq!(sorted(&factory, "njr"), vec!["j-3.njr".to_string()]);
        assert!(sorted(&factory, "njr.cmp").is_empty());
        assert!(sorted(&factory, "njr.tmp").is_empty());
        assert!(!factory.create_sequential_file(CONTROL_FILE_NAME).exists());
        assert!(!factory.create_sequential_file("x.from").exists());
        assert!(factory.create_sequential_file("x.to").exists());
        assert!(factory.create_sequential_file("x.keep").exists());

        let moved = std::fs::read(tmp.path().join("x.to")).unwrap();
        assert_eq!(moved, b"from");
    }

    #[test]
    fn test_decode_truncated_body() {
        let err = ControlFile::decode(Bytes::from_static(&[0, 0, 0, 1, 0, 9, b'a'])).unwrap_err();
        assert!(err.is_corruption());
    }
}
