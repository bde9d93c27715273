//! `std::fs` backed sequential files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{IoCompletion, SequentialFile, SequentialFileFactory, FILL_CHUNK_SIZE};
use crate::error::{JournalError, JournalResult};

/// Factory for [`StdSequentialFile`]s in one directory.
#[derive(Debug, Clone)]
pub struct StdFileFactory {
    dir: PathBuf,
}

impl StdFileFactory {
    /// Creates a factory for `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SequentialFileFactory for StdFileFactory {
    fn create_sequential_file(&self, name: &str) -> Arc<dyn SequentialFile> {
        Arc::new(StdSequentialFile::new(self.dir.clone(), name))
    }

    fn list_files(&self, extension: &str) -> JournalResult<Vec<String>> {
        let suffix = format!(".{}", extension);
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(&suffix) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn alignment(&self) -> usize {
        1
    }

    fn supports_callbacks(&self) -> bool {
        true
    }

    fn directory(&self) -> &Path {
        &self.dir
    }

    fn create_dirs(&self) -> JournalResult<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

struct OpenFile {
    file: File,
    position: usize,
}

/// A sequential file over `std::fs::File`.
///
/// Writes are synchronous, so completions are signalled before `write`
/// returns.
pub struct StdSequentialFile {
    dir: PathBuf,
    name: RwLock<String>,
    inner: Mutex<Option<OpenFile>>,
}

impl StdSequentialFile {
    /// Creates a closed handle.
    pub fn new(dir: PathBuf, name: impl Into<String>) -> Self {
        Self {
            dir,
            name: RwLock::new(name.into()),
            inner: Mutex::new(None),
        }
    }

    /// Full path of the file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&*self.name.read())
    }

    fn not_open(&self) -> JournalError {
        io::Error::new(
            io::ErrorKind::Other,
            format!("file {} is not open", self.name.read()),
        )
        .into()
    }

    fn write_at_cursor(&self, data: &[u8], sync: bool) -> JournalResult<()> {
        let mut guard = self.inner.lock();
        let open = match guard.as_mut() {
            Some(open) => open,
            None => return Err(self.not_open()),
        };
        open.file.seek(SeekFrom::Start(open.position as u64))?;
        open.file.write_all(data)?;
        if sync {
            open.file.sync_data()?;
        }
        open.position += data.len();
        Ok(())
    }
}

impl SequentialFile for StdSequentialFile {
    fn file_name(&self) -> String {
        self.name.read().clone()
    }

    fn open(&self) -> JournalResult<()> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path())?;
        *guard = Some(OpenFile { file, position: 0 });
        trace!(file = %self.name.read(), "opened journal file");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    fn close(&self) -> JournalResult<()> {
        if let Some(open) = self.inner.lock().take() {
            open.file.sync_all()?;
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path().exists()
    }

    fn size(&self) -> JournalResult<usize> {
        let guard = self.inner.lock();
        let len = match guard.as_ref() {
            Some(open) => open.file.metadata()?.len(),
            None => fs::metadata(self.path())?.len(),
        };
        Ok(len as usize)
    }

    fn fill(&self, size: usize, fill: u8) -> JournalResult<()> {
        let mut guard = self.inner.lock();
        let open = match guard.as_mut() {
            Some(open) => open,
            None => return Err(self.not_open()),
        };

        let chunk = vec![fill; FILL_CHUNK_SIZE.min(size.max(1))];
        open.file.seek(SeekFrom::Start(0))?;
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            open.file.write_all(&chunk[..n])?;
            remaining -= n;
        }
        open.file.sync_all()?;
        open.position = 0;
        Ok(())
    }

    fn position(&self, pos: usize) -> JournalResult<()> {
        match self.inner.lock().as_mut() {
            Some(open) => {
                open.position = pos;
                Ok(())
            }
            None => Err(self.not_open()),
        }
    }

    fn current_position(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |open| open.position)
    }

    fn read(&self, buf: &mut [u8]) -> JournalResult<usize> {
        let mut guard = self.inner.lock();
        let open = match guard.as_mut() {
            Some(open) => open,
            None => return Err(self.not_open()),
        };
        open.file.seek(SeekFrom::Start(open.position as u64))?;
        let mut total = 0;
        while total < buf.len() {
            match open.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        open.position += total;
        Ok(total)
    }

    fn write(
        &self,
        data: Bytes,
        sync: bool,
        completion: Option<Arc<dyn IoCompletion>>,
    ) -> JournalResult<()> {
        let result = self.write_at_cursor(&data, sync);
        if let Some(completion) = completion {
            match &result {
                Ok(()) => completion.done(),
                Err(JournalError::Io { source }) => {
                    completion.on_error(source.raw_os_error().unwrap_or(-1), &source.to_string())
                }
                Err(e) => completion.on_error(-1, &e.to_string()),
            }
        }
        result
    }

    fn write_direct(&self, data: Bytes, sync: bool) -> JournalResult<()> {
        self.write_at_cursor(&data, sync)
    }

    fn sync(&self) -> JournalResult<()> {
        match self.inner.lock().as_ref() {
            Some(open) => {
                open.file.sync_data()?;
                Ok(())
            }
            None => Err(self.not_open()),
        }
    }

    fn rename_to(&self, new_name: &str) -> JournalResult<()> {
        self.close()?;
        let mut name = self.name.write();
        fs::rename(self.dir.join(&*name), self.dir.join(new_name))?;
        trace!(from = %name, to = %new_name, "renamed journal file");
        *name = new_name.to_string();
        Ok(())
    }

    fn delete(&self) -> JournalResult<()> {
        self.close()?;
        let path = self.path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clone_file(&self) -> Arc<dyn SequentialFile> {
        Arc::new(StdSequentialFile::new(self.dir.clone(), self.file_name()))
    }
}

impl std::fmt::Debug for StdSequentialFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdSequentialFile")
            .field("dir", &self.dir)
            .field("name", &self.file_name())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::WaitCompletion;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_fill_write_read() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());
        let file = factory.create_sequential_file("a.njr");

        assert!(!file.exists());
        file.open().unwrap();
        file.fill(4096, 0).unwrap();
        assert_eq!(file.size().unwrap(), 4096);
        assert_eq!(file.current_position(), 0);

        file.position(100).unwrap();
        file.write_direct(Bytes::from_static(b"hello"), true).unwrap();
        assert_eq!(file.current_position(), 105);
        assert!(file.fits(4096 - 105));
        assert!(!file.fits(4096 - 104));

        file.position(98).unwrap();
        let mut buf = [0xFFu8; 9];
        assert_eq!(file.read(&mut buf).unwrap(), 9);
        assert_eq!(&buf, b"\0\0hello\0\0");

        file.close().unwrap();
        assert!(!file.is_open());
        assert_eq!(file.size().unwrap(), 4096);
    }

    #[test]
    fn test_short_read_at_end() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());
        let file = factory.create_sequential_file("b.njr");
        file.open().unwrap();
        file.fill(10, 7).unwrap();

        file.position(6).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[7, 7, 7, 7]);
    }

    #[test]
    fn test_write_signals_completion() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());
        let file = factory.create_sequential_file("c.njr");
        file.open().unwrap();

        let completion = Arc::new(WaitCompletion::new());
        file.write(Bytes::from_static(b"x"), false, Some(completion.clone()))
            .unwrap();
        completion.wait(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_closed_file_errors() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path());
        let file = factory.create_sequential_file("d.njr");

        let completion = Arc::new(WaitCompletion::new());
        assert!(file
            .write(Bytes::from_static(b"x"), false, Some(completion.clone()))
            .is_err());
        assert!(completion.wait(Duration::from_secs(1)).is_err());
        assert!(file.position(1).is_err());
    }

    #[test]
    fn test_rename_delete_and_list() {
        let tmp = TempDir::new().unwrap();
        let factory = StdFileFactory::new(tmp.path().join("journal"));
        factory.create_dirs().unwrap();

        let file = factory.create_sequential_file("j-1.njr.tmp");
        file.open().unwrap();
        file.fill(16, 0).unwrap();
        file.rename_to("j-1.njr").unwrap();
        assert!(!file.is_open());
        assert_eq!(file.file_name(), "j-1.njr");

        let other = factory.create_sequential_file("j-2.njr.cmp");
        other.open().unwrap();
        other.close().unwrap();

        let mut names = factory.list_files("njr").unwrap();
        names.sort();
        assert_eq!(names, vec!["j-1.njr".to_string()]);
        assert_eq!(factory.list_files("cmp").unwrap(), vec!["j-2.njr.cmp".to_string()]);

        let clone = file.clone_file();
        assert_eq!(clone.file_name(), "j-1.njr");
        assert!(!clone.is_open());
        assert_eq!(clone.size().unwrap(), 16);

        file.delete().unwrap();
        assert!(!file.exists());
        file.delete().unwrap();
    }

    #[test]
    fn test_block_size() {
        let factory = StdFileFactory::new("/tmp");
        assert_eq!(factory.alignment(), 1);
        assert_eq!(factory.calculate_block_size(17), 17);
        assert!(factory.new_buffer(64).capacity() >= 64);
    }
}
