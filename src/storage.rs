//! Storage abstraction for segment files.
//!
//! Vocabulary note:
//! - Segment files are written positionally (`write_at`) because the record store may be
//!   preallocated: its on-disk length can exceed the logical end of data.
//! - `sync` is the stable-storage barrier. Nothing here calls it implicitly; callers decide
//!   when to flush.

use crate::error::{LogError, LogResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// A file opened for positional reads and writes.
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `pos`. Returns the number of bytes read, which
    /// is short only at end of file.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LogResult<usize>;
    /// Write all of `data` starting at `pos`, extending the file if needed.
    fn write_at(&mut self, pos: u64, data: &[u8]) -> LogResult<()>;
    /// Current on-disk length in bytes.
    fn len(&self) -> LogResult<u64>;
    /// Grow (zero-filled) or shrink the file to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> LogResult<()>;
    /// Make written bytes durable.
    fn sync(&mut self) -> LogResult<()>;

    /// Read exactly `buf.len()` bytes at `pos`, failing with `UnexpectedEof` when short.
    fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> LogResult<()> {
        let n = self.read_at(pos, buf)?;
        if n < buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at {pos}: wanted {}, got {n}", buf.len()),
            )
            .into());
        }
        Ok(())
    }
}

/// Trait for directory-like storage backends.
pub trait Directory: Send + Sync {
    /// Open an existing file for sequential reading.
    fn open_file(&self, path: &str) -> LogResult<Box<dyn Read>>;
    /// Open a file for positional access. With `create`, a missing file is created empty;
    /// without it, a missing file is an error.
    fn open_random(&self, path: &str, create: bool) -> LogResult<Box<dyn RandomAccessFile>>;
    /// Return whether a path exists.
    fn exists(&self, path: &str) -> bool;
    /// Delete a file or directory (directories recursively). Missing paths are not an error.
    fn delete(&self, path: &str) -> LogResult<()>;
    /// Atomically rename/move a file.
    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()>;
    /// Create a directory (and parents if needed).
    fn create_dir_all(&self, path: &str) -> LogResult<()>;
    /// List entries in a directory.
    fn list_dir(&self, path: &str) -> LogResult<Vec<String>>;
    /// Atomically write bytes to a path.
    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()>;
    /// Optional filesystem path for backends that support it.
    fn file_path(&self, path: &str) -> Option<PathBuf>;
}

/// Filesystem-backed `Directory` rooted at a local path.
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Create (or open) a filesystem directory backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> LogResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

struct FsRandomFile {
    file: Mutex<std::fs::File>,
}

impl RandomAccessFile for FsRandomFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LogResult<usize> {
        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(pos))?;
        let mut filled = 0;
        while filled < buf.len() {
            match f.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> LogResult<()> {
        let f = self.file.get_mut();
        f.seek(SeekFrom::Start(pos))?;
        f.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> LogResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> LogResult<()> {
        self.file.get_mut().set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> LogResult<()> {
        self.file.get_mut().sync_all()?;
        Ok(())
    }
}

impl Directory for FsDirectory {
    fn open_file(&self, path: &str) -> LogResult<Box<dyn Read>> {
        let full_path = self.resolve_path(path);
        if !full_path.exists() {
            return Err(LogError::MissingPath(full_path));
        }
        Ok(Box::new(std::fs::File::open(full_path)?))
    }

    fn open_random(&self, path: &str, create: bool) -> LogResult<Box<dyn RandomAccessFile>> {
        let full_path = self.resolve_path(path);
        if !create && !full_path.exists() {
            return Err(LogError::MissingPath(full_path));
        }
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(full_path)?;
        Ok(Box::new(FsRandomFile {
            file: Mutex::new(file),
        }))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).exists()
    }

    fn delete(&self, path: &str) -> LogResult<()> {
        let full_path = self.resolve_path(path);
        if full_path.is_dir() {
            std::fs::remove_dir_all(full_path)?;
        } else if full_path.exists() {
            std::fs::remove_file(full_path)?;
        }
        Ok(())
    }

    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from_path, to_path)?;
        Ok(())
    }

    fn create_dir_all(&self, path: &str) -> LogResult<()> {
        std::fs::create_dir_all(self.resolve_path(path))?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> LogResult<Vec<String>> {
        let full_path = self.resolve_path(path);
        if !full_path.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(full_path)?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            out.push(entry.file_name().to_string_lossy().to_string());
        }
        out.sort();
        Ok(out)
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()> {
        let temp_path = format!("{path}.tmp");
        let full_temp_path = self.resolve_path(&temp_path);
        if let Some(parent) = full_temp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut temp_file = std::fs::File::create(&full_temp_path)?;
        temp_file.write_all(data)?;
        temp_file.sync_all()?;

        let full_path = self.resolve_path(path);
        std::fs::rename(&full_temp_path, &full_path)?;

        if let Some(parent) = full_path.parent() {
            if let Ok(parent_file) = std::fs::File::open(parent) {
                let _ = parent_file.sync_all();
            }
        }
        Ok(())
    }

    fn file_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.resolve_path(path))
    }
}

impl From<FsDirectory> for Arc<dyn Directory> {
    fn from(dir: FsDirectory) -> Self {
        Arc::new(dir)
    }
}

type SharedFiles = Arc<RwLock<HashMap<String, Vec<u8>>>>;

fn poisoned() -> LogError {
    LogError::LockFailed {
        resource: "memory directory".to_string(),
        reason: "lock poisoned".to_string(),
    }
}

/// In-memory `Directory` used for tests.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    files: SharedFiles,
}

impl MemoryDirectory {
    /// Create an empty in-memory directory.
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryRandomFile {
    files: SharedFiles,
    path: String,
}

impl MemoryRandomFile {
    fn with_data<R>(&self, f: impl FnOnce(&Vec<u8>) -> R) -> LogResult<R> {
        let files = self.files.read().map_err(|_| poisoned())?;
        let data = files
            .get(&self.path)
            .ok_or_else(|| LogError::NotFound(self.path.clone()))?;
        Ok(f(data))
    }

    fn with_data_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> LogResult<R> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        let data = files
            .get_mut(&self.path)
            .ok_or_else(|| LogError::NotFound(self.path.clone()))?;
        Ok(f(data))
    }
}

impl RandomAccessFile for MemoryRandomFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LogResult<usize> {
        self.with_data(|data| {
            let start = usize::try_from(pos).unwrap_or(usize::MAX).min(data.len());
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            n
        })
    }

    fn write_at(&mut self, pos: u64, bytes: &[u8]) -> LogResult<()> {
        let start = usize::try_from(pos)
            .map_err(|_| LogError::InvalidState(format!("position {pos} overflows usize")))?;
        self.with_data_mut(|data| {
            let end = start + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(bytes);
        })
    }

    fn len(&self) -> LogResult<u64> {
        self.with_data(|data| data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> LogResult<()> {
        let len = usize::try_from(len)
            .map_err(|_| LogError::InvalidState(format!("length {len} overflows usize")))?;
        self.with_data_mut(|data| data.resize(len, 0))
    }

    fn sync(&mut self) -> LogResult<()> {
        Ok(())
    }
}

impl Directory for MemoryDirectory {
    fn open_file(&self, path: &str) -> LogResult<Box<dyn Read>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        let data = files
            .get(path)
            .ok_or_else(|| LogError::NotFound(path.to_string()))?
            .clone();
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn open_random(&self, path: &str, create: bool) -> LogResult<Box<dyn RandomAccessFile>> {
        {
            let mut files = self.files.write().map_err(|_| poisoned())?;
            if !files.contains_key(path) {
                if !create {
                    return Err(LogError::NotFound(path.to_string()));
                }
                files.insert(path.to_string(), Vec::new());
            }
        }
        Ok(Box::new(MemoryRandomFile {
            files: self.files.clone(),
            path: path.to_string(),
        }))
    }

    fn exists(&self, path: &str) -> bool {
        self.files
            .read()
            .map(|f| f.contains_key(path))
            .unwrap_or(false)
    }

    fn delete(&self, path: &str) -> LogResult<()> {
        self.files.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        match files.remove(from) {
            Some(data) => {
                files.insert(to.to_string(), data);
                Ok(())
            }
            None => Err(LogError::NotFound(from.to_string())),
        }
    }

    fn create_dir_all(&self, _path: &str) -> LogResult<()> {
        Ok(())
    }

    fn list_dir(&self, path: &str) -> LogResult<Vec<String>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        let prefix = if path.is_empty() {
            "".to_string()
        } else {
            format!("{path}/")
        };
        let mut result: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(|k| k.strip_prefix(&prefix).unwrap_or(k).to_string())
            .collect();
        result.sort();
        Ok(result)
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn file_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

impl From<MemoryDirectory> for Arc<dyn Directory> {
    fn from(dir: MemoryDirectory) -> Self {
        Arc::new(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(dir: &dyn Directory) {
        let mut f = dir.open_random("seg/a.log", true).unwrap();
        f.write_at(0, b"hello").unwrap();
        f.write_at(8, b"xy").unwrap();
        assert_eq!(f.len().unwrap(), 10);

        let mut buf = [0xFFu8; 10];
        assert_eq!(f.read_at(0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"hello\0\0\0xy");

        let mut tail = [0u8; 4];
        assert_eq!(f.read_at(8, &mut tail).unwrap(), 2);
        assert!(f.read_exact_at(8, &mut tail).is_err());

        f.set_len(5).unwrap();
        assert_eq!(f.len().unwrap(), 5);
        f.set_len(64).unwrap();
        assert_eq!(f.len().unwrap(), 64);
        f.sync().unwrap();
        drop(f);

        assert!(dir.exists("seg/a.log"));
        dir.atomic_rename("seg/a.log", "seg/a.log.deleted").unwrap();
        assert!(!dir.exists("seg/a.log"));
        let f = dir.open_random("seg/a.log.deleted", false).unwrap();
        let mut head = [0u8; 5];
        f.read_exact_at(0, &mut head).unwrap();
        assert_eq!(&head, b"hello");

        assert!(dir.open_random("seg/missing.index", false).is_err());
        assert!(!dir.exists("seg/missing.index"));
        dir.delete("seg/a.log.deleted").unwrap();
        assert!(!dir.exists("seg/a.log.deleted"));
    }

    #[test]
    fn memory_directory_random_access() {
        exercise(&MemoryDirectory::new());
    }

    #[test]
    fn fs_directory_random_access() {
        let tmp = tempfile::tempdir().unwrap();
        exercise(&FsDirectory::new(tmp.path()).unwrap());
    }

    #[test]
    fn list_dir_is_sorted_and_scoped() {
        let dir = MemoryDirectory::new();
        dir.atomic_write("p/00000000000000000010.log", b"").unwrap();
        dir.atomic_write("p/00000000000000000000.log", b"").unwrap();
        dir.atomic_write("q/00000000000000000000.log", b"").unwrap();
        assert_eq!(
            dir.list_dir("p").unwrap(),
            vec![
                "00000000000000000000.log".to_string(),
                "00000000000000000010.log".to_string()
            ]
        );
    }
}
