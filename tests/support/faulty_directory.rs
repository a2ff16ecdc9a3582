//! `Directory` wrapper with targeted fault injection for segment files.
//!
//! Important: this file lives under `tests/support/` so it is **not** compiled as a standalone
//! integration test target.

use logsegment::error::LogResult;
use logsegment::formats::LOG_FILE_SUFFIX;
use logsegment::storage::{Directory, RandomAccessFile};
use std::io;
use std::sync::{Arc, Mutex};

/// Fault-injection configuration.
#[derive(Default)]
pub struct FaultConfig {
    /// Bytes record store files may still accept. A write past the budget stores the bytes
    /// that fit and then fails (a torn write on a full disk).
    pub log_write_budget: Option<u64>,
    /// Fail `sync` on every file.
    pub fail_sync: bool,
    /// Fail renames.
    pub fail_rename: bool,
    /// Count of injected failures.
    pub injected_failures: usize,
}

/// A `Directory` wrapper with targeted fault injection.
pub struct FaultyDirectory {
    inner: Arc<dyn Directory>,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl FaultyDirectory {
    /// Wrap an existing directory.
    pub fn new(inner: impl Into<Arc<dyn Directory>>) -> Self {
        Self {
            inner: inner.into(),
            cfg: Arc::new(Mutex::new(FaultConfig::default())),
        }
    }

    /// Access the shared fault config (for toggling failpoints and reading counters).
    pub fn cfg(&self) -> Arc<Mutex<FaultConfig>> {
        self.cfg.clone()
    }
}

fn injected(what: &str) -> logsegment::LogError {
    io::Error::new(io::ErrorKind::Other, format!("injected {what} failure")).into()
}

struct FaultyFile {
    path: String,
    inner: Box<dyn RandomAccessFile>,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl RandomAccessFile for FaultyFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> LogResult<usize> {
        self.inner.read_at(pos, buf)
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> LogResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        if self.path.ends_with(LOG_FILE_SUFFIX) {
            if let Some(budget) = cfg.log_write_budget {
                let len = data.len() as u64;
                if len > budget {
                    cfg.log_write_budget = Some(0);
                    cfg.injected_failures += 1;
                    drop(cfg);
                    self.inner.write_at(pos, &data[..budget as usize])?;
                    return Err(injected("write"));
                }
                cfg.log_write_budget = Some(budget - len);
            }
        }
        drop(cfg);
        self.inner.write_at(pos, data)
    }

    fn len(&self) -> LogResult<u64> {
        self.inner.len()
    }

    fn set_len(&mut self, len: u64) -> LogResult<()> {
        self.inner.set_len(len)
    }

    fn sync(&mut self) -> LogResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        if cfg.fail_sync {
            cfg.injected_failures += 1;
            return Err(injected("sync"));
        }
        drop(cfg);
        self.inner.sync()
    }
}

impl Directory for FaultyDirectory {
    fn open_file(&self, path: &str) -> LogResult<Box<dyn io::Read>> {
        self.inner.open_file(path)
    }

    fn open_random(&self, path: &str, create: bool) -> LogResult<Box<dyn RandomAccessFile>> {
        let inner = self.inner.open_random(path, create)?;
        Ok(Box::new(FaultyFile {
            path: path.to_string(),
            inner,
            cfg: self.cfg.clone(),
        }))
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn delete(&self, path: &str) -> LogResult<()> {
        self.inner.delete(path)
    }

    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        if cfg.fail_rename {
            cfg.injected_failures += 1;
            return Err(injected("rename"));
        }
        drop(cfg);
        self.inner.atomic_rename(from, to)
    }

    fn create_dir_all(&self, path: &str) -> LogResult<()> {
        self.inner.create_dir_all(path)
    }

    fn list_dir(&self, path: &str) -> LogResult<Vec<String>> {
        self.inner.list_dir(path)
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()> {
        self.inner.atomic_write(path, data)
    }

    fn file_path(&self, path: &str) -> Option<std::path::PathBuf> {
        self.inner.file_path(path)
    }
}
