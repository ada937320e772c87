//! # mokka-storage
//!
//! why: keep term, vote, commit index and the task log across restarts
//! relations: persists mokka-core's HardState and LogEntry values, used by mokka-runtime
//! what: Storage trait, FileStorage (atomic json files), InMemoryStorage for tests

use mokka_core::{HardState, LogEntry};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Durable storage for one node.
///
/// The node reports changed log tails as `(from, entries)`; storage drops
/// everything at or after `from` and appends the new tail, see [`Storage::persist_tail`].
pub trait Storage {
    /// persist term, vote and commit index
    fn save_hard_state(&mut self, state: &HardState) -> io::Result<()>;

    /// load the persisted hard state, default for a fresh node
    fn load_hard_state(&self) -> io::Result<HardState>;

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// drop every entry with index >= `from_index`
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// clear all persisted state
    fn clear(&mut self) -> io::Result<()>;

    /// Replace the log from `from_index` on with `entries`.
    fn persist_tail(&mut self, from_index: u64, entries: &[LogEntry]) -> io::Result<()> {
        self.truncate_log_from(from_index)?;
        self.append_entries(entries)
    }
}

// -- file storage implementation --

/// File-based storage.
///
/// One directory per node with:
/// - meta.json: term, vote and commit index
/// - log.json: array of log entries
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// open storage at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    /// write to a temp file, sync, then rename over `path`
    fn write_atomic(&self, path: &Path, value: &impl Serialize) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(value).map_err(invalid_data)?;
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    }

    fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> io::Result<T> {
        if !path.exists() {
            return Ok(T::default());
        }
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        serde_json::from_str(&contents).map_err(invalid_data)
    }
}

fn invalid_data(error: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

impl Storage for FileStorage {
    fn save_hard_state(&mut self, state: &HardState) -> io::Result<()> {
        self.write_atomic(&self.meta_path(), state)
    }

    fn load_hard_state(&self) -> io::Result<HardState> {
        Self::read_json(&self.meta_path())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut log = self.load_log()?;
        log.extend(entries.iter().cloned());
        self.write_atomic(&self.log_path(), &log)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Self::read_json(&self.log_path())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        let mut log = self.load_log()?;
        let before = log.len();
        log.retain(|e| e.index < from_index);
        if log.len() == before {
            return Ok(());
        }
        self.write_atomic(&self.log_path(), &log)
    }

    fn persist_tail(&mut self, from_index: u64, entries: &[LogEntry]) -> io::Result<()> {
        // one rewrite instead of truncate + append
        let mut log = self.load_log()?;
        log.retain(|e| e.index < from_index);
        log.extend(entries.iter().cloned());
        self.write_atomic(&self.log_path(), &log)
    }

    fn clear(&mut self) -> io::Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// In-memory storage, nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    hard_state: HardState,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_hard_state(&mut self, state: &HardState) -> io::Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn load_hard_state(&self) -> io::Result<HardState> {
        Ok(self.hard_state.clone())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.hard_state = HardState::default();
        self.log.clear();
        Ok(())
    }
}
